use std::sync::Arc;
use std::time::Duration;

use sluice::flow::{FlowSubscriber, NodeServices, TokioDispatcher};
use sluice::reactive::IterPublisher;
use sluice::{
    FlowContext, FlowEvent, FlowGraph, FlowNodeStatus, ParallelMode, ProcessingNode, Result,
    SluiceError,
};
use sluice_test_utils::ManualPublisher;

type Node = Arc<ProcessingNode<i64, i64>>;

fn node(
    services: &NodeServices<i64>,
    id: &str,
    f: impl Fn(i64) -> Result<Vec<i64>> + Send + Sync + 'static,
) -> Node {
    ProcessingNode::new(
        id,
        move |ctx: &FlowContext<i64>| -> Result<Vec<i64>> { f(*ctx.data()) },
        services.clone(),
    )
}

/// parse -> {double, negate} -> sink
fn diamond() -> (Arc<FlowGraph<i64>>, Arc<sluice::flow::Collector<i64>>) {
    let builder = FlowGraph::builder("diamond");
    let services = builder.services();
    let sink = Arc::new(sluice::flow::Collector::<i64>::new());
    let collect = node(&services, "sink", |v| Ok(vec![v]));
    collect.emitter().register(sink.clone());

    let graph = builder
        .node(node(&services, "parse", |v| Ok(vec![v])))
        .node(node(&services, "double", |v| Ok(vec![v * 2])))
        .node(node(&services, "negate", |v| Ok(vec![-v])))
        .node(collect)
        .edge("parse", "double")
        .edge("parse", "negate")
        .edge("double", "sink")
        .edge("negate", "sink")
        .entry("parse")
        .build()
        .expect("build graph");
    (graph, sink)
}

#[test]
fn test_fan_out_and_in() {
    let (graph, sink) = diamond();
    let session = graph.start_session();

    graph.offer(&session, vec![1, 2]).expect("offer");

    let mut data = sink.data();
    data.sort();
    assert_eq!(data, vec![-2, -1, 2, 4]);
    assert_eq!(graph.successors("parse"), ["double".to_string(), "negate".to_string()]);
    assert!(graph.successors("sink").is_empty());

    let traces: std::collections::HashSet<_> =
        sink.contexts().iter().map(|c| c.trace_id().clone()).collect();
    assert_eq!(traces.len(), 2);
}

#[tokio::test]
async fn test_session_completes_after_finish() {
    let (graph, _) = diamond();
    let mut rx = graph.events().subscribe();
    let session = graph.start_session();

    graph.offer(&session, vec![5]).expect("offer");
    assert!(session.is_running());
    assert!(graph.finish(&session));
    assert!(!session.is_running());

    let mut saw_window = false;
    loop {
        match rx.recv().await.expect("event") {
            FlowEvent::WindowCompleted { .. } => saw_window = true,
            FlowEvent::SessionCompleted { session: id } => {
                assert_eq!(&id, session.id());
                break;
            }
            _ => {}
        }
    }
    assert!(saw_window);

    let late = graph.offer(&session, vec![6]);
    assert!(matches!(late, Err(SluiceError::IllegalState(_))));
}

#[test]
fn test_build_rejects_bad_topology() {
    let builder = FlowGraph::<i64>::builder("bad");
    let services = builder.services();
    let unknown = builder
        .node(node(&services, "a", |v| Ok(vec![v])))
        .edge("a", "ghost")
        .entry("a")
        .build();
    assert!(matches!(unknown, Err(SluiceError::NodeNotFound(id)) if id == "ghost"));

    let builder = FlowGraph::<i64>::builder("cyclic");
    let services = builder.services();
    let cyclic = builder
        .node(node(&services, "a", |v| Ok(vec![v])))
        .node(node(&services, "b", |v| Ok(vec![v])))
        .edge("a", "b")
        .edge("b", "a")
        .entry("a")
        .build();
    assert!(matches!(cyclic, Err(SluiceError::Config(_))));

    let no_entry = FlowGraph::<i64>::builder("empty").build();
    assert!(matches!(no_entry, Err(SluiceError::Config(_))));
}

/// split -> {inc, scale} -join-> merge
fn joined(mode: ParallelMode) -> (Arc<FlowGraph<i64>>, Arc<sluice::flow::Collector<i64>>) {
    let builder = FlowGraph::builder("joined");
    let services = builder.services();
    let sink = Arc::new(sluice::flow::Collector::<i64>::new());
    let merge = node(&services, "merge", |v| Ok(vec![v]));
    merge.emitter().register(sink.clone());

    let graph = builder
        .node(node(&services, "split", |v| Ok(vec![v])))
        .node(node(&services, "inc", |v| Ok(vec![v + 1])))
        .node(node(&services, "scale", |v| Ok(vec![v * 10])))
        .node(merge)
        .edge("split", "inc")
        .edge("split", "scale")
        .join("merge", &["inc", "scale"], mode)
        .entry("split")
        .build()
        .expect("build graph");
    (graph, sink)
}

#[test]
fn test_join_all_merges_every_branch_per_trace() {
    let (graph, sink) = joined(ParallelMode::All);
    let session = graph.start_session();

    graph.offer(&session, vec![1, 2]).expect("offer");

    assert_eq!(sink.data(), vec![2, 10, 3, 20]);
    let first_trace = sink.contexts()[0].trace_id().clone();
    assert_eq!(sink.contexts()[1].trace_id(), &first_trace);
    assert_eq!(session.in_flight(), 0);
    assert!(graph.finish(&session));
    assert_eq!(graph.successors("inc"), ["merge".to_string()]);
}

#[test]
fn test_join_either_forwards_first_branch() {
    let (graph, sink) = joined(ParallelMode::Either);
    let session = graph.start_session();

    graph.offer(&session, vec![1, 2]).expect("offer");

    assert_eq!(sink.data(), vec![2, 3]);
    assert_eq!(session.in_flight(), 0);
    assert!(graph.finish(&session));
}

#[test]
fn test_join_waits_for_filtered_branch() {
    let builder = FlowGraph::builder("filtered");
    let services = builder.services();
    let sink = Arc::new(sluice::flow::Collector::<i64>::new());
    let merge = node(&services, "merge", |v| Ok(vec![v]));
    merge.emitter().register(sink.clone());
    let evens = node(&services, "evens", |v| Ok(vec![v]));
    evens.add_pre_filter(sluice::flow::Filter::new("even", |c: &FlowContext<i64>| {
        c.data() % 2 == 0
    }));

    let graph = builder
        .node(node(&services, "split", |v| Ok(vec![v])))
        .node(node(&services, "all", |v| Ok(vec![v])))
        .node(evens)
        .node(merge)
        .edge("split", "all")
        .edge("split", "evens")
        .join("merge", &["all", "evens"], ParallelMode::All)
        .entry("split")
        .build()
        .expect("build graph");
    let session = graph.start_session();

    graph.offer(&session, vec![1, 2]).expect("offer");

    assert_eq!(sink.data(), vec![1, 2, 2]);
    assert!(graph.finish(&session));
}

#[test]
fn test_build_rejects_bad_joins() {
    let build = |configure: fn(
        sluice::flow::FlowGraphBuilder<i64>,
    ) -> sluice::flow::FlowGraphBuilder<i64>| {
        let builder = FlowGraph::<i64>::builder("joins");
        let services = builder.services();
        let builder = builder
            .node(node(&services, "a", |v| Ok(vec![v])))
            .node(node(&services, "b", |v| Ok(vec![v])))
            .node(node(&services, "c", |v| Ok(vec![v])))
            .entry("a");
        configure(builder).build()
    };

    let unknown = build(|b| b.join("c", &["a", "ghost"], ParallelMode::All));
    assert!(matches!(unknown, Err(SluiceError::NodeNotFound(id)) if id == "ghost"));

    let twice = build(|b| b.join("c", &["a", "a"], ParallelMode::All));
    assert!(matches!(twice, Err(SluiceError::Config(_))));

    let both = build(|b| b.edge("a", "c").join("c", &["a", "b"], ParallelMode::Either));
    assert!(matches!(both, Err(SluiceError::Config(_))));

    let cyclic = build(|b| b.edge("c", "a").join("c", &["a", "b"], ParallelMode::All));
    assert!(matches!(cyclic, Err(SluiceError::Config(_))));
}

#[test]
fn test_failure_terminates_session_for_every_node() {
    let builder = FlowGraph::builder("failing");
    let services = builder.services();
    let graph = builder
        .node(node(&services, "first", |v| Ok(vec![v])))
        .node(node(&services, "boom", |_| Err(SluiceError::node("boom", "bad input"))))
        .edge("first", "boom")
        .entry("first")
        .build()
        .expect("build graph");

    let session = graph.start_session();
    graph.offer(&session, vec![1]).expect("offer");

    assert!(!session.is_running());
    assert!(matches!(graph.offer(&session, vec![2]), Err(SluiceError::IllegalState(_))));
    assert!(!graph.finish(&session));

    let first = graph.node("first").expect("node");
    let stored = first
        .context_repo()
        .find_by_status(FlowNodeStatus::Error)
        .expect("query");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].position, "boom");
    assert!(matches!(graph.node("missing"), Err(SluiceError::NodeNotFound(_))));
}

#[test]
fn test_attach_drives_publisher_into_session() {
    let (graph, sink) = diamond();
    let session = graph.start_session();
    let publisher = ManualPublisher::<i64>::new();

    let worker = graph.attach(&session, publisher.clone());
    assert_eq!(publisher.requested(), 0);
    worker.request(1).expect("request");

    publisher.push(3).expect("push");
    publisher.push(4).expect("push");
    assert_eq!(publisher.requested(), 3);
    publisher.complete().expect("complete");

    assert_eq!(sink.data().len(), 4);
    assert!(!session.is_running());
    assert!(session.is_input_closed());
}

#[test]
fn test_attach_upstream_failure_terminates() {
    let (graph, _) = diamond();
    let session = graph.start_session();
    let publisher = ManualPublisher::<i64>::new();
    let _worker = graph.attach(&session, publisher.clone());

    publisher.fail("socket closed").expect("fail");
    assert!(!session.is_running());
    assert!(!session.is_input_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispatched_graph_completes() {
    let builder = FlowGraph::builder("async")
        .dispatcher(Arc::new(TokioDispatcher::current().expect("runtime")));
    let services = builder.services();
    let graph = builder
        .node(node(&services, "square", |v| Ok(vec![v * v])))
        .entry("square")
        .build()
        .expect("build graph");
    let mut rx = graph.events().subscribe();

    let session = graph.start_session();
    let worker = graph.attach(&session, Arc::new(IterPublisher::new(1..=50)));
    worker.request(1).expect("request");

    let completed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(FlowEvent::SessionCompleted { session: id }) = rx.recv().await {
                return id;
            }
        }
    })
    .await
    .expect("session completes");
    assert_eq!(&completed, session.id());
}
