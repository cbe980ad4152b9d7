use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sluice::core::config::RetryConfig;
use sluice::flow::{
    Collector, ErrorOutcome, FlowSubscriber, NodeServices, ProcessTarget, Retryable,
};
use sluice::{
    FlowContext, FlowEvent, FlowNodeStatus, FlowSession, ProcessingNode, Result, RetryErrorHandler,
    SluiceError,
};

fn fast_retry(max_attempts: u32) -> Arc<RetryErrorHandler> {
    Arc::new(RetryErrorHandler::new(RetryConfig {
        max_attempts,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
    }))
}

/// Node whose first `heal_after` calls fail.
fn flaky(
    services: NodeServices<i32>,
    heal_after: usize,
) -> (Arc<ProcessingNode<i32, i32>>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let node = ProcessingNode::new(
        "charge",
        move |ctx: &FlowContext<i32>| -> Result<Vec<i32>> {
            if counter.fetch_add(1, Ordering::SeqCst) < heal_after {
                return Err(SluiceError::node("charge", "gateway timeout"));
            }
            Ok(vec![*ctx.data()])
        },
        services,
    );
    (node, calls)
}

fn failed_batch(session: &Arc<FlowSession>, values: &[i32]) -> Vec<FlowContext<i32>> {
    values
        .iter()
        .map(|v| {
            let mut ctx = FlowContext::new(session.clone(), *v, "charge");
            for next in [
                FlowNodeStatus::Pending,
                FlowNodeStatus::Ready,
                FlowNodeStatus::Processing,
                FlowNodeStatus::Error,
            ] {
                ctx.set_status(next).expect("forward transition");
            }
            ctx
        })
        .collect()
}

#[test]
fn test_retry_recovers_transient_failure() {
    let services = NodeServices::default();
    let repo = services.repo.clone();
    let (node, calls) = flaky(services, 2);
    node.add_error_handler(fast_retry(3));
    let sink = Arc::new(Collector::<i32>::new());
    node.emitter().register(sink.clone());

    let session = FlowSession::new();
    node.accept(vec![FlowContext::new(session.clone(), 42, "entry")])
        .expect("accept");

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(sink.data(), vec![42]);
    let archived = repo.find_by_status(FlowNodeStatus::Archived).expect("query");
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].attempt, 2);
    assert!(session.is_running());
}

#[tokio::test]
async fn test_unhandled_failure_terminates_and_notifies() {
    let services = NodeServices::default();
    let mut rx = services.events.subscribe();
    let (node, _) = flaky(services, usize::MAX);
    let sink = Arc::new(Collector::<i32>::new());
    node.emitter().register(sink.clone());

    let session = FlowSession::new();
    node.accept(vec![FlowContext::new(session.clone(), 1, "entry")])
        .expect("accept");

    assert!(!session.is_running());
    assert_eq!(sink.failures().len(), 1);
    match rx.recv().await.expect("event") {
        FlowEvent::NodeFailed { node, session: id, error } => {
            assert_eq!(node, "charge");
            assert_eq!(&id, session.id());
            assert!(error.contains("gateway timeout"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
fn test_local_handler_runs_before_global() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let services = NodeServices::<i32>::default();
    let global_order = order.clone();
    services.global_handlers.add(Arc::new(
        move |_: &str, _: &SluiceError, _: &[FlowContext<i32>]| -> Result<ErrorOutcome> {
            global_order.lock().unwrap().push("global");
            Ok(ErrorOutcome::Handled)
        },
    ));
    let (node, _) = flaky(services, usize::MAX);
    let local_order = order.clone();
    node.add_error_handler(Arc::new(
        move |_: &SluiceError, _: &Retryable<i32>, _: &[FlowContext<i32>]| -> Result<ErrorOutcome> {
            local_order.lock().unwrap().push("local");
            Ok(ErrorOutcome::Unhandled)
        },
    ));

    let session = FlowSession::new();
    node.accept(vec![FlowContext::new(session.clone(), 1, "entry")])
        .expect("accept");

    assert_eq!(*order.lock().unwrap(), vec!["local", "global"]);
    assert!(session.is_running());
}

#[test]
fn test_retry_preconditions() {
    let (node, calls) = flaky(NodeServices::default(), 0);
    let retryable = node.retryable();
    let session = FlowSession::new();

    assert!(matches!(retryable.retry(Vec::new()), Err(SluiceError::EmptyBatch)));

    let mut mixed = failed_batch(&session, &[1, 2]);
    mixed[1].set_status(FlowNodeStatus::Retryable).expect("error -> retryable");
    assert!(matches!(
        retryable.retry(mixed),
        Err(SluiceError::HeterogeneousBatch {
            expected: FlowNodeStatus::Error,
            found: FlowNodeStatus::Retryable
        })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_manual_retry_reprocesses_failed_batch() {
    let services = NodeServices::default();
    let repo = services.repo.clone();
    let (node, calls) = flaky(services, 0);
    let sink = Arc::new(Collector::<i32>::new());
    node.emitter().register(sink.clone());
    let session = FlowSession::new();

    let batch = failed_batch(&session, &[3, 4]);
    session.track(batch.len());
    node.retryable().retry(batch).expect("retry");

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(sink.data(), vec![3, 4]);
    assert_eq!(repo.find_by_status(FlowNodeStatus::Archived).expect("query").len(), 2);
    assert_eq!(session.in_flight(), 0);
    assert_eq!(node.retryable().node(), node.id());
}
