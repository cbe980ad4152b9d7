use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sluice_core::config::RuntimeConfig;
use sluice_core::error::{Result, SluiceError};
use sluice_core::event::{EventBus, FlowEvent};
use sluice_core::status::ParallelMode;
use sluice_reactive::{Publisher, Subscription, Worker, WorkerObserver};
use tracing::{debug, info};

use crate::context::FlowContext;
use crate::fanin::{FanIn, FanInBranch};
use crate::node::{
    Dispatcher, FlowSubscriber, GlobalErrorHandler, NodeServices, ProcessTarget, ProcessingNode,
};
use crate::repo::open_repository;
use crate::session::{FlowSession, SessionListener};
use crate::window::{WindowEvents, WindowRegistry};

type Node<T> = Arc<ProcessingNode<T, T>>;

/// Assembles a [`FlowGraph`] from explicitly registered nodes and edges.
///
/// Nodes should be created with [`FlowGraphBuilder::services`] so they share
/// one repository, dispatcher, event bus and global handler list.
pub struct FlowGraphBuilder<T> {
    flow_id: String,
    services: NodeServices<T>,
    nodes: BTreeMap<String, Node<T>>,
    adjacency: BTreeMap<String, Vec<String>>,
    joins: Vec<JoinSpec>,
    entry: Option<String>,
    default_demand: u64,
}

struct JoinSpec {
    target: String,
    branches: Vec<String>,
    mode: ParallelMode,
}

impl<T> FlowGraphBuilder<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            services: NodeServices::default(),
            nodes: BTreeMap::new(),
            adjacency: BTreeMap::new(),
            joins: Vec::new(),
            entry: None,
            default_demand: 0,
        }
    }

    /// Flow id, event capacity, demand and context store from configuration.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let mut builder = Self::new(config.runtime.flow_id.clone());
        builder.services.repo = open_repository(&config.store)?;
        builder.services.events = Arc::new(EventBus::new(config.runtime.event_capacity));
        builder.default_demand = u64::try_from(config.runtime.default_demand).unwrap_or(0);
        Ok(builder)
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.services.dispatcher = dispatcher;
        self
    }

    pub fn global_error_handler(self, handler: Arc<dyn GlobalErrorHandler<T>>) -> Self {
        self.services.global_handlers.add(handler);
        self
    }

    pub fn services(&self) -> NodeServices<T> {
        self.services.clone()
    }

    pub fn node(mut self, node: Node<T>) -> Self {
        self.nodes.insert(node.id().to_string(), node);
        self
    }

    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.adjacency.entry(from.into()).or_default().push(to.into());
        self
    }

    /// Fan `branches` in to `target` through a join: per trace, `target`
    /// receives the branches' merged output once `mode` is satisfied.
    pub fn join(mut self, target: impl Into<String>, branches: &[&str], mode: ParallelMode) -> Self {
        self.joins.push(JoinSpec {
            target: target.into(),
            branches: branches.iter().map(|b| b.to_string()).collect(),
            mode,
        });
        self
    }

    pub fn entry(mut self, id: impl Into<String>) -> Self {
        self.entry = Some(id.into());
        self
    }

    /// Validate the topology and wire every edge through the upstream emitter.
    pub fn build(self) -> Result<Arc<FlowGraph<T>>> {
        let entry_id = self
            .entry
            .clone()
            .ok_or_else(|| SluiceError::Config("flow graph has no entry node".into()))?;
        let entry = self
            .nodes
            .get(&entry_id)
            .cloned()
            .ok_or_else(|| SluiceError::NodeNotFound(entry_id.clone()))?;

        for (from, tos) in &self.adjacency {
            for id in std::iter::once(from).chain(tos) {
                if !self.nodes.contains_key(id) {
                    return Err(SluiceError::NodeNotFound(id.clone()));
                }
            }
        }
        self.check_joins()?;
        let mut topology = self.adjacency.clone();
        for join in &self.joins {
            for branch in &join.branches {
                topology
                    .entry(branch.clone())
                    .or_default()
                    .push(join.target.clone());
            }
        }
        check_acyclic(&topology)?;

        for (from, tos) in &self.adjacency {
            let upstream = &self.nodes[from];
            for to in tos {
                upstream.emitter().register(self.nodes[to].clone());
            }
        }

        let registry = Arc::new(WindowRegistry::new());
        let mut fan_ins = Vec::with_capacity(self.joins.len());
        for join in &self.joins {
            let fan_in = Arc::new(FanIn::new(
                self.flow_id.as_str(),
                self.nodes[&join.target].clone(),
                join.branches.clone(),
                join.mode,
                registry.clone(),
            ));
            for branch in &join.branches {
                FanInBranch::attach(&fan_in, &self.nodes[branch]);
            }
            fan_ins.push(fan_in);
        }

        info!(
            flow = %self.flow_id,
            nodes = self.nodes.len(),
            edges = topology.values().map(Vec::len).sum::<usize>(),
            joins = fan_ins.len(),
            "Flow graph built"
        );
        Ok(Arc::new(FlowGraph {
            flow_id: self.flow_id,
            entry,
            nodes: self.nodes.into_iter().collect(),
            adjacency: topology.into_iter().collect(),
            services: self.services,
            registry,
            fan_ins,
            default_demand: self.default_demand,
        }))
    }

    fn check_joins(&self) -> Result<()> {
        for join in &self.joins {
            for id in std::iter::once(&join.target).chain(&join.branches) {
                if !self.nodes.contains_key(id) {
                    return Err(SluiceError::NodeNotFound(id.clone()));
                }
            }
            if join.branches.is_empty() {
                return Err(SluiceError::Config(format!(
                    "join into {} has no branches",
                    join.target
                )));
            }
            for (i, branch) in join.branches.iter().enumerate() {
                if join.branches[..i].contains(branch) {
                    return Err(SluiceError::Config(format!(
                        "join into {} lists branch {} twice",
                        join.target, branch
                    )));
                }
                let direct = self
                    .adjacency
                    .get(branch)
                    .is_some_and(|tos| tos.contains(&join.target));
                if direct {
                    return Err(SluiceError::Config(format!(
                        "{} reaches {} both directly and through a join",
                        branch, join.target
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_acyclic(adjacency: &BTreeMap<String, Vec<String>>) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        id: &'a str,
        adjacency: &'a BTreeMap<String, Vec<String>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<()> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(SluiceError::Config(format!("flow graph has a cycle through {}", id)))
            }
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        for next in adjacency.get(id).into_iter().flatten() {
            visit(next, adjacency, marks)?;
        }
        marks.insert(id, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for id in adjacency.keys() {
        visit(id, adjacency, &mut marks)?;
    }
    Ok(())
}

/// A built flow: node registry, adjacency list and the shared window cache.
pub struct FlowGraph<T> {
    flow_id: String,
    entry: Node<T>,
    nodes: HashMap<String, Node<T>>,
    adjacency: HashMap<String, Vec<String>>,
    services: NodeServices<T>,
    registry: Arc<WindowRegistry>,
    fan_ins: Vec<Arc<FanIn<T>>>,
    default_demand: u64,
}

impl<T> FlowGraph<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn builder(flow_id: impl Into<String>) -> FlowGraphBuilder<T> {
        FlowGraphBuilder::new(flow_id)
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.services.events
    }

    pub fn registry(&self) -> &Arc<WindowRegistry> {
        &self.registry
    }

    pub fn node(&self, id: &str) -> Result<Node<T>> {
        self.nodes
            .get(id)
            .cloned()
            .ok_or_else(|| SluiceError::NodeNotFound(id.to_string()))
    }

    pub fn successors(&self, id: &str) -> &[String] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Open a session on this graph. Its root window is marked ongoing
    /// until [`FlowGraph::finish`] closes the input.
    pub fn start_session(&self) -> Arc<FlowSession> {
        let session = FlowSession::new();
        let window = session.begin();
        window.mark_ongoing();
        window.observe(Arc::new(WindowEvents::new(self.services.events.clone())));
        session.subscribe(Arc::new(GraphSessionListener {
            nodes: self.nodes.values().cloned().collect(),
            events: self.services.events.clone(),
            registry: self.registry.clone(),
            fan_ins: self.fan_ins.clone(),
        }));
        debug!(flow = %self.flow_id, session = %session.id(), "Session started");
        session
    }

    /// Feed `data` into the entry node.
    pub fn offer(&self, session: &Arc<FlowSession>, data: Vec<T>) -> Result<()> {
        if !session.is_running() {
            return Err(SluiceError::IllegalState(format!(
                "session {} is not running",
                session.id()
            )));
        }
        if session.is_input_closed() {
            return Err(SluiceError::IllegalState(format!(
                "session {} no longer accepts input",
                session.id()
            )));
        }
        let contexts = data
            .into_iter()
            .map(|d| FlowContext::new(session.clone(), d, self.flow_id.as_str()))
            .collect();
        self.entry.accept(contexts)
    }

    /// Close the session's input. Returns whether the session completed now.
    pub fn finish(&self, session: &Arc<FlowSession>) -> bool {
        session.close_input();
        session.try_complete()
    }

    /// Drive `publisher` into `session`: every item is offered to the entry
    /// node, completion closes the input and failure terminates the session.
    ///
    /// The worker starts with the configured default demand and keeps one
    /// item requested per item consumed.
    pub fn attach(
        self: &Arc<Self>,
        session: &Arc<FlowSession>,
        publisher: Arc<dyn Publisher<T>>,
    ) -> Arc<Worker<T>> {
        let observer = Arc::new(SourceObserver {
            graph: Arc::downgrade(self),
            session: session.clone(),
            upstream: OnceLock::new(),
        });
        let worker = Worker::create(observer, publisher, self.default_demand);
        worker.run();
        worker
    }
}

struct GraphSessionListener<T> {
    nodes: Vec<Node<T>>,
    events: Arc<EventBus>,
    registry: Arc<WindowRegistry>,
    fan_ins: Vec<Arc<FanIn<T>>>,
}

impl<T> GraphSessionListener<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn release(&self, session: &Arc<FlowSession>) {
        for fan_in in &self.fan_ins {
            fan_in.evict_session(session.id());
        }
        self.registry.evict_session(session.id());
    }
}

impl<T> SessionListener for GraphSessionListener<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn on_session_complete(&self, session: &Arc<FlowSession>) {
        for node in &self.nodes {
            node.session_completed(session);
        }
        self.release(session);
        self.events.publish(FlowEvent::SessionCompleted {
            session: session.id().clone(),
        });
    }

    fn on_session_terminated(&self, session: &Arc<FlowSession>, reason: &str) {
        self.release(session);
        self.events.publish(FlowEvent::SessionTerminated {
            session: session.id().clone(),
            reason: reason.to_string(),
        });
    }
}

struct SourceObserver<T> {
    graph: Weak<FlowGraph<T>>,
    session: Arc<FlowSession>,
    upstream: OnceLock<Arc<dyn Subscription>>,
}

impl<T> SourceObserver<T> {
    fn graph(&self) -> Result<Arc<FlowGraph<T>>> {
        self.graph
            .upgrade()
            .ok_or_else(|| SluiceError::IllegalState("flow graph dropped".into()))
    }
}

impl<T> WorkerObserver<T> for SourceObserver<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn on_subscribed(&self, subscription: &Arc<dyn Subscription>) -> Result<()> {
        let _ = self.upstream.set(subscription.clone());
        Ok(())
    }

    fn on_consumed(&self, item: T, _sequence: u64) -> Result<()> {
        self.graph()?.offer(&self.session, vec![item])?;
        match self.upstream.get() {
            Some(upstream) => upstream.request(1),
            None => Ok(()),
        }
    }

    fn on_failed(&self, error: SluiceError) -> Result<()> {
        self.session.terminate(&error.to_string());
        Ok(())
    }

    fn on_completed(&self) -> Result<()> {
        self.graph()?.finish(&self.session);
        Ok(())
    }
}
