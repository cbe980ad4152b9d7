//! The node-level processing contract.
//!
//! A node accepts batches of contexts, gates them through an optional
//! [`Block`], filters, processes each context, and emits derived contexts to
//! its listeners. Failures go to the node's own error handlers first, then to
//! the global ones; anything left unhandled terminates the session.

mod block;
mod dispatch;
mod emitter;
mod operators;
mod processing;

pub use block::Block;
pub use dispatch::{Dispatcher, InlineDispatcher, Task, TokioDispatcher};
pub use emitter::{Collector, Emitter, EmitterListener};
pub use operators::{
    ContextCallback, ErrorHandler, ErrorOutcome, Filter, GlobalErrorHandler, SessionCallback,
};
pub use processing::{NodeProcessor, NodeServices, ProcessingNode};

use std::sync::Arc;
use std::time::Duration;

use sluice_core::error::Result;
use sluice_core::status::ProcessType;

use crate::context::FlowContext;
use crate::repo::ContextRepository;
use crate::session::FlowSession;

/// The processing entry point a retry resubmits to.
pub trait ProcessTarget<I>: Send + Sync {
    fn id(&self) -> &str;

    /// Process `contexts`. With `in_thread = false` the batch is handed to the
    /// node's dispatcher instead of running on the caller's thread.
    fn on_process(
        &self,
        process_type: ProcessType,
        contexts: Vec<FlowContext<I>>,
        in_thread: bool,
    ) -> Result<()>;

    /// Process an already accepted batch again once `delay` has passed.
    fn resubmit(&self, contexts: Vec<FlowContext<I>>, delay: Duration) -> Result<()> {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.on_process(ProcessType::Process, contexts, false)
    }
}

pub trait FlowSubscriber<I, O>: ProcessTarget<I> {
    /// Entry point for a new batch from upstream.
    fn accept(&self, contexts: Vec<FlowContext<I>>) -> Result<()>;

    /// Entry point for contexts this node already accepted.
    fn process(&self, contexts: Vec<FlowContext<I>>) -> Result<()>;

    fn block(&self) -> Option<Arc<Block<I>>>;

    fn pre_filters(&self) -> Vec<Arc<Filter<I>>>;

    fn post_filters(&self) -> Vec<Arc<Filter<O>>>;

    fn error_handlers(&self) -> Vec<Arc<dyn ErrorHandler<I>>>;

    fn global_error_handlers(&self) -> Vec<Arc<dyn GlobalErrorHandler<I>>>;

    fn context_repo(&self) -> Arc<dyn ContextRepository<I>>;

    fn emitter(&self) -> &Emitter<O>;

    /// Run the session-level completion callbacks for `session`.
    fn session_completed(&self, session: &Arc<FlowSession>);
}
