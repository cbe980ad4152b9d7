use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use sluice_core::error::{Result, SluiceError};
use sluice_core::event::{EventBus, FlowEvent};
use sluice_core::status::{FlowNodeStatus, ProcessType};
use sluice_core::types::BatchId;
use sluice_reactive::ObserverList;
use tracing::{debug, error, info, warn};

use super::operators::partition;
use super::{
    Block, ContextCallback, Dispatcher, Emitter, EmitterListener, ErrorHandler, ErrorOutcome,
    Filter, FlowSubscriber, GlobalErrorHandler, InlineDispatcher, ProcessTarget, SessionCallback,
};
use crate::context::{group_by_session, FlowContext};
use crate::repo::{ContextRepository, MemoryContextRepository};
use crate::retry::Retryable;
use crate::session::FlowSession;

/// Per-context node logic. A context may produce any number of outputs.
pub trait NodeProcessor<I, O>: Send + Sync {
    fn process(&self, context: &FlowContext<I>) -> Result<Vec<O>>;
}

impl<I, O, F> NodeProcessor<I, O> for F
where
    F: Fn(&FlowContext<I>) -> Result<Vec<O>> + Send + Sync,
{
    fn process(&self, context: &FlowContext<I>) -> Result<Vec<O>> {
        self(context)
    }
}

/// Collaborators shared by the nodes of one graph.
pub struct NodeServices<I> {
    pub repo: Arc<dyn ContextRepository<I>>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub events: Arc<EventBus>,
    pub global_handlers: Arc<ObserverList<dyn GlobalErrorHandler<I>>>,
}

impl<I> Clone for NodeServices<I> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
            dispatcher: self.dispatcher.clone(),
            events: self.events.clone(),
            global_handlers: self.global_handlers.clone(),
        }
    }
}

impl<I: Clone + Send + Sync + 'static> Default for NodeServices<I> {
    fn default() -> Self {
        Self {
            repo: Arc::new(MemoryContextRepository::new()),
            dispatcher: Arc::new(InlineDispatcher),
            events: Arc::new(EventBus::default()),
            global_handlers: Arc::new(ObserverList::new()),
        }
    }
}

/// The standard node: filters, per-context processing, emission and
/// failure escalation around a [`NodeProcessor`].
pub struct ProcessingNode<I, O> {
    id: String,
    processor: Box<dyn NodeProcessor<I, O>>,
    pre_filters: ObserverList<Filter<I>>,
    post_filters: ObserverList<Filter<O>>,
    error_handlers: ObserverList<dyn ErrorHandler<I>>,
    on_complete: ObserverList<ContextCallback<I>>,
    on_retire: ObserverList<ContextCallback<I>>,
    on_session_complete: ObserverList<SessionCallback>,
    block: Mutex<Option<Arc<Block<I>>>>,
    emitter: Emitter<O>,
    retryable: Retryable<I>,
    services: NodeServices<I>,
    me: Weak<ProcessingNode<I, O>>,
}

impl<I, O> ProcessingNode<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    pub fn new(
        id: impl Into<String>,
        processor: impl NodeProcessor<I, O> + 'static,
        services: NodeServices<I>,
    ) -> Arc<Self> {
        let id = id.into();
        Arc::new_cyclic(|me: &Weak<Self>| {
            let target: Weak<dyn ProcessTarget<I>> = me.clone();
            Self {
                retryable: Retryable::new(
                    id.clone(),
                    services.repo.clone(),
                    target,
                    services.events.clone(),
                ),
                id,
                processor: Box::new(processor),
                pre_filters: ObserverList::new(),
                post_filters: ObserverList::new(),
                error_handlers: ObserverList::new(),
                on_complete: ObserverList::new(),
                on_retire: ObserverList::new(),
                on_session_complete: ObserverList::new(),
                block: Mutex::new(None),
                emitter: Emitter::new(),
                services,
                me: me.clone(),
            }
        })
    }

    pub fn add_pre_filter(&self, filter: Filter<I>) {
        self.pre_filters.add(Arc::new(filter));
    }

    pub fn add_post_filter(&self, filter: Filter<O>) {
        self.post_filters.add(Arc::new(filter));
    }

    pub fn add_error_handler(&self, handler: Arc<dyn ErrorHandler<I>>) {
        self.error_handlers.add(handler);
    }

    pub fn on_complete(&self, callback: impl Fn(&[FlowContext<I>]) + Send + Sync + 'static) {
        self.on_complete.add(Arc::new(callback));
    }

    /// Called with every group of contexts this node is done with: archived
    /// after emission, filtered out, handled, failed or dropped.
    pub fn on_retire(&self, callback: impl Fn(&[FlowContext<I>]) + Send + Sync + 'static) {
        self.on_retire.add(Arc::new(callback));
    }

    pub fn on_session_complete(&self, callback: impl Fn(&Arc<FlowSession>) + Send + Sync + 'static) {
        self.on_session_complete.add(Arc::new(callback));
    }

    pub fn install_block(&self, block: Arc<Block<I>>) {
        *self.block.lock().unwrap_or_else(PoisonError::into_inner) = Some(block);
    }

    /// Open the installed block and process whatever it was holding.
    pub fn resume_block(&self) -> Result<()> {
        let Some(block) = self.block() else {
            return Ok(());
        };
        let held = block.resume();
        if held.is_empty() {
            return Ok(());
        }
        debug!(node = %self.id, count = held.len(), "Block resumed");
        self.on_process(ProcessType::PreProcess, held, false)
    }

    pub fn retryable(&self) -> &Retryable<I> {
        &self.retryable
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.services.events
    }

    /// Any error after the batch was tracked fails its sessions before it
    /// is returned.
    fn run(&self, process_type: ProcessType, contexts: Vec<FlowContext<I>>) -> Result<()> {
        let mut outstanding = Outstanding::of(&contexts);
        let result = self.run_batch(process_type, contexts, &mut outstanding);
        if let Err(e) = &result {
            self.abandon(e, outstanding);
        }
        result
    }

    fn run_batch(
        &self,
        process_type: ProcessType,
        contexts: Vec<FlowContext<I>>,
        outstanding: &mut Outstanding,
    ) -> Result<()> {
        let contexts = self.retire_stopped(contexts, outstanding)?;
        let contexts = match process_type {
            ProcessType::PreProcess => self.apply_pre_filters(contexts, outstanding),
            ProcessType::Process => contexts,
        };
        if contexts.is_empty() {
            return Ok(());
        }

        let batch = BatchId::new();
        let mut processing = Vec::with_capacity(contexts.len());
        for mut ctx in contexts {
            if ctx.status() == FlowNodeStatus::Pending {
                ctx.set_status(FlowNodeStatus::Ready)?;
            }
            ctx.set_status(FlowNodeStatus::Processing)?;
            ctx.set_batch(batch.clone());
            processing.push(ctx);
        }
        self.services.repo.update(&processing)?;
        debug!(node = %self.id, batch = %batch, count = processing.len(), "Processing batch");

        let mut archived = Vec::new();
        let mut outputs = Vec::new();
        let mut failed = Vec::new();
        let mut messages = Vec::new();
        for mut ctx in processing {
            match self.processor.process(&ctx) {
                Ok(values) => {
                    outputs.extend(values.into_iter().map(|v| ctx.generate(v, self.id.as_str())));
                    ctx.set_status(FlowNodeStatus::Archived)?;
                    archived.push(ctx);
                }
                Err(e) => {
                    warn!(node = %self.id, context = %ctx.id(), error = %e, "Context failed");
                    let message = e.to_string();
                    ctx.record_failure(message.clone());
                    ctx.set_status(FlowNodeStatus::Error)?;
                    messages.push(message);
                    failed.push(ctx);
                }
            }
        }

        if !archived.is_empty() {
            self.archive(archived, outputs, outstanding)?;
        }
        if !failed.is_empty() {
            self.escalate(failed, messages, outstanding)?;
        }
        Ok(())
    }

    /// Contexts of stopped sessions never reach the processor.
    fn retire_stopped(
        &self,
        contexts: Vec<FlowContext<I>>,
        outstanding: &mut Outstanding,
    ) -> Result<Vec<FlowContext<I>>> {
        let (live, stopped): (Vec<_>, Vec<_>) = contexts
            .into_iter()
            .partition(|ctx| ctx.session().is_running());
        if stopped.is_empty() {
            return Ok(live);
        }

        let mut retired = Vec::with_capacity(stopped.len());
        for mut ctx in stopped {
            if ctx.status().is_running_status() {
                ctx.set_status(FlowNodeStatus::Terminate)?;
            }
            retired.push(ctx);
        }
        debug!(node = %self.id, count = retired.len(), "Dropping contexts of stopped sessions");
        self.services.repo.update(&retired)?;
        self.settle(&retired, outstanding);
        Ok(live)
    }

    /// Rejected contexts stay `PENDING` in the repository and leave the flow.
    fn apply_pre_filters(
        &self,
        contexts: Vec<FlowContext<I>>,
        outstanding: &mut Outstanding,
    ) -> Vec<FlowContext<I>> {
        let filters = self.pre_filters.snapshot();
        let (kept, rejected) = partition(&filters, contexts);
        if !rejected.is_empty() {
            debug!(node = %self.id, count = rejected.len(), "Contexts filtered before processing");
            self.settle(&rejected, outstanding);
        }
        kept
    }

    fn archive(
        &self,
        archived: Vec<FlowContext<I>>,
        outputs: Vec<FlowContext<O>>,
        outstanding: &mut Outstanding,
    ) -> Result<()> {
        let filters = self.post_filters.snapshot();
        let (emitted, dropped) = partition(&filters, outputs);
        if !dropped.is_empty() {
            debug!(node = %self.id, count = dropped.len(), "Outputs filtered after processing");
        }

        self.services.repo.update(&archived)?;
        for callback in self.on_complete.snapshot().iter() {
            callback(&archived);
        }
        for (session, count) in group_by_session(&archived) {
            self.services.events.publish(FlowEvent::ContextsProcessed {
                node: self.id.clone(),
                session: session.id().clone(),
                count,
            });
        }

        // Downstream accepts track the outputs before the inputs settle, so
        // the session never looks idle in between.
        if !emitted.is_empty() {
            self.emitter.emit(emitted).map_err(|e| {
                SluiceError::node(self.id.as_str(), format!("output rejected downstream: {}", e))
            })?;
        }
        self.settle(&archived, outstanding);
        Ok(())
    }

    fn escalate(
        &self,
        failed: Vec<FlowContext<I>>,
        messages: Vec<String>,
        outstanding: &mut Outstanding,
    ) -> Result<()> {
        let error = SluiceError::node(self.id.as_str(), messages.join("; "));
        self.services.repo.update(&failed)?;

        let mut outcome = self.handle_locally(&error, &failed);
        if outcome == ErrorOutcome::Unhandled {
            outcome = self.handle_globally(&error, &failed);
        }
        match outcome {
            ErrorOutcome::Retried => {
                // The resubmitted batch settles in its own run.
                outstanding.release(&failed);
                debug!(node = %self.id, count = failed.len(), "Failed batch resubmitted");
            }
            ErrorOutcome::Handled => {
                info!(node = %self.id, count = failed.len(), "Failure handled");
                self.settle(&failed, outstanding);
            }
            ErrorOutcome::Unhandled => {
                error!(node = %self.id, error = %error, count = failed.len(), "Unhandled node failure");
                for (session, _) in group_by_session(&failed) {
                    self.fail_session(&error, &session);
                }
                self.settle(&failed, outstanding);
            }
        }
        Ok(())
    }

    fn handle_locally(&self, error: &SluiceError, contexts: &[FlowContext<I>]) -> ErrorOutcome {
        for handler in self.error_handlers.snapshot().iter() {
            match handler.handle(error, &self.retryable, contexts) {
                Ok(ErrorOutcome::Unhandled) => continue,
                Ok(outcome) => return outcome,
                Err(e) => warn!(node = %self.id, error = %e, "Error handler failed"),
            }
        }
        ErrorOutcome::Unhandled
    }

    fn handle_globally(&self, error: &SluiceError, contexts: &[FlowContext<I>]) -> ErrorOutcome {
        for handler in self.services.global_handlers.snapshot().iter() {
            match handler.handle(&self.id, error, contexts) {
                Ok(ErrorOutcome::Unhandled) => continue,
                Ok(outcome) => return outcome,
                Err(e) => warn!(node = %self.id, error = %e, "Global error handler failed"),
            }
        }
        ErrorOutcome::Unhandled
    }

    /// Fail and settle everything a broken run still holds.
    fn abandon(&self, error: &SluiceError, outstanding: Outstanding) {
        error!(node = %self.id, error = %error, "Batch abandoned");
        for (session, count) in outstanding.remaining() {
            self.fail_session(error, &session);
            session.settle(count);
            session.try_complete();
        }
    }

    /// Terminate `session`. Only the call that stops it signals downstream.
    fn fail_session(&self, error: &SluiceError, session: &Arc<FlowSession>) {
        let reason = error.to_string();
        self.services.events.publish(FlowEvent::NodeFailed {
            node: self.id.clone(),
            session: session.id().clone(),
            error: reason.clone(),
        });
        if session.terminate(&reason) {
            self.emitter.fail(error, session);
        }
    }

    fn settle(&self, contexts: &[FlowContext<I>], outstanding: &mut Outstanding) {
        outstanding.release(contexts);
        // Listeners run before the settle so anything they start is tracked.
        for callback in self.on_retire.snapshot().iter() {
            callback(contexts);
        }
        for (session, count) in group_by_session(contexts) {
            session.settle(count);
            session.try_complete();
        }
    }

    /// Hand a batch to the dispatcher to run after `delay`.
    fn hand_off(
        &self,
        process_type: ProcessType,
        contexts: Vec<FlowContext<I>>,
        delay: Duration,
    ) -> Result<()> {
        let Some(me) = self.me.upgrade() else {
            let error = SluiceError::IllegalState(format!("node {} is gone", self.id));
            self.abandon(&error, Outstanding::of(&contexts));
            return Err(error);
        };
        self.services.dispatcher.dispatch_after(
            delay,
            Box::new(move || {
                if let Err(e) = me.run(process_type, contexts) {
                    debug!(node = %me.id, error = %e, "Dispatched batch failed");
                }
            }),
        );
        Ok(())
    }
}

/// Per-session count of contexts a run has not settled yet.
struct Outstanding(Vec<(Arc<FlowSession>, usize)>);

impl Outstanding {
    fn of<T>(contexts: &[FlowContext<T>]) -> Self {
        Self(group_by_session(contexts))
    }

    fn release<T>(&mut self, contexts: &[FlowContext<T>]) {
        for (session, count) in group_by_session(contexts) {
            if let Some((_, left)) = self.0.iter_mut().find(|(s, _)| Arc::ptr_eq(s, &session)) {
                *left = left.saturating_sub(count);
            }
        }
    }

    fn remaining(self) -> impl Iterator<Item = (Arc<FlowSession>, usize)> {
        self.0.into_iter().filter(|(_, left)| *left > 0)
    }
}

impl<I, O> ProcessTarget<I> for ProcessingNode<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn on_process(
        &self,
        process_type: ProcessType,
        contexts: Vec<FlowContext<I>>,
        in_thread: bool,
    ) -> Result<()> {
        if contexts.is_empty() {
            return Ok(());
        }
        if in_thread {
            return self.run(process_type, contexts);
        }
        self.hand_off(process_type, contexts, Duration::ZERO)
    }

    fn resubmit(&self, contexts: Vec<FlowContext<I>>, delay: Duration) -> Result<()> {
        if contexts.is_empty() {
            return Ok(());
        }
        self.hand_off(ProcessType::Process, contexts, delay)
    }
}

impl<I, O> FlowSubscriber<I, O> for ProcessingNode<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    fn accept(&self, contexts: Vec<FlowContext<I>>) -> Result<()> {
        if contexts.is_empty() {
            return Ok(());
        }
        if let Some(bad) = contexts
            .iter()
            .find(|c| !matches!(c.status(), FlowNodeStatus::New | FlowNodeStatus::Pending))
        {
            return Err(SluiceError::IllegalState(format!(
                "node {} cannot accept context {} in status {}",
                self.id,
                bad.id(),
                bad.status()
            )));
        }

        let mut accepted = Vec::with_capacity(contexts.len());
        for mut ctx in contexts {
            ctx.set_status(FlowNodeStatus::Pending)?;
            ctx.set_position(self.id.as_str());
            accepted.push(ctx);
        }
        self.services.repo.save(&accepted)?;
        for (session, count) in group_by_session(&accepted) {
            session.track(count);
        }

        if let Some(block) = self.block() {
            match block.hold(accepted) {
                Some(passed) => accepted = passed,
                None => {
                    debug!(node = %self.id, "Batch held by block");
                    return Ok(());
                }
            }
        }
        self.on_process(ProcessType::PreProcess, accepted, false)
    }

    fn process(&self, contexts: Vec<FlowContext<I>>) -> Result<()> {
        self.on_process(ProcessType::Process, contexts, false)
    }

    fn block(&self) -> Option<Arc<Block<I>>> {
        self.block
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn pre_filters(&self) -> Vec<Arc<Filter<I>>> {
        self.pre_filters.snapshot().to_vec()
    }

    fn post_filters(&self) -> Vec<Arc<Filter<O>>> {
        self.post_filters.snapshot().to_vec()
    }

    fn error_handlers(&self) -> Vec<Arc<dyn ErrorHandler<I>>> {
        self.error_handlers.snapshot().to_vec()
    }

    fn global_error_handlers(&self) -> Vec<Arc<dyn GlobalErrorHandler<I>>> {
        self.services.global_handlers.snapshot().to_vec()
    }

    fn context_repo(&self) -> Arc<dyn ContextRepository<I>> {
        self.services.repo.clone()
    }

    fn emitter(&self) -> &Emitter<O> {
        &self.emitter
    }

    fn session_completed(&self, session: &Arc<FlowSession>) {
        for callback in self.on_session_complete.snapshot().iter() {
            callback(session);
        }
    }
}

/// Nodes listen to their upstream's emitter.
impl<I, O> EmitterListener<I> for ProcessingNode<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    fn on_emit(&self, contexts: Vec<FlowContext<I>>) -> Result<()> {
        self.accept(contexts)
    }

    fn on_fail(&self, error: &SluiceError, session: &Arc<FlowSession>) {
        self.emitter.fail(error, session);
    }
}
