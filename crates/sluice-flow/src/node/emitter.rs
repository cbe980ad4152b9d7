use std::sync::{Arc, Mutex, PoisonError};

use sluice_core::error::{Result, SluiceError};
use sluice_core::types::SessionId;
use sluice_reactive::ObserverList;
use tracing::warn;

use crate::context::FlowContext;
use crate::session::FlowSession;

/// Receives what a node emits.
pub trait EmitterListener<O>: Send + Sync {
    fn on_emit(&self, contexts: Vec<FlowContext<O>>) -> Result<()>;

    /// Upstream failed for `session` and nothing handled it.
    fn on_fail(&self, _error: &SluiceError, _session: &Arc<FlowSession>) {}
}

/// Fan-out of a node's output to its listeners.
pub struct Emitter<O> {
    listeners: ObserverList<dyn EmitterListener<O>>,
}

impl<O: Clone> Emitter<O> {
    pub fn new() -> Self {
        Self {
            listeners: ObserverList::new(),
        }
    }

    pub fn register(&self, listener: Arc<dyn EmitterListener<O>>) {
        self.listeners.add(listener);
    }

    pub fn unregister(&self, listener: &Arc<dyn EmitterListener<O>>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Hand `contexts` to every listener and return how many there were.
    ///
    /// Every listener sees the batch even if an earlier one rejects it. The
    /// first rejection is returned; later ones are logged.
    pub fn emit(&self, contexts: Vec<FlowContext<O>>) -> Result<usize> {
        let listeners = self.listeners.snapshot();
        let Some((last, rest)) = listeners.split_last() else {
            return Ok(0);
        };
        let mut rejection = None;
        for listener in rest {
            note(&mut rejection, listener.on_emit(contexts.clone()));
        }
        note(&mut rejection, last.on_emit(contexts));
        match rejection {
            Some(e) => Err(e),
            None => Ok(listeners.len()),
        }
    }

    pub fn fail(&self, error: &SluiceError, session: &Arc<FlowSession>) {
        for listener in self.listeners.snapshot().iter() {
            listener.on_fail(error, session);
        }
    }
}

impl<O: Clone> Default for Emitter<O> {
    fn default() -> Self {
        Self::new()
    }
}

fn note(rejection: &mut Option<SluiceError>, delivered: Result<()>) {
    if let Err(e) = delivered {
        match rejection {
            None => *rejection = Some(e),
            Some(_) => warn!(error = %e, "Emitter listener rejected batch"),
        }
    }
}

/// Terminal listener that keeps everything it receives.
pub struct Collector<O> {
    emitted: Mutex<Vec<FlowContext<O>>>,
    failures: Mutex<Vec<(SessionId, String)>>,
}

impl<O: Clone> Collector<O> {
    pub fn new() -> Self {
        Self {
            emitted: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn contexts(&self) -> Vec<FlowContext<O>> {
        self.emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn data(&self) -> Vec<O> {
        self.contexts().into_iter().map(FlowContext::into_data).collect()
    }

    pub fn failures(&self) -> Vec<(SessionId, String)> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<O: Clone> Default for Collector<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: Clone + Send + Sync> EmitterListener<O> for Collector<O> {
    fn on_emit(&self, contexts: Vec<FlowContext<O>>) -> Result<()> {
        self.emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(contexts);
        Ok(())
    }

    fn on_fail(&self, error: &SluiceError, session: &Arc<FlowSession>) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((session.id().clone(), error.to_string()));
    }
}
