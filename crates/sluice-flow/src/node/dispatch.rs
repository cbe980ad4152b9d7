use std::time::Duration;

use tokio::runtime::Handle;

use sluice_core::error::{Result, SluiceError};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs batches handed off with `in_thread = false`.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, task: Task);

    /// Run `task` once `delay` has passed. The default waits on the calling
    /// thread.
    fn dispatch_after(&self, delay: Duration, task: Task) {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.dispatch(task);
    }
}

/// Runs every task on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, task: Task) {
        task();
    }
}

/// Runs tasks on a tokio runtime's blocking pool. Node logic is synchronous,
/// so it must stay off the async workers.
#[derive(Debug, Clone)]
pub struct TokioDispatcher {
    handle: Handle,
}

impl TokioDispatcher {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Bind to the runtime the caller is running in.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| SluiceError::IllegalState(format!("no tokio runtime: {}", e)))
    }
}

impl Dispatcher for TokioDispatcher {
    fn dispatch(&self, task: Task) {
        drop(self.handle.spawn_blocking(task));
    }

    /// The wait happens on a timer, never on a runtime thread.
    fn dispatch_after(&self, delay: Duration, task: Task) {
        if delay.is_zero() {
            return self.dispatch(task);
        }
        let handle = self.handle.clone();
        drop(self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            drop(handle.spawn_blocking(task));
        }));
    }
}
