use std::sync::{Arc, Mutex, PoisonError};

use sluice_core::error::{Result, SluiceError};
use tracing::debug;

use crate::once::{OnceFlag, Terminal};
use crate::stream::{Publisher, Subscriber, Subscription};
use crate::subscription::SubscriptionGuard;
use crate::worker::{Worker, WorkerObserver};

/// Single-result view of a publisher.
///
/// Whatever the wrapped publisher does, a subscriber sees at most one
/// `consume` followed by exactly one terminal signal. Upstream is asked for a
/// single item and cancelled as soon as it has delivered it.
pub struct Solo<T> {
    publisher: Arc<dyn Publisher<T>>,
}

impl<T: Send + 'static> Solo<T> {
    pub fn from_publisher(publisher: Arc<dyn Publisher<T>>) -> Self {
        Self { publisher }
    }
}

impl<T: Send + 'static> Publisher<T> for Solo<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = SoloSubscription::new(subscriber.clone());
        let worker = Worker::create(subscription.clone(), self.publisher.clone(), 0);
        subscription.attach(worker.clone());
        subscriber.on_subscribed(subscription);
        worker.run();
    }
}

struct SoloSubscription<T> {
    guard: SubscriptionGuard,
    requested: OnceFlag,
    terminal: Terminal,
    subscriber: Mutex<Option<Arc<dyn Subscriber<T>>>>,
    worker: Mutex<Option<Arc<Worker<T>>>>,
}

impl<T: Send + 'static> SoloSubscription<T> {
    fn new(subscriber: Arc<dyn Subscriber<T>>) -> Arc<Self> {
        Arc::new(Self {
            guard: SubscriptionGuard::new(),
            requested: OnceFlag::new(),
            terminal: Terminal::new(),
            subscriber: Mutex::new(Some(subscriber)),
            worker: Mutex::new(None),
        })
    }

    fn attach(&self, worker: Arc<Worker<T>>) {
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
    }

    fn worker(&self) -> Option<Arc<Worker<T>>> {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the downstream subscriber and stop upstream. Breaks the
    /// worker <-> subscription reference cycle.
    fn release(&self) -> Option<Arc<dyn Subscriber<T>>> {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.cancel();
        }
        self.subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl<T: Send + 'static> Subscription for SoloSubscription<T> {
    fn request(&self, count: i64) -> Result<()> {
        if !self.guard.admit(count)? || !self.requested.try_set() {
            return Ok(());
        }
        match self.worker() {
            Some(worker) => worker.request(1),
            None => Ok(()),
        }
    }

    fn cancel(&self) {
        if self.guard.cancel() {
            debug!("Solo subscription cancelled");
            self.release();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.guard.is_cancelled()
    }
}

impl<T: Send + 'static> WorkerObserver<T> for SoloSubscription<T> {
    fn on_subscribed(&self, _subscription: &Arc<dyn Subscription>) -> Result<()> {
        Ok(())
    }

    fn on_consumed(&self, item: T, sequence: u64) -> Result<()> {
        if self.guard.is_cancelled() || !self.terminal.try_complete() {
            debug!(sequence, "Solo dropped surplus item");
            return Ok(());
        }
        if let Some(subscriber) = self.release() {
            subscriber.consume(item);
            subscriber.complete();
        }
        Ok(())
    }

    fn on_failed(&self, error: SluiceError) -> Result<()> {
        if self.guard.is_cancelled() || !self.terminal.try_fail() {
            return Ok(());
        }
        if let Some(subscriber) = self.release() {
            subscriber.fail(error);
        }
        Ok(())
    }

    fn on_completed(&self) -> Result<()> {
        if self.guard.is_cancelled() || !self.terminal.try_complete() {
            return Ok(());
        }
        if let Some(subscriber) = self.release() {
            subscriber.complete();
        }
        Ok(())
    }
}
