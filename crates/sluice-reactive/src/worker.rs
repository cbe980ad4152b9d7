use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use sluice_core::error::{ensure_positive, Result, SluiceError};
use tracing::{debug, warn};

use crate::once::{OnceFlag, Terminal};
use crate::stream::{Publisher, Subscriber, Subscription};

/// Callbacks driven by a [`Worker`].
///
/// Errors returned here are logged and never interrupt the signal flow.
pub trait WorkerObserver<T>: Send + Sync {
    fn on_subscribed(&self, subscription: &Arc<dyn Subscription>) -> Result<()>;

    /// `sequence` numbers items from 0 in arrival order.
    fn on_consumed(&self, item: T, sequence: u64) -> Result<()>;

    fn on_failed(&self, error: SluiceError) -> Result<()>;

    fn on_completed(&self) -> Result<()>;
}

/// Adapts a publisher into an observer-driven, demand-bounded consumption loop.
///
/// The worker never buffers: every item is handed to the observer as it
/// arrives, and upstream only sends what was requested. Demand requested
/// before the upstream handshake is remembered and forwarded on subscription.
pub struct Worker<T> {
    observer: Arc<dyn WorkerObserver<T>>,
    publisher: Arc<dyn Publisher<T>>,
    initial_demand: i64,
    upstream: OnceLock<Arc<dyn Subscription>>,
    pending: AtomicI64,
    sequence: AtomicU64,
    started: OnceFlag,
    cancelled: OnceFlag,
    terminal: Terminal,
    me: Weak<Worker<T>>,
}

impl<T: Send + 'static> Worker<T> {
    /// `initial_demand` of 0 waits for an explicit [`Worker::request`].
    pub fn create(
        observer: Arc<dyn WorkerObserver<T>>,
        publisher: Arc<dyn Publisher<T>>,
        initial_demand: u64,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            observer,
            publisher,
            initial_demand: i64::try_from(initial_demand).unwrap_or(i64::MAX),
            upstream: OnceLock::new(),
            pending: AtomicI64::new(0),
            sequence: AtomicU64::new(0),
            started: OnceFlag::new(),
            cancelled: OnceFlag::new(),
            terminal: Terminal::new(),
            me: me.clone(),
        })
    }

    /// Subscribe to the publisher. Only the first call has an effect.
    pub fn run(&self) {
        if !self.started.try_set() {
            return;
        }
        if let Some(me) = self.me.upgrade() {
            self.publisher.subscribe(me);
        }
    }
}

impl<T> Worker<T> {
    pub fn request(&self, count: i64) -> Result<()> {
        ensure_positive(count, "requested count")?;
        if self.cancelled.is_set() {
            return Ok(());
        }
        match self.upstream.get() {
            Some(upstream) => upstream.request(count),
            None => {
                add_saturating(&self.pending, count);
                // The handshake may have landed between the lookup and the stash.
                if let Some(upstream) = self.upstream.get() {
                    self.flush_pending(upstream)?;
                }
                Ok(())
            }
        }
    }

    pub fn cancel(&self) {
        if !self.cancelled.try_set() {
            return;
        }
        debug!("Worker cancelled");
        if let Some(upstream) = self.upstream.get() {
            upstream.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_set()
    }

    fn flush_pending(&self, upstream: &Arc<dyn Subscription>) -> Result<()> {
        let pending = self.pending.swap(0, Ordering::AcqRel);
        if pending > 0 {
            upstream.request(pending)?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.cancelled.is_set() || self.terminal.is_terminated()
    }
}

impl<T: Send + 'static> Subscriber<T> for Worker<T> {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>) {
        if self.upstream.set(subscription.clone()).is_err() {
            warn!("Worker received a second subscription, cancelling it");
            subscription.cancel();
            return;
        }
        if self.cancelled.is_set() {
            subscription.cancel();
            return;
        }
        if let Err(e) = self.observer.on_subscribed(&subscription) {
            warn!(error = %e, "Worker observer failed on subscribe");
        }
        if self.initial_demand > 0 {
            add_saturating(&self.pending, self.initial_demand);
        }
        if let Err(e) = self.flush_pending(&subscription) {
            warn!(error = %e, "Failed to forward initial demand");
        }
    }

    fn consume(&self, item: T) {
        if self.is_closed() {
            debug!("Dropping item delivered after worker closed");
            return;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.observer.on_consumed(item, sequence) {
            warn!(sequence, error = %e, "Worker observer failed on consume");
        }
    }

    fn fail(&self, error: SluiceError) {
        if self.cancelled.is_set() || !self.terminal.try_fail() {
            return;
        }
        if let Err(e) = self.observer.on_failed(error) {
            warn!(error = %e, "Worker observer failed on failure signal");
        }
    }

    fn complete(&self) {
        if self.cancelled.is_set() || !self.terminal.try_complete() {
            return;
        }
        if let Err(e) = self.observer.on_completed() {
            warn!(error = %e, "Worker observer failed on completion");
        }
    }
}

fn add_saturating(target: &AtomicI64, delta: i64) {
    let _ = target.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        Some(v.saturating_add(delta))
    });
}
