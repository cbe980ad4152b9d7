use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use sluice_core::error::{Result, SluiceError};
use tracing::debug;

use crate::counter::Counter;
use crate::once::Terminal;
use crate::stream::{Publisher, Subscriber, Subscription};
use crate::subscription::{CallbackSubscription, SubscriptionGuard};

/// Cold publisher replaying a fixed sequence to every subscriber, honouring demand.
pub struct IterPublisher<T> {
    items: Vec<T>,
}

impl<T> IterPublisher<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }

    pub fn just(item: T) -> Self {
        Self { items: vec![item] }
    }

    pub fn empty() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> Publisher<T> for IterPublisher<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = IterSubscription::new(self.items.iter().cloned(), subscriber.clone());
        subscriber.on_subscribed(subscription.clone());
        // Empty sequences complete without waiting for demand.
        subscription.drain();
    }
}

struct IterSubscription<T> {
    guard: SubscriptionGuard,
    items: Mutex<VecDeque<T>>,
    demand: Counter,
    wip: AtomicUsize,
    terminal: Terminal,
    subscriber: Mutex<Option<Arc<dyn Subscriber<T>>>>,
    me: Weak<IterSubscription<T>>,
}

impl<T: Send + 'static> IterSubscription<T> {
    fn new(items: impl Iterator<Item = T>, subscriber: Arc<dyn Subscriber<T>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            guard: SubscriptionGuard::new(),
            items: Mutex::new(items.collect()),
            demand: Counter::zero(),
            wip: AtomicUsize::new(0),
            terminal: Terminal::new(),
            subscriber: Mutex::new(Some(subscriber)),
            me: me.clone(),
        })
    }

    fn subscriber(&self) -> Option<Arc<dyn Subscriber<T>>> {
        self.subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn release(&self) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn pop(&self) -> Option<T> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn is_exhausted(&self) -> bool {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Emit while there is demand. Re-entrant requests are folded into the
    /// running loop instead of recursing.
    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let Some(subscriber) = self.subscriber() else {
            return;
        };
        let mut missed = 1;
        loop {
            while !self.guard.is_cancelled() && self.demand.value() > 0 {
                let Some(item) = self.pop() else {
                    break;
                };
                self.demand.decrement();
                subscriber.consume(item);
            }

            if self.guard.is_cancelled() {
                return;
            }
            if self.is_exhausted() && self.terminal.try_complete() {
                subscriber.complete();
                self.release();
                return;
            }

            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                break;
            }
        }
    }
}

impl<T: Send + 'static> Subscription for IterSubscription<T> {
    fn request(&self, count: i64) -> Result<()> {
        if !self.guard.admit(count)? {
            return Ok(());
        }
        self.demand.increase(count)?;
        if let Some(me) = self.me.upgrade() {
            me.drain();
        }
        Ok(())
    }

    fn cancel(&self) {
        if self.guard.cancel() {
            debug!("Iterator subscription cancelled");
            self.release();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.guard.is_cancelled()
    }
}

/// Publisher that fails every subscriber right after the handshake.
pub struct FailingPublisher {
    message: String,
}

impl FailingPublisher {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl<T> Publisher<T> for FailingPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = Arc::new(CallbackSubscription::noop());
        subscriber.on_subscribed(subscription.clone());
        if !subscription.is_cancelled() {
            subscriber.fail(SluiceError::Upstream(self.message.clone()));
        }
    }
}
