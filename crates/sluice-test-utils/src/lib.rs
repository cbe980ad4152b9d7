//! Probes and fixtures shared by the workspace integration tests.

use std::io::Write;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use sluice_core::error::{Result, SluiceError};
use sluice_reactive::{CallbackSubscription, Publisher, Subscriber, Subscription};
use tempfile::NamedTempFile;

/// Every signal a [`RecordingSubscriber`] observed, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal<T> {
    Subscribed,
    Item(T),
    Failed(String),
    Completed,
}

/// Stream subscriber that records what it receives and grants demand only
/// when told to.
pub struct RecordingSubscriber<T> {
    signals: Mutex<Vec<Signal<T>>>,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    initial_demand: i64,
}

impl<T: Clone> RecordingSubscriber<T> {
    pub fn new() -> Arc<Self> {
        Self::with_demand(0)
    }

    /// Request `demand` as soon as a subscription arrives.
    pub fn with_demand(demand: i64) -> Arc<Self> {
        Arc::new(Self {
            signals: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
            initial_demand: demand,
        })
    }

    pub fn request(&self, count: i64) -> Result<()> {
        self.subscription()?.request(count)
    }

    pub fn cancel(&self) -> Result<()> {
        self.subscription()?.cancel();
        Ok(())
    }

    pub fn signals(&self) -> Vec<Signal<T>> {
        self.lock().clone()
    }

    pub fn items(&self) -> Vec<T> {
        self.lock()
            .iter()
            .filter_map(|s| match s {
                Signal::Item(item) => Some(item.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|s| match s {
                Signal::Failed(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn completions(&self) -> usize {
        self.lock()
            .iter()
            .filter(|s| matches!(s, Signal::Completed))
            .count()
    }

    /// Completed or failed, exactly once.
    pub fn is_terminated(&self) -> bool {
        self.lock()
            .iter()
            .filter(|s| matches!(s, Signal::Completed | Signal::Failed(_)))
            .count()
            == 1
    }

    fn subscription(&self) -> Result<Arc<dyn Subscription>> {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| SluiceError::IllegalState("not subscribed".into()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Signal<T>>> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send> Subscriber<T> for RecordingSubscriber<T> {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>) {
        *self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription.clone());
        self.lock().push(Signal::Subscribed);
        if self.initial_demand > 0 {
            let _ = subscription.request(self.initial_demand);
        }
    }

    fn consume(&self, item: T) {
        self.lock().push(Signal::Item(item));
    }

    fn fail(&self, error: SluiceError) {
        self.lock().push(Signal::Failed(error.to_string()));
    }

    fn complete(&self) {
        self.lock().push(Signal::Completed);
    }
}

/// Hot publisher driven by the test: items are pushed by hand and the
/// demand and cancellation it receives are counted.
pub struct ManualPublisher<T> {
    subscriber: Mutex<Option<Arc<dyn Subscriber<T>>>>,
    requested: Arc<AtomicI64>,
    released: Arc<AtomicUsize>,
}

impl<T> ManualPublisher<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscriber: Mutex::new(None),
            requested: Arc::new(AtomicI64::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Total demand granted by the subscriber so far.
    pub fn requested(&self) -> i64 {
        self.requested.load(Ordering::SeqCst)
    }

    /// How many times the subscription was cancelled.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn push(&self, item: T) -> Result<()> {
        self.current()?.consume(item);
        Ok(())
    }

    pub fn complete(&self) -> Result<()> {
        self.current()?.complete();
        Ok(())
    }

    pub fn fail(&self, message: &str) -> Result<()> {
        self.current()?.fail(SluiceError::Upstream(message.to_string()));
        Ok(())
    }

    fn current(&self) -> Result<Arc<dyn Subscriber<T>>> {
        self.subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| SluiceError::IllegalState("no subscriber".into()))
    }
}

impl<T: Send> Publisher<T> for ManualPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        *self.subscriber.lock().unwrap_or_else(PoisonError::into_inner) = Some(subscriber.clone());
        let requested = self.requested.clone();
        let released = self.released.clone();
        subscriber.on_subscribed(Arc::new(CallbackSubscription::new(
            move |n| {
                requested.fetch_add(n, Ordering::SeqCst);
            },
            move || {
                released.fetch_add(1, Ordering::SeqCst);
            },
        )));
    }
}

/// Write `contents` to a temporary `.toml` file that lives as long as the handle.
pub fn write_config(contents: &str) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Route `tracing` output through the test harness. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("sluice=debug"))
        .with_test_writer()
        .try_init();
}
