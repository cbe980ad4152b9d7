use std::sync::Arc;

use sluice_core::error::{Result, SluiceError};

/// Demand and cancellation handle given to a subscriber.
pub trait Subscription: Send + Sync {
    /// Grant `count` more items. `count` must be positive; ignored once cancelled.
    fn request(&self, count: i64) -> Result<()>;

    /// Stop the flow. Idempotent and irreversible.
    fn cancel(&self);

    fn is_cancelled(&self) -> bool;
}

/// Consumer side of the handshake.
///
/// Receives exactly one `on_subscribed`, then at most as many `consume`
/// calls as it requested, then at most one of `complete` / `fail`.
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>);

    fn consume(&self, item: T);

    fn fail(&self, error: SluiceError);

    fn complete(&self);
}

/// Producer side of the handshake.
pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}
