use sluice_core::error::{ensure_positive, Result};

use crate::once::OnceFlag;
use crate::stream::Subscription;

/// Shared request/cancel bookkeeping for subscription implementations.
#[derive(Debug, Default)]
pub struct SubscriptionGuard {
    cancelled: OnceFlag,
}

impl SubscriptionGuard {
    pub const fn new() -> Self {
        Self {
            cancelled: OnceFlag::new(),
        }
    }

    /// Validate a request. `Ok(false)` means the request must be dropped
    /// because the subscription is already cancelled.
    pub fn admit(&self, count: i64) -> Result<bool> {
        ensure_positive(count, "requested count")?;
        Ok(!self.cancelled.is_set())
    }

    /// Returns `true` for the single caller that performs the cancellation.
    pub fn cancel(&self) -> bool {
        self.cancelled.try_set()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_set()
    }
}

type RequestFn = Box<dyn Fn(i64) + Send + Sync>;
type ReleaseFn = Box<dyn Fn() + Send + Sync>;

/// Subscription assembled from closures.
///
/// `on_release` runs exactly once, on the first `cancel`.
pub struct CallbackSubscription {
    guard: SubscriptionGuard,
    on_request: RequestFn,
    on_release: ReleaseFn,
}

impl CallbackSubscription {
    pub fn new(
        on_request: impl Fn(i64) + Send + Sync + 'static,
        on_release: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            guard: SubscriptionGuard::new(),
            on_request: Box::new(on_request),
            on_release: Box::new(on_release),
        }
    }

    /// A subscription that ignores requests and releases nothing.
    pub fn noop() -> Self {
        Self::new(|_| {}, || {})
    }
}

impl Subscription for CallbackSubscription {
    fn request(&self, count: i64) -> Result<()> {
        if self.guard.admit(count)? {
            (self.on_request)(count);
        }
        Ok(())
    }

    fn cancel(&self) {
        if self.guard.cancel() {
            (self.on_release)();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.guard.is_cancelled()
    }
}
