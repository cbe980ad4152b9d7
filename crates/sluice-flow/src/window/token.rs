use std::sync::{Arc, MutexGuard, PoisonError};

use sluice_reactive::OnceFlag;

use super::Window;

/// A consumer's claim on a window.
///
/// While a token is alive the window is not done. `begin_consume` excludes
/// every other holder sharing the window's gate until the returned scope is
/// handed back to `finish_consume` (or dropped).
pub struct WindowToken {
    window: Arc<Window>,
    released: OnceFlag,
}

/// Exclusive section opened by [`WindowToken::begin_consume`].
pub struct ConsumeScope<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl WindowToken {
    pub(crate) fn new(window: Arc<Window>) -> Self {
        Self {
            window,
            released: OnceFlag::new(),
        }
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    pub fn begin_consume(&self) -> ConsumeScope<'_> {
        ConsumeScope {
            _guard: self
                .window
                .gate()
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Close the exclusive section and give the token back.
    pub fn finish_consume(&self, scope: ConsumeScope<'_>) {
        drop(scope);
        self.release();
    }

    fn release(&self) {
        if self.released.try_set() {
            self.window.release_token();
        }
    }
}

impl Drop for WindowToken {
    fn drop(&mut self) {
        self.release();
    }
}
