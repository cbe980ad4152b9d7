//! Join windows.
//!
//! A [`Window`] marks the boundary of what a session (or a branch of it) has
//! produced. Branches fanning back in are reconciled by [`MatchWindow`] arms
//! sharing one source window; every mutation of an arm set happens inside a
//! [`WindowToken`] bracket.

mod join;
mod matcher;
mod registry;
mod token;

pub use join::ParallelJoin;
pub use matcher::MatchWindow;
pub use registry::WindowRegistry;
pub use token::{ConsumeScope, WindowToken};

use std::sync::{Arc, Mutex, PoisonError, Weak};

use sluice_core::error::Result;
use sluice_core::event::{EventBus, FlowEvent};
use sluice_core::types::{SessionId, WindowId};
use sluice_reactive::{Counter, ObserverList, OnceFlag};
use tracing::{debug, warn};

use crate::session::FlowSession;

/// Notified exactly once when a window completes.
pub trait WindowListener: Send + Sync {
    fn on_window_complete(&self, window: &Window) -> Result<()>;
}

impl<F> WindowListener for F
where
    F: Fn(&Window) -> Result<()> + Send + Sync,
{
    fn on_window_complete(&self, window: &Window) -> Result<()> {
        self(window)
    }
}

/// Publishes `WindowCompleted` on the event bus.
pub struct WindowEvents {
    bus: Arc<EventBus>,
}

impl WindowEvents {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl WindowListener for WindowEvents {
    fn on_window_complete(&self, window: &Window) -> Result<()> {
        self.bus.publish(FlowEvent::WindowCompleted {
            window: window.id().clone(),
        });
        Ok(())
    }
}

pub struct Window {
    id: WindowId,
    session_id: SessionId,
    session: Weak<FlowSession>,
    from: Option<Arc<Window>>,
    tos: Mutex<Vec<Weak<Window>>>,
    ongoing: OnceFlag,
    complete: OnceFlag,
    tokens: Counter,
    listeners: ObserverList<dyn WindowListener>,
    gate: Arc<Mutex<()>>,
}

impl Window {
    /// Root window of `session`, with its own consume gate.
    pub fn new(session: &Arc<FlowSession>) -> Arc<Self> {
        Arc::new(Self::build(
            WindowId::new(),
            session,
            None,
            Arc::new(Mutex::new(())),
        ))
    }

    /// Window downstream of `source`, sharing `gate` with its siblings.
    pub(crate) fn derived(
        id: WindowId,
        session: &Arc<FlowSession>,
        source: &Arc<Window>,
        gate: Arc<Mutex<()>>,
    ) -> Arc<Self> {
        let window = Arc::new(Self::build(id, session, Some(source.clone()), gate));
        source.add_to(&window);
        window
    }

    fn build(
        id: WindowId,
        session: &Arc<FlowSession>,
        from: Option<Arc<Window>>,
        gate: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            id,
            session_id: session.id().clone(),
            session: Arc::downgrade(session),
            from,
            tos: Mutex::new(Vec::new()),
            ongoing: OnceFlag::new(),
            complete: OnceFlag::new(),
            tokens: Counter::zero(),
            listeners: ObserverList::new(),
            gate,
        }
    }

    pub fn id(&self) -> &WindowId {
        &self.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// The owning session, if it is still alive.
    pub fn session(&self) -> Option<Arc<FlowSession>> {
        self.session.upgrade()
    }

    /// The window this one was derived from.
    pub fn source(&self) -> Option<&Arc<Window>> {
        self.from.as_ref()
    }

    /// Record `to` as downstream of this window.
    pub fn add_to(&self, to: &Arc<Window>) {
        self.tos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(to));
    }

    pub fn tos(&self) -> Vec<Arc<Window>> {
        self.tos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Flag the window as actively producing. Sticky.
    pub fn mark_ongoing(&self) {
        if self.ongoing.try_set() {
            debug!(window = %self.id, "Window ongoing");
        }
    }

    pub fn is_ongoing(&self) -> bool {
        self.ongoing.is_set()
    }

    /// Complete the window. Listeners run only for the call that completed it.
    pub fn complete(&self) -> bool {
        if !self.complete.try_set() {
            return false;
        }
        debug!(window = %self.id, session = %self.session_id, "Window complete");
        for listener in self.listeners.snapshot().iter() {
            if let Err(e) = listener.on_window_complete(self) {
                warn!(window = %self.id, error = %e, "Window listener failed");
            }
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        self.complete.is_set()
    }

    /// Complete with no consumer still holding a token.
    pub fn is_done(&self) -> bool {
        self.is_complete() && self.tokens.value() == 0
    }

    pub fn fulfilled(&self) -> bool {
        self.is_done()
    }

    pub fn active_tokens(&self) -> i64 {
        self.tokens.value()
    }

    pub fn create_token(self: &Arc<Self>) -> WindowToken {
        self.tokens.increment();
        WindowToken::new(self.clone())
    }

    pub fn observe(&self, listener: Arc<dyn WindowListener>) {
        self.listeners.add(listener);
    }

    pub(crate) fn gate(&self) -> &Mutex<()> {
        &self.gate
    }

    pub(crate) fn release_token(&self) {
        self.tokens.decrement();
    }
}
