use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_core::error::{Result, SluiceError};
use sluice_core::types::SessionId;
use sluice_reactive::{Counter, ObserverList};
use tracing::{debug, info};

use crate::window::Window;

/// Where a session is in its lifecycle. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Completed,
    Terminated,
}

const RUNNING: u8 = 0;
const COMPLETED: u8 = 1;
const TERMINATED: u8 = 2;

/// Notified once when a session leaves the running state.
pub trait SessionListener: Send + Sync {
    fn on_session_complete(&self, session: &Arc<FlowSession>);

    fn on_session_terminated(&self, _session: &Arc<FlowSession>, _reason: &str) {}
}

/// One logical invocation through the flow graph.
///
/// Sessions nest: a child keeps its parent alive and stops running as soon as
/// any ancestor stops. Every context a session produces shares it.
pub struct FlowSession {
    id: SessionId,
    parent: Option<Arc<FlowSession>>,
    window: OnceLock<Arc<Window>>,
    state: AtomicU8,
    in_flight: Counter,
    listeners: ObserverList<dyn SessionListener>,
    created_at: DateTime<Utc>,
}

impl FlowSession {
    pub fn new() -> Arc<Self> {
        Self::with_id(SessionId::new())
    }

    pub fn with_id(id: SessionId) -> Arc<Self> {
        Arc::new(Self::build(id, None))
    }

    /// Derive a session nested under `parent`.
    pub fn child(parent: &Arc<FlowSession>) -> Arc<Self> {
        Arc::new(Self::build(SessionId::new(), Some(parent.clone())))
    }

    fn build(id: SessionId, parent: Option<Arc<FlowSession>>) -> Self {
        Self {
            id,
            parent,
            window: OnceLock::new(),
            state: AtomicU8::new(RUNNING),
            in_flight: Counter::zero(),
            listeners: ObserverList::new(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn parent(&self) -> Option<&Arc<FlowSession>> {
        self.parent.as_ref()
    }

    /// Number of ancestors above this session.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self.parent.as_ref();
        while let Some(parent) = cursor {
            depth += 1;
            cursor = parent.parent.as_ref();
        }
        depth
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            RUNNING => SessionState::Running,
            COMPLETED => SessionState::Completed,
            _ => SessionState::Terminated,
        }
    }

    /// Running, and so is every ancestor.
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
            && self.parent.as_ref().map_or(true, |p| p.is_running())
    }

    /// Create the root window on first call; later calls return the same window.
    pub fn begin(self: &Arc<Self>) -> Arc<Window> {
        self.window.get_or_init(|| Window::new(self)).clone()
    }

    pub fn window(&self) -> Option<Arc<Window>> {
        self.window.get().cloned()
    }

    /// Anchor an externally created window. A session has at most one.
    pub fn set_window(&self, window: Arc<Window>) -> Result<()> {
        self.window.set(window).map_err(|_| {
            SluiceError::IllegalState(format!("session {} already has a window", self.id))
        })
    }

    pub fn subscribe(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.add(listener);
    }

    /// Account for `count` contexts entering the graph.
    pub fn track(&self, count: usize) {
        if count > 0 {
            let _ = self.in_flight.increase(count as i64);
        }
    }

    /// Account for `count` contexts retiring.
    pub fn settle(&self, count: usize) {
        if count > 0 {
            let _ = self.in_flight.decrease(count as i64);
        }
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.value()
    }

    /// No more input will be offered to this session.
    pub fn close_input(self: &Arc<Self>) {
        self.begin().complete();
    }

    pub fn is_input_closed(&self) -> bool {
        self.window().is_some_and(|w| w.is_complete())
    }

    /// Complete the session if its input is closed and nothing is in flight.
    /// Returns `true` only for the call that performed the transition.
    pub fn try_complete(self: &Arc<Self>) -> bool {
        if !self.is_input_closed() || self.in_flight() > 0 {
            return false;
        }
        if !self.transition(COMPLETED) {
            return false;
        }
        info!(session = %self.id, "Session completed");
        for listener in self.listeners.snapshot().iter() {
            listener.on_session_complete(self);
        }
        true
    }

    /// Stop the session. Returns `true` only for the call that stopped it.
    pub fn terminate(self: &Arc<Self>, reason: &str) -> bool {
        if !self.transition(TERMINATED) {
            return false;
        }
        info!(session = %self.id, reason, "Session terminated");
        for listener in self.listeners.snapshot().iter() {
            listener.on_session_terminated(self, reason);
        }
        true
    }

    fn transition(&self, to: u8) -> bool {
        let won = self
            .state
            .compare_exchange(RUNNING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !won {
            debug!(session = %self.id, "Session already finished");
        }
        won
    }
}

impl fmt::Debug for FlowSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowSession")
            .field("id", &self.id)
            .field("parent", &self.parent.as_ref().map(|p| p.id.clone()))
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
