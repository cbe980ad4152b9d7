use serde::{Deserialize, Serialize};

use crate::types::{SessionId, WindowId};

/// Observable runtime events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    ContextsProcessed {
        node: String,
        session: SessionId,
        count: usize,
    },
    NodeFailed {
        node: String,
        session: SessionId,
        error: String,
    },
    RetryDispatched {
        node: String,
        count: usize,
        attempt: u32,
    },
    SessionCompleted {
        session: SessionId,
    },
    SessionTerminated {
        session: SessionId,
        reason: String,
    },
    WindowCompleted {
        window: WindowId,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
