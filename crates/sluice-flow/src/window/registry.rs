use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use sluice_core::error::Result;
use sluice_core::types::{SessionId, WindowId};
use tracing::debug;

use super::{MatchWindow, Window};

/// Match windows created under one (flow, source session) pair.
pub(crate) struct MatchSlot {
    windows: Mutex<HashMap<WindowId, Arc<MatchWindow>>>,
    gate: Arc<Mutex<()>>,
}

impl MatchSlot {
    fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            gate: Arc::new(Mutex::new(())),
        }
    }

    fn windows(&self) -> MutexGuard<'_, HashMap<WindowId, Arc<MatchWindow>>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn gate(&self) -> Arc<Mutex<()>> {
        self.gate.clone()
    }

    pub(crate) fn get_or_try_insert(
        &self,
        id: &WindowId,
        create: impl FnOnce() -> Result<Arc<MatchWindow>>,
    ) -> Result<Arc<MatchWindow>> {
        let mut windows = self.windows();
        if let Some(existing) = windows.get(id) {
            return Ok(existing.clone());
        }
        let created = create()?;
        windows.insert(id.clone(), created.clone());
        Ok(created)
    }

    /// Every cached window anchored to `source`.
    pub(crate) fn arms_of(&self, source: &Arc<Window>) -> Vec<Arc<MatchWindow>> {
        self.windows()
            .values()
            .filter(|w| Arc::ptr_eq(w.source(), source))
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.windows().len()
    }
}

/// Cache of match windows keyed by flow and source session.
#[derive(Default)]
pub struct WindowRegistry {
    slots: DashMap<(String, SessionId), Arc<MatchSlot>>,
}

impl WindowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn slot(&self, flow_id: &str, session: &SessionId) -> Arc<MatchSlot> {
        self.slots
            .entry((flow_id.to_string(), session.clone()))
            .or_insert_with(|| Arc::new(MatchSlot::new()))
            .clone()
    }

    pub fn get(&self, flow_id: &str, session: &SessionId, id: &WindowId) -> Option<Arc<MatchWindow>> {
        let slot = self
            .slots
            .get(&(flow_id.to_string(), session.clone()))?
            .clone();
        let found = slot.windows().get(id).cloned();
        found
    }

    /// Number of match windows cached for one (flow, session) pair.
    pub fn window_count(&self, flow_id: &str, session: &SessionId) -> usize {
        self.slots
            .get(&(flow_id.to_string(), session.clone()))
            .map(|slot| slot.len())
            .unwrap_or(0)
    }

    /// Drop every cached window anchored to `session`, across all flows.
    /// Returns the number of windows released.
    pub fn evict_session(&self, session: &SessionId) -> usize {
        let mut released = 0;
        self.slots.retain(|key, slot| {
            if &key.1 == session {
                released += slot.len();
                false
            } else {
                true
            }
        });
        if released > 0 {
            debug!(session = %session, released, "Evicted match windows");
        }
        released
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
