use std::sync::{Arc, Mutex, PoisonError, Weak};

use sluice_core::error::{Result, SluiceError};
use sluice_core::status::ParallelMode;
use sluice_core::types::WindowId;
use tracing::debug;

use super::registry::MatchSlot;
use super::{Window, WindowRegistry};
use crate::session::FlowSession;

/// One arm of a conditional fan-in.
///
/// Arms sharing a source window form a group. In `Either` mode the first arm
/// to complete releases its siblings; in `All` mode every arm must complete
/// on its own.
pub struct MatchWindow {
    window: Arc<Window>,
    source: Arc<Window>,
    session: Arc<FlowSession>,
    mode: ParallelMode,
    arms: Mutex<Vec<Weak<MatchWindow>>>,
}

impl MatchWindow {
    /// Look up or create the arm `id` under `source`, then refresh the arm
    /// set of the whole group.
    ///
    /// Idempotent per (flow, source session, id): repeated calls return the
    /// same arm, and the mode of an existing arm is kept. `data` is accepted
    /// for call-site symmetry with other window factories and is not stored.
    pub fn from<D: ?Sized>(
        registry: &WindowRegistry,
        flow_id: &str,
        source: &Arc<Window>,
        id: &WindowId,
        _data: &D,
        mode: ParallelMode,
    ) -> Result<Arc<MatchWindow>> {
        let source_session = source.session().ok_or_else(|| {
            SluiceError::IllegalState(format!("source window {} has no live session", source.id()))
        })?;
        let slot = registry.slot(flow_id, source.session_id());
        let window = slot.get_or_try_insert(id, || {
            Self::create(&slot, &source_session, source, id, mode)
        })?;

        let token = window.window.create_token();
        let scope = token.begin_consume();
        let arms = slot.arms_of(source);
        let group: Vec<Weak<MatchWindow>> = arms.iter().map(Arc::downgrade).collect();
        for arm in &arms {
            arm.set_arms(group.clone());
        }
        let cascade = window.mode == ParallelMode::Either && source.is_ongoing();
        token.finish_consume(scope);

        // Window listeners run outside the gate and may re-enter this slot.
        if cascade {
            for arm in &arms {
                arm.window.complete();
            }
        }

        debug!(window = %id, flow = flow_id, arms = arms.len(), "Match window refreshed");
        Ok(window)
    }

    fn create(
        slot: &MatchSlot,
        source_session: &Arc<FlowSession>,
        source: &Arc<Window>,
        id: &WindowId,
        mode: ParallelMode,
    ) -> Result<Arc<MatchWindow>> {
        let session = FlowSession::child(source_session);
        let window = Window::derived(id.clone(), &session, source, slot.gate());
        session.set_window(window.clone())?;
        Ok(Arc::new(Self {
            window,
            source: source.clone(),
            session,
            mode,
            arms: Mutex::new(Vec::new()),
        }))
    }

    fn set_arms(&self, arms: Vec<Weak<MatchWindow>>) {
        *self.arms.lock().unwrap_or_else(PoisonError::into_inner) = arms;
    }

    pub fn id(&self) -> &WindowId {
        self.window.id()
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    pub fn source(&self) -> &Arc<Window> {
        &self.source
    }

    /// Child session this arm is registered under.
    pub fn session(&self) -> &Arc<FlowSession> {
        &self.session
    }

    pub fn mode(&self) -> ParallelMode {
        self.mode
    }

    /// Every arm of the group, this one included.
    pub fn arms(&self) -> Vec<Arc<MatchWindow>> {
        self.arms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Complete this arm. In `Either` mode the siblings complete with it.
    pub fn complete(&self) -> bool {
        let completed = self.window.complete();
        if completed && self.mode == ParallelMode::Either {
            for arm in self.arms() {
                arm.window.complete();
            }
        }
        completed
    }

    pub fn is_complete(&self) -> bool {
        self.window.is_complete()
    }

    /// Whether the join may release.
    pub fn fulfilled(&self) -> bool {
        if !self.source.is_complete() {
            return false;
        }
        match self.mode {
            ParallelMode::Either => self.source.is_ongoing(),
            ParallelMode::All => self.arms().iter().all(|arm| arm.is_complete()),
        }
    }
}
