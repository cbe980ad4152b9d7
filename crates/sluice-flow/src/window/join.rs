use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sluice_core::error::{Result, SluiceError};
use sluice_core::status::ParallelMode;
use sluice_core::types::WindowId;
use sluice_reactive::OnceFlag;
use tracing::{debug, info};

use super::{MatchWindow, Window, WindowRegistry};
use crate::session::FlowSession;

/// Fork/join barrier for parallel branches of one session.
///
/// Each branch is a [`MatchWindow`] arm under a window derived from the
/// session's root window. Outputs are buffered per branch and handed out as
/// one merged batch, exactly once:
///
/// - `All`: when the last branch completes, every buffer in branch order.
/// - `Either`: when the first branch completes, that branch's buffer. Its
///   siblings complete with it and their outputs are discarded.
pub struct ParallelJoin<T> {
    mode: ParallelMode,
    source: Arc<Window>,
    branches: Vec<(String, Arc<MatchWindow>)>,
    buffers: Mutex<HashMap<String, Vec<T>>>,
    released: OnceFlag,
}

impl<T> ParallelJoin<T> {
    pub fn fork(
        registry: &WindowRegistry,
        flow_id: &str,
        session: &Arc<FlowSession>,
        branches: &[&str],
        mode: ParallelMode,
    ) -> Result<Self> {
        if branches.is_empty() {
            return Err(SluiceError::InvalidArgument(
                "a parallel join needs at least one branch".into(),
            ));
        }
        let root = session.begin();
        let source = Window::derived(WindowId::new(), session, &root, Arc::new(Mutex::new(())));

        let mut arms = Vec::with_capacity(branches.len());
        for name in branches {
            if arms.iter().any(|(existing, _)| existing == name) {
                return Err(SluiceError::InvalidArgument(format!(
                    "duplicate branch {} in parallel join",
                    name
                )));
            }
            let id = WindowId(format!("{}/{}", source.id(), name));
            let arm = MatchWindow::from(registry, flow_id, &source, &id, name, mode)?;
            arms.push((name.to_string(), arm));
        }
        source.complete();

        debug!(window = %source.id(), branches = arms.len(), mode = mode.code(), "Parallel join forked");
        Ok(Self {
            mode,
            source,
            buffers: Mutex::new(arms.iter().map(|(name, _)| (name.clone(), Vec::new())).collect()),
            branches: arms,
            released: OnceFlag::new(),
        })
    }

    pub fn mode(&self) -> ParallelMode {
        self.mode
    }

    /// The window every branch arm is derived from.
    pub fn source(&self) -> &Arc<Window> {
        &self.source
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    pub fn is_released(&self) -> bool {
        self.released.is_set()
    }

    pub fn is_branch_complete(&self, branch: &str) -> Result<bool> {
        Ok(self.arm(branch)?.is_complete())
    }

    /// Buffer outputs of `branch`. Returns `false` when they arrived after
    /// the join released or after the branch completed, and were dropped.
    pub fn push(&self, branch: &str, items: impl IntoIterator<Item = T>) -> Result<bool> {
        let arm = self.arm(branch)?;
        let mut buffers = self.buffers();
        if self.released.is_set() || arm.is_complete() {
            debug!(window = %arm.id(), "Late branch output dropped");
            return Ok(false);
        }
        if let Some(buffer) = buffers.get_mut(branch) {
            buffer.extend(items);
        }
        Ok(true)
    }

    /// Mark `branch` as finished. Returns the merged batch if this call
    /// released the join.
    pub fn complete_branch(&self, branch: &str) -> Result<Option<Vec<T>>> {
        let arm = self.arm(branch)?;
        let mut buffers = self.buffers();
        arm.complete();

        let ready = match self.mode {
            ParallelMode::All => self.branches.iter().all(|(_, arm)| arm.is_complete()),
            ParallelMode::Either => true,
        };
        if !ready || !self.released.try_set() {
            return Ok(None);
        }

        let merged = match self.mode {
            ParallelMode::All => self
                .branches
                .iter()
                .filter_map(|(name, _)| buffers.remove(name))
                .flatten()
                .collect(),
            ParallelMode::Either => {
                let winner = buffers.remove(branch).unwrap_or_default();
                buffers.clear();
                winner
            }
        };
        info!(
            window = %self.source.id(),
            branch,
            mode = self.mode.code(),
            count = merged.len(),
            "Parallel join released"
        );
        Ok(Some(merged))
    }

    fn arm(&self, branch: &str) -> Result<&Arc<MatchWindow>> {
        self.branches
            .iter()
            .find(|(name, _)| name == branch)
            .map(|(_, arm)| arm)
            .ok_or_else(|| SluiceError::InvalidArgument(format!("unknown branch {}", branch)))
    }

    fn buffers(&self) -> MutexGuard<'_, HashMap<String, Vec<T>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
