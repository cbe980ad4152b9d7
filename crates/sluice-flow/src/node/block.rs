use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::context::FlowContext;

struct BlockState<I> {
    paused: bool,
    held: Vec<FlowContext<I>>,
}

/// A gate a node can install in front of its processing.
///
/// While paused, accepted contexts are parked here (status `PENDING`);
/// `resume` opens the gate and hands them back.
pub struct Block<I> {
    state: Mutex<BlockState<I>>,
}

impl<I> Block<I> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BlockState {
                paused: false,
                held: Vec::new(),
            }),
        }
    }

    /// A gate that starts closed.
    pub fn paused() -> Self {
        let block = Self::new();
        block.pause();
        block
    }

    fn state(&self) -> MutexGuard<'_, BlockState<I>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pause(&self) {
        self.state().paused = true;
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    pub fn held(&self) -> usize {
        self.state().held.len()
    }

    /// Park `contexts` if paused. Otherwise they are handed straight back.
    pub fn hold(&self, contexts: Vec<FlowContext<I>>) -> Option<Vec<FlowContext<I>>> {
        let mut state = self.state();
        if !state.paused {
            return Some(contexts);
        }
        state.held.extend(contexts);
        None
    }

    /// Open the gate and drain everything parked while it was closed.
    pub fn resume(&self) -> Vec<FlowContext<I>> {
        let mut state = self.state();
        state.paused = false;
        std::mem::take(&mut state.held)
    }
}

impl<I> Default for Block<I> {
    fn default() -> Self {
        Self::new()
    }
}
