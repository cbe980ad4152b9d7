use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// A flag that can be set exactly once; only the first caller wins.
#[derive(Debug, Default)]
pub struct OnceFlag(AtomicBool);

impl OnceFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Set the flag. Returns `true` only for the call that flipped it.
    pub fn try_set(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The terminal signal a stream ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalSignal {
    Completed,
    Failed,
}

const OPEN: u8 = 0;
const COMPLETED: u8 = 1;
const FAILED: u8 = 2;

/// Guards the "at most one terminal signal" rule.
///
/// Completion and failure race for the same slot, so whichever arrives first
/// is the only one ever delivered.
#[derive(Debug, Default)]
pub struct Terminal(AtomicU8);

impl Terminal {
    pub const fn new() -> Self {
        Self(AtomicU8::new(OPEN))
    }

    pub fn try_complete(&self) -> bool {
        self.transition(COMPLETED)
    }

    pub fn try_fail(&self) -> bool {
        self.transition(FAILED)
    }

    pub fn is_terminated(&self) -> bool {
        self.0.load(Ordering::Acquire) != OPEN
    }

    pub fn signal(&self) -> Option<TerminalSignal> {
        match self.0.load(Ordering::Acquire) {
            COMPLETED => Some(TerminalSignal::Completed),
            FAILED => Some(TerminalSignal::Failed),
            _ => None,
        }
    }

    fn transition(&self, to: u8) -> bool {
        self.0
            .compare_exchange(OPEN, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
