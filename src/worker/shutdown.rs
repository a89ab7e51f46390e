//! One-shot shutdown latch.
//!
//! Lock-free: `running → stopping → stopped`, advanced by compare-and-set.
//! Exactly one caller of [`ShutdownLatch::begin`] wins, no matter how many
//! race for it.

use std::sync::atomic::{AtomicU8, Ordering};

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const STOPPED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug)]
pub struct ShutdownLatch {
    phase: AtomicU8,
}

impl ShutdownLatch {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(RUNNING),
        }
    }

    /// Move `running → stopping`. Returns `true` for the single winner.
    pub fn begin(&self) -> bool {
        self.phase
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move `stopping → stopped`. No effect in any other phase.
    pub fn finish(&self) -> bool {
        self.phase
            .compare_exchange(STOPPING, STOPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn phase(&self) -> ShutdownPhase {
        match self.phase.load(Ordering::Acquire) {
            RUNNING => ShutdownPhase::Running,
            STOPPING => ShutdownPhase::Stopping,
            _ => ShutdownPhase::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase() == ShutdownPhase::Running
    }
}

impl Default for ShutdownLatch {
    fn default() -> Self {
        Self::new()
    }
}
