//! Process-wide run/stop flag

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Run/stop flag written by the message bus thread and read by the run
/// controller once per iteration boundary.
///
/// Starts stopped. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    running: Arc<AtomicBool>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Only the control channel should call this.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }
}
