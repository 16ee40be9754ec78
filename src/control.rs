//! Engine-wide pause, resume and terminate, callable from any thread

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct ControlState {
    paused: bool,
    terminate: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<ControlState>,
    changed: Condvar,
}

/// A cloneable handle for controlling a running engine from other threads.
///
/// Requests take effect between steps: a paused engine stops dequeuing
/// tokens but keeps all of its state, and a terminate request cancels the
/// root region before the next step.
#[derive(Debug, Clone, Default)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn pause(&self) {
        self.lock().paused = true;
        self.shared.changed.notify_all();
    }

    pub fn resume(&self) {
        self.lock().paused = false;
        self.shared.changed.notify_all();
    }

    pub fn terminate(&self) {
        self.lock().terminate = true;
        self.shared.changed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn terminate_requested(&self) -> bool {
        self.lock().terminate
    }

    /// Block while paused, up to `timeout`. Returns early on resume or
    /// terminate.
    pub(crate) fn wait_while_paused(&self, timeout: Duration) {
        let guard = self.lock();
        let _ = self
            .shared
            .changed
            .wait_timeout_while(guard, timeout, |s| s.paused && !s.terminate);
    }
}
