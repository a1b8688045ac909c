//! [`BoardControl`] – the reboot escalation hook.
//!
//! Recovery handles per-binary faults without touching the rest of the
//! system; a fault that cannot be attributed to any known binary is the one
//! case that escalates to a full board reboot.  Modelling the escalation as
//! a trait keeps it observable in tests and loggable in the demo CLI.

use std::sync::Mutex;

use tracing::error;

/// Board-level control surface.
pub trait BoardControl: Send + Sync {
    /// Reboot the whole device.  Called only on the unrecoverable path.
    fn reboot(&self, reason: &str);
}

/// Simulated board: records the reboot instead of performing one.
#[derive(Default)]
pub struct SimBoard {
    rebooted: Mutex<Option<String>>,
}

impl SimBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// The reason of the recorded reboot, if one happened.
    pub fn rebooted(&self) -> Option<String> {
        self.rebooted.lock().expect("board mutex poisoned").clone()
    }
}

impl BoardControl for SimBoard {
    fn reboot(&self, reason: &str) {
        error!(reason, "board reboot requested");
        *self.rebooted.lock().expect("board mutex poisoned") = Some(reason.to_string());
    }
}
