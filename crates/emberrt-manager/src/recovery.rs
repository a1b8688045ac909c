//! [`RecoveryController`] – the fault-recovery state machine.
//!
//! `Idle → Diagnosing → Isolating → Reloading → Idle`, driven inline by
//! the manager main loop:
//!
//! 1. **Diagnosing** – resolve the faulted pid to a registry slot.  An
//!    unresolvable pid is an untrusted failure and escalates to a full
//!    board reboot with no registry mutation.
//! 2. **Isolating** – exclude the binary's entire process group from
//!    scheduling.  This happens *before* the reload command exists, so the
//!    group can never run against partially-reinitialised state.
//! 3. **Reloading** – hand a `Reload` to the loading thread and wait for
//!    its outcome.  A reload that fails leaves the slot unloaded and is
//!    reported; it never triggers a second automatic recovery pass.
//!
//! Recovery is single-binary-at-a-time: a fault arriving while a reload is
//! in flight is queued FIFO and admitted only once the current outcome has
//! been observed.

use std::collections::VecDeque;

use emberrt_loader::ProcessHost;
use emberrt_registry::Registry;
use emberrt_types::ProcessId;
use tracing::{info, warn};

/// Observable phase of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Idle,
    Diagnosing,
    Isolating,
    Reloading,
}

/// What the main loop must do for a fault admitted now.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// The fault resolved to `slot`; its group is already excluded from
    /// scheduling — enqueue the reload.
    Reload { slot: usize, faulted: ProcessId },
    /// The pid maps to no known binary — reboot the board.
    Escalate { faulted: ProcessId },
}

/// Fault-recovery state machine.  Owned by the manager main loop; never
/// shared.
pub struct RecoveryController {
    state: RecoveryState,
    /// Slot and faulted pid of the recovery reload in flight.
    in_flight: Option<(usize, ProcessId)>,
    /// Faults queued behind the in-flight recovery, FIFO.
    pending: VecDeque<ProcessId>,
}

impl Default for RecoveryController {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryController {
    pub fn new() -> Self {
        Self {
            state: RecoveryState::Idle,
            in_flight: None,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Admit a fault notification.
    ///
    /// Returns `None` when a recovery reload is already in flight (the
    /// fault is queued), otherwise runs Diagnosing and Isolating and
    /// returns the action for the main loop to complete.
    pub fn on_fault(
        &mut self,
        faulted: ProcessId,
        registry: &Registry,
        host: &dyn ProcessHost,
    ) -> Option<RecoveryAction> {
        if self.in_flight.is_some() {
            info!(%faulted, "recovery in progress; fault queued");
            self.pending.push_back(faulted);
            return None;
        }

        self.state = RecoveryState::Diagnosing;
        let slot = match registry.find_by_id(faulted) {
            Ok(slot) => slot,
            Err(_) => {
                warn!(%faulted, "fault does not map to any known binary; escalating");
                self.state = RecoveryState::Idle;
                return Some(RecoveryAction::Escalate { faulted });
            }
        };

        self.state = RecoveryState::Isolating;
        host.exclude_from_scheduling(faulted);
        info!(slot, %faulted, "process group excluded from scheduling");

        self.state = RecoveryState::Reloading;
        self.in_flight = Some((slot, faulted));
        Some(RecoveryAction::Reload { slot, faulted })
    }

    /// Observe a reload outcome for `slot`.
    ///
    /// If it completes the in-flight recovery, the controller returns to
    /// `Idle` and hands back the next queued fault (if any) for the main
    /// loop to re-admit.  Queued duplicates of the pid that was just
    /// recovered are stale notifications and are dropped, never escalated.
    /// Outcomes for unrelated reloads are ignored.
    pub fn on_reload_outcome(&mut self, slot: usize) -> Option<ProcessId> {
        let Some((in_flight, faulted)) = self.in_flight else {
            return None;
        };
        if in_flight != slot {
            return None;
        }
        self.in_flight = None;
        self.state = RecoveryState::Idle;
        self.pending.retain(|p| *p != faulted);
        self.pending.pop_front()
    }
}
