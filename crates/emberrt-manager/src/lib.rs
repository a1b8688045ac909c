//! The Binary Manager: main loop, Recovery Controller, and the
//! Request/Response Gateway.
//!
//! The [`BinaryManager`] main loop is the single writer of the registry.
//! External callers and the kernel fault hook feed it through a
//! [`ManagerHandle`]; slow work (flash reads, process creation) is
//! delegated to the loading thread; per-binary faults are isolated and
//! reloaded by the [`RecoveryController`] without rebooting the device —
//! unless the faulted pid maps to no known binary, the only fatal path.

mod board;
mod gateway;
mod manager;
mod recovery;

pub use board::{BoardControl, SimBoard};
pub use gateway::IpcRouter;
pub use manager::{BinaryManager, ManagerEvent, ManagerHandle};
pub use recovery::{RecoveryAction, RecoveryController, RecoveryState};
