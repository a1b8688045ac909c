//! [`ProcessHost`] – the boundary to the scheduler / process-creation
//! collaborator.
//!
//! The binary manager never spawns or kills tasks itself; it asks the host
//! to do so and records the resulting pid in the registry.  [`SimHost`] is
//! the simulated backend used by tests and the demo CLI.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use emberrt_types::{PartitionId, ProcessId};
use tracing::info;

/// Everything the host needs to spawn a process from a verified image.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessImage {
    /// Binary name, used as the process name.
    pub name: String,
    /// Partition holding the verified image.
    pub partition: PartitionId,
    /// Payload offset within the partition.
    pub offset: u32,
    /// Payload length in bytes.
    pub size: u32,
    /// Required RAM footprint.
    pub ram_size: u32,
}

/// Scheduler/process collaborator.
///
/// Called from the loading thread (`create_process`,
/// `terminate_process_group`) and from the manager main loop during fault
/// isolation (`exclude_from_scheduling`), so implementations must be
/// thread-safe.
pub trait ProcessHost: Send + Sync {
    /// Spawn a process from a verified image.  A host that enforces its own
    /// creation deadline reports the timeout as an `Err`.
    fn create_process(&self, image: &ProcessImage) -> Result<ProcessId, String>;

    /// Terminate the whole process group rooted at `bin_id`.
    fn terminate_process_group(&self, bin_id: ProcessId) -> Result<(), String>;

    /// Remove every process in `bin_id`'s group from scheduling.  They must
    /// not run again until their binary has been reloaded.
    fn exclude_from_scheduling(&self, bin_id: ProcessId);
}

/// Simulated process host issuing monotonically increasing pids.
///
/// Keeps a journal of host calls so the demo CLI can display them and
/// integration tests can assert ordering.
#[derive(Default)]
pub struct SimHost {
    next_pid: AtomicU32,
    journal: Mutex<Vec<HostCall>>,
}

/// One recorded collaborator call.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    Created { name: String, pid: ProcessId },
    TerminatedGroup(ProcessId),
    Excluded(ProcessId),
}

impl SimHost {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(100),
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of every collaborator call so far, in order.
    pub fn journal(&self) -> Vec<HostCall> {
        self.journal.lock().expect("journal mutex poisoned").clone()
    }

    fn record(&self, call: HostCall) {
        self.journal.lock().expect("journal mutex poisoned").push(call);
    }
}

impl ProcessHost for SimHost {
    fn create_process(&self, image: &ProcessImage) -> Result<ProcessId, String> {
        let pid = ProcessId(self.next_pid.fetch_add(1, Ordering::Relaxed));
        info!(name = %image.name, %pid, partition = %image.partition, "sim process created");
        self.record(HostCall::Created {
            name: image.name.clone(),
            pid,
        });
        Ok(pid)
    }

    fn terminate_process_group(&self, bin_id: ProcessId) -> Result<(), String> {
        info!(%bin_id, "sim process group terminated");
        self.record(HostCall::TerminatedGroup(bin_id));
        Ok(())
    }

    fn exclude_from_scheduling(&self, bin_id: ProcessId) {
        info!(%bin_id, "sim process group excluded from scheduling");
        self.record(HostCall::Excluded(bin_id));
    }
}
