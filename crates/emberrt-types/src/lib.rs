use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Compile-time capacity of the binary registry (number of slots).
pub const BINARY_COUNT: usize = 4;

/// Number of physical flash partitions assigned to each binary slot.
pub const PARTS_PER_BIN: usize = 2;

/// Maximum length of a binary name, in bytes.
pub const BIN_NAME_MAX: usize = 16;
/// Maximum length of a binary version string, in bytes.
pub const BIN_VER_MAX: usize = 16;
/// Maximum length of a kernel version string, in bytes.
pub const KERNEL_VER_MAX: usize = 8;

/// Size of the stored CRC-32 checksum, in bytes.
pub const CHECKSUM_SIZE: usize = 4;
/// Block size used when streaming a payload through the CRC hasher.
pub const CRC_BUFFER_SIZE: usize = 512;

/// Name of the manager's well-known request channel.
pub const BINMGR_REQUEST_CHANNEL: &str = "binmgr";
/// Thread name of the loading worker.
pub const LOADER_THREAD_NAME: &str = "bm_loader";

/// Identity of a running process created from a loaded binary image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(pub u32);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// Index of a physical flash partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u8);

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "part:{}", self.0)
    }
}

/// Error taxonomy shared by the registry, the loader, and the gateway.
///
/// Serializable so that a typed error can ride inside an IPC response
/// payload back to the caller.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BinError {
    /// No binary matches the given id, name, or slot.
    #[error("no binary matches {0}")]
    NotFound(String),

    /// A slot index exceeds the current registry count.
    #[error("slot index {index} out of range (registry holds {count})")]
    OutOfRange { index: usize, count: usize },

    /// The image failed verification: bad header magic, a size that does
    /// not fit its partition, or a checksum mismatch. The slot stays
    /// unloaded; no process is created.
    #[error("integrity check failed on slot {slot}: {details}")]
    Integrity { slot: usize, details: String },

    /// Process creation failed; the slot stays unloaded.
    #[error("process creation failed for slot {slot}: {details}")]
    Spawn { slot: usize, details: String },

    /// Terminating the previous process group failed; the reload is
    /// aborted before any new process is created.
    #[error("termination failed for slot {slot}: {details}")]
    Terminate { slot: usize, details: String },

    /// Persisting a partition flip failed; the previous image stays active.
    #[error("partition commit failed for slot {slot}: {details}")]
    CommitFailed { slot: usize, details: String },

    /// Storage read/write failure, propagated from the flash collaborator.
    #[error("storage error: {0}")]
    Io(String),

    /// A faulted pid does not map to any known binary. The only fatal
    /// path: the board is rebooted.
    #[error("faulted {0} does not map to any known binary")]
    UnrecoverableFault(ProcessId),

    /// An IPC response channel is missing, full, or undersized.
    #[error("ipc channel error: {0}")]
    Channel(String),
}

/// Committed-state view of one registry slot, safe to hand to collaborators
/// and to serialize into query responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    /// Stable slot index within the registry.
    pub index: usize,
    /// Identity of the running process, `None` when not loaded.
    pub bin_id: Option<ProcessId>,
    /// Human-readable binary name, unique across active slots.
    pub name: String,
    /// Image payload size on flash, in bytes.
    pub bin_size: u32,
    /// Required RAM footprint, in bytes.
    pub ram_size: u32,
    /// Size of each of the two physical partitions assigned to this slot.
    pub part_size: u32,
    /// The two physical partition indices usable for double-buffered load.
    pub part_num: [PartitionId; PARTS_PER_BIN],
    /// Which of `part_num[0|1]` holds the active image.
    pub inuse_idx: u8,
    /// Byte offset of the payload within the active partition.
    pub bin_offset: u32,
    /// Version of the image currently on the active partition.
    pub bin_ver: String,
    /// Minimum kernel version the binary declares it requires.
    pub kernel_ver: String,
}

impl SlotSnapshot {
    /// The partition currently backing the running image.
    pub fn active_partition(&self) -> PartitionId {
        self.part_num[self.inuse_idx as usize]
    }

    /// The alternate partition, the staging target for the next update.
    pub fn staging_partition(&self) -> PartitionId {
        self.part_num[1 - self.inuse_idx as usize]
    }
}

/// One operation on the manager's request channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestOp {
    /// Load the single named slot's active image.
    Load { bin_idx: usize },
    /// Load every registered slot in ascending slot-index order.
    LoadAll,
    /// Terminate the slot's process (if any) and load again.
    Reload { bin_idx: usize },
    /// Stage a new image into the slot's inactive partition and commit the
    /// flip. The running image keeps executing from the old partition until
    /// the next reload.
    Update {
        bin_idx: usize,
        payload: Vec<u8>,
        ram_size: u32,
        bin_ver: String,
        kernel_ver: String,
    },
    /// Number of registered binaries.
    GetCount,
    /// Resolve a running pid to its slot index.
    GetIndexById { bin_id: ProcessId },
    /// Slot snapshot by binary name.
    GetInfoByName { name: String },
    /// Snapshots of every registered slot.
    GetInfoAll,
}

/// A gateway request: the operation plus the caller's response channel.
///
/// The response is delivered on `reply_to`; a missing or undersized
/// channel is reported, never silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub reply_to: String,
    pub op: RequestOp,
}

/// A typed gateway response, serialized onto the caller's channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Count(usize),
    Index(usize),
    Info(SlotSnapshot),
    InfoAll(Vec<SlotSnapshot>),
    /// The load/reload commands were queued to the loading thread, in the
    /// listed slot order. Per-slot outcomes follow as completion events.
    LoadQueued { slots: Vec<usize> },
    Error(BinError),
}

/// Envelope for manager completion events published to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"emberrt-manager::loader"`
    pub source: String,
    pub kind: CompletionKind,
}

impl Completion {
    /// Build a completion event stamped with a fresh id and the current time.
    pub fn now(source: impl Into<String>, kind: CompletionKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            kind,
        }
    }
}

/// What a completion event announces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompletionKind {
    /// A slot's image was verified and spawned.
    Loaded { slot: usize, bin_id: ProcessId },
    /// A load or reload failed; the slot stays unloaded.
    LoadFailed { slot: usize, error: BinError },
    /// A fault was resolved to a slot; its process group is isolated and a
    /// reload has been queued.
    RecoveryStarted { slot: usize, faulted: ProcessId },
    /// A fault could not be resolved; the board is rebooting.
    RecoveryEscalated { faulted: ProcessId },
    /// A staged image was committed; the slot's partitions flipped.
    Updated { slot: usize, inuse_idx: u8 },
}
