//! One registry row.

use emberrt_flash::{FlashError, SlotRecord};
use emberrt_types::{PARTS_PER_BIN, PartitionId, ProcessId, SlotSnapshot};

/// A fixed registry row.  The slot index is stable for the lifetime of the
/// system; binaries are never moved between slots.
#[derive(Debug, Clone, PartialEq)]
pub struct BinarySlot {
    pub(crate) index: usize,
    /// Running process for this binary, `None` when not loaded.
    pub(crate) bin_id: Option<ProcessId>,
    /// Partition the running process was loaded from.  Tracked separately
    /// from `inuse_idx`, which may flip under a committed update while the
    /// old process keeps executing.
    pub(crate) running_from: Option<PartitionId>,
    pub(crate) name: String,
    pub(crate) bin_size: u32,
    pub(crate) ram_size: u32,
    pub(crate) part_size: u32,
    pub(crate) part_num: [PartitionId; PARTS_PER_BIN],
    pub(crate) inuse_idx: u8,
    pub(crate) bin_offset: u32,
    pub(crate) bin_ver: String,
    pub(crate) kernel_ver: String,
}

impl BinarySlot {
    /// Build a slot from its persisted boot record.
    ///
    /// Both partitions must be assigned; a slot always boots unloaded
    /// (`bin_id = None`).
    pub(crate) fn from_record(index: usize, record: SlotRecord) -> Result<Self, FlashError> {
        let mut part_num = [PartitionId(0); PARTS_PER_BIN];
        for (i, raw) in record.part_num.iter().enumerate() {
            if *raw < 0 {
                return Err(FlashError::Corrupt(format!(
                    "slot {index} ('{}'): partition {i} unassigned",
                    record.name
                )));
            }
            part_num[i] = PartitionId(*raw as u8);
        }
        Ok(Self {
            index,
            bin_id: None,
            running_from: None,
            name: record.name,
            bin_size: record.bin_size,
            ram_size: record.ram_size,
            part_size: record.part_size,
            part_num,
            inuse_idx: record.inuse_idx,
            bin_offset: record.bin_offset,
            bin_ver: record.bin_ver,
            kernel_ver: record.kernel_ver,
        })
    }

    /// The persisted form of this slot's current committed state.
    pub(crate) fn to_record(&self) -> SlotRecord {
        SlotRecord {
            name: self.name.clone(),
            bin_size: self.bin_size,
            ram_size: self.ram_size,
            part_size: self.part_size,
            part_num: [self.part_num[0].0 as i8, self.part_num[1].0 as i8],
            inuse_idx: self.inuse_idx,
            bin_offset: self.bin_offset,
            bin_ver: self.bin_ver.clone(),
            kernel_ver: self.kernel_ver.clone(),
        }
    }

    /// The partition currently backing the running image.
    pub fn active_partition(&self) -> PartitionId {
        self.part_num[self.inuse_idx as usize]
    }

    /// The alternate partition, the staging target for the next update.
    pub fn staging_partition(&self) -> PartitionId {
        self.part_num[1 - self.inuse_idx as usize]
    }

    /// Committed-state copy handed to collaborators and query responses.
    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            index: self.index,
            bin_id: self.bin_id,
            name: self.name.clone(),
            bin_size: self.bin_size,
            ram_size: self.ram_size,
            part_size: self.part_size,
            part_num: self.part_num,
            inuse_idx: self.inuse_idx,
            bin_offset: self.bin_offset,
            bin_ver: self.bin_ver.clone(),
            kernel_ver: self.kernel_ver.clone(),
        }
    }
}
