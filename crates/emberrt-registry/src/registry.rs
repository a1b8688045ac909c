//! The slot table and its single-writer mutation surface.

use emberrt_flash::{IMAGE_HEADER_SIZE, ImageHeader, MetadataStore};
use emberrt_types::{BINARY_COUNT, BinError, PartitionId, ProcessId, SlotSnapshot};
use tracing::{debug, info, warn};

use crate::slot::BinarySlot;

/// In-memory table of every known binary slot, populated at boot from the
/// metadata partition.
///
/// All mutations go through the manager main loop, which holds the only
/// `&mut Registry`; reads hand out committed-state snapshots.
pub struct Registry {
    slots: Vec<BinarySlot>,
    metadata: MetadataStore,
}

impl Registry {
    /// Populate the table from the flash-resident metadata records.
    ///
    /// Fails if the table is corrupt, exceeds [`BINARY_COUNT`], carries an
    /// unassigned partition, or repeats a binary name.
    pub fn from_flash(metadata: MetadataStore) -> Result<Self, BinError> {
        let records = metadata.read_table()?;
        let mut slots = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            let slot = BinarySlot::from_record(index, record)?;
            if slots.iter().any(|s: &BinarySlot| s.name == slot.name) {
                return Err(BinError::Io(format!(
                    "duplicate binary name '{}' in metadata table",
                    slot.name
                )));
            }
            slots.push(slot);
        }
        info!(count = slots.len(), "registry populated from flash");
        Ok(Self { slots, metadata })
    }

    /// Number of registered binaries.
    pub fn get_count(&self) -> usize {
        self.slots.len()
    }

    /// Resolve a running pid to its slot index.
    pub fn find_by_id(&self, bin_id: ProcessId) -> Result<usize, BinError> {
        self.slots
            .iter()
            .position(|s| s.bin_id == Some(bin_id))
            .ok_or_else(|| BinError::NotFound(bin_id.to_string()))
    }

    /// Resolve a binary name to its slot index.
    pub fn find_by_name(&self, name: &str) -> Result<usize, BinError> {
        self.slots
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| BinError::NotFound(format!("name '{name}'")))
    }

    /// Committed-state snapshot of one slot.
    pub fn snapshot(&self, index: usize) -> Result<SlotSnapshot, BinError> {
        self.slots
            .get(index)
            .map(BinarySlot::snapshot)
            .ok_or(BinError::OutOfRange {
                index,
                count: self.slots.len(),
            })
    }

    /// Snapshots of every slot, in ascending slot-index order.
    pub fn snapshot_all(&self) -> Vec<SlotSnapshot> {
        self.slots.iter().map(BinarySlot::snapshot).collect()
    }

    /// Record a load success: the created process and the partition its
    /// image was read from.
    pub fn mark_loaded(
        &mut self,
        index: usize,
        bin_id: ProcessId,
        partition: PartitionId,
    ) -> Result<(), BinError> {
        let count = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(BinError::OutOfRange { index, count })?;
        debug!(slot = index, %bin_id, %partition, "slot loaded");
        slot.bin_id = Some(bin_id);
        slot.running_from = Some(partition);
        Ok(())
    }

    /// Clear a slot's running process (load failure, termination).
    pub fn mark_unloaded(&mut self, index: usize) -> Result<(), BinError> {
        let count = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(BinError::OutOfRange { index, count })?;
        debug!(slot = index, "slot unloaded");
        slot.bin_id = None;
        slot.running_from = None;
        Ok(())
    }

    /// Partition backing the slot's running process, if one is loaded.
    ///
    /// After a committed update this can differ from the active partition:
    /// the old process keeps executing from the pre-flip partition until it
    /// is reloaded.
    pub fn running_from(&self, index: usize) -> Result<Option<PartitionId>, BinError> {
        self.slots
            .get(index)
            .map(|s| s.running_from)
            .ok_or(BinError::OutOfRange {
                index,
                count: self.slots.len(),
            })
    }

    /// Commit a verified staged image: flip `inuse_idx` and refresh the
    /// slot's size, offset, and version fields.
    ///
    /// The new record is persisted to the metadata partition *first*; only
    /// a successful write mutates the in-memory slot, so readers never
    /// observe an inconsistent offset/partition pair and a failed commit
    /// leaves the previous image active, bit-for-bit.
    ///
    /// Returns the new `inuse_idx`.
    pub fn commit_update(&mut self, index: usize, staged: &ImageHeader) -> Result<u8, BinError> {
        let count = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(BinError::OutOfRange { index, count })?;

        if IMAGE_HEADER_SIZE as u64 + staged.bin_size as u64 > slot.part_size as u64 {
            return Err(BinError::CommitFailed {
                slot: index,
                details: format!(
                    "staged image ({} B + header) exceeds partition size {}",
                    staged.bin_size, slot.part_size
                ),
            });
        }

        let mut candidate = slot.to_record();
        candidate.inuse_idx = 1 - slot.inuse_idx;
        candidate.bin_size = staged.bin_size;
        candidate.ram_size = staged.ram_size;
        candidate.bin_offset = IMAGE_HEADER_SIZE;
        candidate.bin_ver = staged.bin_ver.clone();
        candidate.kernel_ver = staged.kernel_ver.clone();

        if let Err(e) = self.metadata.write_record(index, &candidate) {
            warn!(slot = index, error = %e, "partition flip persist failed; slot unchanged");
            return Err(BinError::CommitFailed {
                slot: index,
                details: e.to_string(),
            });
        }

        let slot = &mut self.slots[index];
        slot.inuse_idx = candidate.inuse_idx;
        slot.bin_size = candidate.bin_size;
        slot.ram_size = candidate.ram_size;
        slot.bin_offset = candidate.bin_offset;
        slot.bin_ver = candidate.bin_ver;
        slot.kernel_ver = candidate.kernel_ver;
        info!(
            slot = index,
            inuse_idx = slot.inuse_idx,
            bin_ver = %slot.bin_ver,
            "partition flip committed"
        );
        Ok(slot.inuse_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberrt_flash::{FlashError, FlashStore, RamFlash, SlotRecord};
    use emberrt_types::PartitionId;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn record(name: &str, parts: [i8; 2]) -> SlotRecord {
        SlotRecord {
            name: name.to_string(),
            bin_size: 200,
            ram_size: 1024,
            part_size: 2048,
            part_num: parts,
            inuse_idx: 0,
            bin_offset: IMAGE_HEADER_SIZE,
            bin_ver: "1.0.0".to_string(),
            kernel_ver: "1.0".to_string(),
        }
    }

    fn booted_registry() -> Registry {
        let flash = Arc::new(RamFlash::new(&[4096]));
        let metadata = MetadataStore::new(flash, PartitionId(0));
        metadata
            .write_table(&[record("micom", [1, 2]), record("wifi", [3, 4])])
            .unwrap();
        Registry::from_flash(metadata).unwrap()
    }

    /// Flash wrapper whose writes can be failed on demand.
    struct BrownoutFlash {
        inner: RamFlash,
        fail_writes: AtomicBool,
    }

    impl FlashStore for BrownoutFlash {
        fn partition_count(&self) -> usize {
            self.inner.partition_count()
        }
        fn partition_size(&self, p: PartitionId) -> Result<u32, FlashError> {
            self.inner.partition_size(p)
        }
        fn read(&self, p: PartitionId, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
            self.inner.read(p, offset, buf)
        }
        fn write(&self, p: PartitionId, offset: u32, bytes: &[u8]) -> Result<(), FlashError> {
            if self.fail_writes.load(Ordering::Relaxed) {
                return Err(FlashError::Device("write aborted".to_string()));
            }
            self.inner.write(p, offset, bytes)
        }
    }

    fn staged_header(bin_size: u32) -> ImageHeader {
        ImageHeader {
            bin_size,
            ram_size: 8192,
            checksum: 0x1234,
            bin_ver: "2.0.0".to_string(),
            kernel_ver: "1.1".to_string(),
        }
    }

    #[test]
    fn boot_populates_slots_unloaded() {
        let registry = booted_registry();
        assert_eq!(registry.get_count(), 2);
        for snap in registry.snapshot_all() {
            assert_eq!(snap.bin_id, None);
        }
        assert_eq!(registry.snapshot(1).unwrap().name, "wifi");
    }

    #[test]
    fn find_by_name_and_id() {
        let mut registry = booted_registry();
        assert_eq!(registry.find_by_name("wifi").unwrap(), 1);
        assert!(matches!(
            registry.find_by_name("ghost"),
            Err(BinError::NotFound(_))
        ));

        registry
            .mark_loaded(0, ProcessId(77), PartitionId(1))
            .unwrap();
        assert_eq!(registry.find_by_id(ProcessId(77)).unwrap(), 0);
        assert!(matches!(
            registry.find_by_id(ProcessId(1)),
            Err(BinError::NotFound(_))
        ));
    }

    #[test]
    fn snapshot_out_of_range() {
        let registry = booted_registry();
        assert!(matches!(
            registry.snapshot(5),
            Err(BinError::OutOfRange { index: 5, count: 2 })
        ));
    }

    #[test]
    fn boot_rejects_duplicate_names() {
        let flash = Arc::new(RamFlash::new(&[4096]));
        let metadata = MetadataStore::new(flash, PartitionId(0));
        metadata
            .write_table(&[record("micom", [1, 2]), record("micom", [3, 4])])
            .unwrap();
        assert!(Registry::from_flash(metadata).is_err());
    }

    #[test]
    fn boot_rejects_unassigned_partition() {
        let flash = Arc::new(RamFlash::new(&[4096]));
        let metadata = MetadataStore::new(flash, PartitionId(0));
        metadata.write_table(&[record("micom", [1, -1])]).unwrap();
        assert!(Registry::from_flash(metadata).is_err());
    }

    #[test]
    fn commit_update_flips_and_persists() {
        let flash = Arc::new(RamFlash::new(&[4096]));
        let metadata = MetadataStore::new(Arc::clone(&flash) as Arc<dyn FlashStore>, PartitionId(0));
        metadata.write_table(&[record("micom", [1, 2])]).unwrap();
        let mut registry = Registry::from_flash(metadata.clone()).unwrap();

        let before = registry.snapshot(0).unwrap();
        assert_eq!(before.active_partition(), PartitionId(1));

        let new_idx = registry.commit_update(0, &staged_header(500)).unwrap();
        assert_eq!(new_idx, 1);

        let after = registry.snapshot(0).unwrap();
        assert_eq!(after.active_partition(), PartitionId(2));
        assert_eq!(after.bin_size, 500);
        assert_eq!(after.bin_ver, "2.0.0");
        // Invariant: bin_offset + bin_size <= part_size.
        assert!(after.bin_offset + after.bin_size <= after.part_size);

        // The flip survives a reboot (metadata re-read).
        let rebooted = Registry::from_flash(metadata).unwrap();
        assert_eq!(rebooted.snapshot(0).unwrap().inuse_idx, 1);
        assert_eq!(rebooted.snapshot(0).unwrap().bin_ver, "2.0.0");
    }

    #[test]
    fn failed_commit_leaves_slot_bit_for_bit_unchanged() {
        let flash = Arc::new(BrownoutFlash {
            inner: RamFlash::new(&[4096]),
            fail_writes: AtomicBool::new(false),
        });
        let metadata = MetadataStore::new(Arc::clone(&flash) as Arc<dyn FlashStore>, PartitionId(0));
        metadata.write_table(&[record("micom", [1, 2])]).unwrap();
        let mut registry = Registry::from_flash(metadata).unwrap();

        let before = registry.snapshot(0).unwrap();
        flash.fail_writes.store(true, Ordering::Relaxed);

        let err = registry.commit_update(0, &staged_header(500)).unwrap_err();
        assert!(matches!(err, BinError::CommitFailed { slot: 0, .. }));

        // Idempotence of failure: nothing changed.
        assert_eq!(registry.snapshot(0).unwrap(), before);
    }

    #[test]
    fn commit_rejects_image_larger_than_partition() {
        let mut registry = booted_registry();
        let before = registry.snapshot(0).unwrap();
        let err = registry
            .commit_update(0, &staged_header(before.part_size))
            .unwrap_err();
        assert!(matches!(err, BinError::CommitFailed { .. }));
        assert_eq!(registry.snapshot(0).unwrap(), before);
    }

    #[test]
    fn mark_loaded_out_of_range() {
        let mut registry = booted_registry();
        assert!(matches!(
            registry.mark_loaded(9, ProcessId(1), PartitionId(1)),
            Err(BinError::OutOfRange { .. })
        ));
        assert!(matches!(
            registry.mark_unloaded(9),
            Err(BinError::OutOfRange { .. })
        ));
    }

    #[test]
    fn running_partition_tracks_load_and_survives_a_flip() {
        let flash = Arc::new(RamFlash::new(&[4096]));
        let metadata = MetadataStore::new(Arc::clone(&flash) as Arc<dyn FlashStore>, PartitionId(0));
        metadata.write_table(&[record("micom", [1, 2])]).unwrap();
        let mut registry = Registry::from_flash(metadata).unwrap();
        assert_eq!(registry.running_from(0).unwrap(), None);

        registry
            .mark_loaded(0, ProcessId(5), PartitionId(1))
            .unwrap();
        assert_eq!(registry.running_from(0).unwrap(), Some(PartitionId(1)));

        // The flip changes the active partition, not the running one.
        registry.commit_update(0, &staged_header(500)).unwrap();
        assert_eq!(registry.snapshot(0).unwrap().active_partition(), PartitionId(2));
        assert_eq!(registry.running_from(0).unwrap(), Some(PartitionId(1)));

        registry.mark_unloaded(0).unwrap();
        assert_eq!(registry.running_from(0).unwrap(), None);
        assert_eq!(registry.snapshot(0).unwrap().bin_id, None);
    }
}
