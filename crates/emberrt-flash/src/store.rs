//! [`FlashStore`] – the boundary to the raw block/MTD storage driver.
//!
//! The binary manager only ever reads and writes whole byte ranges within a
//! partition; erase geometry, wear levelling, and bad-block handling stay on
//! the driver side of this trait.  [`RamFlash`] is the in-memory simulator
//! that stands in for the real driver in tests and the demo CLI.

use std::sync::Mutex;

use emberrt_types::PartitionId;

use crate::FlashError;

/// Raw partitioned storage, addressed by partition index and byte offset.
///
/// Implementations must be safe to share across the manager task and the
/// loading thread.
pub trait FlashStore: Send + Sync {
    /// Number of partitions exposed by the device.
    fn partition_count(&self) -> usize;

    /// Size in bytes of the given partition.
    fn partition_size(&self, partition: PartitionId) -> Result<u32, FlashError>;

    /// Fill `buf` from `partition` starting at `offset`.
    fn read(&self, partition: PartitionId, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Write `bytes` to `partition` starting at `offset`.
    ///
    /// Only ever used for image-update staging and metadata persistence; an
    /// active partition is never written while its image may be executing.
    fn write(&self, partition: PartitionId, offset: u32, bytes: &[u8]) -> Result<(), FlashError>;
}

/// In-memory flash simulator.
///
/// Partitions are independently sized byte arrays initialised to `0xFF`
/// (erased NOR state).  Bounds are checked on every access so tests catch
/// layout mistakes instead of silently wrapping.
pub struct RamFlash {
    partitions: Mutex<Vec<Vec<u8>>>,
}

impl RamFlash {
    /// Create a device with one partition per entry of `sizes`.
    pub fn new(sizes: &[u32]) -> Self {
        Self {
            partitions: Mutex::new(sizes.iter().map(|s| vec![0xFF; *s as usize]).collect()),
        }
    }

    fn check_range(
        &self,
        partition: PartitionId,
        offset: u32,
        len: u32,
    ) -> Result<(), FlashError> {
        let parts = self.partitions.lock().expect("flash mutex poisoned");
        let size = parts
            .get(partition.0 as usize)
            .ok_or(FlashError::UnknownPartition(partition))?
            .len() as u32;
        if offset.checked_add(len).is_none_or(|end| end > size) {
            return Err(FlashError::OutOfBounds {
                partition,
                offset,
                len,
                size,
            });
        }
        Ok(())
    }
}

impl FlashStore for RamFlash {
    fn partition_count(&self) -> usize {
        self.partitions.lock().expect("flash mutex poisoned").len()
    }

    fn partition_size(&self, partition: PartitionId) -> Result<u32, FlashError> {
        let parts = self.partitions.lock().expect("flash mutex poisoned");
        parts
            .get(partition.0 as usize)
            .map(|p| p.len() as u32)
            .ok_or(FlashError::UnknownPartition(partition))
    }

    fn read(&self, partition: PartitionId, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_range(partition, offset, buf.len() as u32)?;
        let parts = self.partitions.lock().expect("flash mutex poisoned");
        let start = offset as usize;
        buf.copy_from_slice(&parts[partition.0 as usize][start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, partition: PartitionId, offset: u32, bytes: &[u8]) -> Result<(), FlashError> {
        self.check_range(partition, offset, bytes.len() as u32)?;
        let mut parts = self.partitions.lock().expect("flash mutex poisoned");
        let start = offset as usize;
        parts[partition.0 as usize][start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}
