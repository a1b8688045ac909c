//! Persisted slot metadata.
//!
//! A reserved metadata partition holds the registry's boot image: a small
//! table header (`"EBMT"` magic + record count) followed by one fixed-size
//! [`SlotRecord`] per binary slot.  The table is read once at boot to
//! populate the registry; individual records are rewritten when a partition
//! flip is committed.  A written record, re-read, yields identical fields.
//!
//! Record layout (little-endian, 59 bytes):
//!
//! | field        | bytes | description                            |
//! |--------------|-------|----------------------------------------|
//! | `name`       | 16    | NUL-padded UTF-8, unique across slots  |
//! | `bin_size`   | 4     | payload length on flash                |
//! | `ram_size`   | 4     | required RAM footprint                 |
//! | `part_size`  | 4     | size of each of the two partitions     |
//! | `part_num`   | 2     | two physical partition indices (i8)    |
//! | `inuse_idx`  | 1     | which partition holds the active image |
//! | `bin_offset` | 4     | payload offset in the active partition |
//! | `bin_ver`    | 16    | NUL-padded UTF-8                       |
//! | `kernel_ver` | 8     | NUL-padded UTF-8                       |

use std::sync::Arc;

use emberrt_types::{BIN_NAME_MAX, BIN_VER_MAX, BINARY_COUNT, KERNEL_VER_MAX, PartitionId};
use tracing::debug;

use crate::image::{read_padded, write_padded};
use crate::{FlashError, FlashStore};

/// `"EBMT"` table magic.
pub const METADATA_MAGIC: [u8; 4] = *b"EBMT";

/// Encoded size of the table header (magic + u16 count).
pub const TABLE_HEADER_SIZE: u32 = 6;

/// Encoded size of one slot record.
pub const RECORD_SIZE: u32 = 59;

/// One persisted registry row.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotRecord {
    pub name: String,
    pub bin_size: u32,
    pub ram_size: u32,
    pub part_size: u32,
    pub part_num: [i8; 2],
    pub inuse_idx: u8,
    pub bin_offset: u32,
    pub bin_ver: String,
    pub kernel_ver: String,
}

impl SlotRecord {
    /// Encode to the fixed 59-byte layout.
    pub fn encode(&self) -> Result<[u8; RECORD_SIZE as usize], FlashError> {
        if self.inuse_idx > 1 {
            return Err(FlashError::Corrupt(format!(
                "inuse_idx {} not in {{0,1}}",
                self.inuse_idx
            )));
        }
        let mut out = [0u8; RECORD_SIZE as usize];
        write_padded(&mut out[0..16], &self.name, "name", BIN_NAME_MAX)?;
        out[16..20].copy_from_slice(&self.bin_size.to_le_bytes());
        out[20..24].copy_from_slice(&self.ram_size.to_le_bytes());
        out[24..28].copy_from_slice(&self.part_size.to_le_bytes());
        out[28] = self.part_num[0] as u8;
        out[29] = self.part_num[1] as u8;
        out[30] = self.inuse_idx;
        out[31..35].copy_from_slice(&self.bin_offset.to_le_bytes());
        write_padded(&mut out[35..51], &self.bin_ver, "bin_ver", BIN_VER_MAX)?;
        write_padded(&mut out[51..59], &self.kernel_ver, "kernel_ver", KERNEL_VER_MAX)?;
        Ok(out)
    }

    /// Decode from the fixed layout, sanity-checking the fields that have a
    /// constrained domain.
    pub fn decode(bytes: &[u8; RECORD_SIZE as usize]) -> Result<Self, FlashError> {
        let inuse_idx = bytes[30];
        if inuse_idx > 1 {
            return Err(FlashError::Corrupt(format!(
                "inuse_idx {inuse_idx} not in {{0,1}}"
            )));
        }
        let record = Self {
            name: read_padded(&bytes[0..16])?,
            bin_size: u32::from_le_bytes(bytes[16..20].try_into().expect("fixed slice")),
            ram_size: u32::from_le_bytes(bytes[20..24].try_into().expect("fixed slice")),
            part_size: u32::from_le_bytes(bytes[24..28].try_into().expect("fixed slice")),
            part_num: [bytes[28] as i8, bytes[29] as i8],
            inuse_idx,
            bin_offset: u32::from_le_bytes(bytes[31..35].try_into().expect("fixed slice")),
            bin_ver: read_padded(&bytes[35..51])?,
            kernel_ver: read_padded(&bytes[51..59])?,
        };
        if record.bin_offset as u64 + record.bin_size as u64 > record.part_size as u64 {
            return Err(FlashError::Corrupt(format!(
                "record '{}': bin_offset {} + bin_size {} exceeds part_size {}",
                record.name, record.bin_offset, record.bin_size, record.part_size
            )));
        }
        Ok(record)
    }
}

/// Reader/writer for the metadata partition.
#[derive(Clone)]
pub struct MetadataStore {
    flash: Arc<dyn FlashStore>,
    partition: PartitionId,
}

impl MetadataStore {
    pub fn new(flash: Arc<dyn FlashStore>, partition: PartitionId) -> Self {
        Self { flash, partition }
    }

    /// Read the whole table: header check, then `count` records.
    pub fn read_table(&self) -> Result<Vec<SlotRecord>, FlashError> {
        let mut header = [0u8; TABLE_HEADER_SIZE as usize];
        self.flash.read(self.partition, 0, &mut header)?;
        if header[0..4] != METADATA_MAGIC {
            return Err(FlashError::Corrupt(format!(
                "bad metadata magic {:02x?}",
                &header[0..4]
            )));
        }
        let count = u16::from_le_bytes([header[4], header[5]]) as usize;
        if count > BINARY_COUNT {
            return Err(FlashError::Corrupt(format!(
                "metadata count {count} exceeds capacity {BINARY_COUNT}"
            )));
        }

        let mut records = Vec::with_capacity(count);
        let mut buf = [0u8; RECORD_SIZE as usize];
        for idx in 0..count {
            self.flash
                .read(self.partition, Self::record_offset(idx), &mut buf)?;
            records.push(SlotRecord::decode(&buf)?);
        }
        debug!(count, "metadata table read");
        Ok(records)
    }

    /// Write the whole table (boot-time provisioning).
    pub fn write_table(&self, records: &[SlotRecord]) -> Result<(), FlashError> {
        if records.len() > BINARY_COUNT {
            return Err(FlashError::Corrupt(format!(
                "{} records exceed capacity {BINARY_COUNT}",
                records.len()
            )));
        }
        let mut header = [0u8; TABLE_HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&METADATA_MAGIC);
        header[4..6].copy_from_slice(&(records.len() as u16).to_le_bytes());
        self.flash.write(self.partition, 0, &header)?;
        for (idx, record) in records.iter().enumerate() {
            self.write_record(idx, record)?;
        }
        Ok(())
    }

    /// Rewrite a single slot's record in place.  This is the persistence
    /// step of a partition-flip commit: it must complete before the
    /// in-memory slot may change.
    pub fn write_record(&self, index: usize, record: &SlotRecord) -> Result<(), FlashError> {
        self.flash
            .write(self.partition, Self::record_offset(index), &record.encode()?)
    }

    fn record_offset(index: usize) -> u32 {
        TABLE_HEADER_SIZE + index as u32 * RECORD_SIZE
    }
}
