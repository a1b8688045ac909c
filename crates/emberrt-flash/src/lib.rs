//! Storage layer for the EmberRT binary manager.
//!
//! This crate owns everything that touches raw flash:
//!
//! - [`FlashStore`] – the trait boundary to the block/MTD driver, with
//!   [`RamFlash`] as the simulated backend used by tests and the demo CLI.
//! - [`ImageHeader`] – the fixed 40-byte header preceding every image
//!   payload on a partition.
//! - [`checksum`] – streaming CRC-32 over fixed-size blocks, so a whole
//!   image never has to sit in memory at once.
//! - [`MetadataStore`] – the per-slot boot records persisted in a reserved
//!   metadata partition; records round-trip bit-for-bit across reboot.

pub mod checksum;
pub mod image;
pub mod metadata;
pub mod store;

pub use checksum::{crc32, crc32_over};
pub use image::{IMAGE_HEADER_SIZE, IMAGE_MAGIC, ImageHeader};
pub use metadata::{METADATA_MAGIC, MetadataStore, RECORD_SIZE, SlotRecord};
pub use store::{FlashStore, RamFlash};

use emberrt_types::{BinError, PartitionId};
use thiserror::Error;

/// Errors raised by the flash layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlashError {
    #[error("unknown partition {0}")]
    UnknownPartition(PartitionId),

    #[error("access out of bounds on {partition}: offset {offset} + len {len} > size {size}")]
    OutOfBounds {
        partition: PartitionId,
        offset: u32,
        len: u32,
        size: u32,
    },

    #[error("corrupt on-flash data: {0}")]
    Corrupt(String),

    #[error("flash device error: {0}")]
    Device(String),
}

impl From<FlashError> for BinError {
    fn from(e: FlashError) -> Self {
        BinError::Io(e.to_string())
    }
}
