//! Streaming CRC-32 over flash-resident payloads.
//!
//! Images can be far larger than the manager's working memory, so the
//! checksum is computed incrementally over [`CRC_BUFFER_SIZE`]-byte reads
//! instead of pulling the whole payload into RAM.

use emberrt_types::{CRC_BUFFER_SIZE, PartitionId};

use crate::{FlashError, FlashStore};

/// CRC-32 of an in-memory byte slice.
///
/// Used when *producing* an image (update staging, test fixtures); readers
/// should prefer [`crc32_over`].
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// CRC-32 of `len` bytes starting at `offset` on `partition`, computed in
/// [`CRC_BUFFER_SIZE`]-byte blocks.
pub fn crc32_over(
    flash: &dyn FlashStore,
    partition: PartitionId,
    offset: u32,
    len: u32,
) -> Result<u32, FlashError> {
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; CRC_BUFFER_SIZE];
    let mut remaining = len;
    let mut pos = offset;
    while remaining > 0 {
        let chunk = remaining.min(CRC_BUFFER_SIZE as u32);
        flash.read(partition, pos, &mut buf[..chunk as usize])?;
        hasher.update(&buf[..chunk as usize]);
        pos += chunk;
        remaining -= chunk;
    }
    Ok(hasher.finalize())
}
