//! On-flash image layout.
//!
//! Every partition holding a binary starts with a fixed 40-byte
//! [`ImageHeader`]; the payload follows immediately, so a slot's
//! `bin_offset` is always [`IMAGE_HEADER_SIZE`].
//!
//! Layout (all integers little-endian):
//!
//! | field        | bytes | description                      |
//! |--------------|-------|----------------------------------|
//! | `magic`      | 4     | `"EMBR"`                         |
//! | `bin_size`   | 4     | payload length                   |
//! | `ram_size`   | 4     | required RAM footprint           |
//! | `checksum`   | 4     | CRC-32 over the payload only     |
//! | `bin_ver`    | 16    | NUL-padded UTF-8                 |
//! | `kernel_ver` | 8     | NUL-padded UTF-8                 |

use emberrt_types::{BIN_VER_MAX, KERNEL_VER_MAX, PartitionId};

use crate::{FlashError, FlashStore, checksum};

/// `"EMBR"` as a little-endian u32.
pub const IMAGE_MAGIC: u32 = u32::from_le_bytes(*b"EMBR");

/// Total encoded header size in bytes.
pub const IMAGE_HEADER_SIZE: u32 = 40;

/// Decoded image header.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageHeader {
    pub bin_size: u32,
    pub ram_size: u32,
    pub checksum: u32,
    pub bin_ver: String,
    pub kernel_ver: String,
}

impl ImageHeader {
    /// Encode to the fixed on-flash byte layout.
    pub fn encode(&self) -> Result<[u8; IMAGE_HEADER_SIZE as usize], FlashError> {
        let mut out = [0u8; IMAGE_HEADER_SIZE as usize];
        out[0..4].copy_from_slice(&IMAGE_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.bin_size.to_le_bytes());
        out[8..12].copy_from_slice(&self.ram_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        write_padded(&mut out[16..32], &self.bin_ver, "bin_ver", BIN_VER_MAX)?;
        write_padded(&mut out[32..40], &self.kernel_ver, "kernel_ver", KERNEL_VER_MAX)?;
        Ok(out)
    }

    /// Decode from the fixed on-flash byte layout, checking the magic.
    pub fn decode(bytes: &[u8; IMAGE_HEADER_SIZE as usize]) -> Result<Self, FlashError> {
        let magic = u32::from_le_bytes(bytes[0..4].try_into().expect("fixed slice"));
        if magic != IMAGE_MAGIC {
            return Err(FlashError::Corrupt(format!(
                "bad image magic {magic:#010x} (expected {IMAGE_MAGIC:#010x})"
            )));
        }
        Ok(Self {
            bin_size: u32::from_le_bytes(bytes[4..8].try_into().expect("fixed slice")),
            ram_size: u32::from_le_bytes(bytes[8..12].try_into().expect("fixed slice")),
            checksum: u32::from_le_bytes(bytes[12..16].try_into().expect("fixed slice")),
            bin_ver: read_padded(&bytes[16..32])?,
            kernel_ver: read_padded(&bytes[32..40])?,
        })
    }

    /// Read and decode the header at the start of `partition`.
    pub fn read_from(
        flash: &dyn FlashStore,
        partition: PartitionId,
    ) -> Result<Self, FlashError> {
        let mut buf = [0u8; IMAGE_HEADER_SIZE as usize];
        flash.read(partition, 0, &mut buf)?;
        Self::decode(&buf)
    }
}

/// Write a complete image (header + payload) to the start of `partition`,
/// computing the payload checksum.  Used by update staging and by test
/// fixtures provisioning the simulated flash.
pub fn write_image(
    flash: &dyn FlashStore,
    partition: PartitionId,
    payload: &[u8],
    ram_size: u32,
    bin_ver: &str,
    kernel_ver: &str,
) -> Result<ImageHeader, FlashError> {
    let header = ImageHeader {
        bin_size: payload.len() as u32,
        ram_size,
        checksum: checksum::crc32(payload),
        bin_ver: bin_ver.to_string(),
        kernel_ver: kernel_ver.to_string(),
    };
    flash.write(partition, 0, &header.encode()?)?;
    flash.write(partition, IMAGE_HEADER_SIZE, payload)?;
    Ok(header)
}

/// NUL-pad `s` into `dst`, rejecting over-long values.
pub(crate) fn write_padded(
    dst: &mut [u8],
    s: &str,
    field: &str,
    max: usize,
) -> Result<(), FlashError> {
    if s.len() > max {
        return Err(FlashError::Corrupt(format!(
            "{field} '{s}' exceeds {max} bytes"
        )));
    }
    dst[..s.len()].copy_from_slice(s.as_bytes());
    Ok(())
}

/// Read a NUL-padded UTF-8 field.
pub(crate) fn read_padded(src: &[u8]) -> Result<String, FlashError> {
    let end = src.iter().position(|b| *b == 0).unwrap_or(src.len());
    std::str::from_utf8(&src[..end])
        .map(str::to_string)
        .map_err(|e| FlashError::Corrupt(format!("non-UTF-8 string field: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RamFlash;

    fn sample_header() -> ImageHeader {
        ImageHeader {
            bin_size: 512,
            ram_size: 4096,
            checksum: 0xCAFEBABE,
            bin_ver: "3.2.1".to_string(),
            kernel_ver: "1.4".to_string(),
        }
    }

    #[test]
    fn header_encode_decode_roundtrip() {
        let header = sample_header();
        let bytes = header.encode().unwrap();
        assert_eq!(ImageHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut bytes = sample_header().encode().unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            ImageHeader::decode(&bytes),
            Err(FlashError::Corrupt(_))
        ));
    }

    #[test]
    fn encode_rejects_over_long_version() {
        let mut header = sample_header();
        header.bin_ver = "x".repeat(BIN_VER_MAX + 1);
        assert!(header.encode().is_err());
    }

    #[test]
    fn write_image_then_read_header_back() {
        let flash = RamFlash::new(&[1024]);
        let payload = b"ember kernel payload".to_vec();
        let written =
            write_image(&flash, PartitionId(0), &payload, 2048, "2.0.0", "1.1").unwrap();

        let read = ImageHeader::read_from(&flash, PartitionId(0)).unwrap();
        assert_eq!(read, written);
        assert_eq!(read.bin_size, payload.len() as u32);
        assert_eq!(read.checksum, checksum::crc32(&payload));
    }

    #[test]
    fn written_payload_checksum_verifies_in_blocks() {
        let flash = RamFlash::new(&[8192]);
        let payload: Vec<u8> = (0..4000).map(|i| (i % 7) as u8).collect();
        let header = write_image(&flash, PartitionId(0), &payload, 0, "1", "1").unwrap();

        let streamed =
            checksum::crc32_over(&flash, PartitionId(0), IMAGE_HEADER_SIZE, header.bin_size)
                .unwrap();
        assert_eq!(streamed, header.checksum);
    }
}
