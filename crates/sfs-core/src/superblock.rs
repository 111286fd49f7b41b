//! Superblock codec.
//!
//! Block 0 holds a 64-byte little-endian record; the rest of the block is
//! zero.
//!
//! | Offset | Field | Type |
//! |--------|-------|------|
//! | 0 | magic | u32 |
//! | 4 | version | u16 |
//! | 8 | block_size | u32 |
//! | 12 | max_files | u32 |
//! | 16 | total_blocks | u64 |
//! | 24 | free_blocks | u64 |
//! | 32 | bitmap_start | u32 |
//! | 36 | tree_start | u32 |
//! | 40 | meta_start | u32 |
//! | 44 | data_start | u32 |
//! | 48 | order | u32 |
//! | 52 | next_dir_id | u32 |
//! | 60 | crc32c of bytes 0..60 | u32 |

use serde::Serialize;
use sfs_types::{
    BlockNumber, Geometry, ParseError, SFS_FORMAT_VERSION, SFS_MAGIC, SUPERBLOCK_SIZE, read_le_u16,
    read_le_u32, read_le_u64,
};

const CRC_OFFSET: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Superblock {
    pub version: u16,
    pub block_size: u32,
    pub max_files: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub bitmap_start: BlockNumber,
    pub tree_start: BlockNumber,
    pub meta_start: BlockNumber,
    pub data_start: BlockNumber,
    pub order: u32,
    pub next_dir_id: u32,
}

impl Superblock {
    /// Superblock for a freshly formatted image: every data block free.
    #[must_use]
    pub fn fresh(geometry: &Geometry) -> Self {
        Self {
            version: SFS_FORMAT_VERSION,
            block_size: geometry.block_size,
            max_files: geometry.max_files,
            total_blocks: geometry.total_blocks,
            free_blocks: geometry.data_blocks(),
            bitmap_start: geometry.bitmap_start,
            tree_start: geometry.tree_start,
            meta_start: geometry.meta_start,
            data_start: geometry.data_start,
            order: geometry.order,
            next_dir_id: 1,
        }
    }

    /// Geometry implied by the recorded parameters, checked against the
    /// recorded region starts.
    pub fn geometry(&self) -> Result<Geometry, ParseError> {
        let geometry = Geometry::new(self.block_size, self.total_blocks, self.max_files, self.order)?;
        if geometry.bitmap_start != self.bitmap_start
            || geometry.tree_start != self.tree_start
            || geometry.meta_start != self.meta_start
            || geometry.data_start != self.data_start
        {
            return Err(ParseError::InvalidField {
                field: "region starts",
                reason: "do not match the recorded parameters",
            });
        }
        Ok(geometry)
    }

    /// Encode into a full block buffer.
    #[must_use]
    pub fn encode(&self, block_size: usize) -> Vec<u8> {
        let mut buf = vec![0_u8; block_size.max(SUPERBLOCK_SIZE)];
        buf[0..4].copy_from_slice(&SFS_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.block_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.max_files.to_le_bytes());
        buf[16..24].copy_from_slice(&self.total_blocks.to_le_bytes());
        buf[24..32].copy_from_slice(&self.free_blocks.to_le_bytes());
        for (offset, block) in [
            (32, self.bitmap_start),
            (36, self.tree_start),
            (40, self.meta_start),
            (44, self.data_start),
        ] {
            // Geometry::new bounds total_blocks to u32, so region starts fit.
            let raw = u32::try_from(block.0).unwrap_or(u32::MAX);
            buf[offset..offset + 4].copy_from_slice(&raw.to_le_bytes());
        }
        buf[48..52].copy_from_slice(&self.order.to_le_bytes());
        buf[52..56].copy_from_slice(&self.next_dir_id.to_le_bytes());
        let crc = crc32c::crc32c(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(data, 0)?;
        if magic != SFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SFS_MAGIC),
                actual: u64::from(magic),
            });
        }
        let stored_crc = read_le_u32(data, CRC_OFFSET)?;
        if crc32c::crc32c(&data[..CRC_OFFSET]) != stored_crc {
            return Err(ParseError::InvalidField {
                field: "checksum",
                reason: "crc32c mismatch",
            });
        }
        let version = read_le_u16(data, 4)?;
        if version != SFS_FORMAT_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported format version",
            });
        }
        let block = |offset| read_le_u32(data, offset).map(|v| BlockNumber(u64::from(v)));
        Ok(Self {
            version,
            block_size: read_le_u32(data, 8)?,
            max_files: read_le_u32(data, 12)?,
            total_blocks: read_le_u64(data, 16)?,
            free_blocks: read_le_u64(data, 24)?,
            bitmap_start: block(32)?,
            tree_start: block(36)?,
            meta_start: block(40)?,
            data_start: block(44)?,
            order: read_le_u32(data, 48)?,
            next_dir_id: read_le_u32(data, 52)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_types::FsConfig;

    #[test]
    fn encode_decode_round_trip() {
        let geo = Geometry::from_config(&FsConfig::default()).unwrap();
        let mut sb = Superblock::fresh(&geo);
        sb.free_blocks -= 7;
        sb.next_dir_id = 12;
        let buf = sb.encode(4096);
        assert_eq!(buf.len(), 4096);
        let back = Superblock::decode(&buf).unwrap();
        assert_eq!(back, sb);
        assert_eq!(back.geometry().unwrap(), geo);
    }

    #[test]
    fn checksum_detects_bit_flip() {
        let geo = Geometry::from_config(&FsConfig::default()).unwrap();
        let mut buf = Superblock::fresh(&geo).encode(4096);
        buf[25] ^= 0x01;
        assert!(matches!(
            Superblock::decode(&buf),
            Err(ParseError::InvalidField {
                field: "checksum",
                ..
            })
        ));
    }

    #[test]
    fn zeroed_block_is_not_a_superblock() {
        assert!(matches!(
            Superblock::decode(&[0_u8; 512]),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn mismatched_region_start_is_rejected() {
        let geo = Geometry::from_config(&FsConfig::default()).unwrap();
        let mut sb = Superblock::fresh(&geo);
        sb.data_start = BlockNumber(sb.data_start.0 + 1);
        assert!(sb.geometry().is_err());
    }
}
