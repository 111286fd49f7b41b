#![forbid(unsafe_code)]
//! Shared newtypes, format constants, and disk geometry for SFS images.
//!
//! An SFS image is a single fixed-size file carved into five regions:
//!
//! | Region | Length (blocks) | Contents |
//! |--------|-----------------|----------|
//! | superblock | 1 | counters and geometry parameters |
//! | bitmap | `ceil(ceil(total / 8) / block_size)` | one bit per block, LSB-first |
//! | B+tree | leaf bound + internal bound | packed node records |
//! | metadata | `ceil(max_files / (order - 1))` | 128-byte slot records |
//! | data | remainder | file contents |
//!
//! Everything before the data region is permanently marked used in the bitmap.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Format constants ────────────────────────────────────────────────────────

/// Superblock magic, "SFS1" read as a little-endian u32.
pub const SFS_MAGIC: u32 = 0x3153_4653;

/// On-disk format version written by this build.
pub const SFS_FORMAT_VERSION: u16 = 1;

/// Width of the NUL-padded name field in a metadata slot.
pub const NAME_FIELD_LEN: usize = 32;

/// Longest accepted entry name (one byte is reserved for the terminator).
pub const MAX_NAME_LEN: usize = NAME_FIELD_LEN - 1;

/// Extents per entry.
pub const MAX_EXTENTS: usize = 5;

/// Size of one metadata slot record.
pub const SLOT_SIZE: usize = 128;

/// Bytes used by the superblock record (the rest of block 0 is zero).
pub const SUPERBLOCK_SIZE: usize = 64;

pub const MIN_BLOCK_SIZE: u32 = 512;
pub const MAX_BLOCK_SIZE: u32 = 65536;
pub const MIN_ORDER: u32 = 3;

// ── Newtypes ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an entry in the metadata table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotIndex(pub u32);

impl SlotIndex {
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Directory identifier used for parent/child linkage. The root is 0 and has
/// no slot of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DirId(pub u32);

impl DirId {
    pub const ROOT: Self = Self(0);

    #[must_use]
    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Display for DirId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contiguous run of blocks owned by one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub start: BlockNumber,
    pub len: u32,
}

impl Extent {
    #[must_use]
    pub fn new(start: BlockNumber, len: u32) -> Self {
        Self { start, len }
    }

    /// One past the last block of the run.
    #[must_use]
    pub fn end(&self) -> BlockNumber {
        BlockNumber(self.start.0 + u64::from(self.len))
    }

    pub fn blocks(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        (self.start.0..self.end().0).map(BlockNumber)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    /// Namespace tag used when deriving index keys.
    #[must_use]
    pub fn tag(self) -> char {
        match self {
            Self::File => 'F',
            Self::Directory => 'D',
        }
    }

    #[must_use]
    pub fn is_dir(self) -> bool {
        matches!(self, Self::Directory)
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => f.write_str("file"),
            Self::Directory => f.write_str("directory"),
        }
    }
}

// ── Permissions and attributes ──────────────────────────────────────────────

pub const OWNER_SHIFT: u16 = 6;
pub const GROUP_SHIFT: u16 = 3;
pub const OTHER_SHIFT: u16 = 0;

pub const DEFAULT_FILE_MODE: u16 = 0o644;
pub const DEFAULT_DIR_MODE: u16 = 0o755;

bitflags! {
    /// Requested access, tested against one rwx triplet of an entry's mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Access: u16 {
        const READ = 0b100;
        const WRITE = 0b010;
        const EXEC = 0b001;
    }
}

bitflags! {
    /// Advisory attribute byte stored in each slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Attributes: u8 {
        const HIDDEN = 0b100;
        const SYSTEM = 0b010;
        const ARCHIVE = 0b001;
    }
}

/// Render a 9-bit mode as `rwxr-x---`.
#[must_use]
pub fn mode_string(mode: u16) -> String {
    let mut out = String::with_capacity(9);
    for shift in [OWNER_SHIFT, GROUP_SHIFT, OTHER_SHIFT] {
        let triplet = (mode >> shift) & 0o7;
        out.push(if triplet & Access::READ.bits() != 0 { 'r' } else { '-' });
        out.push(if triplet & Access::WRITE.bits() != 0 { 'w' } else { '-' });
        out.push(if triplet & Access::EXEC.bits() != 0 { 'x' } else { '-' });
    }
    out
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("name is empty")]
    Empty,
    #[error("name is {len} bytes, limit is {MAX_NAME_LEN}")]
    TooLong { len: usize },
    #[error("name contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("name {0:?} is reserved")]
    Reserved(String),
}

/// Accept 1..=31 bytes of ASCII alphanumerics, `.` and `_`, excluding `.`/`..`.
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong { len: name.len() });
    }
    if name == "." || name == ".." {
        return Err(NameError::Reserved(name.to_owned()));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '.' || *c == '_'))
    {
        return Err(NameError::InvalidChar(bad));
    }
    Ok(())
}

// ── Byte helpers ────────────────────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

// ── Configuration and geometry ──────────────────────────────────────────────

/// Format-time parameters. The defaults give a 100 MiB image with 4 KiB
/// blocks, room for 3000 entries, and an order-5 index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub disk_size: u64,
    pub block_size: u32,
    pub max_files: u32,
    pub order: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            disk_size: 100 * 1024 * 1024,
            block_size: 4096,
            max_files: 3000,
            order: 5,
        }
    }
}

/// Derived region layout. Every field is a pure function of
/// `(block_size, total_blocks, max_files, order)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub block_size: u32,
    pub total_blocks: u64,
    pub max_files: u32,
    pub order: u32,
    pub bitmap_start: BlockNumber,
    pub bitmap_blocks: u64,
    pub tree_start: BlockNumber,
    pub tree_blocks: u64,
    pub meta_start: BlockNumber,
    pub meta_blocks: u64,
    pub data_start: BlockNumber,
}

/// Upper bound on B+tree nodes for `max_files` keys, used to size the region.
#[must_use]
pub fn tree_node_bound(max_files: u32, order: u32) -> u64 {
    let fanout = u64::from(order.max(MIN_ORDER));
    let leaves = u64::from(max_files).div_ceil(fanout - 1).max(1);
    let mut internal = 0_u64;
    let mut level = leaves;
    while level > 1 {
        level = level.div_ceil(fanout);
        internal += level;
    }
    leaves + internal
}

/// Largest serialized node record for the given order.
#[must_use]
pub fn max_node_record_len(order: u32) -> usize {
    let keys = order.saturating_sub(1) as usize;
    let header = 4 + 1 + 4;
    let leaf = header + keys * 4 * 2 + 4;
    let internal = header + keys * 4 + 4 + (keys + 1) * 4;
    leaf.max(internal)
}

impl Geometry {
    pub fn from_config(config: &FsConfig) -> Result<Self, ParseError> {
        if config.block_size == 0 {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be non-zero",
            });
        }
        Self::new(
            config.block_size,
            config.disk_size / u64::from(config.block_size),
            config.max_files,
            config.order,
        )
    }

    pub fn new(
        block_size: u32,
        total_blocks: u64,
        max_files: u32,
        order: u32,
    ) -> Result<Self, ParseError> {
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        if order < MIN_ORDER {
            return Err(ParseError::InvalidField {
                field: "order",
                reason: "must be at least 3",
            });
        }
        if max_files == 0 {
            return Err(ParseError::InvalidField {
                field: "max_files",
                reason: "must be non-zero",
            });
        }
        let bs = block_size as usize;
        if SLOT_SIZE * (order as usize - 1) > bs {
            return Err(ParseError::InvalidField {
                field: "order",
                reason: "order-1 metadata slots must fit in one block",
            });
        }
        if max_node_record_len(order) > bs {
            return Err(ParseError::InvalidField {
                field: "order",
                reason: "a full B+tree node must fit in one block",
            });
        }
        if u32::try_from(total_blocks).is_err() {
            return Err(ParseError::IntegerConversion {
                field: "total_blocks",
            });
        }

        let bitmap_blocks = total_blocks.div_ceil(8).div_ceil(u64::from(block_size));
        let tree_blocks = tree_node_bound(max_files, order);
        let meta_blocks = u64::from(max_files).div_ceil(u64::from(order - 1));

        let bitmap_start = BlockNumber(1);
        let tree_start = BlockNumber(bitmap_start.0 + bitmap_blocks);
        let meta_start = BlockNumber(tree_start.0 + tree_blocks);
        let data_start = BlockNumber(meta_start.0 + meta_blocks);
        if data_start.0 >= total_blocks {
            return Err(ParseError::InvalidField {
                field: "disk_size",
                reason: "too small to hold any data blocks",
            });
        }

        Ok(Self {
            block_size,
            total_blocks,
            max_files,
            order,
            bitmap_start,
            bitmap_blocks,
            tree_start,
            tree_blocks,
            meta_start,
            meta_blocks,
            data_start,
        })
    }

    #[must_use]
    pub fn disk_size(&self) -> u64 {
        self.total_blocks * u64::from(self.block_size)
    }

    #[must_use]
    pub fn data_blocks(&self) -> u64 {
        self.total_blocks - self.data_start.0
    }

    #[must_use]
    pub fn slots_per_block(&self) -> u32 {
        self.order - 1
    }

    /// Number of addressable metadata slots (always >= `max_files`).
    #[must_use]
    pub fn slot_capacity(&self) -> u32 {
        self.max_files
    }

    /// Block holding `slot` and the byte offset of its record in that block.
    #[must_use]
    pub fn slot_location(&self, slot: SlotIndex) -> (BlockNumber, usize) {
        let per_block = self.slots_per_block();
        let block = self.meta_start.0 + u64::from(slot.0 / per_block);
        let offset = (slot.0 % per_block) as usize * SLOT_SIZE;
        (BlockNumber(block), offset)
    }

    /// Ceiling division of a byte length into blocks.
    #[must_use]
    pub fn blocks_for_bytes(&self, bytes: u64) -> u64 {
        bytes.div_ceil(u64::from(self.block_size))
    }

    #[must_use]
    pub fn is_data_block(&self, block: BlockNumber) -> bool {
        block >= self.data_start && block.0 < self.total_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_geometry_matches_reference_layout() {
        let geo = Geometry::from_config(&FsConfig::default()).unwrap();
        assert_eq!(geo.total_blocks, 25_600);
        assert_eq!(geo.bitmap_blocks, 1);
        assert_eq!(geo.meta_blocks, 750);
        // 750 leaves, then 150 + 30 + 6 + 2 + 1 internal nodes.
        assert_eq!(geo.tree_blocks, 939);
        assert_eq!(geo.data_start, BlockNumber(1 + 1 + 939 + 750));
        assert_eq!(geo.data_blocks(), 25_600 - geo.data_start.0);
    }

    #[test]
    fn small_geometry_regions_are_contiguous() {
        let cfg = FsConfig {
            disk_size: 1024 * 1024,
            block_size: 512,
            max_files: 64,
            order: 5,
        };
        let geo = Geometry::from_config(&cfg).unwrap();
        assert_eq!(geo.total_blocks, 2048);
        assert_eq!(geo.bitmap_start, BlockNumber(1));
        assert_eq!(geo.tree_start.0, geo.bitmap_start.0 + geo.bitmap_blocks);
        assert_eq!(geo.meta_start.0, geo.tree_start.0 + geo.tree_blocks);
        assert_eq!(geo.data_start.0, geo.meta_start.0 + geo.meta_blocks);
        assert_eq!(geo.meta_blocks, 16);
    }

    #[test]
    fn rejects_bad_parameters() {
        let base = FsConfig {
            disk_size: 1024 * 1024,
            block_size: 512,
            max_files: 64,
            order: 5,
        };
        let bad_bs = FsConfig {
            block_size: 1000,
            ..base.clone()
        };
        assert!(Geometry::from_config(&bad_bs).is_err());

        let bad_order = FsConfig {
            order: 2,
            ..base.clone()
        };
        assert!(Geometry::from_config(&bad_order).is_err());

        // Five slots of 128 bytes do not fit a 512-byte block.
        let wide = FsConfig {
            order: 6,
            ..base.clone()
        };
        assert!(Geometry::from_config(&wide).is_err());

        let tiny = FsConfig {
            disk_size: 512 * 8,
            ..base
        };
        assert!(Geometry::from_config(&tiny).is_err());
    }

    #[test]
    fn slot_location_packs_order_minus_one_per_block() {
        let geo = Geometry::from_config(&FsConfig::default()).unwrap();
        assert_eq!(geo.slot_location(SlotIndex(0)), (geo.meta_start, 0));
        assert_eq!(geo.slot_location(SlotIndex(3)), (geo.meta_start, 3 * SLOT_SIZE));
        assert_eq!(
            geo.slot_location(SlotIndex(4)),
            (BlockNumber(geo.meta_start.0 + 1), 0)
        );
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("a.txt").is_ok());
        assert!(validate_name("Report_2024.md").is_ok());
        assert_eq!(validate_name(""), Err(NameError::Empty));
        assert_eq!(validate_name(".."), Err(NameError::Reserved("..".into())));
        assert_eq!(validate_name("a b"), Err(NameError::InvalidChar(' ')));
        assert_eq!(validate_name("a/b"), Err(NameError::InvalidChar('/')));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert_eq!(
            validate_name(&long),
            Err(NameError::TooLong {
                len: MAX_NAME_LEN + 1
            })
        );
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[test]
    fn mode_string_renders_triplets() {
        assert_eq!(mode_string(0o644), "rw-r--r--");
        assert_eq!(mode_string(0o755), "rwxr-xr-x");
        assert_eq!(mode_string(0o640), "rw-r-----");
        assert_eq!(mode_string(0), "---------");
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let cfg: FsConfig = serde_json::from_str(r#"{"max_files": 10}"#).unwrap();
        assert_eq!(cfg.max_files, 10);
        assert_eq!(cfg.block_size, 4096);
    }

    #[test]
    fn extent_block_iteration() {
        let ext = Extent::new(BlockNumber(10), 3);
        let blocks: Vec<_> = ext.blocks().collect();
        assert_eq!(blocks, vec![BlockNumber(10), BlockNumber(11), BlockNumber(12)]);
        assert_eq!(ext.end(), BlockNumber(13));
    }

    proptest! {
        #[test]
        fn blocks_for_bytes_is_ceiling_division(bytes in 0_u64..10_000_000) {
            let geo = Geometry::from_config(&FsConfig::default()).unwrap();
            let blocks = geo.blocks_for_bytes(bytes);
            prop_assert!(blocks * 4096 >= bytes);
            prop_assert!(blocks == 0 || (blocks - 1) * 4096 < bytes);
        }
    }
}
