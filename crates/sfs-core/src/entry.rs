//! Metadata entries and their 128-byte slot records.
//!
//! | Offset | Field | Type |
//! |--------|-------|------|
//! | 0 | name, NUL padded | `[u8; 32]` |
//! | 32 | size | u64 |
//! | 40 | extent count | u32 |
//! | 44 | 5 × (start, len) | (u32, u32) |
//! | 84 | is_dir | u8 |
//! | 85 | parent dir id | u32 |
//! | 89 | dir id | u32 |
//! | 93 | created / modified / accessed | 3 × u64 |
//! | 117 | owner | u32 |
//! | 121 | group | u32 |
//! | 125 | mode | u16 |
//! | 127 | attributes | u8 |
//!
//! A slot whose first name byte is zero is vacant.

use sfs_types::{
    Attributes, BlockNumber, DirId, EntryKind, Extent, MAX_EXTENTS, NAME_FIELD_LEN, ParseError,
    SLOT_SIZE, ensure_slice, read_le_u16, read_le_u32, read_le_u64, trim_nul_padded,
};
use std::time::{SystemTime, UNIX_EPOCH};

const OFF_SIZE: usize = 32;
const OFF_EXTENT_COUNT: usize = 40;
const OFF_EXTENTS: usize = 44;
const OFF_IS_DIR: usize = 84;
const OFF_PARENT: usize = 85;
const OFF_DIR_ID: usize = 89;
const OFF_CREATED: usize = 93;
const OFF_MODIFIED: usize = 101;
const OFF_ACCESSED: usize = 109;
const OFF_OWNER: usize = 117;
const OFF_GROUP: usize = 121;
const OFF_MODE: usize = 125;
const OFF_ATTRIBUTES: usize = 127;

/// Current wall-clock time in unix seconds.
#[must_use]
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
    /// Logical size in bytes. Always zero for directories.
    pub size: u64,
    pub extents: Vec<Extent>,
    /// Id of the containing directory.
    pub parent: DirId,
    /// Id this directory hands to its children. Unused for files.
    pub dir_id: DirId,
    pub created: u64,
    pub modified: u64,
    pub accessed: u64,
    pub owner: u32,
    pub group: u32,
    pub mode: u16,
    pub attributes: Attributes,
}

impl Entry {
    #[must_use]
    pub fn vacant() -> Self {
        Self {
            name: String::new(),
            kind: EntryKind::File,
            size: 0,
            extents: Vec::new(),
            parent: DirId::ROOT,
            dir_id: DirId::ROOT,
            created: 0,
            modified: 0,
            accessed: 0,
            owner: 0,
            group: 0,
            mode: 0,
            attributes: Attributes::empty(),
        }
    }

    /// A fresh entry stamped with the current time.
    #[must_use]
    pub fn new(
        name: &str,
        kind: EntryKind,
        parent: DirId,
        owner: u32,
        group: u32,
        mode: u16,
    ) -> Self {
        let now = now_secs();
        Self {
            name: name.to_owned(),
            kind,
            parent,
            created: now,
            modified: now,
            accessed: now,
            owner,
            group,
            mode,
            ..Self::vacant()
        }
    }

    #[must_use]
    pub fn is_vacant(&self) -> bool {
        self.name.is_empty()
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Blocks claimed across all extents.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.extents.iter().map(|e| u64::from(e.len)).sum()
    }

    /// Every claimed block, in extent order.
    #[must_use]
    pub fn blocks(&self) -> Vec<BlockNumber> {
        self.extents.iter().flat_map(Extent::blocks).collect()
    }

    /// Whether this live entry is the one named by the lookup tuple.
    #[must_use]
    pub fn matches(&self, owner: u32, parent: DirId, kind: EntryKind, name: &str) -> bool {
        !self.is_vacant()
            && self.owner == owner
            && self.parent == parent
            && self.kind == kind
            && self.name == name
    }

    #[must_use]
    pub fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut buf = [0_u8; SLOT_SIZE];
        if self.is_vacant() {
            return buf;
        }
        let name = self.name.as_bytes();
        let len = name.len().min(NAME_FIELD_LEN - 1);
        buf[..len].copy_from_slice(&name[..len]);
        buf[OFF_SIZE..OFF_SIZE + 8].copy_from_slice(&self.size.to_le_bytes());
        let count = self.extents.len().min(MAX_EXTENTS);
        // count <= MAX_EXTENTS, so the cast is lossless.
        buf[OFF_EXTENT_COUNT..OFF_EXTENT_COUNT + 4].copy_from_slice(&(count as u32).to_le_bytes());
        for (i, extent) in self.extents.iter().take(MAX_EXTENTS).enumerate() {
            let off = OFF_EXTENTS + i * 8;
            // Geometry caps the image at u32::MAX blocks.
            let start = u32::try_from(extent.start.0).unwrap_or(u32::MAX);
            buf[off..off + 4].copy_from_slice(&start.to_le_bytes());
            buf[off + 4..off + 8].copy_from_slice(&extent.len.to_le_bytes());
        }
        buf[OFF_IS_DIR] = u8::from(self.is_dir());
        buf[OFF_PARENT..OFF_PARENT + 4].copy_from_slice(&self.parent.0.to_le_bytes());
        buf[OFF_DIR_ID..OFF_DIR_ID + 4].copy_from_slice(&self.dir_id.0.to_le_bytes());
        buf[OFF_CREATED..OFF_CREATED + 8].copy_from_slice(&self.created.to_le_bytes());
        buf[OFF_MODIFIED..OFF_MODIFIED + 8].copy_from_slice(&self.modified.to_le_bytes());
        buf[OFF_ACCESSED..OFF_ACCESSED + 8].copy_from_slice(&self.accessed.to_le_bytes());
        buf[OFF_OWNER..OFF_OWNER + 4].copy_from_slice(&self.owner.to_le_bytes());
        buf[OFF_GROUP..OFF_GROUP + 4].copy_from_slice(&self.group.to_le_bytes());
        buf[OFF_MODE..OFF_MODE + 2].copy_from_slice(&self.mode.to_le_bytes());
        buf[OFF_ATTRIBUTES] = self.attributes.bits();
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, 0, SLOT_SIZE)?;
        if raw[0] == 0 {
            return Ok(Self::vacant());
        }
        let count = read_le_u32(raw, OFF_EXTENT_COUNT)? as usize;
        if count > MAX_EXTENTS {
            return Err(ParseError::InvalidField {
                field: "extent_count",
                reason: "exceeds the per-slot limit",
            });
        }
        let mut extents = Vec::with_capacity(count);
        for i in 0..count {
            let off = OFF_EXTENTS + i * 8;
            let start = read_le_u32(raw, off)?;
            let len = read_le_u32(raw, off + 4)?;
            if len == 0 {
                return Err(ParseError::InvalidField {
                    field: "extent",
                    reason: "zero-length extent",
                });
            }
            extents.push(Extent::new(BlockNumber(u64::from(start)), len));
        }
        let kind = match raw[OFF_IS_DIR] {
            0 => EntryKind::File,
            1 => EntryKind::Directory,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "is_dir",
                    reason: "must be 0 or 1",
                });
            }
        };
        Ok(Self {
            name: trim_nul_padded(&raw[..NAME_FIELD_LEN]),
            kind,
            size: read_le_u64(raw, OFF_SIZE)?,
            extents,
            parent: DirId(read_le_u32(raw, OFF_PARENT)?),
            dir_id: DirId(read_le_u32(raw, OFF_DIR_ID)?),
            created: read_le_u64(raw, OFF_CREATED)?,
            modified: read_le_u64(raw, OFF_MODIFIED)?,
            accessed: read_le_u64(raw, OFF_ACCESSED)?,
            owner: read_le_u32(raw, OFF_OWNER)?,
            group: read_le_u32(raw, OFF_GROUP)?,
            mode: read_le_u16(raw, OFF_MODE)? & 0o777,
            attributes: Attributes::from_bits_truncate(raw[OFF_ATTRIBUTES]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_types::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};

    fn sample_file() -> Entry {
        let mut entry = Entry::new("notes.txt", EntryKind::File, DirId(3), 1000, 100, 0o640);
        entry.size = 9000;
        entry.extents = vec![
            Extent::new(BlockNumber(1700), 2),
            Extent::new(BlockNumber(1710), 1),
        ];
        entry.attributes = Attributes::HIDDEN | Attributes::ARCHIVE;
        entry
    }

    #[test]
    fn slot_round_trip() {
        let entry = sample_file();
        let buf = entry.encode();
        assert_eq!(&buf[..9], b"notes.txt");
        assert_eq!(buf[9], 0);
        assert_eq!(Entry::decode(&buf).unwrap(), entry);
    }

    #[test]
    fn directory_round_trip_keeps_ids() {
        let mut dir = Entry::new("docs", EntryKind::Directory, DirId::ROOT, 0, 0, DEFAULT_DIR_MODE);
        dir.dir_id = DirId(7);
        let back = Entry::decode(&dir.encode()).unwrap();
        assert!(back.is_dir());
        assert_eq!(back.dir_id, DirId(7));
        assert_eq!(back.parent, DirId::ROOT);
    }

    #[test]
    fn vacant_slot_is_all_zero() {
        assert_eq!(Entry::vacant().encode(), [0_u8; SLOT_SIZE]);
        assert!(Entry::decode(&[0_u8; SLOT_SIZE]).unwrap().is_vacant());
    }

    #[test]
    fn block_accounting() {
        let entry = sample_file();
        assert_eq!(entry.block_count(), 3);
        assert_eq!(
            entry.blocks(),
            vec![BlockNumber(1700), BlockNumber(1701), BlockNumber(1710)]
        );
    }

    #[test]
    fn matches_checks_every_key_component() {
        let entry = Entry::new("a", EntryKind::File, DirId(2), 5, 5, DEFAULT_FILE_MODE);
        assert!(entry.matches(5, DirId(2), EntryKind::File, "a"));
        assert!(!entry.matches(6, DirId(2), EntryKind::File, "a"));
        assert!(!entry.matches(5, DirId(3), EntryKind::File, "a"));
        assert!(!entry.matches(5, DirId(2), EntryKind::Directory, "a"));
        assert!(!entry.matches(5, DirId(2), EntryKind::File, "b"));
        assert!(!Entry::vacant().matches(0, DirId::ROOT, EntryKind::File, ""));
    }

    #[test]
    fn too_many_extents_rejected() {
        let mut buf = sample_file().encode();
        buf[OFF_EXTENT_COUNT..OFF_EXTENT_COUNT + 4].copy_from_slice(&6_u32.to_le_bytes());
        assert!(Entry::decode(&buf).is_err());
    }

    #[test]
    fn bad_kind_byte_rejected() {
        let mut buf = sample_file().encode();
        buf[OFF_IS_DIR] = 9;
        assert!(Entry::decode(&buf).is_err());
    }
}
