//! Flat metadata table: one slot per entry, packed `order - 1` per block.
//!
//! Directories do not store child lists. Children are found by scanning for
//! slots whose parent id and owner match.

use crate::entry::Entry;
use sfs_block::{BlockDevice, write_region};
use sfs_error::{Result, SfsError};
use sfs_types::{BlockNumber, DirId, Geometry, SLOT_SIZE, SlotIndex};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct MetadataTable {
    entries: Vec<Entry>,
    geometry: Geometry,
}

impl MetadataTable {
    /// Empty table; the region is assumed already zeroed.
    #[must_use]
    pub fn format(geometry: Geometry) -> Self {
        Self {
            entries: vec![Entry::vacant(); geometry.slot_capacity() as usize],
            geometry,
        }
    }

    pub fn load(dev: &dyn BlockDevice, geometry: Geometry) -> Result<Self> {
        let capacity = geometry.slot_capacity();
        let per_block = geometry.slots_per_block();
        let mut entries = Vec::with_capacity(capacity as usize);
        for b in 0..geometry.meta_blocks {
            let block = BlockNumber(geometry.meta_start.0 + b);
            let buf = dev.read_block(block)?;
            for i in 0..per_block {
                if entries.len() == capacity as usize {
                    break;
                }
                let off = i as usize * SLOT_SIZE;
                let entry = Entry::decode(&buf.as_slice()[off..off + SLOT_SIZE]).map_err(|err| {
                    SfsError::Corruption {
                        block: block.0,
                        detail: format!("slot {}: {err}", entries.len()),
                    }
                })?;
                entries.push(entry);
            }
        }
        let table = Self { entries, geometry };
        debug!(slots = capacity, live = table.live().count(), "metadata_table_loaded");
        Ok(table)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn get(&self, slot: SlotIndex) -> Option<&Entry> {
        self.entries.get(slot.as_usize())
    }

    pub fn set(&mut self, slot: SlotIndex, entry: Entry) -> Result<()> {
        let cell = self
            .entries
            .get_mut(slot.as_usize())
            .ok_or_else(|| SfsError::Format(format!("slot {slot} out of range")))?;
        *cell = entry;
        Ok(())
    }

    #[must_use]
    pub fn first_vacant(&self) -> Option<SlotIndex> {
        self.entries
            .iter()
            .position(Entry::is_vacant)
            .and_then(|i| u32::try_from(i).ok())
            .map(SlotIndex)
    }

    /// Occupied slots in table order.
    pub fn live(&self) -> impl Iterator<Item = (SlotIndex, &Entry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_vacant())
            .filter_map(|(i, e)| u32::try_from(i).ok().map(|i| (SlotIndex(i), e)))
    }

    /// Children of `dir` visible to `owner`, in slot order.
    #[must_use]
    pub fn children_of(&self, dir: DirId, owner: u32) -> Vec<(SlotIndex, Entry)> {
        self.live()
            .filter(|(_, e)| e.parent == dir && e.owner == owner)
            .map(|(slot, e)| (slot, e.clone()))
            .collect()
    }

    /// Slot of the directory that hands out `dir_id`.
    #[must_use]
    pub fn find_dir(&self, dir_id: DirId) -> Option<(SlotIndex, &Entry)> {
        if dir_id.is_root() {
            return None;
        }
        self.live().find(|(_, e)| e.is_dir() && e.dir_id == dir_id)
    }

    /// Rewrite the block holding `slot`.
    pub fn persist_slot(&self, dev: &dyn BlockDevice, slot: SlotIndex) -> Result<()> {
        let entry = self
            .get(slot)
            .ok_or_else(|| SfsError::Format(format!("slot {slot} out of range")))?;
        let (block, offset) = self.geometry.slot_location(slot);
        let mut buf = dev.read_block(block)?;
        buf.as_mut_slice()[offset..offset + SLOT_SIZE].copy_from_slice(&entry.encode());
        dev.write_block(block, buf.as_slice())?;
        trace!(slot = slot.0, block = block.0, "slot_persisted");
        Ok(())
    }

    /// Rewrite the whole region.
    pub fn persist_all(&self, dev: &dyn BlockDevice) -> Result<()> {
        let per_block = self.geometry.slots_per_block() as usize;
        let bs = self.geometry.block_size as usize;
        let blocks = usize::try_from(self.geometry.meta_blocks)
            .map_err(|_| SfsError::Format("metadata region too large".into()))?;
        let mut data = vec![0_u8; blocks * bs];
        for (i, entry) in self.entries.iter().enumerate() {
            let off = (i / per_block) * bs + (i % per_block) * SLOT_SIZE;
            data[off..off + SLOT_SIZE].copy_from_slice(&entry.encode());
        }
        write_region(dev, self.geometry.meta_start, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_block::{ByteBlockDevice, MemByteDevice};
    use sfs_types::{DEFAULT_FILE_MODE, EntryKind, FsConfig};

    fn small() -> (Geometry, ByteBlockDevice<MemByteDevice>) {
        let config = FsConfig {
            disk_size: 1024 * 1024,
            block_size: 512,
            max_files: 64,
            order: 5,
        };
        let geo = Geometry::from_config(&config).unwrap();
        let dev = ByteBlockDevice::new(MemByteDevice::new(1024 * 1024), 512).unwrap();
        (geo, dev)
    }

    fn file(name: &str, parent: u32, owner: u32) -> Entry {
        Entry::new(name, EntryKind::File, DirId(parent), owner, owner, DEFAULT_FILE_MODE)
    }

    #[test]
    fn persist_slot_then_load() {
        let (geo, dev) = small();
        let mut table = MetadataTable::format(geo);
        assert_eq!(table.capacity(), 64);
        table.set(SlotIndex(5), file("five", 0, 0)).unwrap();
        table.persist_slot(&dev, SlotIndex(5)).unwrap();
        table.set(SlotIndex(6), file("six", 0, 0)).unwrap();
        table.persist_slot(&dev, SlotIndex(6)).unwrap();

        let loaded = MetadataTable::load(&dev, geo).unwrap();
        assert_eq!(loaded.get(SlotIndex(5)).unwrap().name, "five");
        assert_eq!(loaded.get(SlotIndex(6)).unwrap().name, "six");
        assert_eq!(loaded.live().count(), 2);
        assert_eq!(loaded.first_vacant(), Some(SlotIndex(0)));
    }

    #[test]
    fn persist_all_matches_slot_writes() {
        let (geo, dev) = small();
        let mut table = MetadataTable::format(geo);
        for i in 0..10 {
            table.set(SlotIndex(i), file(&format!("f{i}"), 0, 0)).unwrap();
        }
        table.persist_all(&dev).unwrap();
        let loaded = MetadataTable::load(&dev, geo).unwrap();
        assert_eq!(loaded.live().count(), 10);
        assert_eq!(loaded.get(SlotIndex(9)).unwrap().name, "f9");
        assert_eq!(loaded.first_vacant(), Some(SlotIndex(10)));
    }

    #[test]
    fn children_filter_by_parent_and_owner() {
        let (geo, _) = small();
        let mut table = MetadataTable::format(geo);
        table.set(SlotIndex(0), file("a", 3, 1)).unwrap();
        table.set(SlotIndex(1), file("b", 3, 2)).unwrap();
        table.set(SlotIndex(2), file("c", 4, 1)).unwrap();
        let kids = table.children_of(DirId(3), 1);
        assert_eq!(kids.len(), 1);
        assert_eq!(kids[0].1.name, "a");
    }

    #[test]
    fn find_dir_skips_root_and_files() {
        let (geo, _) = small();
        let mut table = MetadataTable::format(geo);
        let mut dir = Entry::new("d", EntryKind::Directory, DirId::ROOT, 0, 0, 0o755);
        dir.dir_id = DirId(4);
        table.set(SlotIndex(3), dir).unwrap();
        assert_eq!(table.find_dir(DirId(4)).unwrap().0, SlotIndex(3));
        assert!(table.find_dir(DirId::ROOT).is_none());
        assert!(table.find_dir(DirId(5)).is_none());
    }

    #[test]
    fn full_table_has_no_vacancy() {
        let (geo, _) = small();
        let mut table = MetadataTable::format(geo);
        for i in 0..64 {
            table.set(SlotIndex(i), file(&format!("f{i}"), 0, 0)).unwrap();
        }
        assert_eq!(table.first_vacant(), None);
        assert!(table.set(SlotIndex(64), file("x", 0, 0)).is_err());
    }
}
