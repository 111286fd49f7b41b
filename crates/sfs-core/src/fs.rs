//! The filesystem engine: shared aggregates, format/open, and the internal
//! helpers every operation is built from.
//!
//! # Locking
//!
//! | Lock | Guards | Held by |
//! |------|--------|---------|
//! | `mutation` | one logical mutating call | create, write, append, delete, rename, mkdir, rmdir, chmod, chown, chgrp, attributes, replay |
//! | entry lock | one slot | readers share, mutators exclusive |
//! | `superblock`, `table`, `index`, `counters` | one aggregate each | short sections, never nested on the same lock |
//!
//! Acquisition order is `mutation`, then entry lock, then aggregates.
//! Queries skip `mutation`.

use crate::entry::{Entry, now_secs};
use crate::extent::{append_blocks, block_at, truncate};
use crate::keys::index_key;
use crate::lock::EntryLock;
use crate::session::{AccountStore, AccountTable, Identity, Session};
use crate::superblock::Superblock;
use crate::table::MetadataTable;
use parking_lot::{Mutex, RwLock};
use sfs_alloc::BlockAllocator;
use sfs_block::{BlockDevice, read_region, zero_blocks};
use sfs_btree::{BPlusTree, Key};
use sfs_error::{Result, SfsError};
use sfs_journal::{Journal, JournalOp, JournalOptions};
use sfs_types::{
    BlockNumber, DirId, EntryKind, Extent, FsConfig, Geometry, NameError, ParseError, SlotIndex,
    validate_name,
};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ── Options ─────────────────────────────────────────────────────────────────

/// How to attach the journal and account store when formatting or opening.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub journal_path: PathBuf,
    /// fsync the journal after every append and commit patch (default: true).
    pub sync_on_commit: bool,
    pub accounts: Arc<dyn AccountStore>,
}

impl OpenOptions {
    #[must_use]
    pub fn new(journal_path: impl Into<PathBuf>) -> Self {
        Self {
            journal_path: journal_path.into(),
            sync_on_commit: true,
            accounts: Arc::new(AccountTable::new()),
        }
    }

    #[must_use]
    pub fn sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    #[must_use]
    pub fn accounts(mut self, accounts: Arc<dyn AccountStore>) -> Self {
        self.accounts = accounts;
        self
    }

    fn journal_options(&self) -> JournalOptions {
        JournalOptions {
            sync_on_commit: self.sync_on_commit,
        }
    }
}

// ── Error conversion ────────────────────────────────────────────────────────

pub(crate) fn geometry_error(err: ParseError) -> SfsError {
    SfsError::InvalidGeometry(err.to_string())
}

pub(crate) fn name_error(err: NameError) -> SfsError {
    match err {
        NameError::TooLong { .. } => SfsError::NameTooLong,
        other => SfsError::InvalidName(other.to_string()),
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Counters {
    pub next_dir_id: u32,
    pub live_entries: usize,
}

/// What a mutating call logs before it runs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Intent<'a> {
    pub op: JournalOp,
    pub name: &'a str,
    pub alt_name: &'a str,
    pub payload: &'a [u8],
    pub size: u64,
    pub dir: DirId,
}

pub struct Filesystem {
    pub(crate) dev: Arc<dyn BlockDevice>,
    pub(crate) geometry: Geometry,
    pub(crate) superblock: RwLock<Superblock>,
    pub(crate) allocator: BlockAllocator,
    pub(crate) table: RwLock<MetadataTable>,
    pub(crate) locks: Vec<EntryLock>,
    pub(crate) index: RwLock<BPlusTree>,
    pub(crate) counters: RwLock<Counters>,
    pub(crate) accounts: Arc<dyn AccountStore>,
    pub(crate) journal: Journal,
    pub(crate) mutation: Mutex<()>,
}

impl fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filesystem")
            .field("geometry", &self.geometry)
            .field("superblock", &*self.superblock.read())
            .field("journal", &self.journal.path())
            .finish_non_exhaustive()
    }
}

fn check_device(dev: &dyn BlockDevice, geometry: &Geometry) -> Result<()> {
    if dev.block_size() != geometry.block_size {
        return Err(SfsError::InvalidGeometry(format!(
            "device block size {} != image block size {}",
            dev.block_size(),
            geometry.block_size
        )));
    }
    if dev.block_count() < geometry.total_blocks {
        return Err(SfsError::InvalidGeometry(format!(
            "device holds {} blocks, image needs {}",
            dev.block_count(),
            geometry.total_blocks
        )));
    }
    Ok(())
}

impl Filesystem {
    /// Lay out a fresh image on `dev` and start an empty journal.
    pub fn format(
        dev: Arc<dyn BlockDevice>,
        config: &FsConfig,
        options: OpenOptions,
    ) -> Result<Self> {
        let geometry = Geometry::from_config(config).map_err(geometry_error)?;
        check_device(dev.as_ref(), &geometry)?;

        zero_blocks(dev.as_ref(), BlockNumber(0), geometry.data_start.0)?;
        let superblock = Superblock::fresh(&geometry);
        dev.write_block(BlockNumber(0), &superblock.encode(geometry.block_size as usize))?;
        let allocator = BlockAllocator::format(dev.as_ref(), geometry)?;
        let mut index = BPlusTree::new(geometry.order as usize);
        index.save(dev.as_ref(), geometry.tree_start, geometry.tree_blocks)?;
        let table = MetadataTable::format(geometry);
        dev.sync()?;
        let journal = Journal::create(&options.journal_path, options.journal_options())?;

        info!(
            total_blocks = geometry.total_blocks,
            data_start = geometry.data_start.0,
            block_size = geometry.block_size,
            max_files = geometry.max_files,
            order = geometry.order,
            "filesystem_formatted"
        );
        Ok(Self::assemble(
            dev,
            geometry,
            superblock,
            allocator,
            table,
            index,
            Counters {
                next_dir_id: 1,
                live_entries: 0,
            },
            options.accounts,
            journal,
        ))
    }

    /// Open an existing image, reconciling the index, bitmap and free count
    /// with the table.
    pub fn open(dev: Arc<dyn BlockDevice>, options: OpenOptions) -> Result<Self> {
        let block0 = dev.read_block(BlockNumber(0))?;
        let mut superblock = Superblock::decode(block0.as_slice()).map_err(|err| match err {
            magic @ ParseError::InvalidMagic { .. } => SfsError::Format(magic.to_string()),
            other => SfsError::Corruption {
                block: 0,
                detail: other.to_string(),
            },
        })?;
        let geometry = superblock.geometry().map_err(|err| SfsError::Corruption {
            block: 0,
            detail: err.to_string(),
        })?;
        check_device(dev.as_ref(), &geometry)?;

        let allocator = BlockAllocator::load(dev.as_ref(), geometry)?;
        let table = MetadataTable::load(dev.as_ref(), geometry)?;
        let mut index = BPlusTree::load(
            dev.as_ref(),
            geometry.tree_start,
            geometry.tree_blocks,
            geometry.order as usize,
        )?;
        let journal = Journal::open_with_options(&options.journal_path, options.journal_options())?;

        let counters = reconcile(
            dev.as_ref(),
            &geometry,
            &mut superblock,
            &allocator,
            &table,
            &mut index,
        )?;
        info!(
            live = counters.live_entries,
            free = superblock.free_blocks,
            pending = journal.load_report().uncommitted,
            "filesystem_opened"
        );
        Ok(Self::assemble(
            dev,
            geometry,
            superblock,
            allocator,
            table,
            index,
            counters,
            options.accounts,
            journal,
        ))
    }

    #[expect(clippy::too_many_arguments)]
    fn assemble(
        dev: Arc<dyn BlockDevice>,
        geometry: Geometry,
        superblock: Superblock,
        allocator: BlockAllocator,
        table: MetadataTable,
        index: BPlusTree,
        counters: Counters,
        accounts: Arc<dyn AccountStore>,
        journal: Journal,
    ) -> Self {
        let locks = (0..table.capacity()).map(|_| EntryLock::new()).collect();
        Self {
            dev,
            geometry,
            superblock: RwLock::new(superblock),
            allocator,
            table: RwLock::new(table),
            locks,
            index: RwLock::new(index),
            counters: RwLock::new(counters),
            accounts,
            journal,
            mutation: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.superblock.read().clone()
    }

    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    #[must_use]
    pub fn accounts(&self) -> &Arc<dyn AccountStore> {
        &self.accounts
    }

    /// Copy of the entry in `slot`, if occupied.
    #[must_use]
    pub fn entry(&self, slot: SlotIndex) -> Option<Entry> {
        self.table
            .read()
            .get(slot)
            .filter(|e| !e.is_vacant())
            .cloned()
    }

    /// The reader/writer lock embedded in `slot`.
    #[must_use]
    pub fn entry_lock(&self, slot: SlotIndex) -> Option<&EntryLock> {
        self.locks.get(slot.as_usize())
    }

    pub(crate) fn lock_for(&self, slot: SlotIndex) -> Result<&EntryLock> {
        self.entry_lock(slot)
            .ok_or_else(|| SfsError::Format(format!("slot {slot} out of range")))
    }

    // ── Persistence helpers ─────────────────────────────────────────────────

    /// Write the in-memory superblock (with the current dir id counter).
    pub(crate) fn persist_superblock(&self) -> Result<()> {
        let next_dir_id = self.counters.read().next_dir_id;
        let mut sb = self.superblock.write();
        sb.next_dir_id = next_dir_id;
        self.dev
            .write_block(BlockNumber(0), &sb.encode(self.geometry.block_size as usize))
    }

    pub(crate) fn persist_slot(&self, slot: SlotIndex) -> Result<()> {
        self.table.read().persist_slot(self.dev.as_ref(), slot)
    }

    /// Store `entry` in `slot` and write it; on failure the previous content
    /// is put back in memory.
    pub(crate) fn store_entry(&self, slot: SlotIndex, entry: Entry) -> Result<()> {
        let previous = {
            let mut table = self.table.write();
            let previous = table.get(slot).cloned().unwrap_or_else(Entry::vacant);
            table.set(slot, entry)?;
            previous
        };
        if let Err(err) = self.persist_slot(slot) {
            if let Err(undo) = self.table.write().set(slot, previous) {
                warn!(slot = slot.0, error = %undo, "slot_restore_failed");
            }
            return Err(err);
        }
        Ok(())
    }

    fn save_index(&self, index: &mut BPlusTree) -> Result<()> {
        index.save(
            self.dev.as_ref(),
            self.geometry.tree_start,
            self.geometry.tree_blocks,
        )
    }

    /// Apply `edits` (key, `Some(slot)` to insert or `None` to remove) and
    /// save. On a save failure the edits are undone in memory.
    pub(crate) fn index_apply(&self, edits: &[(Key, Option<SlotIndex>)]) -> Result<()> {
        let mut index = self.index.write();
        let mut undo = Vec::with_capacity(edits.len());
        for &(key, target) in edits {
            let old = match target {
                Some(slot) => index.insert(key, slot.0),
                None => index.remove(key),
            };
            undo.push((key, old));
        }
        if let Err(err) = self.save_index(&mut index) {
            for (key, old) in undo.into_iter().rev() {
                match old {
                    Some(value) => {
                        index.insert(key, value);
                    }
                    None => {
                        index.remove(key);
                    }
                }
            }
            warn!(edits = edits.len(), error = %err, "index_save_failed_rolled_back");
            return Err(err);
        }
        Ok(())
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    /// Entry named `name` of `kind` under `parent` owned by `owner`.
    ///
    /// A key that resolves to some other entry is treated as absent.
    pub(crate) fn lookup(
        &self,
        owner: u32,
        parent: DirId,
        kind: EntryKind,
        name: &str,
    ) -> Option<(SlotIndex, Entry)> {
        let key = index_key(owner, parent, kind, name);
        let slot = SlotIndex(self.index.read().search(key)?);
        let table = self.table.read();
        let entry = table.get(slot)?;
        if entry.matches(owner, parent, kind, name) {
            Some((slot, entry.clone()))
        } else {
            debug!(key, slot = slot.0, name, "index_key_shadowed");
            None
        }
    }

    /// File first, then directory.
    pub(crate) fn lookup_any(
        &self,
        owner: u32,
        parent: DirId,
        name: &str,
    ) -> Option<(SlotIndex, Entry)> {
        self.lookup(owner, parent, EntryKind::File, name)
            .or_else(|| self.lookup(owner, parent, EntryKind::Directory, name))
    }

    /// Fail unless `name` is free in both namespaces and its key for `kind`
    /// is unclaimed.
    pub(crate) fn ensure_absent(
        &self,
        owner: u32,
        parent: DirId,
        kind: EntryKind,
        name: &str,
    ) -> Result<Key> {
        if self.lookup_any(owner, parent, name).is_some() {
            return Err(SfsError::Exists);
        }
        let key = index_key(owner, parent, kind, name);
        if self.index.read().contains(key) {
            warn!(key, name, parent = parent.0, "index_key_collision");
            return Err(SfsError::IndexCollision(name.to_owned()));
        }
        Ok(key)
    }

    pub(crate) fn ensure_dir_exists(&self, dir: DirId) -> Result<()> {
        if dir.is_root() || self.table.read().find_dir(dir).is_some() {
            Ok(())
        } else {
            Err(SfsError::NotFound(format!("directory #{dir}")))
        }
    }

    pub(crate) fn dir_has_children(&self, dir: DirId) -> bool {
        self.table.read().live().any(|(_, e)| e.parent == dir)
    }

    // ── Paths ───────────────────────────────────────────────────────────────

    /// Parent of directory `dir`; the root is its own parent.
    pub(crate) fn parent_of(&self, dir: DirId) -> DirId {
        self.table
            .read()
            .find_dir(dir)
            .map_or(DirId::ROOT, |(_, e)| e.parent)
    }

    fn walk(&self, identity: &Identity, start: DirId, components: &[&str]) -> Result<DirId> {
        let mut dir = start;
        for &part in components {
            dir = match part {
                "." => dir,
                ".." => self.parent_of(dir),
                name => match self.lookup(identity.uid, dir, EntryKind::Directory, name) {
                    Some((_, entry)) => entry.dir_id,
                    None if self.lookup(identity.uid, dir, EntryKind::File, name).is_some() => {
                        return Err(SfsError::NotDirectory);
                    }
                    None => return Err(SfsError::NotFound(name.to_owned())),
                },
            };
        }
        Ok(dir)
    }

    fn split_path<'p>(session: &Session, path: &'p str) -> (DirId, Vec<&'p str>) {
        let start = if path.starts_with('/') {
            DirId::ROOT
        } else {
            session.cwd
        };
        (start, path.split('/').filter(|s| !s.is_empty()).collect())
    }

    /// Directory named by `path`.
    pub(crate) fn resolve_dir(&self, session: &Session, path: &str) -> Result<DirId> {
        let (start, parts) = Self::split_path(session, path);
        self.walk(&session.identity, start, &parts)
    }

    /// Containing directory and final component of `path`.
    pub(crate) fn resolve_parent<'p>(
        &self,
        session: &Session,
        path: &'p str,
    ) -> Result<(DirId, &'p str)> {
        let (start, mut parts) = Self::split_path(session, path);
        let Some(name) = parts.pop() else {
            return Err(SfsError::InvalidName(path.to_owned()));
        };
        if name == "." || name == ".." {
            return Err(SfsError::InvalidName(name.to_owned()));
        }
        let dir = self.walk(&session.identity, start, &parts)?;
        Ok((dir, name))
    }

    /// File named by `path`.
    pub(crate) fn resolve_file(
        &self,
        session: &Session,
        path: &str,
    ) -> Result<(DirId, String, SlotIndex, Entry)> {
        let (dir, name) = self.resolve_parent(session, path)?;
        self.find_file(&session.identity, dir, name)
            .map(|(slot, entry)| (dir, name.to_owned(), slot, entry))
    }

    pub(crate) fn find_file(
        &self,
        identity: &Identity,
        dir: DirId,
        name: &str,
    ) -> Result<(SlotIndex, Entry)> {
        match self.lookup(identity.uid, dir, EntryKind::File, name) {
            Some(found) => Ok(found),
            None if self
                .lookup(identity.uid, dir, EntryKind::Directory, name)
                .is_some() =>
            {
                Err(SfsError::IsDirectory)
            }
            None => Err(SfsError::NotFound(name.to_owned())),
        }
    }

    pub(crate) fn find_dir(
        &self,
        identity: &Identity,
        dir: DirId,
        name: &str,
    ) -> Result<(SlotIndex, Entry)> {
        match self.lookup(identity.uid, dir, EntryKind::Directory, name) {
            Some(found) => Ok(found),
            None if self.lookup(identity.uid, dir, EntryKind::File, name).is_some() => {
                Err(SfsError::NotDirectory)
            }
            None => Err(SfsError::NotFound(name.to_owned())),
        }
    }

    /// Entry of either kind named by `path`. `None` means the root.
    pub(crate) fn resolve_any(
        &self,
        session: &Session,
        path: &str,
    ) -> Result<Option<(SlotIndex, Entry)>> {
        let (start, parts) = Self::split_path(session, path);
        let last_is_name = parts.last().is_some_and(|p| *p != "." && *p != "..");
        if !last_is_name {
            let dir = self.walk(&session.identity, start, &parts)?;
            return Ok(self.table.read().find_dir(dir).map(|(s, e)| (s, e.clone())));
        }
        let (dir, name) = self.resolve_parent(session, path)?;
        self.lookup_any(session.identity.uid, dir, name)
            .map(Some)
            .ok_or_else(|| SfsError::NotFound(name.to_owned()))
    }

    // ── Data path ───────────────────────────────────────────────────────────

    /// Contents of `entry`, trimmed to its logical size.
    pub(crate) fn read_extents(&self, entry: &Entry) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(usize::try_from(entry.size).unwrap_or(0));
        for extent in &entry.extents {
            out.extend(read_region(
                self.dev.as_ref(),
                extent.start,
                u64::from(extent.len),
            )?);
        }
        out.truncate(usize::try_from(entry.size).unwrap_or(usize::MAX));
        Ok(out)
    }

    /// Write `data` at byte `offset` of the run described by `extents`.
    ///
    /// Partial blocks are read first unless `pad_tail` is set and the block
    /// starts at the write position, in which case the tail is zeroed.
    fn write_extents(
        &self,
        extents: &[Extent],
        offset: u64,
        data: &[u8],
        pad_tail: bool,
    ) -> Result<()> {
        let bs = self.geometry.block_size;
        let bs_len = bs as usize;
        let mut pos = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let block = block_at(extents, bs, pos).ok_or_else(|| {
                SfsError::Format(format!("byte {pos} lies past the last extent"))
            })?;
            let in_block = (pos % u64::from(bs)) as usize;
            let chunk = rest.len().min(bs_len - in_block);
            let mut buf = if in_block == 0 && (chunk == bs_len || pad_tail) {
                vec![0_u8; bs_len]
            } else {
                self.dev.read_block(block)?.into_inner()
            };
            buf[in_block..in_block + chunk].copy_from_slice(&rest[..chunk]);
            self.dev.write_block(block, &buf)?;
            pos += chunk as u64;
            rest = &rest[chunk..];
        }
        Ok(())
    }

    /// Resize `before` to `new_size`, write `data` at `offset`, persist the
    /// slot and superblock, and release surplus blocks last.
    ///
    /// Any failure before the slot is persisted rolls the entry, superblock
    /// and freshly claimed blocks back.
    pub(crate) fn store_bytes(
        &self,
        slot: SlotIndex,
        before: &Entry,
        offset: u64,
        data: &[u8],
        new_size: u64,
    ) -> Result<Entry> {
        let need = self.geometry.blocks_for_bytes(new_size);
        let have = before.block_count();
        let sb_snapshot = self.superblock.read().clone();
        let mut entry = before.clone();
        let mut fresh = Vec::new();
        let mut released = Vec::new();

        if need > have {
            fresh = self.allocator.allocate(self.dev.as_ref(), need - have)?;
            if let Err(err) = append_blocks(&mut entry.extents, &fresh) {
                self.rollback_update(slot, before, &sb_snapshot, &fresh);
                return Err(err);
            }
            self.superblock.write().free_blocks -= fresh.len() as u64;
        } else if need < have {
            released = truncate(&mut entry.extents, need);
        }

        if let Err(err) = self.write_extents(&entry.extents, offset, data, offset == 0) {
            self.rollback_update(slot, before, &sb_snapshot, &fresh);
            return Err(err);
        }

        let now = now_secs();
        entry.size = new_size;
        entry.modified = now;
        entry.accessed = now;
        if let Err(err) = self
            .store_entry(slot, entry.clone())
            .and_then(|()| self.persist_superblock())
        {
            self.rollback_update(slot, before, &sb_snapshot, &fresh);
            return Err(err);
        }

        if !released.is_empty() {
            self.release_blocks(&released);
        }
        debug!(
            slot = slot.0,
            size = new_size,
            grown = fresh.len(),
            shrunk = released.len(),
            "entry_resized"
        );
        Ok(entry)
    }

    /// Free `blocks` after the metadata that referenced them is gone.
    /// Failures only leak blocks, so they are logged rather than returned.
    pub(crate) fn release_blocks(&self, blocks: &[BlockNumber]) {
        match self.allocator.free(self.dev.as_ref(), blocks) {
            Ok(freed) => {
                self.superblock.write().free_blocks += freed;
                if let Err(err) = self.persist_superblock() {
                    warn!(error = %err, "superblock_persist_after_free_failed");
                }
            }
            Err(err) => warn!(count = blocks.len(), error = %err, "blocks_leaked"),
        }
    }

    /// Zero and release every block of `entry`, blank its slot, and drop its
    /// index key.
    pub(crate) fn remove_entry(&self, slot: SlotIndex, entry: &Entry) -> Result<()> {
        for extent in &entry.extents {
            zero_blocks(self.dev.as_ref(), extent.start, u64::from(extent.len))?;
        }
        self.store_entry(slot, Entry::vacant())?;
        let key = index_key(entry.owner, entry.parent, entry.kind, &entry.name);
        if let Err(err) = self.index_apply(&[(key, None)]) {
            if let Err(undo) = self.store_entry(slot, entry.clone()) {
                warn!(slot = slot.0, error = %undo, "slot_restore_failed");
            }
            return Err(err);
        }
        self.release_blocks(&entry.blocks());
        let mut counters = self.counters.write();
        counters.live_entries = counters.live_entries.saturating_sub(1);
        Ok(())
    }

    /// Log `intent` (unless replaying `replay`), run `body`, then mark the
    /// record committed whatever the outcome.
    pub(crate) fn journaled<T>(
        &self,
        identity: &Identity,
        intent: Intent<'_>,
        replay: Option<u64>,
        body: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let timestamp = match replay {
            Some(ts) => ts,
            None => self.journal.log_operation(
                &identity.name,
                intent.op,
                intent.name,
                intent.alt_name,
                intent.payload,
                intent.size,
                intent.dir.0,
            )?,
        };
        let result = body();
        if let Err(err) = self.journal.mark_committed(timestamp) {
            warn!(timestamp, error = %err, "journal_commit_failed");
        }
        result
    }

    /// Validate a new entry name.
    pub(crate) fn check_name(name: &str) -> Result<()> {
        validate_name(name).map_err(name_error)
    }

    /// Rewrite every region from memory and flush the device.
    pub fn sync(&self) -> Result<()> {
        let _mutation = self.mutation.lock();
        self.persist_superblock()?;
        self.allocator.persist(self.dev.as_ref())?;
        {
            let mut index = self.index.write();
            self.save_index(&mut index)?;
        }
        self.table.read().persist_all(self.dev.as_ref())?;
        self.dev.sync()?;
        debug!("filesystem_synced");
        Ok(())
    }
}

/// Bring the loaded index and superblock in line with the table and bitmap.
fn reconcile(
    dev: &dyn BlockDevice,
    geometry: &Geometry,
    superblock: &mut Superblock,
    allocator: &BlockAllocator,
    table: &MetadataTable,
    index: &mut BPlusTree,
) -> Result<Counters> {
    let mut reinserted = 0_usize;
    let mut live_entries = 0_usize;
    let mut max_dir_id = 0_u32;
    for (slot, entry) in table.live() {
        live_entries += 1;
        if entry.is_dir() {
            max_dir_id = max_dir_id.max(entry.dir_id.0);
        }
        let key = index_key(entry.owner, entry.parent, entry.kind, &entry.name);
        if index.search(key) != Some(slot.0) {
            if let Some(previous) = index.insert(key, slot.0) {
                warn!(key, slot = slot.0, previous, "reconcile_key_repointed");
            }
            reinserted += 1;
        }
    }

    let mut dangling = 0_usize;
    for (key, value) in index.entries() {
        let valid = table.get(SlotIndex(value)).is_some_and(|e| {
            !e.is_vacant() && index_key(e.owner, e.parent, e.kind, &e.name) == key
        });
        if !valid {
            index.remove(key);
            dangling += 1;
        }
    }
    if reinserted + dangling > 0 {
        warn!(reinserted, dangling, "reconcile_index_repaired");
        index.save(dev, geometry.tree_start, geometry.tree_blocks)?;
    }

    let claimed: HashSet<u64> = table
        .live()
        .flat_map(|(_, entry)| entry.blocks())
        .map(|block| block.0)
        .collect();
    let leaked: Vec<BlockNumber> = (geometry.data_start.0..geometry.total_blocks)
        .map(BlockNumber)
        .filter(|block| allocator.is_allocated(*block) && !claimed.contains(&block.0))
        .collect();
    if !leaked.is_empty() {
        warn!(
            count = leaked.len(),
            first = leaked[0].0,
            "reconcile_leaked_blocks_released"
        );
        allocator.free(dev, &leaked)?;
    }

    let mut dirty = false;
    let bitmap_free = allocator.free_count();
    if superblock.free_blocks != bitmap_free {
        warn!(
            recorded = superblock.free_blocks,
            bitmap = bitmap_free,
            "reconcile_free_count_mismatch"
        );
        superblock.free_blocks = bitmap_free;
        dirty = true;
    }
    let next_dir_id = superblock
        .next_dir_id
        .max(max_dir_id.saturating_add(1))
        .max(1);
    if next_dir_id != superblock.next_dir_id {
        superblock.next_dir_id = next_dir_id;
        dirty = true;
    }
    if dirty {
        dev.write_block(
            BlockNumber(0),
            &superblock.encode(geometry.block_size as usize),
        )?;
    }

    Ok(Counters {
        next_dir_id,
        live_entries,
    })
}
