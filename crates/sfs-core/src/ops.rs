//! Session-facing operations.
//!
//! Every public call resolves its path against the session, runs, and writes
//! one status line into the session sink (`Error: ...` on failure) besides
//! returning the result. Mutating calls hold the engine mutation lock for
//! their whole duration; the `*_in` variants assume it is already held and
//! take an explicit directory so replay can run them outside any session.

use crate::entry::{Entry, now_secs};
use crate::extent::append_blocks;
use crate::fs::{Filesystem, Intent};
use crate::keys::index_key;
use crate::perm::{self, attribute_string};
use crate::session::{Identity, Session};
use crate::table::MetadataTable;
use serde::Serialize;
use sfs_btree::Key;
use sfs_error::{Result, SfsError};
use sfs_journal::JournalOp;
use sfs_types::{
    Access, Attributes, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, DirId, EntryKind, Extent, SlotIndex,
    mode_string,
};
use std::collections::HashSet;
use std::fmt::Display;
use tracing::{debug, info, warn};

// ── Views ───────────────────────────────────────────────────────────────────

/// Everything `stat` reports about one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryStat {
    pub name: String,
    pub kind: EntryKind,
    /// Directories report the total size of everything below them.
    pub size: u64,
    pub blocks: u64,
    pub extents: Vec<Extent>,
    pub created: u64,
    pub modified: u64,
    pub accessed: u64,
    pub owner: u32,
    pub owner_name: String,
    pub group: u32,
    pub group_name: String,
    pub mode: u16,
    pub permissions: String,
    pub attributes: String,
    /// `None` for the root directory, which has no slot.
    pub slot: Option<SlotIndex>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub permissions: String,
    pub attributes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsStats {
    pub total_blocks: u64,
    pub data_blocks: u64,
    pub free_blocks: u64,
    pub live_entries: usize,
    pub slot_capacity: usize,
    pub next_dir_id: u32,
    pub index_keys: usize,
    pub index_height: usize,
    pub journal_records: usize,
}

fn report<T>(
    session: &mut Session,
    result: Result<T>,
    success: impl FnOnce(&T) -> String,
) -> Result<T> {
    match &result {
        Ok(value) => session.say(success(value)),
        Err(err) => session.say(format_args!("Error: {err}")),
    }
    result
}

/// Total size of everything below `dir`.
fn dir_size(table: &MetadataTable, dir: DirId) -> u64 {
    let mut total = 0_u64;
    let mut pending = vec![dir];
    let mut seen = HashSet::new();
    while let Some(current) = pending.pop() {
        if !seen.insert(current) {
            continue;
        }
        for (_, entry) in table.live().filter(|(_, e)| e.parent == current) {
            if entry.is_dir() {
                pending.push(entry.dir_id);
            } else {
                total += entry.size;
            }
        }
    }
    total
}

fn sorted_children(table: &MetadataTable, dir: DirId, owner: u32) -> Vec<Entry> {
    let mut kids: Vec<Entry> = table
        .children_of(dir, owner)
        .into_iter()
        .map(|(_, e)| e)
        .collect();
    kids.sort_by(|a, b| a.name.cmp(&b.name));
    kids
}

fn render_tree(
    table: &MetadataTable,
    owner: u32,
    dir: DirId,
    prefix: &str,
    seen: &mut HashSet<DirId>,
    out: &mut String,
) {
    if !seen.insert(dir) {
        return;
    }
    let kids = sorted_children(table, dir, owner);
    let last_index = kids.len().saturating_sub(1);
    for (i, kid) in kids.iter().enumerate() {
        let last = i == last_index;
        out.push_str(prefix);
        out.push_str(if last { "`-- " } else { "|-- " });
        out.push_str(&kid.name);
        out.push('\n');
        if kid.is_dir() {
            let child_prefix = format!("{prefix}{}", if last { "    " } else { "|   " });
            render_tree(table, owner, kid.dir_id, &child_prefix, seen, out);
        }
    }
}

impl Filesystem {
    // ── Create / mkdir ──────────────────────────────────────────────────────

    /// Claim a slot and `size` bytes of blocks for a new entry.
    #[expect(clippy::too_many_arguments)]
    fn insert_entry(
        &self,
        identity: &Identity,
        parent: DirId,
        name: &str,
        kind: EntryKind,
        mode: u16,
        size: u64,
        key: Key,
    ) -> Result<(SlotIndex, Entry)> {
        let slot = self.table.read().first_vacant().ok_or(SfsError::TableFull)?;
        let _guard = self.lock_for(slot)?.write();
        let sb_snapshot = self.superblock.read().clone();
        let fresh = self
            .allocator
            .allocate(self.dev.as_ref(), self.geometry.blocks_for_bytes(size))?;

        let mut entry = Entry::new(name, kind, parent, identity.uid, identity.gid, mode);
        entry.size = size;
        if let Err(err) = append_blocks(&mut entry.extents, &fresh) {
            self.rollback_new(slot, &sb_snapshot, &fresh);
            return Err(err);
        }
        if kind.is_dir() {
            let mut counters = self.counters.write();
            entry.dir_id = DirId(counters.next_dir_id);
            counters.next_dir_id += 1;
        }
        self.superblock.write().free_blocks -= fresh.len() as u64;

        if let Err(err) = self
            .store_entry(slot, entry.clone())
            .and_then(|()| self.index_apply(&[(key, Some(slot))]))
        {
            self.rollback_new(slot, &sb_snapshot, &fresh);
            return Err(err);
        }
        if let Err(err) = self.persist_superblock() {
            if let Err(undo) = self.index_apply(&[(key, None)]) {
                warn!(key, error = %undo, "rollback_index_key_kept");
            }
            self.rollback_new(slot, &sb_snapshot, &fresh);
            return Err(err);
        }
        self.counters.write().live_entries += 1;
        debug!(slot = slot.0, name, kind = %kind, blocks = fresh.len(), "entry_created");
        Ok((slot, entry))
    }

    pub(crate) fn create_in(
        &self,
        identity: &Identity,
        parent: DirId,
        name: &str,
        size: u64,
        mode: u16,
        replay: Option<u64>,
    ) -> Result<SlotIndex> {
        Self::check_name(name)?;
        self.ensure_dir_exists(parent)?;
        let key = self.ensure_absent(identity.uid, parent, EntryKind::File, name)?;
        let intent = Intent {
            op: JournalOp::Create,
            name,
            alt_name: "",
            payload: &[],
            size,
            dir: parent,
        };
        self.journaled(identity, intent, replay, || {
            self.insert_entry(
                identity,
                parent,
                name,
                EntryKind::File,
                mode,
                size,
                key,
            )
            .map(|(slot, _)| slot)
        })
    }

    pub fn create(&self, session: &mut Session, path: &str, size: u64) -> Result<SlotIndex> {
        self.create_with_mode(session, path, size, DEFAULT_FILE_MODE)
    }

    pub fn create_with_mode(
        &self,
        session: &mut Session,
        path: &str,
        size: u64,
        mode: u16,
    ) -> Result<SlotIndex> {
        let result = {
            let _mutation = self.mutation.lock();
            self.resolve_parent(session, path).and_then(|(dir, name)| {
                self.create_in(&session.identity, dir, name, size, mode & 0o777, None)
            })
        };
        report(session, result, |_| format!("Created {path} ({size} bytes)"))
    }

    pub(crate) fn mkdir_in(
        &self,
        identity: &Identity,
        parent: DirId,
        name: &str,
        mode: u16,
    ) -> Result<DirId> {
        Self::check_name(name)?;
        self.ensure_dir_exists(parent)?;
        let key = self.ensure_absent(identity.uid, parent, EntryKind::Directory, name)?;
        let (_, entry) =
            self.insert_entry(identity, parent, name, EntryKind::Directory, mode, 0, key)?;
        Ok(entry.dir_id)
    }

    pub fn mkdir(&self, session: &mut Session, path: &str) -> Result<DirId> {
        let result = {
            let _mutation = self.mutation.lock();
            self.resolve_parent(session, path).and_then(|(dir, name)| {
                self.mkdir_in(&session.identity, dir, name, DEFAULT_DIR_MODE)
            })
        };
        report(session, result, |_| format!("Created directory {path}"))
    }

    // ── Read / write / append ───────────────────────────────────────────────

    pub fn read(&self, session: &mut Session, path: &str) -> Result<Vec<u8>> {
        let result = self.resolve_file(session, path).and_then(|(dir, name, slot, _)| {
            let lock = self.lock_for(slot)?;
            let _guard = lock.read();
            lock.open();
            let outcome = self
                .find_file(&session.identity, dir, &name)
                .and_then(|(now_slot, entry)| {
                    if now_slot != slot {
                        return Err(SfsError::NotFound(name.clone()));
                    }
                    perm::require(&entry, &session.identity, Access::READ)?;
                    self.read_extents(&entry)
                });
            lock.close();
            outcome
        });
        report(session, result, |data| String::from_utf8_lossy(data).into_owned())
    }

    pub(crate) fn write_in(
        &self,
        identity: &Identity,
        parent: DirId,
        name: &str,
        data: &[u8],
        replay: Option<u64>,
    ) -> Result<Entry> {
        let (slot, entry) = self.find_file(identity, parent, name)?;
        perm::require(&entry, identity, Access::WRITE)?;
        let _guard = self.lock_for(slot)?.write();
        let size = data.len() as u64;
        let intent = Intent {
            op: JournalOp::Write,
            name,
            alt_name: "",
            payload: data,
            size,
            dir: parent,
        };
        self.journaled(identity, intent, replay, || {
            self.store_bytes(slot, &entry, 0, data, size)
        })
    }

    /// Replace the whole content of a file with `data`.
    pub fn write(&self, session: &mut Session, path: &str, data: &[u8]) -> Result<()> {
        let result = {
            let _mutation = self.mutation.lock();
            self.resolve_parent(session, path)
                .and_then(|(dir, name)| self.write_in(&session.identity, dir, name, data, None))
        };
        report(session, result.map(|_| ()), |()| {
            format!("Wrote {} bytes to {path}", data.len())
        })
    }

    pub(crate) fn append_in(
        &self,
        identity: &Identity,
        parent: DirId,
        name: &str,
        data: &[u8],
        replay: Option<u64>,
    ) -> Result<Entry> {
        let (slot, entry) = self.find_file(identity, parent, name)?;
        perm::require(&entry, identity, Access::WRITE)?;
        let _guard = self.lock_for(slot)?.write();
        let before = entry.size;
        let intent = Intent {
            op: JournalOp::WriteAppend,
            name,
            alt_name: "",
            payload: data,
            size: before,
            dir: parent,
        };
        self.journaled(identity, intent, replay, || {
            self.store_bytes(slot, &entry, before, data, before + data.len() as u64)
        })
    }

    pub fn append(&self, session: &mut Session, path: &str, data: &[u8]) -> Result<()> {
        let result = {
            let _mutation = self.mutation.lock();
            self.resolve_parent(session, path)
                .and_then(|(dir, name)| self.append_in(&session.identity, dir, name, data, None))
        };
        report(session, result.map(|_| ()), |()| {
            format!("Appended {} bytes to {path}", data.len())
        })
    }

    // ── Delete / rmdir ──────────────────────────────────────────────────────

    pub(crate) fn delete_file_in(
        &self,
        identity: &Identity,
        parent: DirId,
        name: &str,
        replay: Option<u64>,
    ) -> Result<()> {
        let (slot, entry) = self.find_file(identity, parent, name)?;
        perm::require_not_system(&entry)?;
        perm::require(&entry, identity, Access::WRITE)?;
        let _guard = self.lock_for(slot)?.write();
        let intent = Intent {
            op: JournalOp::DeleteFile,
            name,
            alt_name: "",
            payload: &[],
            size: entry.size,
            dir: parent,
        };
        self.journaled(identity, intent, replay, || self.remove_entry(slot, &entry))
    }

    pub fn delete(&self, session: &mut Session, path: &str) -> Result<()> {
        let result = {
            let _mutation = self.mutation.lock();
            self.resolve_parent(session, path)
                .and_then(|(dir, name)| self.delete_file_in(&session.identity, dir, name, None))
        };
        report(session, result, |()| format!("Deleted {path}"))
    }

    pub(crate) fn rmdir_in(
        &self,
        identity: &Identity,
        parent: DirId,
        name: &str,
        replay: Option<u64>,
    ) -> Result<()> {
        let (slot, entry) = self.find_dir(identity, parent, name)?;
        perm::require_not_system(&entry)?;
        perm::require(&entry, identity, Access::WRITE)?;
        if self.dir_has_children(entry.dir_id) {
            return Err(SfsError::NotEmpty);
        }
        let _guard = self.lock_for(slot)?.write();
        let intent = Intent {
            op: JournalOp::DeleteDir,
            name,
            alt_name: "",
            payload: &[],
            size: 0,
            dir: parent,
        };
        self.journaled(identity, intent, replay, || self.remove_entry(slot, &entry))
    }

    pub fn rmdir(&self, session: &mut Session, path: &str) -> Result<()> {
        let result = {
            let _mutation = self.mutation.lock();
            self.resolve_parent(session, path)
                .and_then(|(dir, name)| self.rmdir_in(&session.identity, dir, name, None))
        };
        report(session, result, |()| format!("Removed directory {path}"))
    }

    /// Remove a directory and everything below it, children first. Each
    /// removal is journaled on its own. Returns how many entries went.
    fn rmdir_recursive_in(&self, identity: &Identity, parent: DirId, name: &str) -> Result<usize> {
        let (_, dir) = self.find_dir(identity, parent, name)?;
        perm::require_not_system(&dir)?;
        let children = self.table.read().children_of(dir.dir_id, identity.uid);
        let mut removed = 0;
        for (_, child) in children {
            if child.is_dir() {
                removed += self.rmdir_recursive_in(identity, dir.dir_id, &child.name)?;
            } else {
                self.delete_file_in(identity, dir.dir_id, &child.name, None)?;
                removed += 1;
            }
        }
        self.rmdir_in(identity, parent, name, None)?;
        Ok(removed + 1)
    }

    pub fn rmdir_recursive(&self, session: &mut Session, path: &str) -> Result<usize> {
        let result = {
            let _mutation = self.mutation.lock();
            self.resolve_parent(session, path)
                .and_then(|(dir, name)| self.rmdir_recursive_in(&session.identity, dir, name))
        };
        report(session, result, |n| format!("Removed {path} ({n} entries)"))
    }

    // ── Rename ──────────────────────────────────────────────────────────────

    pub(crate) fn rename_in(
        &self,
        identity: &Identity,
        parent: DirId,
        old_name: &str,
        new_name: &str,
        replay: Option<u64>,
    ) -> Result<()> {
        Self::check_name(new_name)?;
        let (slot, entry) = self
            .lookup_any(identity.uid, parent, old_name)
            .ok_or_else(|| SfsError::NotFound(old_name.to_owned()))?;
        perm::require_not_system(&entry)?;
        perm::require(&entry, identity, Access::WRITE)?;
        if old_name == new_name {
            return Ok(());
        }
        let new_key = self.ensure_absent(identity.uid, parent, entry.kind, new_name)?;
        let old_key = index_key(entry.owner, entry.parent, entry.kind, &entry.name);
        let _guard = self.lock_for(slot)?.write();
        let intent = Intent {
            op: JournalOp::Rename,
            name: old_name,
            alt_name: new_name,
            payload: &[],
            size: 0,
            dir: parent,
        };
        self.journaled(identity, intent, replay, || {
            let mut renamed = entry.clone();
            new_name.clone_into(&mut renamed.name);
            renamed.modified = now_secs();
            self.replace_keyed(slot, &entry, renamed, old_key, new_key)
        })
    }

    /// Rename an entry within its directory.
    pub fn rename(&self, session: &mut Session, path: &str, new_name: &str) -> Result<()> {
        let result = {
            let _mutation = self.mutation.lock();
            self.resolve_parent(session, path).and_then(|(dir, name)| {
                self.rename_in(&session.identity, dir, name, new_name, None)
            })
        };
        report(session, result, |()| format!("Renamed {path} to {new_name}"))
    }

    /// Store `after` in `slot` and move its index key from `old_key` to
    /// `new_key`, putting `before` back if the index cannot be saved.
    fn replace_keyed(
        &self,
        slot: SlotIndex,
        before: &Entry,
        after: Entry,
        old_key: Key,
        new_key: Key,
    ) -> Result<()> {
        self.store_entry(slot, after)?;
        if let Err(err) = self.index_apply(&[(old_key, None), (new_key, Some(slot))]) {
            if let Err(undo) = self.store_entry(slot, before.clone()) {
                warn!(slot = slot.0, error = %undo, "slot_restore_failed");
            }
            return Err(err);
        }
        Ok(())
    }

    // ── Ownership, mode, attributes ─────────────────────────────────────────

    /// Resolve `path` to a slotted entry the caller may administer.
    fn owned_entry(&self, session: &Session, path: &str) -> Result<(SlotIndex, Entry)> {
        let (slot, entry) = self
            .resolve_any(session, path)?
            .ok_or(SfsError::PermissionDenied)?;
        perm::require_owner(&entry, &session.identity)?;
        Ok((slot, entry))
    }

    fn update_entry(
        &self,
        session: &Session,
        path: &str,
        apply: impl FnOnce(&mut Entry),
    ) -> Result<Entry> {
        let _mutation = self.mutation.lock();
        let (slot, entry) = self.owned_entry(session, path)?;
        let _guard = self.lock_for(slot)?.write();
        let mut updated = entry;
        apply(&mut updated);
        self.store_entry(slot, updated.clone())?;
        Ok(updated)
    }

    pub fn chmod(&self, session: &mut Session, path: &str, mode: u16) -> Result<()> {
        let mode = mode & 0o777;
        let result = self.update_entry(session, path, |e| e.mode = mode);
        report(session, result.map(|_| ()), |()| {
            format!("Mode of {path} set to {}", mode_string(mode))
        })
    }

    pub fn chgrp(&self, session: &mut Session, path: &str, gid: u32) -> Result<()> {
        let result = match self.accounts.group_name(gid) {
            Some(_) => self.update_entry(session, path, |e| e.group = gid).map(|_| ()),
            None => Err(SfsError::NotFound(format!("group {gid}"))),
        };
        report(session, result, |()| format!("Group of {path} set to {gid}"))
    }

    fn chown_locked(&self, session: &Session, path: &str, uid: u32) -> Result<()> {
        if self.accounts.user_name(uid).is_none() {
            return Err(SfsError::NotFound(format!("user {uid}")));
        }
        let (slot, entry) = self.owned_entry(session, path)?;
        if entry.owner == uid {
            return Ok(());
        }
        let new_key = self.ensure_absent(uid, entry.parent, entry.kind, &entry.name)?;
        let old_key = index_key(entry.owner, entry.parent, entry.kind, &entry.name);
        let _guard = self.lock_for(slot)?.write();
        let mut updated = entry.clone();
        updated.owner = uid;
        self.replace_keyed(slot, &entry, updated, old_key, new_key)
    }

    /// Hand an entry to another user. The owner is part of the index key,
    /// so the entry is re-keyed.
    pub fn chown(&self, session: &mut Session, path: &str, uid: u32) -> Result<()> {
        let result = {
            let _mutation = self.mutation.lock();
            self.chown_locked(session, path, uid)
        };
        report(session, result, |()| format!("Owner of {path} set to {uid}"))
    }

    pub fn set_attributes(
        &self,
        session: &mut Session,
        path: &str,
        attributes: Attributes,
    ) -> Result<()> {
        let result = self.update_entry(session, path, |e| e.attributes.insert(attributes));
        report(session, result, |e| {
            format!("Attributes of {path}: {}", attribute_string(e))
        })
        .map(|_| ())
    }

    pub fn clear_attributes(
        &self,
        session: &mut Session,
        path: &str,
        attributes: Attributes,
    ) -> Result<()> {
        let result = self.update_entry(session, path, |e| e.attributes.remove(attributes));
        report(session, result, |e| {
            format!("Attributes of {path}: {}", attribute_string(e))
        })
        .map(|_| ())
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    fn root_stat(&self) -> EntryStat {
        let table = self.table.read();
        let name = |n: Option<String>| n.unwrap_or_else(|| "0".to_owned());
        EntryStat {
            name: "/".to_owned(),
            kind: EntryKind::Directory,
            size: dir_size(&table, DirId::ROOT),
            blocks: 0,
            extents: Vec::new(),
            created: 0,
            modified: 0,
            accessed: 0,
            owner: 0,
            owner_name: name(self.accounts.user_name(0)),
            group: 0,
            group_name: name(self.accounts.group_name(0)),
            mode: DEFAULT_DIR_MODE,
            permissions: mode_string(DEFAULT_DIR_MODE),
            attributes: "----".to_owned(),
            slot: None,
        }
    }

    fn stat_entry(&self, slot: SlotIndex) -> Result<EntryStat> {
        let lock = self.lock_for(slot)?;
        let _guard = lock.read();
        let entry = self
            .entry(slot)
            .ok_or_else(|| SfsError::NotFound(format!("slot {slot}")))?;
        let size = if entry.is_dir() {
            dir_size(&self.table.read(), entry.dir_id)
        } else {
            entry.size
        };
        Ok(EntryStat {
            size,
            blocks: entry.block_count(),
            extents: entry.extents.clone(),
            created: entry.created,
            modified: entry.modified,
            accessed: entry.accessed,
            owner: entry.owner,
            owner_name: self
                .accounts
                .user_name(entry.owner)
                .unwrap_or_else(|| entry.owner.to_string()),
            group: entry.group,
            group_name: self
                .accounts
                .group_name(entry.group)
                .unwrap_or_else(|| entry.group.to_string()),
            mode: entry.mode,
            permissions: mode_string(entry.mode),
            attributes: attribute_string(&entry),
            slot: Some(slot),
            kind: entry.kind,
            name: entry.name,
        })
    }

    pub fn stat(&self, session: &mut Session, path: &str) -> Result<EntryStat> {
        let result = self.resolve_any(session, path).and_then(|found| match found {
            None => Ok(self.root_stat()),
            Some((slot, _)) => self.stat_entry(slot),
        });
        report(session, result, |s| {
            format!(
                "{} {} {} {}:{} {} bytes, {} blocks, {} extents",
                s.name,
                s.kind,
                s.permissions,
                s.owner_name,
                s.group_name,
                s.size,
                s.blocks,
                s.extents.len()
            )
        })
    }

    /// Directory named by `path` (or the cwd) after checking `access` on it.
    fn open_dir(&self, session: &Session, path: Option<&str>, access: Access) -> Result<DirId> {
        let dir = match path {
            Some(p) => self.resolve_dir(session, p)?,
            None => session.cwd,
        };
        if dir.is_root() {
            return Ok(dir);
        }
        let entry = self
            .table
            .read()
            .find_dir(dir)
            .map(|(_, e)| e.clone())
            .ok_or_else(|| SfsError::NotFound(format!("directory #{dir}")))?;
        perm::require(&entry, &session.identity, access)?;
        Ok(dir)
    }

    pub fn list(&self, session: &mut Session, path: Option<&str>) -> Result<Vec<ListEntry>> {
        let result = self.open_dir(session, path, Access::READ).map(|dir| {
            let table = self.table.read();
            sorted_children(&table, dir, session.identity.uid)
                .into_iter()
                .map(|e| ListEntry {
                    size: if e.is_dir() {
                        dir_size(&table, e.dir_id)
                    } else {
                        e.size
                    },
                    kind: e.kind,
                    permissions: mode_string(e.mode),
                    attributes: attribute_string(&e),
                    name: e.name,
                })
                .collect::<Vec<_>>()
        });
        match &result {
            Ok(entries) => {
                for e in entries {
                    let tag = if e.kind.is_dir() { 'd' } else { '-' };
                    session.say(format_args!(
                        "{tag}{} {} {:>10} {}",
                        e.permissions, e.attributes, e.size, e.name
                    ));
                }
            }
            Err(err) => session.say(format_args!("Error: {err}")),
        }
        result
    }

    pub fn tree(&self, session: &mut Session, path: Option<&str>) -> Result<String> {
        let result = self.open_dir(session, path, Access::READ).map(|dir| {
            let mut out = format!("{}\n", path.unwrap_or("."));
            let table = self.table.read();
            render_tree(
                &table,
                session.identity.uid,
                dir,
                "",
                &mut HashSet::new(),
                &mut out,
            );
            out
        });
        report(session, result, |t| t.trim_end().to_owned())
    }

    // ── Session helpers ─────────────────────────────────────────────────────

    pub fn cd(&self, session: &mut Session, path: &str) -> Result<()> {
        let result = self
            .open_dir(session, Some(path), Access::EXEC)
            .map(|dir| session.cwd = dir);
        let result = result.map(|()| self.path_of(session.cwd));
        report(session, result, |p| format!("Now in {p}")).map(|_| ())
    }

    /// Absolute path of directory `dir`.
    fn path_of(&self, dir: DirId) -> String {
        let table = self.table.read();
        let mut names = Vec::new();
        let mut current = dir;
        while !current.is_root() && names.len() <= table.capacity() {
            let Some((_, entry)) = table.find_dir(current) else {
                break;
            };
            names.push(entry.name.clone());
            current = entry.parent;
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    pub fn pwd(&self, session: &mut Session) -> String {
        let path = self.path_of(session.cwd);
        session.say(&path);
        path
    }

    pub fn whoami(&self, session: &mut Session) -> String {
        let name = session.identity.name.clone();
        session.say(&name);
        name
    }

    #[must_use]
    pub fn stats(&self) -> FsStats {
        let tree = self.index.read().stats();
        let counters = *self.counters.read();
        FsStats {
            total_blocks: self.geometry.total_blocks,
            data_blocks: self.geometry.data_blocks(),
            free_blocks: self.superblock.read().free_blocks,
            live_entries: counters.live_entries,
            slot_capacity: self.locks.len(),
            next_dir_id: counters.next_dir_id,
            index_keys: tree.keys,
            index_height: tree.height,
            journal_records: self.journal.len(),
        }
    }
}

impl Display for FsStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} data blocks free, {}/{} entries, index height {}",
            self.free_blocks,
            self.data_blocks,
            self.live_entries,
            self.slot_capacity,
            self.index_height
        )
    }
}

/// Emit the one-line summary of a login.
pub(crate) fn log_login(identity: &Identity, pending: usize) {
    info!(user = %identity.name, uid = identity.uid, pending, "session_login");
}
