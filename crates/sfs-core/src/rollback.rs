//! Compensation for a mutation that failed part way through one call.
//!
//! These restore the superblock snapshot taken before the step sequence,
//! put the slot back, and release blocks claimed during the attempt. They are
//! best effort: a failure while undoing is logged and the original error is
//! what the caller reports. The journal is not touched.

use crate::entry::Entry;
use crate::fs::Filesystem;
use crate::superblock::Superblock;
use sfs_types::{BlockNumber, SlotIndex};
use tracing::{info, warn};

impl Filesystem {
    fn restore_superblock(&self, snapshot: &Superblock) {
        {
            let mut sb = self.superblock.write();
            sb.free_blocks = snapshot.free_blocks;
        }
        if let Err(err) = self.persist_superblock() {
            warn!(error = %err, "rollback_superblock_persist_failed");
        }
    }

    fn reset_slot(&self, slot: SlotIndex, entry: Entry) {
        let reset = self.table.write().set(slot, entry);
        let persisted = reset.and_then(|()| self.persist_slot(slot));
        if let Err(err) = persisted {
            warn!(slot = slot.0, error = %err, "rollback_slot_reset_failed");
        }
    }

    fn free_fresh(&self, fresh: &[BlockNumber]) {
        if fresh.is_empty() {
            return;
        }
        if let Err(err) = self.allocator.free(self.dev.as_ref(), fresh) {
            warn!(count = fresh.len(), error = %err, "rollback_free_failed");
        }
    }

    /// Undo a half-built new entry: blank `slot` and release `fresh`.
    pub(crate) fn rollback_new(
        &self,
        slot: SlotIndex,
        snapshot: &Superblock,
        fresh: &[BlockNumber],
    ) {
        self.reset_slot(slot, Entry::vacant());
        self.free_fresh(fresh);
        self.restore_superblock(snapshot);
        info!(slot = slot.0, released = fresh.len(), "rollback_new_entry");
    }

    /// Undo an in-place update: restore `before` into `slot` and release
    /// `fresh`.
    pub(crate) fn rollback_update(
        &self,
        slot: SlotIndex,
        before: &Entry,
        snapshot: &Superblock,
        fresh: &[BlockNumber],
    ) {
        self.reset_slot(slot, before.clone());
        self.free_fresh(fresh);
        self.restore_superblock(snapshot);
        info!(slot = slot.0, released = fresh.len(), "rollback_update_entry");
    }
}
