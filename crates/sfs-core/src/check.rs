//! Read-only consistency check across the bitmap, metadata table, index and
//! superblock.

use crate::fs::Filesystem;
use crate::keys::index_key;
use serde::Serialize;
use sfs_types::{BlockNumber, SlotIndex};
use std::collections::HashMap;
use std::fmt;
use tracing::{info, warn};

// ── Findings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FindingKind {
    /// A data block is referenced by more than one extent.
    DoubleClaimed,
    /// An extent references a block the bitmap marks free.
    UnmarkedClaim,
    /// An extent points outside the data region.
    OutOfRange,
    /// A bitmap-allocated data block no entry references.
    Leaked,
    /// A file holds a different number of blocks than its size needs.
    SizeMismatch,
    /// A live entry whose index key does not lead back to its slot.
    MissingKey,
    /// An index key pointing at a vacant or different entry.
    DanglingKey,
    /// The superblock free count disagrees with the bitmap.
    FreeCount,
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DoubleClaimed => "double_claimed",
            Self::UnmarkedClaim => "unmarked_claim",
            Self::OutOfRange => "out_of_range",
            Self::Leaked => "leaked",
            Self::SizeMismatch => "size_mismatch",
            Self::MissingKey => "missing_key",
            Self::DanglingKey => "dangling_key",
            Self::FreeCount => "free_count",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckFinding {
    pub kind: FindingKind,
    pub detail: String,
}

impl fmt::Display for CheckFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.detail)
    }
}

// ── Report ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub findings: Vec<CheckFinding>,
    pub entries_checked: usize,
    pub blocks_claimed: u64,
    pub superblock_free: u64,
    pub bitmap_free: u64,
}

impl CheckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    #[must_use]
    pub fn count(&self, kind: FindingKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }

    fn push(&mut self, kind: FindingKind, detail: String) {
        self.findings.push(CheckFinding { kind, detail });
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "checked {} entries, {} claimed blocks, free {} (bitmap {}): {} findings",
            self.entries_checked,
            self.blocks_claimed,
            self.superblock_free,
            self.bitmap_free,
            self.findings.len()
        )
    }
}

impl Filesystem {
    /// Cross-check every region without changing anything.
    #[must_use]
    pub fn check(&self) -> CheckReport {
        let _mutation = self.mutation.lock();
        let geometry = self.geometry;
        let mut report = CheckReport {
            superblock_free: self.superblock.read().free_blocks,
            bitmap_free: self.allocator.free_count(),
            ..CheckReport::default()
        };

        let table = self.table.read();
        let index = self.index.read();
        let mut claims: HashMap<BlockNumber, SlotIndex> = HashMap::new();
        for (slot, entry) in table.live() {
            report.entries_checked += 1;
            for block in entry.blocks() {
                if !geometry.is_data_block(block) {
                    report.push(
                        FindingKind::OutOfRange,
                        format!("slot {slot} ({}) references block {block}", entry.name),
                    );
                    continue;
                }
                if let Some(first) = claims.insert(block, slot) {
                    report.push(
                        FindingKind::DoubleClaimed,
                        format!("block {block} claimed by slots {first} and {slot}"),
                    );
                }
                if !self.allocator.is_allocated(block) {
                    report.push(
                        FindingKind::UnmarkedClaim,
                        format!("block {block} of slot {slot} is free in the bitmap"),
                    );
                }
            }
            let expected = if entry.is_dir() {
                0
            } else {
                geometry.blocks_for_bytes(entry.size)
            };
            if entry.block_count() != expected {
                report.push(
                    FindingKind::SizeMismatch,
                    format!(
                        "slot {slot} ({}) holds {} blocks for {} bytes",
                        entry.name,
                        entry.block_count(),
                        entry.size
                    ),
                );
            }
            let key = index_key(entry.owner, entry.parent, entry.kind, &entry.name);
            if index.search(key) != Some(slot.0) {
                report.push(
                    FindingKind::MissingKey,
                    format!("slot {slot} ({}) is not reachable through key {key:#010x}", entry.name),
                );
            }
        }
        report.blocks_claimed = claims.len() as u64;

        for (key, value) in index.entries() {
            let valid = table.get(SlotIndex(value)).is_some_and(|e| {
                !e.is_vacant() && index_key(e.owner, e.parent, e.kind, &e.name) == key
            });
            if !valid {
                report.push(
                    FindingKind::DanglingKey,
                    format!("key {key:#010x} points at slot {value}"),
                );
            }
        }
        drop(index);
        drop(table);

        for raw in geometry.data_start.0..geometry.total_blocks {
            let block = BlockNumber(raw);
            if self.allocator.is_allocated(block) && !claims.contains_key(&block) {
                report.push(FindingKind::Leaked, format!("block {block} is allocated but unused"));
            }
        }
        if report.superblock_free != report.bitmap_free {
            report.push(
                FindingKind::FreeCount,
                format!(
                    "superblock records {} free blocks, bitmap has {}",
                    report.superblock_free, report.bitmap_free
                ),
            );
        }

        if report.is_clean() {
            info!(entries = report.entries_checked, "check_clean");
        } else {
            warn!(
                entries = report.entries_checked,
                findings = report.findings.len(),
                "check_found_inconsistencies"
            );
        }
        report
    }
}
