#![forbid(unsafe_code)]
//! SFS engine: a single-image filesystem with a bitmap allocator, a flat
//! metadata table, a B+tree name index and a write-ahead journal.
//!
//! # Image layout
//!
//! | Region | Start | Content |
//! |--------|-------|---------|
//! | superblock | block 0 | geometry, free count, next directory id, crc32c |
//! | bitmap | block 1 | one bit per block, set = allocated |
//! | index | `tree_start` | B+tree nodes, breadth-first |
//! | metadata | `meta_start` | 128-byte slots, `order - 1` per block |
//! | data | `data_start` | file contents, addressed by extents |
//!
//! The journal lives in a separate text file next to the image.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `superblock` | block 0 codec |
//! | `entry` | slot record codec |
//! | `table` | in-memory metadata table and slot persistence |
//! | `extent` | extent list growth, truncation and addressing |
//! | `keys` | qualified names and index keys |
//! | `perm` | mode bits, attributes and ownership checks |
//! | `lock` | per-slot reader/writer locks with open handle counts |
//! | `session` | caller identity, cwd, output sink, account store |
//! | `fs` | engine state, format/open and shared helpers |
//! | `ops` | session-facing operations |
//! | `rollback` | compensation for partially applied mutations |
//! | `recovery` | per-identity journal replay at login |
//! | `check` | read-only consistency check |

mod check;
mod entry;
mod extent;
mod fs;
mod keys;
mod lock;
mod ops;
mod perm;
mod recovery;
mod rollback;
mod session;
mod superblock;
mod table;

pub use check::{CheckFinding, CheckReport, FindingKind};
pub use entry::{Entry, now_secs};
pub use extent::{append_blocks, block_at, truncate};
pub use fs::{Filesystem, OpenOptions};
pub use keys::{index_key, qualified_name};
pub use lock::{EntryLock, EntryReadGuard, EntryWriteGuard, LockState};
pub use ops::{EntryStat, FsStats, ListEntry};
pub use perm::{attribute_string, has_permission, is_read_only};
pub use recovery::RecoveryReport;
pub use session::{AccountStore, AccountTable, Identity, Session};
pub use superblock::Superblock;
pub use table::MetadataTable;
