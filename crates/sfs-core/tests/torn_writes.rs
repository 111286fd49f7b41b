#![forbid(unsafe_code)]
//! A crash between the bitmap write and the slot write (or the other way
//! round on delete) leaves bitmap bits no extent reaches. Opening the image
//! releases them again.

use sfs_block::{BlockBuf, BlockDevice, ByteBlockDevice, MemByteDevice};
use sfs_core::{Filesystem, FindingKind, Identity, OpenOptions, Session};
use sfs_error::Result;
use sfs_types::{BlockNumber, FsConfig, Geometry};
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Once armed, writes outside the surviving ranges are dropped on the floor
/// while still reporting success, the way a power cut loses unflushed I/O.
struct TornDevice {
    inner: ByteBlockDevice<MemByteDevice>,
    surviving: Mutex<Option<Vec<Range<u64>>>>,
}

impl TornDevice {
    fn arm(&self, surviving: Vec<Range<u64>>) {
        *self.surviving.lock().expect("lock") = Some(surviving);
    }
}

impl BlockDevice for TornDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        self.inner.read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let surviving = self.surviving.lock().expect("lock").clone();
        match surviving {
            Some(ranges) if !ranges.iter().any(|r| r.contains(&block.0)) => Ok(()),
            _ => self.inner.write_block(block, data),
        }
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

fn format(dir: &Path) -> (MemByteDevice, Arc<TornDevice>, Filesystem) {
    let mem = MemByteDevice::new(1024 * 1024);
    let torn = Arc::new(TornDevice {
        inner: ByteBlockDevice::new(mem.clone(), 512).expect("block device"),
        surviving: Mutex::new(None),
    });
    let config = FsConfig {
        disk_size: 1024 * 1024,
        block_size: 512,
        max_files: 64,
        order: 5,
    };
    let fs = Filesystem::format(
        Arc::clone(&torn) as Arc<dyn BlockDevice>,
        &config,
        OpenOptions::new(dir.join("journal.log")).sync_on_commit(false),
    )
    .expect("format");
    (mem, torn, fs)
}

fn reopen(mem: &MemByteDevice, dir: &Path) -> Filesystem {
    let dev: Arc<dyn BlockDevice> =
        Arc::new(ByteBlockDevice::new(mem.clone(), 512).expect("block device"));
    Filesystem::open(dev, OpenOptions::new(dir.join("journal.log")).sync_on_commit(false))
        .expect("reopen")
}

fn data_region(geometry: &Geometry) -> Range<u64> {
    geometry.data_start.0..geometry.total_blocks
}

#[test]
fn blocks_claimed_before_a_lost_slot_write_are_released_on_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mem, torn, fs) = format(dir.path());
    let geometry = *fs.geometry();
    let initial_free = fs.superblock().free_blocks;
    let mut s = Session::new(Identity::root());

    // Bitmap and zero-fills land; slot, index and superblock do not.
    torn.arm(vec![
        geometry.bitmap_start.0..geometry.tree_start.0,
        data_region(&geometry),
    ]);
    fs.create(&mut s, "a.txt", 2048).expect("create");
    drop(fs);

    let fs = reopen(&mem, dir.path());
    let mut s = Session::new(Identity::root());
    fs.login(&mut s, Identity::root()).expect("login");
    assert!(fs.stat(&mut s, "a.txt").is_err());

    let report = fs.check();
    assert_eq!(report.count(FindingKind::Leaked), 0, "{report}");
    assert!(report.is_clean(), "{report}");
    assert_eq!(fs.superblock().free_blocks, initial_free);
    assert_eq!(fs.stats().free_blocks, fs.stats().data_blocks);

    fs.create(&mut s, "b.txt", 2048).expect("space is reusable");
    assert!(fs.check().is_clean());
}

#[test]
fn blocks_of_a_delete_cut_before_release_are_released_on_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mem, torn, fs) = format(dir.path());
    let geometry = *fs.geometry();
    let initial_free = fs.superblock().free_blocks;
    let mut s = Session::new(Identity::root());
    fs.create(&mut s, "a.txt", 2048).expect("create");
    assert_eq!(fs.superblock().free_blocks, initial_free - 4);

    // Slot and index are cleared; bitmap and superblock never hear of it.
    torn.arm(vec![
        geometry.tree_start.0..geometry.data_start.0,
        data_region(&geometry),
    ]);
    fs.delete(&mut s, "a.txt").expect("delete");
    drop(fs);

    let fs = reopen(&mem, dir.path());
    let report = fs.check();
    assert!(report.is_clean(), "{report}");
    assert_eq!(fs.superblock().free_blocks, initial_free);
    assert_eq!(fs.stats().live_entries, 0);
}

#[test]
fn reopen_without_a_crash_releases_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mem, _torn, fs) = format(dir.path());
    let mut s = Session::new(Identity::root());
    fs.create(&mut s, "kept", 1500).expect("create");
    let free = fs.superblock().free_blocks;
    drop(fs);

    let fs = reopen(&mem, dir.path());
    let mut s = Session::new(Identity::root());
    assert_eq!(fs.superblock().free_blocks, free);
    assert_eq!(fs.stat(&mut s, "kept").expect("stat").blocks, 3);
    assert!(fs.check().is_clean());
}
