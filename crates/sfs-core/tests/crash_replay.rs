#![forbid(unsafe_code)]
//! Records logged but never applied (or applied but never committed) are
//! replayed at the next login of the identity that wrote them.

use sfs_block::{BlockDevice, ByteBlockDevice, MemByteDevice};
use sfs_core::{Filesystem, Identity, OpenOptions, Session};
use sfs_journal::JournalOp;
use sfs_types::{DirId, FsConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn small_config() -> FsConfig {
    FsConfig {
        disk_size: 1024 * 1024,
        block_size: 512,
        max_files: 64,
        order: 5,
    }
}

fn device(mem: &MemByteDevice) -> Arc<dyn BlockDevice> {
    Arc::new(ByteBlockDevice::new(mem.clone(), 512).expect("block device"))
}

fn journal_path(dir: &Path) -> PathBuf {
    dir.join("journal.log")
}

fn format(dir: &Path) -> (MemByteDevice, Filesystem) {
    let mem = MemByteDevice::new(1024 * 1024);
    let fs = Filesystem::format(device(&mem), &small_config(), OpenOptions::new(journal_path(dir)))
        .expect("format");
    (mem, fs)
}

fn reopen(mem: &MemByteDevice, dir: &Path) -> Filesystem {
    Filesystem::open(device(mem), OpenOptions::new(journal_path(dir))).expect("reopen")
}

/// Log an intent as if the process died right after the journal append.
fn log_only(
    fs: &Filesystem,
    user: &str,
    op: JournalOp,
    name: &str,
    alt: &str,
    payload: &[u8],
    size: u64,
) -> u64 {
    fs.journal()
        .log_operation(user, op, name, alt, payload, size, DirId::ROOT.0)
        .expect("log")
}

#[test]
fn unapplied_create_is_replayed_and_committed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mem, fs) = format(dir.path());
    let ts = log_only(&fs, "root", JournalOp::Create, "ghost.txt", "", b"", 100);
    drop(fs);

    let fs = reopen(&mem, dir.path());
    assert_eq!(fs.journal().load_report().uncommitted, 1);
    let mut s = Session::new(Identity::root());
    let report = fs.login(&mut s, Identity::root()).expect("login");
    assert_eq!(report.replayed, 1);
    assert!(s.take_output().starts_with("Welcome root: recovered 1"));

    assert_eq!(fs.stat(&mut s, "ghost.txt").expect("stat").size, 100);
    let record = fs.journal().record(ts).expect("record");
    assert!(record.committed);
    assert!(record.check);
    assert!(fs.check().is_clean());
}

#[test]
fn replay_is_idempotent_across_logins() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mem, fs) = format(dir.path());
    log_only(&fs, "root", JournalOp::Create, "once", "", b"", 10);
    drop(fs);

    let fs = reopen(&mem, dir.path());
    let mut s = Session::new(Identity::root());
    assert_eq!(fs.login(&mut s, Identity::root()).expect("login").replayed, 1);
    drop(fs);

    let fs = reopen(&mem, dir.path());
    let report = fs.login(&mut s, Identity::root()).expect("second login");
    assert_eq!(report.total(), 0);
    assert_eq!(fs.stats().live_entries, 1);
}

#[test]
fn create_already_on_disk_is_skipped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mem, fs) = format(dir.path());
    let mut s = Session::new(Identity::root());
    fs.create(&mut s, "done", 5).expect("create");
    log_only(&fs, "root", JournalOp::Create, "done", "", b"", 5);
    drop(fs);

    let fs = reopen(&mem, dir.path());
    let report = fs.login(&mut s, Identity::root()).expect("login");
    assert_eq!(report.skipped, 1);
    assert_eq!(report.replayed, 0);
    assert_eq!(fs.stats().live_entries, 1);
}

#[test]
fn append_replays_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mem, fs) = format(dir.path());
    let mut s = Session::new(Identity::root());
    fs.create(&mut s, "log", 0).expect("create");
    fs.write(&mut s, "log", b"abc").expect("write");
    log_only(&fs, "root", JournalOp::WriteAppend, "log", "", b"def", 3);
    drop(fs);

    let fs = reopen(&mem, dir.path());
    let report = fs.login(&mut s, Identity::root()).expect("login");
    assert_eq!(report.replayed, 1);
    assert_eq!(fs.read(&mut s, "log").expect("read"), b"abcdef");
}

#[test]
fn append_already_applied_is_skipped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mem, fs) = format(dir.path());
    let mut s = Session::new(Identity::root());
    fs.create(&mut s, "log", 0).expect("create");
    fs.write(&mut s, "log", b"abcdef").expect("write");
    log_only(&fs, "root", JournalOp::WriteAppend, "log", "", b"def", 3);
    drop(fs);

    let fs = reopen(&mem, dir.path());
    let report = fs.login(&mut s, Identity::root()).expect("login");
    assert_eq!(report.skipped, 1);
    assert_eq!(fs.read(&mut s, "log").expect("read"), b"abcdef");
}

#[test]
fn write_delete_and_rename_replay() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mem, fs) = format(dir.path());
    let mut s = Session::new(Identity::root());
    fs.create(&mut s, "a", 0).expect("create a");
    fs.create(&mut s, "b", 0).expect("create b");
    log_only(&fs, "root", JournalOp::Write, "a", "", b"payload", 7);
    log_only(&fs, "root", JournalOp::Rename, "a", "c", b"", 0);
    log_only(&fs, "root", JournalOp::DeleteFile, "b", "", b"", 0);
    log_only(&fs, "root", JournalOp::DeleteFile, "never", "", b"", 0);
    drop(fs);

    let fs = reopen(&mem, dir.path());
    let report = fs.login(&mut s, Identity::root()).expect("login");
    assert_eq!(report.replayed, 3);
    assert_eq!(report.skipped, 1);
    assert_eq!(fs.read(&mut s, "c").expect("read"), b"payload");
    assert!(fs.read(&mut s, "a").is_err());
    assert!(fs.read(&mut s, "b").is_err());
    assert!(fs.journal().pending_for("root").is_empty());
}

#[test]
fn records_are_replayed_only_for_their_identity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mem, fs) = format(dir.path());
    log_only(&fs, "alice", JournalOp::Create, "mine", "", b"", 0);
    drop(fs);

    let fs = reopen(&mem, dir.path());
    let mut s = Session::new(Identity::root());
    assert_eq!(fs.login(&mut s, Identity::root()).expect("root login").total(), 0);
    assert_eq!(fs.journal().pending_for("alice").len(), 1);

    let alice = Identity::new(1000, 100, "alice");
    let report = fs.login(&mut s, alice).expect("alice login");
    assert_eq!(report.replayed, 1);
    assert_eq!(s.identity.name, "alice");
    assert_eq!(fs.stat(&mut s, "mine").expect("stat").owner, 1000);
}

#[test]
fn unreplayable_record_is_counted_and_retired() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mem, fs) = format(dir.path());
    log_only(&fs, "root", JournalOp::Write, "missing", "", b"x", 1);
    drop(fs);

    let fs = reopen(&mem, dir.path());
    let mut s = Session::new(Identity::root());
    let report = fs.login(&mut s, Identity::root()).expect("login");
    assert_eq!(report.failed, 1);
    assert!(fs.journal().pending_for("root").is_empty());
}

#[test]
fn torn_journal_tail_does_not_block_open() {
    use std::io::Write;

    let dir = tempfile::tempdir().expect("tempdir");
    let (mem, fs) = format(dir.path());
    log_only(&fs, "root", JournalOp::Create, "kept", "", b"", 0);
    drop(fs);
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(journal_path(dir.path()))
        .expect("open journal");
    file.write_all(b"root|123|CREATE|half").expect("append torn line");
    drop(file);

    let fs = reopen(&mem, dir.path());
    assert!(fs.journal().load_report().discarded_tail_bytes > 0);
    let mut s = Session::new(Identity::root());
    assert_eq!(fs.login(&mut s, Identity::root()).expect("login").replayed, 1);
}
