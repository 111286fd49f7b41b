#![forbid(unsafe_code)]
//! File-level journal behavior: in-place commit patches, reopen, torn tails,
//! and compaction.

use sfs_error::SfsError;
use sfs_journal::{Journal, JournalOp, JournalOptions};
use std::fs;
use std::io::Write;

// ---------------------------------------------------------------------------
// Commit patching
// ---------------------------------------------------------------------------

#[test]
fn commit_patches_only_the_two_trailing_flags() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.log");
    let journal = Journal::open(&path).unwrap();

    let ts = journal
        .log_operation("alice", JournalOp::Write, "a.txt", "", b"hello|world", 5, 2)
        .unwrap();
    let before = fs::read(&path).unwrap();
    journal.mark_committed(ts).unwrap();
    let after = fs::read(&path).unwrap();

    assert_eq!(before.len(), after.len());
    let n = before.len();
    assert_eq!(&before[..n - 4], &after[..n - 4]);
    assert_eq!(&before[n - 4..], b"0|0\n");
    assert_eq!(&after[n - 4..], b"1|1\n");

    let record = journal.record(ts).unwrap();
    assert!(record.committed);
    assert!(record.check);
}

#[test]
fn commit_of_middle_record_leaves_neighbours_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.log");
    let journal = Journal::open(&path).unwrap();

    let first = journal
        .log_operation("alice", JournalOp::Create, "a", "", b"", 10, 0)
        .unwrap();
    let middle = journal
        .log_operation("alice", JournalOp::Rename, "a", "b", b"", 0, 0)
        .unwrap();
    let last = journal
        .log_operation("alice", JournalOp::DeleteFile, "b", "", b"", 0, 0)
        .unwrap();
    journal.mark_committed(middle).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].ends_with("|0|0"));
    assert!(lines[1].ends_with("|1|1"));
    assert!(lines[2].ends_with("|0|0"));

    let pending: Vec<u64> = journal
        .pending_for("alice")
        .into_iter()
        .map(|r| r.timestamp)
        .collect();
    assert_eq!(pending, vec![first, last]);
}

#[test]
fn double_commit_is_harmless() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::open(dir.path().join("journal.log")).unwrap();
    let ts = journal
        .log_operation("alice", JournalOp::Create, "a", "", b"", 0, 0)
        .unwrap();
    journal.mark_committed(ts).unwrap();
    journal.mark_committed(ts).unwrap();
    assert!(journal.pending_for("alice").is_empty());
}

// ---------------------------------------------------------------------------
// Reopen
// ---------------------------------------------------------------------------

#[test]
fn reopen_restores_records_and_flags() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.log");
    let (committed, pending) = {
        let journal = Journal::open(&path).unwrap();
        let a = journal
            .log_operation("alice", JournalOp::Create, "a", "", b"", 1, 0)
            .unwrap();
        let b = journal
            .log_operation("bob", JournalOp::WriteAppend, "b", "", b"x\ny", 3, 4)
            .unwrap();
        journal.mark_committed(a).unwrap();
        (a, b)
    };

    let journal = Journal::open(&path).unwrap();
    assert_eq!(journal.len(), 2);
    assert_eq!(journal.load_report().uncommitted, 1);
    assert!(journal.pending_for("alice").is_empty());
    let bob = journal.pending_for("bob");
    assert_eq!(bob.len(), 1);
    assert_eq!(bob[0].timestamp, pending);
    assert_eq!(bob[0].payload, b"x\ny");
    assert_eq!(bob[0].directory, 4);

    // New stamps continue past everything on disk.
    let next = journal
        .log_operation("alice", JournalOp::Create, "c", "", b"", 0, 0)
        .unwrap();
    assert!(next > pending && next > committed);
    journal.mark_committed(pending).unwrap();
    assert!(journal.pending_for("bob").is_empty());
}

#[test]
fn torn_tail_is_discarded_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.log");
    {
        let journal = Journal::open(&path).unwrap();
        journal
            .log_operation("alice", JournalOp::Create, "a", "", b"", 0, 0)
            .unwrap();
    }
    let intact = fs::metadata(&path).unwrap().len();
    {
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"alice|99999999999999|WRI").unwrap();
    }

    let journal = Journal::open(&path).unwrap();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal.load_report().discarded_tail_bytes, 24);
    assert_eq!(fs::metadata(&path).unwrap().len(), intact);
}

#[test]
fn corrupt_complete_line_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.log");
    fs::write(&path, b"this is not a journal line\n").unwrap();
    assert!(Journal::open(&path).is_err());
}

// ---------------------------------------------------------------------------
// Load ordering
// ---------------------------------------------------------------------------

fn two_record_lines(path: &std::path::Path) -> (Vec<u8>, Vec<u8>) {
    {
        let journal = Journal::open(path).unwrap();
        journal
            .log_operation("alice", JournalOp::Create, "a", "", b"", 0, 0)
            .unwrap();
        journal
            .log_operation("alice", JournalOp::Create, "b", "", b"", 0, 0)
            .unwrap();
    }
    let bytes = fs::read(path).unwrap();
    let mut lines = bytes.split_inclusive(|b| *b == b'\n').map(<[u8]>::to_vec);
    (lines.next().unwrap(), lines.next().unwrap())
}

#[test]
fn out_of_order_records_are_sorted_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.log");
    let (first, second) = two_record_lines(&path);
    fs::write(&path, [second, first].concat()).unwrap();

    let journal = Journal::open(&path).unwrap();
    let names: Vec<_> = journal.records().into_iter().map(|r| r.name).collect();
    assert_eq!(names, ["a", "b"]);
    assert_eq!(journal.load_report().uncommitted, 2);
}

#[test]
fn duplicate_timestamps_are_an_error_not_a_silent_drop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.log");
    let (first, second) = two_record_lines(&path);
    fs::write(&path, [first.clone(), second, first].concat()).unwrap();

    let err = Journal::open(&path).unwrap_err();
    assert!(matches!(err, SfsError::Journal(_)), "{err:?}");
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

#[test]
fn compact_keeps_only_uncommitted_and_stays_patchable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.log");
    let journal = Journal::open_with_options(
        &path,
        JournalOptions {
            sync_on_commit: false,
        },
    )
    .unwrap();

    let mut stamps = Vec::new();
    for i in 0..6 {
        stamps.push(
            journal
                .log_operation("alice", JournalOp::Create, &format!("f{i}"), "", b"", 0, 0)
                .unwrap(),
        );
    }
    for ts in &stamps[..4] {
        journal.mark_committed(*ts).unwrap();
    }

    assert_eq!(journal.compact().unwrap(), 4);
    assert_eq!(journal.len(), 2);
    journal.mark_committed(stamps[5]).unwrap();

    drop(journal);
    let reopened = Journal::open(&path).unwrap();
    let pending = reopened.pending_for("alice");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].name, "f4");
}
