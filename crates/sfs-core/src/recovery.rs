//! Journal replay at login.
//!
//! Uncommitted records belonging to the logging-in identity are re-run in
//! timestamp order against the directory each one recorded. Every replay is
//! idempotent:
//!
//! | Operation | Already applied when | Action otherwise |
//! |-----------|----------------------|------------------|
//! | `CREATE` | the file exists | create |
//! | `WRITE` | never detectable | overwrite again |
//! | `WRITE-APPEND` | size is recorded size + payload | append if size is the recorded size |
//! | `DELETE-FILE` / `DELETE-DIR` | the entry is absent | delete |
//! | `RENAME` | the source is absent | rename |
//!
//! Skipped and failed records are marked committed as well, so they are not
//! retried on the next login.

use crate::fs::Filesystem;
use crate::ops::log_login;
use crate::session::{Identity, Session};
use serde::Serialize;
use sfs_error::{Result, SfsError};
use sfs_journal::{JournalOp, JournalRecord};
use sfs_types::{DEFAULT_FILE_MODE, DirId, EntryKind};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub replayed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RecoveryReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.replayed + self.skipped + self.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Replayed,
    Skipped,
}

impl Filesystem {
    /// Start a session for `identity` at the root and replay its pending
    /// journal records.
    pub fn login(&self, session: &mut Session, identity: Identity) -> Result<RecoveryReport> {
        session.identity = identity;
        session.cwd = DirId::ROOT;
        let result = self.recover(&session.identity);
        let name = session.identity.name.clone();
        match &result {
            Ok(report) if report.total() > 0 => session.say(format_args!(
                "Welcome {}: recovered {} pending operations ({} replayed, {} skipped, {} failed)",
                name,
                report.total(),
                report.replayed,
                report.skipped,
                report.failed
            )),
            Ok(_) => session.say(format_args!("Welcome {name}")),
            Err(err) => session.say(format_args!("Error: {err}")),
        }
        result
    }

    /// Replay every uncommitted record logged by `identity`.
    pub fn recover(&self, identity: &Identity) -> Result<RecoveryReport> {
        let _mutation = self.mutation.lock();
        let pending = self.journal.pending_for(&identity.name);
        log_login(identity, pending.len());
        let mut report = RecoveryReport::default();
        for record in pending {
            self.journal.mark_replaying(record.timestamp)?;
            match self.replay_record(identity, &record) {
                Ok(Outcome::Replayed) => report.replayed += 1,
                Ok(Outcome::Skipped) => {
                    report.skipped += 1;
                    self.journal.mark_committed(record.timestamp)?;
                }
                Err(err) => {
                    warn!(
                        timestamp = record.timestamp,
                        op = %record.op,
                        name = %record.name,
                        error = %err,
                        "journal_replay_failed"
                    );
                    report.failed += 1;
                    self.journal.mark_committed(record.timestamp)?;
                }
            }
        }
        if report.total() > 0 {
            info!(
                user = %identity.name,
                replayed = report.replayed,
                skipped = report.skipped,
                failed = report.failed,
                "journal_recovered"
            );
        }
        Ok(report)
    }

    fn replay_record(&self, identity: &Identity, record: &JournalRecord) -> Result<Outcome> {
        let dir = DirId(record.directory);
        let ts = Some(record.timestamp);
        let name = record.name.as_str();
        debug!(timestamp = record.timestamp, op = %record.op, name, dir = dir.0, "journal_replay");

        let dir_exists = self.ensure_dir_exists(dir).is_ok();
        match record.op {
            JournalOp::Create => {
                if dir_exists && self.lookup(identity.uid, dir, EntryKind::File, name).is_some() {
                    return Ok(Outcome::Skipped);
                }
                self.create_in(identity, dir, name, record.size, DEFAULT_FILE_MODE, ts)?;
            }
            JournalOp::Write => {
                self.write_in(identity, dir, name, &record.payload, ts)?;
            }
            JournalOp::WriteAppend => {
                let (_, entry) = self.find_file(identity, dir, name)?;
                let appended = record.size + record.payload.len() as u64;
                if entry.size == appended && !record.payload.is_empty() {
                    return Ok(Outcome::Skipped);
                }
                if entry.size != record.size {
                    return Err(SfsError::Journal(format!(
                        "cannot replay append to {name}: size {} is neither {} nor {appended}",
                        entry.size, record.size
                    )));
                }
                self.append_in(identity, dir, name, &record.payload, ts)?;
            }
            JournalOp::DeleteFile => {
                if !dir_exists || self.lookup(identity.uid, dir, EntryKind::File, name).is_none() {
                    return Ok(Outcome::Skipped);
                }
                self.delete_file_in(identity, dir, name, ts)?;
            }
            JournalOp::DeleteDir => {
                if !dir_exists
                    || self
                        .lookup(identity.uid, dir, EntryKind::Directory, name)
                        .is_none()
                {
                    return Ok(Outcome::Skipped);
                }
                self.rmdir_in(identity, dir, name, ts)?;
            }
            JournalOp::Rename => {
                if !dir_exists || self.lookup_any(identity.uid, dir, name).is_none() {
                    return Ok(Outcome::Skipped);
                }
                self.rename_in(identity, dir, name, &record.alt_name, ts)?;
            }
        }
        Ok(Outcome::Replayed)
    }
}
