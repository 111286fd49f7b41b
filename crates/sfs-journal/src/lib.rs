#![forbid(unsafe_code)]
//! Write-ahead journal for SFS mutations.
//!
//! Every mutating request appends one line describing its intent before it
//! touches the image. When the request finishes, the two trailing flag bytes
//! of that line are overwritten in place; nothing else in the file is ever
//! rewritten except by [`Journal::compact`].
//!
//! # Line format
//!
//! ```text
//! identity|timestamp|OP|name|alt|dir|size|payload|check|committed\n
//! ```
//!
//! | Field | Encoding |
//! |-------|----------|
//! | identity | user name, no `|`, CR or LF |
//! | timestamp | decimal ms since the epoch, strictly increasing per journal |
//! | OP | `WRITE`, `WRITE-APPEND`, `CREATE`, `DELETE-DIR`, `DELETE-FILE`, `RENAME` |
//! | name / alt | entry name and rename target (alt may be empty) |
//! | dir | decimal directory id the name is relative to |
//! | size | decimal declared size |
//! | payload | raw bytes with `\` `LF` `CR` escaped as `\\` `\n` `\r` |
//! | check / committed | `0` or `1` |
//!
//! The first seven fields are split from the left and the last two from the
//! right, so the payload may contain `|`. A final line without a terminating
//! newline is a torn append and is discarded on open.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sfs_error::{Result, SfsError};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace, warn};

// ── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JournalOp {
    Write,
    WriteAppend,
    Create,
    DeleteDir,
    DeleteFile,
    Rename,
}

impl JournalOp {
    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Write => "WRITE",
            Self::WriteAppend => "WRITE-APPEND",
            Self::Create => "CREATE",
            Self::DeleteDir => "DELETE-DIR",
            Self::DeleteFile => "DELETE-FILE",
            Self::Rename => "RENAME",
        }
    }

    pub fn from_keyword(raw: &str) -> Result<Self> {
        Ok(match raw {
            "WRITE" => Self::Write,
            "WRITE-APPEND" => Self::WriteAppend,
            "CREATE" => Self::Create,
            "DELETE-DIR" => Self::DeleteDir,
            "DELETE-FILE" => Self::DeleteFile,
            "RENAME" => Self::Rename,
            other => {
                return Err(SfsError::Journal(format!("unknown operation {other:?}")));
            }
        })
    }
}

impl fmt::Display for JournalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// One logged intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub identity: String,
    pub timestamp: u64,
    pub op: JournalOp,
    pub name: String,
    pub alt_name: String,
    pub directory: u32,
    pub size: u64,
    pub payload: Vec<u8>,
    /// Set while the record is being replayed and once it is committed.
    pub check: bool,
    pub committed: bool,
}

fn flag(value: bool) -> u8 {
    if value { b'1' } else { b'0' }
}

fn parse_flag(raw: &[u8]) -> Result<bool> {
    match raw {
        b"0" => Ok(false),
        b"1" => Ok(true),
        other => Err(SfsError::Journal(format!(
            "flag must be 0 or 1, got {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn check_field(field: &str, value: &str) -> Result<()> {
    if value.bytes().any(|b| matches!(b, b'|' | b'\n' | b'\r')) {
        return Err(SfsError::Journal(format!(
            "{field} {value:?} contains a reserved delimiter"
        )));
    }
    Ok(())
}

fn escape_payload(payload: &[u8], out: &mut Vec<u8>) {
    for &b in payload {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            other => out.push(other),
        }
    }
}

fn unescape_payload(raw: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter();
    while let Some(&b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            other => {
                return Err(SfsError::Journal(format!(
                    "bad payload escape \\{:?}",
                    other.map(|c| char::from(*c))
                )));
            }
        }
    }
    Ok(out)
}

fn text_field(raw: &[u8], field: &str) -> Result<String> {
    String::from_utf8(raw.to_vec())
        .map_err(|_| SfsError::Journal(format!("{field} is not valid UTF-8")))
}

fn number_field(raw: &[u8], field: &str) -> Result<u64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            SfsError::Journal(format!(
                "{field} is not a number: {:?}",
                String::from_utf8_lossy(raw)
            ))
        })
}

impl JournalRecord {
    /// Serialize as one newline-terminated line.
    #[must_use]
    pub fn encode_line(&self) -> Vec<u8> {
        let mut line = format!(
            "{}|{}|{}|{}|{}|{}|{}|",
            self.identity,
            self.timestamp,
            self.op,
            self.name,
            self.alt_name,
            self.directory,
            self.size
        )
        .into_bytes();
        escape_payload(&self.payload, &mut line);
        line.extend_from_slice(&[b'|', flag(self.check), b'|', flag(self.committed), b'\n']);
        line
    }

    /// Parse one line (without its trailing newline).
    pub fn decode_line(line: &[u8]) -> Result<Self> {
        let mut head = line.splitn(8, |b| *b == b'|');
        let mut next = |field: &str| {
            head.next()
                .ok_or_else(|| SfsError::Journal(format!("line is missing {field}")))
        };
        let identity = text_field(next("identity")?, "identity")?;
        let timestamp = number_field(next("timestamp")?, "timestamp")?;
        let op = JournalOp::from_keyword(&text_field(next("operation")?, "operation")?)?;
        let name = text_field(next("name")?, "name")?;
        let alt_name = text_field(next("alt name")?, "alt name")?;
        let directory = number_field(next("directory")?, "directory")?;
        let size = number_field(next("size")?, "size")?;
        let rest = next("payload")?;

        let mut tail = rest.rsplitn(3, |b| *b == b'|');
        let committed = parse_flag(
            tail.next()
                .ok_or_else(|| SfsError::Journal("line is missing committed flag".into()))?,
        )?;
        let check = parse_flag(
            tail.next()
                .ok_or_else(|| SfsError::Journal("line is missing check flag".into()))?,
        )?;
        let payload = unescape_payload(
            tail.next()
                .ok_or_else(|| SfsError::Journal("line is missing payload".into()))?,
        )?;

        Ok(Self {
            identity,
            timestamp,
            op,
            name,
            alt_name,
            directory: u32::try_from(directory)
                .map_err(|_| SfsError::Journal(format!("directory {directory} out of range")))?,
            size,
            payload,
            check,
            committed,
        })
    }
}

// ── File handle ─────────────────────────────────────────────────────────────

/// Byte span of one line in the log, excluding the newline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LineSpan {
    offset: u64,
    len: u64,
}

impl LineSpan {
    fn check_offset(self) -> u64 {
        self.offset + self.len - 3
    }

    fn committed_offset(self) -> u64 {
        self.offset + self.len - 1
    }
}

#[derive(Debug)]
struct JournalFile {
    file: File,
    write_pos: u64,
}

impl JournalFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.write_pos))?;
        self.file.write_all(data)?;
        self.write_pos += data.len() as u64;
        Ok(())
    }

    fn patch(&mut self, offset: u64, byte: u8) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&[byte])?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

// ── Journal ─────────────────────────────────────────────────────────────────

/// Configuration options for the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalOptions {
    /// Whether to fsync after each append and commit patch (default: true).
    pub sync_on_commit: bool,
}

impl Default for JournalOptions {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
        }
    }
}

/// What `open` found in an existing log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalLoadReport {
    pub records: usize,
    pub uncommitted: usize,
    /// Bytes of a torn final line that were cut off.
    pub discarded_tail_bytes: u64,
}

#[derive(Debug)]
struct JournalState {
    file: JournalFile,
    records: Vec<JournalRecord>,
    spans: Vec<LineSpan>,
    last_timestamp: u64,
}

impl JournalState {
    fn position(&self, timestamp: u64) -> Option<usize> {
        self.records
            .binary_search_by_key(&timestamp, |r| r.timestamp)
            .ok()
    }
}

#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    options: JournalOptions,
    state: Mutex<JournalState>,
    load_report: JournalLoadReport,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn parse_log(bytes: &[u8]) -> Result<(Vec<JournalRecord>, Vec<LineSpan>, u64)> {
    let mut records = Vec::new();
    let mut spans = Vec::new();
    let mut offset = 0_usize;
    while offset < bytes.len() {
        let Some(nl) = bytes[offset..].iter().position(|b| *b == b'\n') else {
            break;
        };
        let line = &bytes[offset..offset + nl];
        if !line.is_empty() {
            let record = JournalRecord::decode_line(line).map_err(|err| {
                SfsError::Journal(format!("line at byte {offset}: {err}"))
            })?;
            records.push(record);
            spans.push(LineSpan {
                offset: offset as u64,
                len: nl as u64,
            });
        }
        offset += nl + 1;
    }
    Ok((records, spans, offset as u64))
}

impl Journal {
    /// Open (or create) the log at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, JournalOptions::default())
    }

    /// Start an empty log at `path`, discarding any previous contents.
    pub fn create(path: impl AsRef<Path>, options: JournalOptions) -> Result<Self> {
        File::create(path.as_ref())?.sync_all()?;
        Self::open_with_options(path, options)
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: JournalOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let (mut records, mut spans, valid_len) = parse_log(&bytes)?;
        let discarded = bytes.len() as u64 - valid_len;
        if discarded > 0 {
            warn!(path = %path.display(), discarded, "journal_torn_tail_discarded");
            file.set_len(valid_len)?;
        }
        if records.windows(2).any(|w| w[0].timestamp >= w[1].timestamp) {
            warn!(path = %path.display(), "journal_out_of_order_resorted");
            let mut paired: Vec<_> = records.into_iter().zip(spans).collect();
            paired.sort_by_key(|(r, _)| r.timestamp);
            if let Some(dup) = paired.windows(2).find(|w| w[0].0.timestamp == w[1].0.timestamp) {
                return Err(SfsError::Journal(format!(
                    "duplicate timestamp {} in {}",
                    dup[0].0.timestamp,
                    path.display()
                )));
            }
            (records, spans) = paired.into_iter().unzip();
        }

        let load_report = JournalLoadReport {
            records: records.len(),
            uncommitted: records.iter().filter(|r| !r.committed).count(),
            discarded_tail_bytes: discarded,
        };
        let last_timestamp = records.last().map_or(0, |r| r.timestamp);
        info!(
            path = %path.display(),
            records = load_report.records,
            uncommitted = load_report.uncommitted,
            "journal_opened"
        );

        Ok(Self {
            path,
            options,
            state: Mutex::new(JournalState {
                file: JournalFile {
                    file,
                    write_pos: valid_len,
                },
                records,
                spans,
                last_timestamp,
            }),
            load_report,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn load_report(&self) -> JournalLoadReport {
        self.load_report
    }

    /// Append an intent record and return its timestamp.
    #[expect(clippy::too_many_arguments)]
    pub fn log_operation(
        &self,
        identity: &str,
        op: JournalOp,
        name: &str,
        alt_name: &str,
        payload: &[u8],
        size: u64,
        directory: u32,
    ) -> Result<u64> {
        check_field("identity", identity)?;
        check_field("name", name)?;
        check_field("alt name", alt_name)?;

        let mut state = self.state.lock();
        let timestamp = now_millis().max(state.last_timestamp + 1);
        let record = JournalRecord {
            identity: identity.to_owned(),
            timestamp,
            op,
            name: name.to_owned(),
            alt_name: alt_name.to_owned(),
            directory,
            size,
            payload: payload.to_vec(),
            check: false,
            committed: false,
        };
        let line = record.encode_line();
        let offset = state.file.write_pos;
        state.file.append(&line)?;
        if self.options.sync_on_commit {
            state.file.sync()?;
        }
        state.spans.push(LineSpan {
            offset,
            len: line.len() as u64 - 1,
        });
        state.records.push(record);
        state.last_timestamp = timestamp;
        debug!(identity, timestamp, op = %op, name, directory, "journal_append");
        Ok(timestamp)
    }

    /// Flip both trailing flags of the record stamped `timestamp` to `1`.
    pub fn mark_committed(&self, timestamp: u64) -> Result<()> {
        let mut state = self.state.lock();
        let idx = state
            .position(timestamp)
            .ok_or_else(|| SfsError::Journal(format!("no record with timestamp {timestamp}")))?;
        if state.records[idx].committed {
            trace!(timestamp, "journal_already_committed");
            return Ok(());
        }
        let span = state.spans[idx];
        state.file.patch(span.check_offset(), b'1')?;
        state.file.patch(span.committed_offset(), b'1')?;
        if self.options.sync_on_commit {
            state.file.sync()?;
        }
        let record = &mut state.records[idx];
        record.check = true;
        record.committed = true;
        debug!(timestamp, "journal_commit");
        Ok(())
    }

    /// Flag a record as being replayed. In memory only; the on-disk check
    /// byte is written together with the commit flag.
    pub fn mark_replaying(&self, timestamp: u64) -> Result<()> {
        let mut state = self.state.lock();
        let idx = state
            .position(timestamp)
            .ok_or_else(|| SfsError::Journal(format!("no record with timestamp {timestamp}")))?;
        state.records[idx].check = true;
        Ok(())
    }

    /// Uncommitted records for `identity`, oldest first.
    #[must_use]
    pub fn pending_for(&self, identity: &str) -> Vec<JournalRecord> {
        self.state
            .lock()
            .records
            .iter()
            .filter(|r| !r.committed && r.identity == identity)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn records(&self) -> Vec<JournalRecord> {
        self.state.lock().records.clone()
    }

    #[must_use]
    pub fn record(&self, timestamp: u64) -> Option<JournalRecord> {
        let state = self.state.lock();
        state.position(timestamp).map(|i| state.records[i].clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the log keeping only uncommitted records. Returns how many
    /// committed records were dropped.
    pub fn compact(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let before = state.records.len();
        let kept: Vec<JournalRecord> = state
            .records
            .iter()
            .filter(|r| !r.committed)
            .cloned()
            .collect();

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".compact");
        let tmp_path = PathBuf::from(tmp_name);
        let mut spans = Vec::with_capacity(kept.len());
        {
            let mut tmp = File::create(&tmp_path)?;
            let mut offset = 0_u64;
            for record in &kept {
                let line = record.encode_line();
                tmp.write_all(&line)?;
                spans.push(LineSpan {
                    offset,
                    len: line.len() as u64 - 1,
                });
                offset += line.len() as u64;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let write_pos = file.metadata()?.len();
        state.file = JournalFile { file, write_pos };
        state.records = kept;
        state.spans = spans;
        let dropped = before - state.records.len();
        info!(path = %self.path.display(), dropped, kept = state.records.len(), "journal_compacted");
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(payload: &[u8]) -> JournalRecord {
        JournalRecord {
            identity: "alice".into(),
            timestamp: 1_700_000_000_123,
            op: JournalOp::Write,
            name: "a.txt".into(),
            alt_name: String::new(),
            directory: 3,
            size: 42,
            payload: payload.to_vec(),
            check: false,
            committed: false,
        }
    }

    #[test]
    fn line_layout_is_pipe_delimited() {
        let line = sample(b"hello").encode_line();
        assert_eq!(
            line,
            b"alice|1700000000123|WRITE|a.txt||3|42|hello|0|0\n".to_vec()
        );
    }

    #[test]
    fn payload_with_delimiters_round_trips() {
        let record = sample(b"a|b\nc\\d\r|");
        let line = record.encode_line();
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
        let decoded = JournalRecord::decode_line(&line[..line.len() - 1]).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn decode_rejects_malformed_lines() {
        assert!(JournalRecord::decode_line(b"alice|1|WRITE").is_err());
        assert!(JournalRecord::decode_line(b"alice|x|WRITE|a||0|0||0|0").is_err());
        assert!(JournalRecord::decode_line(b"alice|1|MKDIR|a||0|0||0|0").is_err());
        assert!(JournalRecord::decode_line(b"alice|1|WRITE|a||0|0||2|0").is_err());
        assert!(JournalRecord::decode_line(b"alice|1|WRITE|a||0|0|bad\\q|0|0").is_err());
    }

    #[test]
    fn keywords_round_trip() {
        for op in [
            JournalOp::Write,
            JournalOp::WriteAppend,
            JournalOp::Create,
            JournalOp::DeleteDir,
            JournalOp::DeleteFile,
            JournalOp::Rename,
        ] {
            assert_eq!(JournalOp::from_keyword(op.keyword()).unwrap(), op);
        }
    }

    #[test]
    fn timestamps_are_strictly_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path().join("journal.log")).unwrap();
        let mut last = 0;
        for i in 0..50 {
            let ts = journal
                .log_operation("bob", JournalOp::Create, &format!("f{i}"), "", b"", 0, 0)
                .unwrap();
            assert!(ts > last);
            last = ts;
        }
    }

    #[test]
    fn rejects_delimiters_in_text_fields() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path().join("journal.log")).unwrap();
        assert!(
            journal
                .log_operation("a|b", JournalOp::Create, "x", "", b"", 0, 0)
                .is_err()
        );
        assert!(
            journal
                .log_operation("a", JournalOp::Create, "x\ny", "", b"", 0, 0)
                .is_err()
        );
        assert!(journal.is_empty());
    }

    #[test]
    fn mark_committed_unknown_timestamp_fails() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path().join("journal.log")).unwrap();
        assert!(matches!(journal.mark_committed(5), Err(SfsError::Journal(_))));
    }

    proptest! {
        #[test]
        fn arbitrary_payloads_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..200)) {
            let record = sample(&payload);
            let line = record.encode_line();
            prop_assert_eq!(line.last(), Some(&b'\n'));
            let decoded = JournalRecord::decode_line(&line[..line.len() - 1]).unwrap();
            prop_assert_eq!(decoded, record);
        }
    }
}
