//! Append-only JSONL reply history, the source of truth for deduplication.
//!
//! Every processed post produces exactly one line:
//! ```jsonl
//! {"post_id":"1790","author":"dev","original_text":"...","reply_text":"...","timestamp":"2026-10-16T09:12:03Z","outcome":"posted","run_id":"..."}
//! {"post_id":"1791","author":"ops","original_text":"...","timestamp":"2026-10-16T09:12:40Z","outcome":"skipped-filtered","run_id":"...","detail":"blocklist:war"}
//! ```
//!
//! Lines are never rewritten. An append is a single write of one full line followed by
//! `sync_data`, so after a crash the file either contains the whole line or a torn tail
//! without a terminating newline. Torn tails are cut off the next time the store is opened.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::post::Post;

/// Terminal classification of processing a post within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Posted,
    SkippedDuplicate,
    SkippedFiltered,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Posted => write!(f, "posted"),
            Self::SkippedDuplicate => write!(f, "skipped-duplicate"),
            Self::SkippedFiltered => write!(f, "skipped-filtered"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One history row. Created once per processed post per run and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyRecord {
    pub post_id: String,
    pub author: String,
    pub original_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_text: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
    pub run_id: Uuid,
    /// Filter reason tag or error kind, for human audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ReplyRecord {
    pub fn new(post: &Post, outcome: Outcome, timestamp: DateTime<Utc>, run_id: Uuid) -> Self {
        Self {
            post_id: post.id.clone(),
            author: post.author.clone(),
            original_text: post.text.clone(),
            reply_text: None,
            timestamp,
            outcome,
            run_id,
            detail: None,
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply_text = Some(reply.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Errors from the history store.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("history serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("post {post_id} already has a posted reply")]
    ConstraintViolation { post_id: String },
    #[error("corrupt history record at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

/// Durable log of processed posts.
///
/// `append` must be durable before it returns, and `exists` must reflect every
/// successful `append`, including those made by earlier processes.
pub trait HistoryStore: Send {
    /// Whether a `posted` record exists for this post.
    fn exists(&self, post_id: &str) -> Result<bool, HistoryError>;

    /// Durably append a record. A second `posted` record for the same post fails
    /// with [`HistoryError::ConstraintViolation`].
    fn append(&mut self, record: &ReplyRecord) -> Result<(), HistoryError>;

    /// Number of `posted` records dated today (UTC).
    fn count_today(&self) -> Result<usize, HistoryError>;

    /// Number of `posted` records ever written.
    fn posted_count(&self) -> Result<usize, HistoryError>;

    /// Timestamp of the newest `posted` record, if any.
    fn last_posted_at(&self) -> Result<Option<DateTime<Utc>>, HistoryError>;

    /// Most recent records, newest first.
    fn recent(&self, limit: usize) -> Result<Vec<ReplyRecord>, HistoryError>;

    /// All records dated `date` (UTC), in append order.
    fn records_on(&self, date: NaiveDate) -> Result<Vec<ReplyRecord>, HistoryError>;
}

/// JSONL-file history store. Keeps an in-memory index rebuilt on open.
pub struct JsonlHistoryStore {
    path: PathBuf,
    records: Vec<ReplyRecord>,
    posted: HashSet<String>,
    clock: Arc<dyn Clock>,
}

impl JsonlHistoryStore {
    /// Open (or create) the history file, recovering from a torn trailing line.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let records = load_records(&path)?;
        let posted = records
            .iter()
            .filter(|r| r.outcome == Outcome::Posted)
            .map(|r| r.post_id.clone())
            .collect::<HashSet<_>>();

        info!(
            path = %path.display(),
            records = records.len(),
            posted = posted.len(),
            "history store opened"
        );

        Ok(Self {
            path,
            records,
            posted,
            clock: Arc::new(SystemClock),
        })
    }

    /// Clock that decides what "today" is.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn posted_on(&self, date: NaiveDate) -> usize {
        self.records
            .iter()
            .filter(|r| r.outcome == Outcome::Posted && r.timestamp.date_naive() == date)
            .count()
    }
}

impl HistoryStore for JsonlHistoryStore {
    fn exists(&self, post_id: &str) -> Result<bool, HistoryError> {
        Ok(self.posted.contains(post_id))
    }

    fn append(&mut self, record: &ReplyRecord) -> Result<(), HistoryError> {
        if record.outcome == Outcome::Posted && self.posted.contains(&record.post_id) {
            return Err(HistoryError::ConstraintViolation {
                post_id: record.post_id.clone(),
            });
        }

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        debug!(post_id = %record.post_id, outcome = %record.outcome, "history record appended");

        if record.outcome == Outcome::Posted {
            self.posted.insert(record.post_id.clone());
        }
        self.records.push(record.clone());
        Ok(())
    }

    fn count_today(&self) -> Result<usize, HistoryError> {
        Ok(self.posted_on(self.clock.now().date_naive()))
    }

    fn posted_count(&self) -> Result<usize, HistoryError> {
        Ok(self.posted.len())
    }

    fn last_posted_at(&self) -> Result<Option<DateTime<Utc>>, HistoryError> {
        Ok(self
            .records
            .iter()
            .rev()
            .find(|r| r.outcome == Outcome::Posted)
            .map(|r| r.timestamp))
    }

    fn recent(&self, limit: usize) -> Result<Vec<ReplyRecord>, HistoryError> {
        Ok(self.records.iter().rev().take(limit).cloned().collect())
    }

    fn records_on(&self, date: NaiveDate) -> Result<Vec<ReplyRecord>, HistoryError> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.timestamp.date_naive() == date)
            .cloned()
            .collect())
    }
}

/// Read every complete record. A final line without a newline that fails to parse is a
/// torn write from a crash: it is truncated away. Any other unparsable line is corruption.
fn load_records(path: &Path) -> Result<Vec<ReplyRecord>, HistoryError> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut line_no = 0usize;

    while offset < data.len() {
        line_no += 1;
        let rest = &data[offset..];
        let (line, consumed, terminated) = match rest.iter().position(|b| *b == b'\n') {
            Some(pos) => (&rest[..pos], pos + 1, true),
            None => (rest, rest.len(), false),
        };

        if line.iter().all(|b| b.is_ascii_whitespace()) {
            offset += consumed;
            continue;
        }

        match serde_json::from_slice::<ReplyRecord>(line) {
            Ok(record) => {
                records.push(record);
                if !terminated {
                    // Complete record whose newline never landed.
                    let mut file = OpenOptions::new().append(true).open(path)?;
                    file.write_all(b"\n")?;
                    file.sync_data()?;
                }
            }
            Err(e) if !terminated => {
                warn!(
                    path = %path.display(),
                    line = line_no,
                    error = %e,
                    "discarding torn trailing history record"
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(offset as u64)?;
                file.sync_data()?;
                break;
            }
            Err(e) => {
                return Err(HistoryError::Corrupt {
                    line: line_no,
                    reason: e.to_string(),
                })
            }
        }
        offset += consumed;
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn record(id: &str, outcome: Outcome, ts: DateTime<Utc>) -> ReplyRecord {
        let post = Post::new(id, "dev", "just shipped a new release of the parser");
        ReplyRecord::new(&post, outcome, ts, Uuid::nil())
    }

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 10, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        let mut store = JsonlHistoryStore::open(&path).unwrap();
        store
            .append(&record("1", Outcome::Posted, ts(15, 9)).with_reply("nice"))
            .unwrap();
        store
            .append(&record("2", Outcome::SkippedFiltered, ts(15, 10)).with_detail("low-signal"))
            .unwrap();
        assert!(store.exists("1").unwrap());
        assert!(!store.exists("2").unwrap());

        let reopened = JsonlHistoryStore::open(&path).unwrap();
        assert!(reopened.exists("1").unwrap());
        assert!(!reopened.exists("2").unwrap());
        assert_eq!(reopened.posted_count().unwrap(), 1);
        assert_eq!(reopened.last_posted_at().unwrap(), Some(ts(15, 9)));

        let recent = reopened.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].post_id, "2");
        assert_eq!(recent[0].detail.as_deref(), Some("low-signal"));
        assert_eq!(recent[1].reply_text.as_deref(), Some("nice"));
    }

    #[test]
    fn test_second_posted_record_violates_constraint() {
        let dir = tempdir().unwrap();
        let mut store = JsonlHistoryStore::open(dir.path().join("h.jsonl")).unwrap();

        store.append(&record("7", Outcome::Posted, ts(15, 9))).unwrap();
        let err = store
            .append(&record("7", Outcome::Posted, ts(15, 10)))
            .unwrap_err();
        assert!(matches!(err, HistoryError::ConstraintViolation { ref post_id } if post_id == "7"));

        // Non-posted outcomes for the same post are still accepted.
        store
            .append(&record("7", Outcome::SkippedDuplicate, ts(15, 11)))
            .unwrap();
        assert_eq!(store.recent(10).unwrap().len(), 2);
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h.jsonl");
        {
            let mut store = JsonlHistoryStore::open(&path).unwrap();
            store.append(&record("1", Outcome::Posted, ts(15, 9))).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"post_id":"2","author":"dev","origi"#).unwrap();
        drop(file);

        let mut store = JsonlHistoryStore::open(&path).unwrap();
        assert!(store.exists("1").unwrap());
        assert!(!store.exists("2").unwrap());

        store.append(&record("2", Outcome::Posted, ts(15, 10))).unwrap();
        let reopened = JsonlHistoryStore::open(&path).unwrap();
        assert_eq!(reopened.posted_count().unwrap(), 2);
    }

    #[test]
    fn test_unterminated_complete_record_is_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h.jsonl");
        let line = serde_json::to_string(&record("9", Outcome::Posted, ts(15, 9))).unwrap();
        fs::write(&path, line).unwrap();

        let mut store = JsonlHistoryStore::open(&path).unwrap();
        assert!(store.exists("9").unwrap());
        store.append(&record("10", Outcome::Failed, ts(15, 10))).unwrap();

        let reopened = JsonlHistoryStore::open(&path).unwrap();
        assert_eq!(reopened.recent(10).unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_middle_line_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h.jsonl");
        let good = serde_json::to_string(&record("1", Outcome::Posted, ts(15, 9))).unwrap();
        fs::write(&path, format!("not json\n{}\n", good)).unwrap();

        match JsonlHistoryStore::open(&path) {
            Err(HistoryError::Corrupt { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected corruption error, got {:?}", other.err()),
        }
    }

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[test]
    fn test_records_on_and_count_today() {
        let dir = tempdir().unwrap();
        let mut store = JsonlHistoryStore::open(dir.path().join("h.jsonl"))
            .unwrap()
            .with_clock(Arc::new(FixedClock(ts(15, 18))));

        store.append(&record("a", Outcome::Posted, ts(14, 9))).unwrap();
        store.append(&record("b", Outcome::Posted, ts(15, 9))).unwrap();
        store.append(&record("c", Outcome::Failed, ts(15, 10))).unwrap();
        store.append(&record("d", Outcome::Posted, ts(15, 17))).unwrap();
        store.append(&record("e", Outcome::Posted, ts(16, 1))).unwrap();

        let day = NaiveDate::from_ymd_opt(2020, 10, 15).unwrap();
        let on_day = store.records_on(day).unwrap();
        assert_eq!(on_day.len(), 3);
        assert_eq!(on_day[0].post_id, "b");

        // Only posted records dated the clock's day count.
        assert_eq!(store.count_today().unwrap(), 2);
    }

    #[test]
    fn test_outcome_wire_format() {
        assert_eq!(
            serde_json::to_string(&Outcome::SkippedDuplicate).unwrap(),
            "\"skipped-duplicate\""
        );
        assert_eq!(Outcome::SkippedFiltered.to_string(), "skipped-filtered");
    }
}
