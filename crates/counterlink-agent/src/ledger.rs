//! Processed-file ledger
//!
//! Every export moves through `unseen → pending → processed`. Transitions
//! are appended to a JSON-lines file and fsynced before the pipeline acts on
//! them, so after a crash the ledger is replayed and any file still `pending`
//! is simply treated as unseen again and re-sent.
//!
//! Failed uploads append a `pending` and an `unseen` line per file every
//! cycle, so the file is rewritten whenever superseded lines dominate, both
//! on open and while running.
//!
//! ```text
//! {"name":"TRAX_0001.CSV","state":"pending","size":412,"modified":"2024-05-01T10:02:11Z","at":"2026-10-19T12:00:00Z"}
//! {"name":"TRAX_0001.CSV","state":"processed","size":412,"modified":"2024-05-01T10:02:11Z","at":"2026-10-19T12:00:03Z"}
//! ```

use crate::error::LedgerError;
use crate::scanner::ExportFile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Lifecycle state of one export file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    /// Never seen, or released after a failed upload
    Unseen,
    /// Part of a batch awaiting acknowledgment
    Pending,
    /// Acknowledged by the server
    Processed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LedgerLine {
    name: String,
    state: FileState,
    size: u64,
    modified: DateTime<Utc>,
    at: DateTime<Utc>,
}

impl LedgerLine {
    fn for_file(file: &ExportFile, state: FileState, at: DateTime<Utc>) -> Self {
        Self {
            name: file.file_name.clone(),
            state,
            size: file.size,
            modified: DateTime::<Utc>::from(file.modified),
            at,
        }
    }
}

/// Summary for `status` output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerCounts {
    pub processed: usize,
    pub pending: usize,
}

/// Runtime compaction never triggers below this many lines.
pub const COMPACT_MIN_LINES: usize = 64;

/// Append-only record of which exports have been delivered
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    entries: BTreeMap<String, LedgerLine>,
    file: File,
    /// Lines currently in the file
    lines: usize,
}

impl Ledger {
    /// Replay the ledger at `path`, creating it if needed.
    ///
    /// Entries left `pending` by an earlier run are dropped back to unseen
    /// and the file is rewritten to hold only processed entries.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let io_err = |source| LedgerError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let (entries, line_count) = match std::fs::read_to_string(&path) {
            Ok(content) => replay(&path, &content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (BTreeMap::new(), 0),
            Err(source) => return Err(io_err(source)),
        };

        let stale_pending = entries.values().filter(|e| e.state != FileState::Processed).count();
        let entries: BTreeMap<String, LedgerLine> = entries
            .into_iter()
            .filter(|(_, e)| e.state == FileState::Processed)
            .collect();

        let mut lines = line_count;
        if stale_pending > 0 || line_count > entries.len() {
            if stale_pending > 0 {
                info!(count = stale_pending, "Releasing files left pending by a previous run");
            }
            compact(&path, entries.values())?;
            debug!(
                path = %path.display(),
                lines_before = line_count,
                lines_after = entries.len(),
                "Compacted ledger"
            );
            lines = entries.len();
        }

        let file = open_append(&path)?;

        Ok(Self {
            path,
            entries,
            file,
            lines,
        })
    }

    /// Counts from the ledger file without taking ownership of it.
    ///
    /// Unlike [`Ledger::open`] this never rewrites the file, so it is safe
    /// while the agent is running.
    pub fn inspect(path: &Path) -> Result<LedgerCounts, LedgerError> {
        let entries = match std::fs::read_to_string(path) {
            Ok(content) => replay(path, &content).0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            },
        };

        Ok(count_states(entries.values()))
    }

    pub fn state(&self, name: &str) -> FileState {
        self.entries.get(name).map_or(FileState::Unseen, |e| e.state)
    }

    pub fn is_processed(&self, name: &str) -> bool {
        self.state(name) == FileState::Processed
    }

    pub fn counts(&self) -> LedgerCounts {
        count_states(self.entries.values())
    }

    /// Record that `files` are about to be uploaded
    pub fn mark_pending<'a>(
        &mut self,
        files: impl IntoIterator<Item = &'a ExportFile>,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        for file in files {
            if self.state(&file.file_name) == FileState::Unseen {
                self.append(LedgerLine::for_file(file, FileState::Pending, now))?;
            }
        }
        Ok(())
    }

    /// Return pending files to unseen after a failed or deferred upload
    pub fn release<'a>(
        &mut self,
        files: impl IntoIterator<Item = &'a ExportFile>,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        let mut released = 0;
        for file in files {
            if self.state(&file.file_name) == FileState::Pending {
                self.append(LedgerLine::for_file(file, FileState::Unseen, now))?;
                released += 1;
            }
        }
        Ok(released)
    }

    /// Record a file as delivered. Returns `false` if it already was.
    pub fn mark_processed(&mut self, file: &ExportFile, now: DateTime<Utc>) -> Result<bool, LedgerError> {
        if self.is_processed(&file.file_name) {
            return Ok(false);
        }
        self.append(LedgerLine::for_file(file, FileState::Processed, now))?;
        Ok(true)
    }

    fn append(&mut self, line: LedgerLine) -> Result<(), LedgerError> {
        let mut json = serde_json::to_string(&line)?;
        json.push('\n');

        let io_err = |source| LedgerError::Io {
            path: self.path.clone(),
            source,
        };
        self.file.write_all(json.as_bytes()).map_err(io_err)?;
        self.file.sync_data().map_err(io_err)?;

        if line.state == FileState::Unseen {
            self.entries.remove(&line.name);
        } else {
            self.entries.insert(line.name.clone(), line);
        }
        self.lines += 1;

        if self.lines >= COMPACT_MIN_LINES && self.lines > 2 * self.entries.len() {
            compact(&self.path, self.entries.values())?;
            self.file = open_append(&self.path)?;
            debug!(
                path = %self.path.display(),
                lines_before = self.lines,
                lines_after = self.entries.len(),
                "Compacted ledger"
            );
            self.lines = self.entries.len();
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File, LedgerError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn count_states<'a>(entries: impl Iterator<Item = &'a LedgerLine>) -> LedgerCounts {
    let mut counts = LedgerCounts::default();
    for entry in entries {
        match entry.state {
            FileState::Processed => counts.processed += 1,
            FileState::Pending => counts.pending += 1,
            FileState::Unseen => {},
        }
    }
    counts
}

fn replay(path: &Path, content: &str) -> (BTreeMap<String, LedgerLine>, usize) {
    let mut entries = BTreeMap::new();
    let mut count = 0;
    let total = content.lines().filter(|l| !l.trim().is_empty()).count();

    for (index, raw) in content.lines().filter(|l| !l.trim().is_empty()).enumerate() {
        count += 1;
        match serde_json::from_str::<LedgerLine>(raw) {
            Ok(line) if line.state == FileState::Unseen => {
                entries.remove(&line.name);
            },
            Ok(line) => {
                entries.insert(line.name.clone(), line);
            },
            Err(e) if index + 1 == total => {
                warn!(path = %path.display(), error = %e, "Ignoring truncated final ledger line");
            },
            Err(e) => {
                warn!(path = %path.display(), line = index + 1, error = %e, "Skipping unreadable ledger line");
            },
        }
    }

    (entries, count)
}

fn compact<'a>(path: &Path, entries: impl Iterator<Item = &'a LedgerLine>) -> Result<(), LedgerError> {
    let io_err = |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut body = String::new();
    for entry in entries {
        body.push_str(&serde_json::to_string(entry)?);
        body.push('\n');
    }

    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = File::create(&tmp).map_err(io_err)?;
    file.write_all(body.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::scanner::ExportDialect;
    use chrono::TimeZone;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn export(name: &str) -> ExportFile {
        ExportFile {
            path: PathBuf::from("/mnt/usb").join(name),
            file_name: name.to_string(),
            size: 42,
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(1_714_557_600),
            dialect: ExportDialect::Csv,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_lifecycle_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let (a, b) = (export("A.CSV"), export("B.CSV"));

        {
            let mut ledger = Ledger::open(&path).unwrap();
            ledger.mark_pending([&a, &b], now()).unwrap();
            assert_eq!(ledger.state("A.CSV"), FileState::Pending);
            assert!(ledger.mark_processed(&a, now()).unwrap());
            assert_eq!(ledger.counts(), LedgerCounts { processed: 1, pending: 1 });
        }

        let ledger = Ledger::open(&path).unwrap();
        assert!(ledger.is_processed("A.CSV"));
        assert_eq!(ledger.state("B.CSV"), FileState::Unseen);
        assert_eq!(ledger.counts(), LedgerCounts { processed: 1, pending: 0 });

        let lines = std::fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().count(), 1);
    }

    #[test]
    fn test_inspect_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let mut ledger = Ledger::open(&path).unwrap();
        ledger.mark_pending([&export("A.CSV"), &export("B.CSV")], now()).unwrap();
        ledger.mark_processed(&export("A.CSV"), now()).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let counts = Ledger::inspect(&path).unwrap();

        assert_eq!(counts, LedgerCounts { processed: 1, pending: 1 });
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
        assert_eq!(Ledger::inspect(&dir.path().join("missing.jsonl")).unwrap(), LedgerCounts::default());
    }

    #[test]
    fn test_release_returns_pending_to_unseen() {
        let dir = TempDir::new().unwrap();
        let mut ledger = Ledger::open(dir.path().join("ledger.jsonl")).unwrap();
        let a = export("A.CSV");

        ledger.mark_pending([&a], now()).unwrap();
        assert_eq!(ledger.release([&a], now()).unwrap(), 1);
        assert_eq!(ledger.state("A.CSV"), FileState::Unseen);
        assert_eq!(ledger.release([&a], now()).unwrap(), 0);
    }

    #[test]
    fn test_mark_processed_twice_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let mut ledger = Ledger::open(&path).unwrap();
        let a = export("A.CSV");

        assert!(ledger.mark_processed(&a, now()).unwrap());
        let before = std::fs::read_to_string(&path).unwrap();
        assert!(!ledger.mark_processed(&a, now()).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn test_truncated_last_line_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        {
            let mut ledger = Ledger::open(&path).unwrap();
            ledger.mark_processed(&export("A.CSV"), now()).unwrap();
        }
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str(r#"{"name":"B.CSV","state":"proc"#);
        std::fs::write(&path, content).unwrap();

        let ledger = Ledger::open(&path).unwrap();
        assert!(ledger.is_processed("A.CSV"));
        assert!(!ledger.is_processed("B.CSV"));
        assert_eq!(ledger.counts(), LedgerCounts { processed: 1, pending: 0 });
    }

    #[test]
    fn test_repeated_failures_keep_file_bounded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let mut ledger = Ledger::open(&path).unwrap();
        let done = export("DONE.CSV");
        ledger.mark_processed(&done, now()).unwrap();
        let retried: Vec<_> = ["A.CSV", "B.CSV", "C.CSV", "D.CSV", "E.CSV"]
            .into_iter()
            .map(export)
            .collect();

        for _ in 0..100 {
            ledger.mark_pending(&retried, now()).unwrap();
            assert_eq!(ledger.release(&retried, now()).unwrap(), 5);
            let lines = std::fs::read_to_string(&path).unwrap().lines().count();
            assert!(lines <= COMPACT_MIN_LINES, "ledger grew to {lines} lines");
        }

        assert!(ledger.is_processed("DONE.CSV"));
        assert_eq!(ledger.state("A.CSV"), FileState::Unseen);

        ledger.mark_pending(&retried[..1], now()).unwrap();
        drop(ledger);
        let reopened = Ledger::open(&path).unwrap();
        assert!(reopened.is_processed("DONE.CSV"));
        assert_eq!(reopened.state("A.CSV"), FileState::Unseen);
    }
}
