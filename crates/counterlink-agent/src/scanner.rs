//! File scanner
//!
//! Lists the export files sitting in the root of the counter's mount point.
//! Files the ledger already knows as processed are filtered out, and a file
//! is only handed on once it has stopped changing: the counter writes exports
//! in place, so a half-written file must wait for the next cycle.

use crate::error::{FileStale, ScanError, StaleReason};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Export format, chosen by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportDialect {
    /// Comma separated with an optional preamble
    Csv,
    /// Whitespace separated columns
    Prn,
    /// Binary memory dump; recognized but never parsed
    Dump,
}

impl ExportDialect {
    /// Dialect for a lowercase extension without the dot
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "csv" => Some(ExportDialect::Csv),
            "prn" => Some(ExportDialect::Prn),
            "dmp" => Some(ExportDialect::Dump),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportDialect::Csv => "csv",
            ExportDialect::Prn => "prn",
            ExportDialect::Dump => "dmp",
        }
    }
}

impl std::fmt::Display for ExportDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An export file discovered on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportFile {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub modified: SystemTime,
    pub dialect: ExportDialect,
}

impl ExportFile {
    /// Size and mtime, the parts of identity that change while writing
    fn fingerprint(&self) -> (u64, SystemTime) {
        (self.size, self.modified)
    }
}

/// Result of one directory scan
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Stable, unprocessed exports in lexicographic order
    pub ready: Vec<ExportFile>,
    /// Exports held back until a later cycle
    pub stale: Vec<FileStale>,
    /// Matching exports skipped because the ledger has them
    pub already_processed: usize,
}

/// Scans a mount point for export files
#[derive(Debug, Clone)]
pub struct FileScanner {
    extensions: Vec<String>,
    stability_window: Duration,
}

impl FileScanner {
    pub fn new(extensions: Vec<String>, stability_window: Duration) -> Self {
        Self {
            extensions: extensions.into_iter().map(|e| e.to_lowercase()).collect(),
            stability_window,
        }
    }

    /// List candidate exports under `mount`.
    ///
    /// `is_processed` is asked about every matching file name; those it
    /// accepts are left out of the result.
    pub async fn scan(
        &self,
        mount: &Path,
        is_processed: impl Fn(&str) -> bool,
    ) -> Result<ScanOutcome, ScanError> {
        let mut outcome = ScanOutcome::default();
        let mut candidates = Vec::new();

        for file in self.list(mount).await? {
            if is_processed(&file.file_name) {
                outcome.already_processed += 1;
                continue;
            }
            if file.size == 0 {
                outcome.stale.push(FileStale {
                    file: file.file_name,
                    reason: StaleReason::Empty,
                });
                continue;
            }
            candidates.push(file);
        }

        if !candidates.is_empty() && !self.stability_window.is_zero() {
            tokio::time::sleep(self.stability_window).await;

            let mut stable = Vec::with_capacity(candidates.len());
            for file in candidates {
                match stat(&file.path).await {
                    Some((size, modified)) if (size, modified) == file.fingerprint() => {
                        stable.push(file)
                    },
                    Some(_) => outcome.stale.push(FileStale {
                        file: file.file_name,
                        reason: StaleReason::StillChanging,
                    }),
                    None => debug!(file = %file.file_name, "Export vanished during stability check"),
                }
            }
            candidates = stable;
        }

        outcome.ready = candidates;
        Ok(outcome)
    }

    /// Every regular file with a recognized extension, sorted by name
    async fn list(&self, mount: &Path) -> Result<Vec<ExportFile>, ScanError> {
        let read_dir_err = |source| ScanError::ReadDir {
            path: mount.to_path_buf(),
            source,
        };
        let mut entries = tokio::fs::read_dir(mount).await.map_err(read_dir_err)?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(read_dir_err)? {
            let path = entry.path();
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                warn!(path = %path.display(), "Skipping export with a non UTF-8 name");
                continue;
            };
            let Some(dialect) = self.dialect_of(&file_name) else {
                continue;
            };
            // Follows symlinks, so a link to a regular file counts as one.
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(e) => {
                    debug!(file = %file_name, error = %e, "Could not stat export");
                    continue;
                },
            };

            files.push(ExportFile {
                path,
                file_name,
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                dialect,
            });
        }

        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(files)
    }

    fn dialect_of(&self, file_name: &str) -> Option<ExportDialect> {
        let (_, ext) = file_name.rsplit_once('.')?;
        let ext = ext.to_lowercase();
        if !self.extensions.contains(&ext) {
            return None;
        }
        ExportDialect::from_extension(&ext)
    }
}

async fn stat(path: &Path) -> Option<(u64, SystemTime)> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    Some((metadata.len(), metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH)))
}
