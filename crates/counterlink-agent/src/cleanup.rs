//! Cleanup manager
//!
//! Acts on a positive acknowledgment only: each acknowledged export is
//! removed from the device (deleted, or moved to the archive directory) and
//! recorded as processed. Nothing else ever deletes an export.

use crate::batch::PreparedBatch;
use crate::config::{AgentConfig, CleanupMode};
use crate::error::{CleanupError, LedgerError};
use crate::ledger::Ledger;
use crate::scanner::ExportFile;
use crate::uploader::Acknowledgment;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// How acknowledged exports leave the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposal {
    Delete,
    Archive(PathBuf),
}

impl Disposal {
    pub fn from_config(config: &AgentConfig) -> Self {
        match (config.cleanup, &config.archive_dir) {
            (CleanupMode::Archive, Some(dir)) => Disposal::Archive(dir.clone()),
            _ => Disposal::Delete,
        }
    }
}

/// What one cleanup pass did
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Acknowledged files now recorded as processed
    pub acknowledged: Vec<String>,
    /// Files of the batch the server did not confirm
    pub retained: Vec<ExportFile>,
    /// Disposal failures; the files were still recorded as processed
    pub failures: Vec<CleanupError>,
}

#[derive(Debug, Clone)]
pub struct CleanupManager {
    disposal: Disposal,
}

impl CleanupManager {
    pub fn new(disposal: Disposal) -> Self {
        Self { disposal }
    }

    /// Dispose of and record every file `ack` covers; keep the rest
    pub fn apply(
        &self,
        prepared: &PreparedBatch,
        ack: &Acknowledgment,
        ledger: &mut Ledger,
        now: DateTime<Utc>,
    ) -> Result<CleanupReport, LedgerError> {
        let mut report = CleanupReport::default();

        for file in &prepared.files {
            if !ack.covers(&file.file_name) {
                report.retained.push(file.clone());
                continue;
            }

            if ledger.is_processed(&file.file_name) {
                continue;
            }

            match self.dispose(file) {
                Ok(Some(destination)) => {
                    info!(file = %file.file_name, to = %destination.display(), "Archived export")
                },
                Ok(None) => info!(file = %file.file_name, "Deleted export"),
                Err(e) => {
                    error!(file = %file.file_name, error = %e, "Failed to remove acknowledged export");
                    report.failures.push(e);
                },
            }

            ledger.mark_processed(file, now)?;
            report.acknowledged.push(file.file_name.clone());
        }

        Ok(report)
    }

    /// Record a file that produced no records; it stays on the device
    pub fn mark_empty(
        &self,
        file: &ExportFile,
        ledger: &mut Ledger,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let newly = ledger.mark_processed(file, now)?;
        if newly {
            info!(file = %file.file_name, "Export has no records, marked processed and left on device");
        }
        Ok(newly)
    }

    /// Returns the archive destination, or `None` when deleted
    fn dispose(&self, file: &ExportFile) -> Result<Option<PathBuf>, CleanupError> {
        match &self.disposal {
            Disposal::Delete => match std::fs::remove_file(&file.path) {
                Ok(()) => Ok(None),
                // Already gone, e.g. removed by hand.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(source) => Err(CleanupError::Delete {
                    path: file.path.clone(),
                    source,
                }),
            },
            Disposal::Archive(dir) => archive(&file.path, &file.file_name, dir)
                .map(Some)
                .map_err(|source| CleanupError::Archive {
                    path: file.path.clone(),
                    archive_dir: dir.clone(),
                    source,
                }),
        }
    }
}

fn archive(path: &Path, file_name: &str, dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let destination = free_name(dir, file_name);

    if std::fs::rename(path, &destination).is_err() {
        // Different filesystem: the archive usually lives on the SD card.
        std::fs::copy(path, &destination)?;
        std::fs::remove_file(path)?;
    }
    Ok(destination)
}

/// `dir/name`, or `dir/stem.N.ext` for the first free N
fn free_name(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) => (stem, format!(".{ext}")),
        None => (file_name, String::new()),
    };
    (1u32..)
        .map(|n| dir.join(format!("{stem}.{n}{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}
