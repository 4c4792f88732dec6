//! Monthly upload byte budget
//!
//! The cellular plan allows a fixed number of bytes per calendar month. The
//! running total is persisted after every charge so a restart cannot reset
//! it. Periods are UTC months (`YYYY-MM`); a new month starts from zero.

use crate::error::{BudgetError, UploadError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetState {
    /// `YYYY-MM`, UTC
    pub period: String,
    pub bytes_sent: u64,
}

/// Persistent byte counter for the current period
#[derive(Debug)]
pub struct ByteBudget {
    path: PathBuf,
    limit: u64,
    state: BudgetState,
}

pub fn period_of(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

impl ByteBudget {
    /// Load the counter from `path`, starting empty if the file is missing
    pub fn open(path: impl Into<PathBuf>, limit: u64) -> Result<Self, BudgetError> {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| BudgetError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BudgetState {
                period: String::new(),
                bytes_sent: 0,
            },
            Err(source) => return Err(BudgetError::Io { path, source }),
        };

        Ok(Self { path, limit, state })
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes sent in the period containing `now`
    pub fn used(&self, now: DateTime<Utc>) -> u64 {
        if self.state.period == period_of(now) {
            self.state.bytes_sent
        } else {
            0
        }
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> u64 {
        self.limit.saturating_sub(self.used(now))
    }

    /// Refuse a send of `needed` bytes that would overrun this period
    pub fn check(&self, needed: u64, now: DateTime<Utc>) -> Result<(), UploadError> {
        let remaining = self.remaining(now);
        if needed > remaining {
            return Err(UploadError::BudgetExceeded {
                period: period_of(now),
                needed,
                remaining,
            });
        }
        Ok(())
    }

    /// Add `bytes` to the period containing `now` and persist
    pub fn charge(&mut self, bytes: u64, now: DateTime<Utc>) -> Result<(), BudgetError> {
        let period = period_of(now);
        if self.state.period != period {
            if !self.state.period.is_empty() {
                info!(
                    previous = %self.state.period,
                    period = %period,
                    previous_bytes = self.state.bytes_sent,
                    "Budget period rolled over"
                );
            }
            self.state = BudgetState { period, bytes_sent: 0 };
        }

        self.state.bytes_sent = self.state.bytes_sent.saturating_add(bytes);
        if self.state.bytes_sent > self.limit {
            warn!(
                period = %self.state.period,
                bytes_sent = self.state.bytes_sent,
                limit = self.limit,
                "Monthly byte budget overrun"
            );
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), BudgetError> {
        let io_err = |source| BudgetError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_vec_pretty(&self.state).map_err(|source| BudgetError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        let tmp = tmp_path(&self.path);
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
