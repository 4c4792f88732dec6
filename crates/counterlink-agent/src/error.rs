//! Error types for the uploader agent
//!
//! Each pipeline stage owns a small error type. Row- and file-level problems
//! (`RecordFormatError`, `FileStale`, `ParseError`) are handled inside their
//! stage; everything that can end a cycle converts into [`AgentError`] and is
//! wrapped in a [`CycleError`] naming the stage it came from.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Umbrella error for anything that can abort a poll cycle or startup
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error("Payload encoding failed: {0}")]
    Payload(#[from] counterlink_common::CounterlinkError),

    #[error("HTTP client setup failed: {0}")]
    Client(#[source] reqwest::Error),
}

impl AgentError {
    /// Short machine-friendly name used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "config",
            AgentError::Scan(_) => "scan",
            AgentError::Parse(_) => "parse",
            AgentError::Upload(e) => e.kind(),
            AgentError::Ledger(_) => "ledger",
            AgentError::Budget(_) => "budget_state",
            AgentError::Cleanup(_) => "cleanup",
            AgentError::Payload(_) => "payload",
            AgentError::Client(_) => "client",
        }
    }
}

/// Configuration is missing, unreadable or invalid
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn invalid_value(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The counter's mass-storage device is not mounted anywhere we look.
///
/// A normal transient state: the counter is unplugged or still enumerating.
#[derive(Error, Debug)]
#[error("Counter device not mounted (checked {mount_root} and {media_root})")]
pub struct DeviceAbsent {
    pub mount_root: PathBuf,
    pub media_root: PathBuf,
}

/// Listing the mount point failed
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Failed to list {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a file was held back from this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// Zero bytes: the counter has created but not yet written it
    Empty,
    /// Size or modification time moved during the stability window
    StillChanging,
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleReason::Empty => write!(f, "file is empty"),
            StaleReason::StillChanging => write!(f, "file is still being written"),
        }
    }
}

/// A candidate export that is not safe to read yet; retried next cycle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Skipping {file}: {reason}")]
pub struct FileStale {
    pub file: String,
    pub reason: StaleReason,
}

/// What was wrong with a single export row
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowFault {
    #[error("row has no timestamp")]
    MissingTimestamp,

    #[error("unrecognized timestamp '{0}'")]
    BadTimestamp(String),

    #[error("timestamp year {0} outside 2000..=2099")]
    OutOfRange(i32),

    #[error("local time '{0}' does not exist in the source timezone")]
    NonexistentLocalTime(String),

    #[error("invalid vehicle count '{0}'")]
    BadCount(String),

    #[error("unreadable row: {0}")]
    Malformed(String),
}

/// A single export row that could not be turned into a record.
///
/// Counted and logged; never aborts the rest of the file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {fault}")]
pub struct RecordFormatError {
    pub line: u64,
    pub fault: RowFault,
}

impl RecordFormatError {
    pub fn new(line: u64, fault: RowFault) -> Self {
        Self { line, fault }
    }
}

/// File-level parse failure
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No parser for the {0} export dialect")]
    UnsupportedDialect(&'static str),
}

/// Upload attempt failed; the whole batch stays on the device for retry
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Monthly budget exhausted for {period}: payload of {needed} bytes, {remaining} bytes left")]
    BudgetExceeded {
        period: String,
        needed: u64,
        remaining: u64,
    },

    #[error("Upload timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    #[error("Could not connect to ingestion endpoint: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("Upload request failed: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Server rejected batch with status {status}")]
    Status { status: u16 },

    #[error("Server response could not be understood: {0}")]
    MalformedResponse(String),
}

impl UploadError {
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::BudgetExceeded { .. } => "budget_exceeded",
            UploadError::Timeout(_) => "timeout",
            UploadError::Connect(_) => "connect",
            UploadError::Network(_) => "network",
            UploadError::Status { .. } => "status",
            UploadError::MalformedResponse(_) => "malformed_response",
        }
    }

    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, UploadError::BudgetExceeded { .. })
    }
}

/// Persisting the monthly byte counter failed
#[derive(Error, Debug)]
pub enum BudgetError {
    #[error("Budget state I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt budget state in {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Reading or appending the processed-file ledger failed
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ledger entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Deleting or archiving an acknowledged export failed
#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("Failed to delete {path}: {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to archive {path} into {archive_dir}: {source}")]
    Archive {
        path: PathBuf,
        archive_dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Pipeline stage names, used in log fields and cycle errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Scan,
    Parse,
    /// Assembling and compressing the batch
    Batch,
    Upload,
    Cleanup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scan => "scan",
            Stage::Parse => "parse",
            Stage::Batch => "batch",
            Stage::Upload => "upload",
            Stage::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure caught at the poll loop boundary, with enough context to diagnose
#[derive(Error, Debug)]
#[error("{stage} stage failed{}: {source}", .file.as_deref().map(|f| format!(" on {f}")).unwrap_or_default())]
pub struct CycleError {
    pub stage: Stage,
    pub file: Option<String>,
    #[source]
    pub source: AgentError,
}

impl CycleError {
    pub fn new(stage: Stage, source: impl Into<AgentError>) -> Self {
        Self {
            stage,
            file: None,
            source: source.into(),
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn kind(&self) -> &'static str {
        self.source.kind()
    }
}
