//! Error types for Counterlink

use thiserror::Error;

/// Result type alias for Counterlink operations
pub type Result<T> = std::result::Result<T, CounterlinkError>;

/// Main error type shared across the workspace
#[derive(Error, Debug)]
pub enum CounterlinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}
