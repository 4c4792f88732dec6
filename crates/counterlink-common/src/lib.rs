//! Counterlink Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the Counterlink workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the shared error type and result alias
//! - **Logging**: `tracing` subscriber setup shared by every binary
//! - **Checksums**: payload content hashes sent alongside uploads
//! - **Types**: vehicle-passage records, batches and the compact wire payload
//!
//! # Example
//!
//! ```no_run
//! use counterlink_common::types::Batch;
//! use counterlink_common::types::payload;
//!
//! fn ship(batch: &Batch) -> counterlink_common::Result<Vec<u8>> {
//!     let bytes = payload::compress(batch)?;
//!     let echoed = payload::decompress(&bytes)?;
//!     assert_eq!(&echoed, batch);
//!     Ok(bytes)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CounterlinkError, Result};
