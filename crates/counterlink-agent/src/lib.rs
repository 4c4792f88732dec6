//! Counterlink Agent Library
//!
//! Moves traffic counter exports from a USB mass-storage device to a remote
//! ingestion endpoint over a metered cellular link.
//!
//! # Pipeline
//!
//! Every poll cycle runs the same stages in order:
//!
//! - **mount**: find where the counter is mounted right now
//! - **scanner**: list stable, unprocessed export files
//! - **parser**: turn each file into vehicle-passage records
//! - **batch**: gather the cycle's records into one batch
//! - **uploader**: send the compressed batch within the monthly byte budget
//! - **cleanup**: delete or archive the files the server acknowledged
//!
//! [`poll::PollLoop`] drives the stages; [`ledger::Ledger`] remembers which
//! files are done across restarts.
//!
//! # Example
//!
//! ```no_run
//! use counterlink_agent::config::AgentConfig;
//! use counterlink_agent::poll::PollLoop;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AgentConfig::load(None)?;
//!     let mut poll = PollLoop::from_config(&config)?;
//!     poll.run(CancellationToken::new()).await;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod batch;
pub mod budget;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod error;
pub mod ledger;
pub mod mount;
pub mod parser;
pub mod poll;
pub mod scanner;
pub mod uploader;

pub use error::{AgentError, Result};
