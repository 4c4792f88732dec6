//! Command-line interface
//!
//! The clap definitions live in the library so `xtask` can render them into
//! the CLI reference.

use crate::budget::{period_of, ByteBudget};
use crate::config::AgentConfig;
use crate::error::ConfigError;
use crate::ledger::Ledger;
use crate::parser::RecordParser;
use anyhow::{Context, Result};
use chrono::Utc;
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use counterlink_common::checksum::verify_payload;
use counterlink_common::types::payload;
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "counterlink")]
#[command(author, version, about = "Uploads traffic counter exports from a USB device")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the poll loop until interrupted
    Run {
        /// TOML configuration file
        #[arg(short, long, env = "COUNTERLINK_CONFIG")]
        config: Option<PathBuf>,

        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Parse one export file and print its records as JSON
    Parse {
        /// Export file (.csv, .prn)
        file: PathBuf,

        /// IANA timezone of the counter's clock
        #[arg(short, long, default_value = "UTC")]
        timezone: String,
    },

    /// Show ledger and budget state
    Status {
        /// TOML configuration file
        #[arg(short, long, env = "COUNTERLINK_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Decode a gzip upload payload back to JSON
    Decode {
        /// Payload file as sent to the server
        payload: PathBuf,

        /// Expected hex SHA-256 of the payload
        #[arg(long)]
        sha256: Option<String>,
    },
}

/// `counterlink parse`
pub fn parse_command(file: &Path, timezone: &str) -> Result<String> {
    let tz: Tz = timezone
        .parse()
        .map_err(|_| ConfigError::invalid_value("timezone", timezone))?;
    let parsed = RecordParser::new(tz)
        .parse_path(file)
        .with_context(|| format!("Failed to parse {}", file.display()))?;

    Ok(serde_json::to_string_pretty(&parsed)?)
}

/// `counterlink status`
pub fn status_command(config: &AgentConfig) -> Result<String> {
    let now = Utc::now();
    let ledger = Ledger::inspect(&config.ledger_path())?;
    let budget = ByteBudget::open(config.budget_path(), config.monthly_byte_budget)?;

    let status = json!({
        "location_id": config.location_id,
        "server_url": config.server_url,
        "state_dir": config.state_dir,
        "files": {
            "processed": ledger.processed,
            "pending": ledger.pending,
        },
        "budget": {
            "period": period_of(now),
            "used_bytes": budget.used(now),
            "limit_bytes": budget.limit(),
            "remaining_bytes": budget.remaining(now),
        },
    });
    Ok(serde_json::to_string_pretty(&status)?)
}

/// `counterlink decode`
pub fn decode_command(path: &Path, sha256: Option<&str>) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if let Some(expected) = sha256 {
        verify_payload(&bytes, expected)?;
    }
    let batch = payload::decompress(&bytes)?;

    Ok(serde_json::to_string_pretty(&batch)?)
}
