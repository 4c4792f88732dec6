//! Build automation tasks for counterlink
//!
//! - `generate-cli-docs`: render the `counterlink` command reference

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for counterlink", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<counterlink_agent::cli::Cli>();

    let content = format!(
        r#"# counterlink CLI Reference

Generated from the CLI source code on {}.

## Overview

`counterlink` runs on a field unit next to a roadside traffic counter. It
watches for the counter's USB export to be mounted, parses new export files
into vehicle passage records, uploads them as one gzip JSON batch over a
metered cellular link, and removes files from the device only after the
server acknowledges them.

## Quick Start

```bash
# Parse an export locally without uploading
counterlink parse --timezone Europe/Berlin /media/usb/TRAX_0001.CSV

# Run one poll cycle against a config file
counterlink run --config /etc/counterlink/agent.toml --once

# Show delivered files and this month's byte budget
counterlink status --config /etc/counterlink/agent.toml
```

## Commands

{}

## Environment Variables

Every configuration key can be set as `COUNTERLINK_<KEY>`, for example
`COUNTERLINK_LOCATION_ID`, `COUNTERLINK_SERVER_URL` or
`COUNTERLINK_MONTHLY_BYTE_BUDGET`. Environment values override the TOML file.

Logging is controlled by `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT` and `LOG_DIR`.

## Example Configuration

```toml
location_id = 12
server_url = "https://ingest.example.net/pi_upload"
mount_root = "/mnt/usb"
source_timezone = "Europe/Berlin"
monthly_byte_budget = 52428800
cleanup = "archive"
archive_dir = "/var/lib/counterlink/archive"
state_dir = "/var/lib/counterlink"
```

---

*To update, run `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;

    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("✅ Generated CLI documentation at: {}", file_path.display());

    Ok(())
}
