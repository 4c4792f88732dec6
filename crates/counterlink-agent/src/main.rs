//! Counterlink - traffic counter export uploader

use anyhow::{Context, Result};
use clap::Parser;
use counterlink_agent::cli::{decode_command, parse_command, status_command, Cli, Command};
use counterlink_agent::config::AgentConfig;
use counterlink_agent::poll::PollLoop;
use counterlink_common::logging::{init_logging, LogConfig, LogLevel};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only `run` is chatty by default; the other commands print their own output.
    let log_level = match (&cli.command, cli.verbose) {
        (_, true) => LogLevel::Debug,
        (Command::Run { .. }, false) => LogLevel::Info,
        _ => LogLevel::Warn,
    };

    let log_config = LogConfig::with_level(log_level).merge_env()?;

    let _guard = init_logging(&log_config)?;

    match cli.command {
        Command::Run { config, once } => {
            let config = AgentConfig::load(config.as_deref()).context("Invalid configuration")?;
            run(config, once).await?;
        },
        Command::Parse { file, timezone } => {
            println!("{}", parse_command(&file, &timezone)?);
        },
        Command::Status { config } => {
            let config = AgentConfig::load(config.as_deref()).context("Invalid configuration")?;
            println!("{}", status_command(&config)?);
        },
        Command::Decode { payload, sha256 } => {
            println!("{}", decode_command(&payload, sha256.as_deref())?);
        },
    }

    Ok(())
}

async fn run(config: AgentConfig, once: bool) -> Result<()> {
    info!(
        location_id = config.location_id,
        server_url = %config.server_url,
        mount_root = %config.mount_root.display(),
        cleanup = %config.cleanup,
        "Starting counterlink agent"
    );

    let mut poll = PollLoop::from_config(&config)?;

    if once {
        let report = poll.run_cycle().await;
        info!(outcome = ?report.outcome, "Single cycle complete");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let listener = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    poll.run(shutdown).await;
    listener.abort();

    info!("Agent shut down gracefully");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing current cycle before exit");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing current cycle before exit");
        },
    }
}
