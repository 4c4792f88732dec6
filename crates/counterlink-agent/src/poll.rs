//! Poll loop
//!
//! Drives locate → scan → parse → batch → upload → cleanup on a fixed
//! interval. The batch is sized to what is left of the monthly budget before
//! any file is marked pending; files that do not fit stay unseen.
//!
//! Each cycle is isolated: whatever fails is logged with its stage and file,
//! reported in the [`CycleReport`], and the loop goes back to sleep. Only a shutdown request ends [`PollLoop::run`], and only between
//! cycles or while sleeping.

use crate::batch::{BatchBuilder, PreparedBatch};
use crate::cleanup::{CleanupManager, Disposal};
use crate::config::AgentConfig;
use crate::error::{AgentError, CycleError, ParseError, Stage};
use crate::ledger::Ledger;
use crate::mount::MountLocator;
use crate::parser::RecordParser;
use crate::scanner::FileScanner;
use crate::uploader::Uploader;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Scanning,
    Uploading,
    Sleeping,
}

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleOutcome {
    /// The counter is not mounted
    DeviceAbsent,
    /// No new records to send
    #[default]
    NothingNew,
    /// The server acknowledged some or all files of the batch
    Uploaded { acknowledged: usize, retained: usize },
    /// The batch was not delivered and stays on the device
    UploadFailed,
    /// The monthly budget would be exceeded; nothing was sent
    BudgetDeferred,
    /// A stage failed before an upload was attempted
    Aborted,
}

/// Summary of one cycle
#[derive(Debug, Default)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// Unprocessed exports found ready on the device
    pub files_scanned: usize,
    /// Exports held back as empty or still being written
    pub files_stale: usize,
    pub files_parsed: usize,
    /// Exports held back because they do not fit the remaining budget
    pub files_deferred: usize,
    /// Records in the batch
    pub records: usize,
    pub rows_rejected: usize,
    /// Bytes charged against the budget this cycle
    pub bytes_sent: u64,
    pub errors: Vec<CycleError>,
}

impl CycleReport {
    fn fail(&mut self, err: CycleError) {
        error!(
            stage = %err.stage,
            file = err.file.as_deref().unwrap_or("-"),
            kind = err.kind(),
            error = %err.source,
            "Cycle stage failed"
        );
        self.errors.push(err);
    }
}

/// The agent's main loop and the pipeline components it owns
pub struct PollLoop {
    locator: MountLocator,
    scanner: FileScanner,
    parser: RecordParser,
    builder: BatchBuilder,
    uploader: Uploader,
    cleanup: CleanupManager,
    ledger: Ledger,
    poll_interval: Duration,
    device_retry: Duration,
    state: LoopState,
    /// Last batch the server did not confirm, reused if nothing changed
    unacknowledged: Option<PreparedBatch>,
}

impl PollLoop {
    /// Wire up every component from a validated configuration
    pub fn from_config(config: &AgentConfig) -> Result<Self, AgentError> {
        Ok(Self {
            locator: MountLocator::from_config(config),
            scanner: FileScanner::new(config.extensions.clone(), config.stability_window()),
            parser: RecordParser::new(config.timezone()?),
            builder: BatchBuilder::new(config.location_id),
            uploader: Uploader::from_config(config)?,
            cleanup: CleanupManager::new(Disposal::from_config(config)),
            ledger: Ledger::open(config.ledger_path())?,
            poll_interval: config.poll_interval(),
            device_retry: config.device_retry(),
            state: LoopState::Idle,
            unacknowledged: None,
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    /// Poll until `shutdown` is cancelled
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            device_retry_secs = self.device_retry.as_secs(),
            "Poll loop started"
        );

        while !shutdown.is_cancelled() {
            let report = self.run_cycle().await;

            let pause = match report.outcome {
                CycleOutcome::DeviceAbsent => self.device_retry,
                _ => self.poll_interval,
            };
            debug!(seconds = pause.as_secs(), "Sleeping until next cycle");

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {},
            }
            self.state = LoopState::Idle;
        }

        info!("Poll loop stopped");
    }

    /// Run one cycle against the current wall clock
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle as if it were `now` (budget periods, ledger times)
    #[tracing::instrument(name = "poll_cycle", skip_all, fields(at = %now))]
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();
        self.state = LoopState::Scanning;
        self.cycle(now, &mut report).await;
        self.state = LoopState::Sleeping;

        info!(
            outcome = ?report.outcome,
            files = report.files_scanned,
            stale = report.files_stale,
            records = report.records,
            rejected = report.rows_rejected,
            bytes_sent = report.bytes_sent,
            errors = report.errors.len(),
            "Poll cycle finished"
        );
        report
    }

    async fn cycle(&mut self, now: DateTime<Utc>, report: &mut CycleReport) {
        let mount = match self.locator.locate() {
            Ok(mount) => mount,
            Err(absent) => {
                info!(%absent, "Counter not mounted, skipping cycle");
                report.outcome = CycleOutcome::DeviceAbsent;
                return;
            },
        };
        debug!(mount = %mount.display(), "Counter mounted");

        let ledger = &self.ledger;
        let scan = match self.scanner.scan(&mount, |name| ledger.is_processed(name)).await {
            Ok(scan) => scan,
            Err(e) => {
                report.fail(CycleError::new(Stage::Scan, e));
                report.outcome = CycleOutcome::Aborted;
                return;
            },
        };
        for stale in &scan.stale {
            info!(file = %stale.file, reason = %stale.reason, "Export not ready, retrying next cycle");
        }
        report.files_scanned = scan.ready.len();
        report.files_stale = scan.stale.len();

        let mut parsed_files = Vec::with_capacity(scan.ready.len());
        for file in scan.ready {
            let parsed = match self.parser.parse(&file) {
                Ok(parsed) => parsed,
                Err(ParseError::UnsupportedDialect(dialect)) => {
                    warn!(file = %file.file_name, dialect, "No parser for export dialect, leaving it on the device");
                    continue;
                },
                Err(e) => {
                    report.fail(CycleError::new(Stage::Parse, e).with_file(&file.file_name));
                    continue;
                },
            };
            report.files_parsed += 1;
            report.rows_rejected += parsed.rejected.len();
            for rejected in &parsed.rejected {
                warn!(file = %file.file_name, line = rejected.line, fault = %rejected.fault, "Skipping malformed row");
            }

            if parsed.records.is_empty() {
                warn!(file = %file.file_name, rejected = parsed.rejected.len(), "Export yielded no records");
                if let Err(e) = self.cleanup.mark_empty(&file, &mut self.ledger, now) {
                    report.fail(CycleError::new(Stage::Cleanup, e).with_file(&file.file_name));
                }
                continue;
            }
            parsed_files.push((file, parsed.records));
        }

        let ceiling = self.uploader.sendable_bytes(now);
        let plan = match self
            .builder
            .build(parsed_files, now, self.unacknowledged.as_ref(), ceiling)
        {
            Ok(plan) => plan,
            Err(e) => {
                report.fail(CycleError::new(Stage::Batch, e));
                report.outcome = CycleOutcome::Aborted;
                return;
            },
        };

        report.files_deferred = plan.deferred.len();
        if !plan.deferred.is_empty() {
            // Each file was tried alone against an untouched budget.
            let hopeless = plan.prepared.is_none() && self.uploader.budget().used(now) == 0;
            for file in &plan.deferred {
                if hopeless {
                    error!(file = %file.file_name, ceiling, "Export alone exceeds the monthly byte budget");
                } else {
                    warn!(file = %file.file_name, ceiling, "Export deferred until the budget allows it");
                }
            }
        }

        let Some(prepared) = plan.prepared else {
            report.outcome = if !plan.deferred.is_empty() {
                CycleOutcome::BudgetDeferred
            } else if report.errors.is_empty() {
                self.unacknowledged = None;
                CycleOutcome::NothingNew
            } else {
                self.unacknowledged = None;
                CycleOutcome::Aborted
            };
            return;
        };
        report.records = prepared.batch.len();

        self.state = LoopState::Uploading;
        if let Err(e) = self.ledger.mark_pending(&prepared.files, now) {
            report.fail(CycleError::new(Stage::Upload, e));
            report.outcome = CycleOutcome::Aborted;
            return;
        }

        info!(
            batch_id = %prepared.batch.batch_id,
            files = prepared.files.len(),
            records = prepared.batch.len(),
            vehicles = prepared.batch.vehicle_total(),
            bytes = prepared.payload.len(),
            deferred = report.files_deferred,
            "Uploading batch"
        );
        debug!(per_file = ?prepared.batch.records_per_file(), "Batch composition");
        let used_before = self.uploader.budget().used(now);
        let result = self.uploader.upload(&prepared.batch, &prepared.payload, now).await;
        report.bytes_sent = self.uploader.budget().used(now).saturating_sub(used_before);

        match result {
            Ok(result) => {
                self.unacknowledged = None;
                match self.cleanup.apply(&prepared, &result.ack, &mut self.ledger, now) {
                    Ok(cleanup) => {
                        for failure in cleanup.failures {
                            report.fail(CycleError::new(Stage::Cleanup, failure));
                        }
                        if let Err(e) = self.ledger.release(&cleanup.retained, now) {
                            report.fail(CycleError::new(Stage::Cleanup, e));
                        }
                        if !cleanup.retained.is_empty() {
                            info!(
                                retained = cleanup.retained.len(),
                                "Server acknowledged part of the batch, keeping the rest"
                            );
                        }
                        report.outcome = CycleOutcome::Uploaded {
                            acknowledged: cleanup.acknowledged.len(),
                            retained: cleanup.retained.len(),
                        };
                    },
                    Err(e) => {
                        report.fail(CycleError::new(Stage::Cleanup, e));
                        report.outcome = CycleOutcome::Aborted;
                    },
                }
            },
            Err(e) => {
                let deferred = e.is_budget_exceeded();
                if deferred {
                    warn!(error = %e, "Upload deferred until the budget resets");
                } else {
                    report.fail(CycleError::new(Stage::Upload, e));
                }
                self.retain(prepared, now, report);
                report.outcome = if deferred {
                    CycleOutcome::BudgetDeferred
                } else {
                    CycleOutcome::UploadFailed
                };
            },
        }
    }

    /// Keep a batch for the next cycle after a failed or deferred upload
    fn retain(&mut self, prepared: PreparedBatch, now: DateTime<Utc>, report: &mut CycleReport) {
        if let Err(e) = self.ledger.release(&prepared.files, now) {
            report.fail(CycleError::new(Stage::Upload, e));
        }
        self.unacknowledged = Some(prepared);
    }
}
