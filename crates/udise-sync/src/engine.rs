//! Fetch orchestrator: analysis, chunked fan-out, buffered saves and the
//! pause/resume/cancel state machine.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use udise_adapters::{parse_identifiers, SchoolSource, SourceError, SourceFile, SourceFileError};
use udise_core::{AcademicYear, FlatRecord, LogEvent, SyncJob, SyncStatus};
use udise_storage::{GatewayError, PersistenceGateway};
use uuid::Uuid;

use crate::config::SyncTuning;
use crate::events::EventSink;
use crate::filter::filter_pending;
use crate::report::write_run_report;
use crate::transform::{fetch_school, FailureKind, RecordFailure};
use crate::SyncRunSummary;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source file invalid: {0}")]
    SourceFileInvalid(#[from] SourceFileError),
    #[error("no academic year selected")]
    NoYearSelected,
    #[error("existence check failed: {0}")]
    Gateway(#[from] GatewayError),
    #[error("source API error: {0}")]
    Source(#[from] SourceError),
    #[error("cannot {action} while {status}")]
    InvalidTransition {
        action: &'static str,
        status: SyncStatus,
    },
}

/// Result of the analysis phase, shown to the operator before confirming.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub academic_year: AcademicYear,
    pub total_identifiers: usize,
    pub skipped_duplicates: usize,
    pub pending: Vec<String>,
    pub sample: Vec<FlatRecord>,
    pub sample_failures: Vec<RecordFailure>,
}

impl AnalysisReport {
    pub fn ready_to_sync(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[derive(Debug)]
struct PreparedRun {
    year: AcademicYear,
    pending: Vec<String>,
    total_identifiers: usize,
    skipped_duplicates: usize,
}

#[derive(Debug, Default)]
struct RunTally {
    processed: usize,
    saved: usize,
    chunks: usize,
    save_batches: usize,
    failed_batches: usize,
    lost_records: usize,
    failures: Vec<RecordFailure>,
}

pub struct SyncEngine {
    source: Arc<dyn SchoolSource>,
    gateway: Arc<dyn PersistenceGateway>,
    events: Arc<dyn EventSink>,
    tuning: SyncTuning,
    reports_dir: Option<PathBuf>,
    job: watch::Sender<SyncJob>,
    prepared: Mutex<Option<PreparedRun>>,
    sample: Mutex<Vec<FlatRecord>>,
    last_summary: Mutex<Option<SyncRunSummary>>,
    cancel: StdMutex<CancellationToken>,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn SchoolSource>,
        gateway: Arc<dyn PersistenceGateway>,
        events: Arc<dyn EventSink>,
        tuning: SyncTuning,
    ) -> Self {
        let (job, _) = watch::channel(SyncJob::default());
        Self {
            source,
            gateway,
            events,
            tuning,
            reports_dir: None,
            job,
            prepared: Mutex::new(None),
            sample: Mutex::new(Vec::new()),
            last_summary: Mutex::new(None),
            cancel: StdMutex::new(CancellationToken::new()),
        }
    }

    pub fn with_reports_dir(mut self, reports_dir: Option<PathBuf>) -> Self {
        self.reports_dir = reports_dir;
        self
    }

    pub fn tuning(&self) -> &SyncTuning {
        &self.tuning
    }

    pub fn snapshot(&self) -> SyncJob {
        self.job.borrow().clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.job.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncJob> {
        self.job.subscribe()
    }

    pub async fn sample(&self) -> Vec<FlatRecord> {
        self.sample.lock().await.clone()
    }

    pub async fn last_summary(&self) -> Option<SyncRunSummary> {
        self.last_summary.lock().await.clone()
    }

    pub async fn academic_years(&self) -> Result<Vec<AcademicYear>, SyncError> {
        Ok(self.source.academic_years().await?)
    }

    /// Parses `file`, filters out stored identifiers and previews a sample.
    pub async fn analyze(
        &self,
        file: &SourceFile,
        year: AcademicYear,
    ) -> Result<AnalysisReport, SyncError> {
        self.begin_analysis()?;
        let result = match parse_identifiers(file) {
            Ok(identifiers) => {
                self.emit(LogEvent::info(format!(
                    "Extracted {} UDISE codes from {}",
                    identifiers.len(),
                    file.name
                )));
                self.analyze_codes(identifiers, year).await
            }
            Err(err) => Err(err.into()),
        };
        self.finish_analysis(result)
    }

    /// Same as [`SyncEngine::analyze`] for an already extracted list.
    pub async fn analyze_identifiers(
        &self,
        identifiers: Vec<String>,
        year: AcademicYear,
    ) -> Result<AnalysisReport, SyncError> {
        self.begin_analysis()?;
        let identifiers = identifiers
            .into_iter()
            .map(|code| code.trim().to_string())
            .filter(|code| !code.is_empty())
            .collect::<Vec<_>>();
        let result = if identifiers.is_empty() {
            Err(SourceFileError::Empty.into())
        } else {
            self.analyze_codes(identifiers, year).await
        };
        self.finish_analysis(result)
    }

    fn begin_analysis(&self) -> Result<(), SyncError> {
        self.transition("analyze", &[SyncStatus::Idle, SyncStatus::ReadyToSync], |job| {
            *job = SyncJob {
                status: SyncStatus::Analyzing,
                ..SyncJob::default()
            };
        })?;
        self.events.start_segment();
        Ok(())
    }

    fn finish_analysis(
        &self,
        result: Result<AnalysisReport, SyncError>,
    ) -> Result<AnalysisReport, SyncError> {
        if let Err(err) = &result {
            self.emit(LogEvent::error(format!("Analysis failed: {err}")));
            self.job.send_replace(SyncJob::default());
        }
        result
    }

    async fn analyze_codes(
        &self,
        identifiers: Vec<String>,
        year: AcademicYear,
    ) -> Result<AnalysisReport, SyncError> {
        if year.year_desc.trim().is_empty() {
            return Err(SyncError::NoYearSelected);
        }
        self.prepared.lock().await.take();
        self.sample.lock().await.clear();

        let set = filter_pending(self.gateway.as_ref(), &identifiers, &year).await?;
        let total_identifiers = set.pending.len() + set.duplicates;
        self.emit(LogEvent::info(format!(
            "Analysis for {year}: {total_identifiers} unique codes, {} already stored, {} pending",
            set.duplicates,
            set.pending.len()
        )));
        self.job.send_modify(|job| {
            job.total_identifiers = total_identifiers;
            job.skipped_duplicate_count = set.duplicates;
            job.pending_identifiers = set.pending.clone();
        });

        if set.pending.is_empty() {
            self.emit(LogEvent::success(format!(
                "All records already exist for {year}; nothing to sync"
            )));
            self.job.send_replace(SyncJob::default());
            return Ok(AnalysisReport {
                academic_year: year,
                total_identifiers,
                skipped_duplicates: set.duplicates,
                pending: Vec::new(),
                sample: Vec::new(),
                sample_failures: Vec::new(),
            });
        }

        let sample_len = self.tuning.sample_size.min(set.pending.len());
        self.emit(LogEvent::info(format!(
            "Fetching preview sample of {sample_len} schools"
        )));
        let mut sample = Vec::new();
        let mut sample_failures = Vec::new();
        let mut tally = RunTally::default();
        self.fetch_chunk(&set.pending[..sample_len], &year, &mut sample, &mut tally, false)
            .await;
        sample_failures.append(&mut tally.failures);

        *self.sample.lock().await = sample.clone();
        *self.prepared.lock().await = Some(PreparedRun {
            year: year.clone(),
            pending: set.pending.clone(),
            total_identifiers,
            skipped_duplicates: set.duplicates,
        });
        self.job.send_modify(|job| job.status = SyncStatus::ReadyToSync);
        self.emit(LogEvent::info(format!(
            "Ready to sync {} schools",
            set.pending.len()
        )));

        Ok(AnalysisReport {
            academic_year: year,
            total_identifiers,
            skipped_duplicates: set.duplicates,
            pending: set.pending,
            sample,
            sample_failures,
        })
    }

    /// Drops a prepared run without syncing it.
    pub async fn reset(&self) -> Result<(), SyncError> {
        self.transition("reset", &[SyncStatus::Idle, SyncStatus::ReadyToSync], |job| {
            *job = SyncJob::default();
        })?;
        self.prepared.lock().await.take();
        Ok(())
    }

    /// Runs the prepared sync to completion or cancellation.
    pub async fn confirm(&self) -> Result<SyncRunSummary, SyncError> {
        let prepared = {
            let mut slot = self.prepared.lock().await;
            let status = self.status();
            if status != SyncStatus::ReadyToSync {
                return Err(SyncError::InvalidTransition {
                    action: "confirm",
                    status,
                });
            }
            let Some(prepared) = slot.take() else {
                return Err(SyncError::InvalidTransition {
                    action: "confirm",
                    status,
                });
            };
            prepared
        };

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        self.job.send_modify(|job| {
            job.status = SyncStatus::Syncing;
            job.processed_count = 0;
            job.saved_count = 0;
            job.failed_count = 0;
            job.current_chunk_index = 0;
        });

        let summary = self.run(prepared, token).await;

        if let Some(root) = &self.reports_dir {
            match write_run_report(root, &summary).await {
                Ok(dir) => info!(run_id = %summary.run_id, dir = %dir.display(), "run report written"),
                Err(err) => warn!(run_id = %summary.run_id, error = %err, "failed to write run report"),
            }
        }
        *self.last_summary.lock().await = Some(summary.clone());
        self.job.send_replace(SyncJob::default());
        Ok(summary)
    }

    /// Takes effect at the next chunk boundary; in-flight fetches finish.
    pub fn pause(&self) -> Result<(), SyncError> {
        self.transition("pause", &[SyncStatus::Syncing], |job| {
            job.status = SyncStatus::Paused;
        })?;
        self.emit(LogEvent::info("Sync paused; in-flight schools will finish"));
        Ok(())
    }

    pub fn resume(&self) -> Result<(), SyncError> {
        self.transition("resume", &[SyncStatus::Paused], |job| {
            job.status = SyncStatus::Syncing;
        })?;
        self.emit(LogEvent::info("Sync resumed"));
        Ok(())
    }

    pub fn cancel(&self) -> Result<(), SyncError> {
        let status = self.status();
        if !matches!(status, SyncStatus::Syncing | SyncStatus::Paused) {
            return Err(SyncError::InvalidTransition {
                action: "cancel",
                status,
            });
        }
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        self.emit(LogEvent::info("Cancellation requested"));
        Ok(())
    }

    async fn run(&self, prepared: PreparedRun, token: CancellationToken) -> SyncRunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let chunk_size = self.tuning.chunk_size.max(1);
        let chunk_count = prepared.pending.len().div_ceil(chunk_size);
        info!(%run_id, pending = prepared.pending.len(), chunk_count, "sync run started");
        self.emit(LogEvent::info(format!(
            "Starting sync of {} schools for {} in {chunk_count} chunks",
            prepared.pending.len(),
            prepared.year
        )));

        let mut tally = RunTally::default();
        let mut buffer = Vec::new();
        let mut outcome = SyncStatus::Complete;

        for (index, chunk) in prepared.pending.chunks(chunk_size).enumerate() {
            if token.is_cancelled() || !self.wait_while_paused(&token).await {
                outcome = SyncStatus::Cancelled;
                break;
            }
            if index > 0 && !self.sleep_unless_cancelled(&token, self.tuning.step_delay()).await {
                outcome = SyncStatus::Cancelled;
                break;
            }

            self.job.send_modify(|job| job.current_chunk_index = index);
            self.fetch_chunk(chunk, &prepared.year, &mut buffer, &mut tally, true)
                .await;
            tally.chunks += 1;

            if token.is_cancelled() {
                outcome = SyncStatus::Cancelled;
                break;
            }
            let is_last = index + 1 == chunk_count;
            if buffer.len() >= self.tuning.save_batch_size || (is_last && !buffer.is_empty()) {
                self.flush(&mut buffer, &mut tally).await;
            }
        }

        if outcome == SyncStatus::Cancelled {
            self.emit(LogEvent::info(format!(
                "Sync cancelled by user; {} unsaved records discarded, {} saved",
                buffer.len(),
                tally.saved
            )));
        } else {
            self.emit(LogEvent::success(format!(
                "Sync complete: {} saved, {} failed, {} already stored",
                tally.saved,
                tally.failures.len(),
                prepared.skipped_duplicates
            )));
        }
        self.job.send_modify(|job| job.status = outcome);
        info!(%run_id, %outcome, saved = tally.saved, "sync run finished");

        SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            academic_year: prepared.year,
            outcome,
            total_identifiers: prepared.total_identifiers,
            skipped_duplicates: prepared.skipped_duplicates,
            pending: prepared.pending.len(),
            processed: tally.processed,
            saved: tally.saved,
            failed: tally.failures.len(),
            chunks: tally.chunks,
            save_batches: tally.save_batches,
            failed_batches: tally.failed_batches,
            lost_records: tally.lost_records,
            failures: tally.failures,
        }
    }

    /// Fans out one chunk; every identifier settles before this returns.
    async fn fetch_chunk(
        &self,
        codes: &[String],
        year: &AcademicYear,
        buffer: &mut Vec<FlatRecord>,
        tally: &mut RunTally,
        publish: bool,
    ) {
        let source = self.source.as_ref();
        let mut in_flight = codes
            .iter()
            .map(|code| async move { (code, fetch_school(source, code, year).await) })
            .collect::<FuturesUnordered<_>>();

        while let Some((code, result)) = in_flight.next().await {
            let failed = match result {
                Ok(school) => {
                    for missing in &school.unavailable {
                        self.emit(
                            LogEvent::error(format!(
                                "CategoryUnavailable: {} for {code}: {}",
                                missing.category, missing.reason
                            ))
                            .for_school(code.as_str(), missing.category.name()),
                        );
                    }
                    buffer.push(school.record);
                    false
                }
                Err(failure) => {
                    let label = match failure.kind {
                        FailureKind::SourceNotFound => "SourceNotFound",
                        FailureKind::Transport => "SourceUnavailable",
                    };
                    self.emit(
                        LogEvent::error(format!("{label}: {}", failure.message))
                            .for_school(code.as_str(), failure.stage.name()),
                    );
                    tally.failures.push(failure);
                    true
                }
            };
            tally.processed += 1;
            if publish {
                self.job.send_modify(|job| {
                    job.processed_count += 1;
                    if failed {
                        job.failed_count += 1;
                    }
                });
            }
        }
    }

    async fn flush(&self, buffer: &mut Vec<FlatRecord>, tally: &mut RunTally) {
        let batch = std::mem::take(buffer);
        tally.save_batches += 1;
        match self.gateway.save_records(&batch).await {
            Ok(receipt) if receipt.success => {
                tally.saved += receipt.count;
                self.job.send_modify(|job| job.saved_count += receipt.count);
                if receipt.count < batch.len() {
                    self.emit(LogEvent::info(format!(
                        "{} of {} records were already stored",
                        batch.len() - receipt.count,
                        batch.len()
                    )));
                }
                self.emit(LogEvent::success(format!(
                    "Progress: saved {} records ({} total)",
                    receipt.count, tally.saved
                )));
            }
            Ok(_) => self.record_lost_batch(batch.len(), "backend reported failure", tally),
            Err(err) => self.record_lost_batch(batch.len(), &err.to_string(), tally),
        }
    }

    fn record_lost_batch(&self, size: usize, reason: &str, tally: &mut RunTally) {
        tally.failed_batches += 1;
        tally.lost_records += size;
        warn!(batch = size, reason, "save batch lost");
        self.emit(LogEvent::error(format!(
            "PersistenceBatchFailure: {size} records not saved: {reason}"
        )));
    }

    /// Returns false when cancelled while paused.
    async fn wait_while_paused(&self, token: &CancellationToken) -> bool {
        while self.status() == SyncStatus::Paused {
            if !self.sleep_unless_cancelled(token, self.tuning.pause_poll()).await {
                return false;
            }
        }
        !token.is_cancelled()
    }

    async fn sleep_unless_cancelled(&self, token: &CancellationToken, delay: Duration) -> bool {
        if delay.is_zero() {
            return !token.is_cancelled();
        }
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Applies `update` only when the current status is one of `allowed`.
    fn transition(
        &self,
        action: &'static str,
        allowed: &[SyncStatus],
        update: impl FnOnce(&mut SyncJob),
    ) -> Result<(), SyncError> {
        let mut outcome = Ok(());
        self.job.send_if_modified(|job| {
            if !allowed.contains(&job.status) {
                outcome = Err(SyncError::InvalidTransition {
                    action,
                    status: job.status,
                });
                return false;
            }
            update(job);
            true
        });
        outcome
    }

    fn emit(&self, event: LogEvent) {
        self.events.emit(event);
    }
}
