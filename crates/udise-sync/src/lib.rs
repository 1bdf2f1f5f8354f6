//! Sync pipeline: record transformation, existing-record filtering and the
//! chunked fetch orchestrator with its event log, exports and run reports.

pub mod config;
pub mod engine;
pub mod events;
pub mod export;
pub mod filter;
pub mod report;
pub mod transform;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use udise_adapters::UdiseClient;
use udise_core::{AcademicYear, SyncStatus};
use udise_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, HttpGateway, MemoryGateway, PersistenceGateway,
    PgGateway,
};
use uuid::Uuid;

pub use config::{GatewayKind, SyncConfig, SyncTuning};
pub use engine::{AnalysisReport, SyncEngine, SyncError};
pub use events::{EventLog, EventPage, EventSink, DEFAULT_LOG_CAPACITY};
pub use export::{to_csv_string, write_csv, HeaderMode};
pub use filter::{filter_pending, PendingSet};
pub use transform::{fetch_school, CategoryUnavailable, FailureKind, FetchedSchool, RecordFailure};

pub const CRATE_NAME: &str = "udise-sync";

/// Outcome of one confirmed run, returned to callers and written as a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub academic_year: AcademicYear,
    pub outcome: SyncStatus,
    pub total_identifiers: usize,
    pub skipped_duplicates: usize,
    pub pending: usize,
    pub processed: usize,
    pub saved: usize,
    pub failed: usize,
    pub chunks: usize,
    pub save_batches: usize,
    pub failed_batches: usize,
    pub lost_records: usize,
    pub failures: Vec<RecordFailure>,
}

pub fn http_fetcher_for(config: &SyncConfig) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        global_concurrency: config.tuning.global_concurrency,
        per_host_concurrency: config.tuning.global_concurrency,
        backoff: BackoffPolicy {
            max_retries: config.tuning.max_retries,
            ..BackoffPolicy::default()
        },
        request_budget: config.tuning.request_budget(),
        ..Default::default()
    })
}

/// Wires the live UDISE+ client and the configured gateway into an engine.
pub async fn build_engine(config: &SyncConfig, events: Arc<dyn EventSink>) -> Result<SyncEngine> {
    let http = Arc::new(http_fetcher_for(config)?);
    let source = Arc::new(UdiseClient::new(http.clone(), config.api_base.clone()));
    let gateway: Arc<dyn PersistenceGateway> = match config.gateway {
        GatewayKind::Http => Arc::new(HttpGateway::new(http, config.backend_url.clone())),
        GatewayKind::Postgres => Arc::new(
            PgGateway::connect(&config.database_url)
                .await
                .context("connecting to DATABASE_URL")?,
        ),
        GatewayKind::Memory => Arc::new(MemoryGateway::new()),
    };
    tracing::info!(gateway = ?config.gateway, api = %config.api_base, "sync engine configured");

    Ok(SyncEngine::new(source, gateway, events, config.tuning.clone())
        .with_reports_dir(config.reports_dir.clone()))
}

pub async fn build_engine_from_env(events: Arc<dyn EventSink>) -> Result<SyncEngine> {
    let config = SyncConfig::from_env()?;
    build_engine(&config, events).await
}
