//! Axum JSON control API for the sync engine.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use udise_adapters::SourceFile;
use udise_core::{AcademicYear, SyncJob, SyncStatus};
use udise_sync::{
    build_engine, report::recent_reports_markdown, to_csv_string, EventLog, EventSink, HeaderMode,
    SyncConfig, SyncEngine, SyncError, SyncRunSummary,
};

pub const CRATE_NAME: &str = "udise-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub events: Arc<EventLog>,
    pub reports_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>, events: Arc<EventLog>) -> Self {
        Self {
            engine,
            events,
            reports_dir: None,
        }
    }

    pub fn with_reports_dir(mut self, reports_dir: Option<PathBuf>) -> Self {
        self.reports_dir = reports_dir;
        self
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub job: SyncJob,
    pub progress_percent: f64,
    pub last_run: Option<SyncRunSummary>,
}

#[derive(Debug, Deserialize, Default)]
struct LogsQuery {
    since: Option<usize>,
}

/// An uploaded file (text `content` or base64 `content_base64` for
/// spreadsheets) with its name, or a plain code list.
#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub academic_year: AcademicYear,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_base64: Option<String>,
    #[serde(default)]
    pub identifiers: Option<Vec<String>>,
}

impl AnalyzeRequest {
    fn file_bytes(&self) -> Result<Option<Vec<u8>>, String> {
        if let Some(encoded) = &self.content_base64 {
            return STANDARD
                .decode(encoded.trim())
                .map(Some)
                .map_err(|err| format!("invalid base64 content: {err}"));
        }
        Ok(self.content.as_ref().map(|text| text.clone().into_bytes()))
    }
}

#[derive(Debug, Deserialize, Default)]
struct CsvQuery {
    header: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ReportsQuery {
    runs: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/logs", get(logs_handler))
        .route("/api/years", get(years_handler))
        .route("/api/analyze", post(analyze_handler))
        .route("/api/confirm", post(confirm_handler))
        .route("/api/pause", post(pause_handler))
        .route("/api/resume", post(resume_handler))
        .route("/api/cancel", post(cancel_handler))
        .route("/api/reset", post(reset_handler))
        .route("/api/sample.csv", get(sample_csv_handler))
        .route("/api/reports", get(reports_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("UDISE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env()?;
    let events = Arc::new(EventLog::with_capacity(config.tuning.log_capacity));
    let sink: Arc<dyn EventSink> = events.clone();
    let engine = Arc::new(build_engine(&config, sink).await?);
    let state = AppState::new(engine, events).with_reports_dir(config.reports_dir.clone());

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "control api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let job = state.engine.snapshot();
    Json(StatusResponse {
        progress_percent: job.progress_percent(),
        job,
        last_run: state.engine.last_summary().await,
    })
    .into_response()
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Response {
    Json(state.events.since(query.since.unwrap_or(0))).into_response()
}

async fn years_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.academic_years().await {
        Ok(years) => Json(years).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn analyze_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnalyzeRequest>,
) -> Response {
    let bytes = match request.file_bytes() {
        Ok(bytes) => bytes,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };
    let result = match (bytes, request.identifiers) {
        (Some(bytes), _) => {
            let name = request.file_name.unwrap_or_else(|| "upload.csv".to_string());
            let file = SourceFile::new(name, bytes);
            state.engine.analyze(&file, request.academic_year).await
        }
        (None, Some(identifiers)) => {
            state
                .engine
                .analyze_identifiers(identifiers, request.academic_year)
                .await
        }
        (None, None) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "provide either file content or identifiers".to_string(),
            )
        }
    };
    match result {
        Ok(report) => Json(report).into_response(),
        Err(err) => sync_error(err),
    }
}

/// Starts the prepared run in the background; progress is read via status/logs.
async fn confirm_handler(State(state): State<Arc<AppState>>) -> Response {
    let status = state.engine.status();
    if status != SyncStatus::ReadyToSync {
        return sync_error(SyncError::InvalidTransition {
            action: "confirm",
            status,
        });
    }
    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(err) = engine.confirm().await {
            tracing::warn!(error = %err, "confirm failed");
        }
    });
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "syncing"})),
    )
        .into_response()
}

async fn pause_handler(State(state): State<Arc<AppState>>) -> Response {
    control_response(&state, state.engine.pause())
}

async fn resume_handler(State(state): State<Arc<AppState>>) -> Response {
    control_response(&state, state.engine.resume())
}

async fn cancel_handler(State(state): State<Arc<AppState>>) -> Response {
    control_response(&state, state.engine.cancel())
}

async fn reset_handler(State(state): State<Arc<AppState>>) -> Response {
    let result = state.engine.reset().await;
    control_response(&state, result)
}

async fn sample_csv_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CsvQuery>,
) -> Response {
    let mode = match query.header.as_deref() {
        Some("union") => HeaderMode::Union,
        _ => HeaderMode::FirstRecord,
    };
    let sample = state.engine.sample().await;
    if sample.is_empty() {
        return error_response(StatusCode::NOT_FOUND, "no preview sample available".to_string());
    }
    match to_csv_string(&sample, mode) {
        Ok(csv) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"udise_sample.csv\"",
                ),
            ],
            csv,
        )
            .into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn reports_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportsQuery>,
) -> Response {
    let Some(dir) = state.reports_dir.clone() else {
        return error_response(StatusCode::NOT_FOUND, "run reports are disabled".to_string());
    };
    let runs = query.runs.unwrap_or(10);
    let index = tokio::task::spawn_blocking(move || recent_reports_markdown(&dir, runs)).await;
    match index {
        Ok(Ok(markdown)) => (
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            markdown,
        )
            .into_response(),
        Ok(Err(err)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn control_response(state: &AppState, result: Result<(), SyncError>) -> Response {
    match result {
        Ok(()) => Json(serde_json::json!({"status": state.engine.status()})).into_response(),
        Err(err) => sync_error(err),
    }
}

fn sync_error(err: SyncError) -> Response {
    let status = match &err {
        SyncError::SourceFileInvalid(_) | SyncError::NoYearSelected => StatusCode::BAD_REQUEST,
        SyncError::InvalidTransition { .. } => StatusCode::CONFLICT,
        SyncError::Gateway(_) | SyncError::Source(_) => StatusCode::BAD_GATEWAY,
    };
    error_response(status, err.to_string())
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({"error": message}))).into_response()
}
