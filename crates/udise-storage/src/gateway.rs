//! Persistence gateway: batched existence check and idempotent bulk save.
//!
//! Storage is keyed by `(udise_code, ay)`; saving a record whose key already
//! exists is a skip, never an overwrite. The reported `count` is the number of
//! rows actually inserted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrator;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use udise_core::FlatRecord;

use crate::{FetchError, HttpFetcher};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

const BACKEND_HOST: &str = "backend";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveReceipt {
    pub success: bool,
    #[serde(default)]
    pub count: usize,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("gateway rejected request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Returns the subset of `codes` already stored for `ay`, in one round trip.
    async fn existing_codes(&self, codes: &[String], ay: &str) -> Result<Vec<String>, GatewayError>;

    async fn save_records(&self, records: &[FlatRecord]) -> Result<SaveReceipt, GatewayError>;
}

#[derive(Debug, Serialize)]
struct CheckExistingRequest<'a> {
    codes: &'a [String],
    ay: &'a str,
}

#[derive(Debug, Deserialize)]
struct CheckExistingResponse {
    #[serde(default)]
    existing: Vec<String>,
}

/// Backend REST gateway (`/check-existing`, `/save-schools`).
#[derive(Debug, Clone)]
pub struct HttpGateway {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl HttpGateway {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PersistenceGateway for HttpGateway {
    async fn existing_codes(&self, codes: &[String], ay: &str) -> Result<Vec<String>, GatewayError> {
        let url = format!("{}/check-existing", self.base_url);
        let resp: CheckExistingResponse = self
            .http
            .post_json(BACKEND_HOST, &url, &CheckExistingRequest { codes, ay })
            .await?;
        Ok(resp.existing)
    }

    async fn save_records(&self, records: &[FlatRecord]) -> Result<SaveReceipt, GatewayError> {
        let url = format!("{}/save-schools", self.base_url);
        Ok(self.http.post_json(BACKEND_HOST, &url, records).await?)
    }
}

/// PostgreSQL gateway over the `school_records` table.
#[derive(Debug, Clone)]
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, GatewayError> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    async fn existing_codes(&self, codes: &[String], ay: &str) -> Result<Vec<String>, GatewayError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT udise_code
              FROM school_records
             WHERE ay = $1
               AND udise_code = ANY($2)
            "#,
        )
        .bind(ay)
        .bind(codes)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(code,)| code).collect())
    }

    async fn save_records(&self, records: &[FlatRecord]) -> Result<SaveReceipt, GatewayError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for record in records {
            let (Some(code), Some(ay)) = (record.udise_code(), record.academic_year()) else {
                debug!("skipping record without udise_code/ay");
                continue;
            };
            let result = sqlx::query(
                r#"
                INSERT INTO school_records (udise_code, ay, data)
                VALUES ($1, $2, $3)
                ON CONFLICT (udise_code, ay) DO NOTHING
                "#,
            )
            .bind(code)
            .bind(ay)
            .bind(sqlx::types::Json(record))
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(SaveReceipt {
            success: true,
            count: inserted,
        })
    }
}

/// In-process gateway for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: HashMap<(String, String), FlatRecord>,
    existence_checks: usize,
    save_batches: Vec<usize>,
    failing_saves: HashSet<usize>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates storage, bypassing the save path.
    pub async fn seed(&self, records: impl IntoIterator<Item = FlatRecord>) {
        let mut state = self.state.lock().await;
        for record in records {
            if let (Some(code), Some(ay)) = (record.udise_code(), record.academic_year()) {
                state.rows.insert((code.to_string(), ay.to_string()), record.clone());
            }
        }
    }

    /// Makes the `n`-th save call (0-based) fail with a rejected error.
    pub async fn fail_save_call(&self, n: usize) {
        self.state.lock().await.failing_saves.insert(n);
    }

    pub async fn stored(&self) -> Vec<FlatRecord> {
        self.state.lock().await.rows.values().cloned().collect()
    }

    pub async fn stored_count(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn contains(&self, code: &str, ay: &str) -> bool {
        self.state
            .lock()
            .await
            .rows
            .contains_key(&(code.to_string(), ay.to_string()))
    }

    /// Sizes of every save call received, including failed ones.
    pub async fn save_batches(&self) -> Vec<usize> {
        self.state.lock().await.save_batches.clone()
    }

    pub async fn existence_checks(&self) -> usize {
        self.state.lock().await.existence_checks
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn existing_codes(&self, codes: &[String], ay: &str) -> Result<Vec<String>, GatewayError> {
        let mut state = self.state.lock().await;
        state.existence_checks += 1;
        Ok(codes
            .iter()
            .filter(|code| state.rows.contains_key(&((*code).clone(), ay.to_string())))
            .cloned()
            .collect())
    }

    async fn save_records(&self, records: &[FlatRecord]) -> Result<SaveReceipt, GatewayError> {
        let mut state = self.state.lock().await;
        let call_index = state.save_batches.len();
        state.save_batches.push(records.len());
        if state.failing_saves.contains(&call_index) {
            return Err(GatewayError::Rejected(format!(
                "save call {call_index} rejected"
            )));
        }

        let mut inserted = 0usize;
        for record in records {
            let (Some(code), Some(ay)) = (record.udise_code(), record.academic_year()) else {
                continue;
            };
            let key = (code.to_string(), ay.to_string());
            if !state.rows.contains_key(&key) {
                state.rows.insert(key, record.clone());
                inserted += 1;
            }
        }
        Ok(SaveReceipt {
            success: true,
            count: inserted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HttpClientConfig;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(code: &str, ay: &str) -> FlatRecord {
        let mut r = FlatRecord::new(code);
        r.set_academic_year(ay);
        r
    }

    #[tokio::test]
    async fn memory_gateway_skips_true_duplicates() {
        let gw = MemoryGateway::new();
        let first = gw
            .save_records(&[record("A1", "2023-24"), record("B2", "2023-24")])
            .await
            .unwrap();
        assert_eq!(first.count, 2);

        let second = gw
            .save_records(&[record("A1", "2023-24"), record("A1", "2024-25")])
            .await
            .unwrap();
        assert!(second.success);
        assert_eq!(second.count, 1);
        assert_eq!(gw.stored_count().await, 3);
        assert_eq!(gw.save_batches().await, vec![2, 2]);
    }

    #[tokio::test]
    async fn memory_gateway_existence_is_year_scoped_and_case_sensitive() {
        let gw = MemoryGateway::new();
        gw.seed([record("ab12", "2023-24")]).await;
        let codes = vec!["ab12".to_string(), "AB12".to_string()];
        assert_eq!(
            gw.existing_codes(&codes, "2023-24").await.unwrap(),
            vec!["ab12".to_string()]
        );
        assert!(gw.existing_codes(&codes, "2024-25").await.unwrap().is_empty());
        assert_eq!(gw.existence_checks().await, 2);
    }

    #[tokio::test]
    async fn memory_gateway_scripted_failure() {
        let gw = MemoryGateway::new();
        gw.fail_save_call(0).await;
        assert!(gw.save_records(&[record("A1", "x")]).await.is_err());
        assert_eq!(gw.save_records(&[record("A1", "x")]).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn http_gateway_speaks_backend_contract() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/check-existing"))
            .and(body_json(serde_json::json!({"codes": ["A1", "B2"], "ay": "2023-24"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"existing": ["B2"]})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/save-schools"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"success": true, "count": 1})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let gw = HttpGateway::new(http, format!("{}/api/", server.uri()));

        let existing = gw
            .existing_codes(&["A1".to_string(), "B2".to_string()], "2023-24")
            .await
            .unwrap();
        assert_eq!(existing, vec!["B2".to_string()]);

        let receipt = gw
            .save_records(&[record("A1", "2023-24"), record("C3", "2023-24")])
            .await
            .unwrap();
        assert_eq!(receipt, SaveReceipt { success: true, count: 1 });
    }
}
