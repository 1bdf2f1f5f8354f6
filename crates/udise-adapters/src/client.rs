//! UDISE+ proxy API client.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use thiserror::Error;
use udise_core::{AcademicYear, FetchCategory};
use udise_storage::{FetchError, HttpFetcher};

const UDISE_HOST: &str = "udise-api";

/// Response wrapper shared by every UDISE+ endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default, deserialize_with = "truthy")]
    pub status: bool,
    #[serde(default)]
    pub data: Option<JsonValue>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiEnvelope {
    pub fn ok(data: JsonValue) -> Self {
        Self {
            status: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: false,
            data: None,
            message: Some(message.into()),
        }
    }

    /// The data object when the endpoint reported success and sent one.
    pub fn payload(&self) -> Option<&JsonValue> {
        if !self.status {
            return None;
        }
        self.data.as_ref().filter(|d| !d.is_null())
    }

    /// First entry of a search response's `data.content` list.
    pub fn first_search_hit(&self) -> Option<&JsonValue> {
        self.payload()?.get("content")?.as_array()?.first()
    }
}

fn truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Bool(b) => b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        JsonValue::String(s) => !s.is_empty() && s != "false" && s != "0",
        JsonValue::Null => false,
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    })
}

/// Reads a search hit's `schoolId`, which the API sends as number or string.
pub fn school_id_of(hit: &JsonValue) -> Option<String> {
    match hit.get("schoolId")? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0} is not a detail category")]
    NotADetail(FetchCategory),
    #[error("academic year list unavailable: {0}")]
    Years(String),
}

#[async_trait]
pub trait SchoolSource: Send + Sync {
    async fn academic_years(&self) -> Result<Vec<AcademicYear>, SourceError>;

    async fn search_school(&self, udise_code: &str) -> Result<ApiEnvelope, SourceError>;

    async fn fetch_detail(
        &self,
        category: FetchCategory,
        school_id: &str,
        year_id: &str,
    ) -> Result<ApiEnvelope, SourceError>;
}

/// Live client against the UDISE+ proxy.
#[derive(Debug, Clone)]
pub struct UdiseClient {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl UdiseClient {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Path and query for one detail category.
    pub fn detail_request(
        category: FetchCategory,
        school_id: &str,
        year_id: &str,
    ) -> Result<(&'static str, Vec<(&'static str, String)>), SourceError> {
        let school_and_year = vec![
            ("schoolId", school_id.to_string()),
            ("yearId", year_id.to_string()),
        ];
        Ok(match category {
            FetchCategory::Profile => ("school/profile", school_and_year),
            FetchCategory::Facility => ("school/facility", school_and_year),
            FetchCategory::ReportCard => ("school/report-card", school_and_year),
            FetchCategory::Enrollment(flag) => {
                let mut query = vec![("flag", flag.code().to_string())];
                query.extend(school_and_year);
                ("getSocialData", query)
            }
            FetchCategory::Statistics => (
                "school-statistics/enrolment-teacher",
                vec![("schoolId", school_id.to_string())],
            ),
            FetchCategory::Search => return Err(SourceError::NotADetail(category)),
        })
    }
}

#[async_trait]
impl SchoolSource for UdiseClient {
    async fn academic_years(&self) -> Result<Vec<AcademicYear>, SourceError> {
        let envelope: ApiEnvelope = self
            .http
            .get_json(UDISE_HOST, &self.url("master/year"), &[("year", "0".to_string())])
            .await?;
        let data = envelope
            .payload()
            .cloned()
            .ok_or_else(|| SourceError::Years(envelope.message.clone().unwrap_or_default()))?;
        serde_json::from_value(data).map_err(|e| SourceError::Years(e.to_string()))
    }

    async fn search_school(&self, udise_code: &str) -> Result<ApiEnvelope, SourceError> {
        Ok(self
            .http
            .get_json(
                UDISE_HOST,
                &self.url("search-schools"),
                &[
                    ("searchType", "1".to_string()),
                    ("searchParam", udise_code.to_string()),
                ],
            )
            .await?)
    }

    async fn fetch_detail(
        &self,
        category: FetchCategory,
        school_id: &str,
        year_id: &str,
    ) -> Result<ApiEnvelope, SourceError> {
        let (path, query) = Self::detail_request(category, school_id, year_id)?;
        Ok(self.http.get_json(UDISE_HOST, &self.url(path), &query).await?)
    }
}
