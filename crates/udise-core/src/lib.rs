//! Core domain model for the UDISE+ school data sync.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "udise-core";

pub const UDISE_CODE_KEY: &str = "udise_code";
pub const ACADEMIC_YEAR_KEY: &str = "ay";

/// Academic year as published by the UDISE+ master endpoint.
///
/// `year_desc` is the durable join key for dedup; `year_id` is an API token
/// that is only forwarded to detail endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcademicYear {
    #[serde(deserialize_with = "string_or_number")]
    pub year_id: String,
    pub year_desc: String,
}

impl AcademicYear {
    pub fn new(year_id: impl Into<String>, year_desc: impl Into<String>) -> Self {
        Self {
            year_id: year_id.into(),
            year_desc: year_desc.into(),
        }
    }
}

impl fmt::Display for AcademicYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.year_desc, self.year_id)
    }
}

/// Accepts `"2023"` or `2023` and always yields the string form.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

/// Leaf value of a [`FlatRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Number(serde_json::Number),
    Text(String),
}

impl Scalar {
    /// Converts a JSON value into a scalar. Containers have no scalar form.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;
        match value {
            Value::Null => Some(Scalar::Null),
            Value::Bool(b) => Some(Scalar::Text(b.to_string())),
            Value::Number(n) => Some(Scalar::Number(n.clone())),
            Value::String(s) => Some(Scalar::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text form used by exports; null renders empty.
    pub fn to_cell(&self) -> String {
        match self {
            Scalar::Null => String::new(),
            Scalar::Number(n) => n.to_string(),
            Scalar::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Number(value.into())
    }
}

/// Partial flat output produced by the column mapper for one fragment.
pub type Fragment = IndexMap<String, Scalar>;

/// One fully merged, single-level school row.
///
/// Key order is insertion order, so exports keep `udise_code`, `ay` and the
/// search fields first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlatRecord {
    fields: IndexMap<String, Scalar>,
}

impl FlatRecord {
    pub fn new(udise_code: impl Into<String>) -> Self {
        let mut fields = IndexMap::new();
        fields.insert(UDISE_CODE_KEY.to_string(), Scalar::Text(udise_code.into()));
        Self { fields }
    }

    pub fn udise_code(&self) -> Option<&str> {
        self.fields.get(UDISE_CODE_KEY).and_then(Scalar::as_str)
    }

    pub fn academic_year(&self) -> Option<&str> {
        self.fields.get(ACADEMIC_YEAR_KEY).and_then(Scalar::as_str)
    }

    pub fn set_academic_year(&mut self, year_desc: &str) {
        self.fields
            .insert(ACADEMIC_YEAR_KEY.to_string(), Scalar::Text(year_desc.to_string()));
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Scalar) {
        self.fields.insert(key.into(), value);
    }

    /// Object-assign merge: later keys overwrite earlier ones.
    pub fn merge(&mut self, fragment: Fragment) {
        self.fields.extend(fragment);
    }

    pub fn get(&self, key: &str) -> Option<&Scalar> {
        self.fields.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Scalar)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// The 5 demographic breakdown endpoints (`getSocialData?flag=N`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentFlag {
    Caste,
    Minority,
    Age,
    Ews,
    Other,
}

impl EnrollmentFlag {
    pub const ALL: [EnrollmentFlag; 5] = [
        EnrollmentFlag::Caste,
        EnrollmentFlag::Minority,
        EnrollmentFlag::Age,
        EnrollmentFlag::Ews,
        EnrollmentFlag::Other,
    ];

    pub fn code(self) -> u8 {
        match self {
            EnrollmentFlag::Caste => 1,
            EnrollmentFlag::Minority => 2,
            EnrollmentFlag::Age => 3,
            EnrollmentFlag::Ews => 4,
            EnrollmentFlag::Other => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.code() == code)
    }
}

/// Every endpoint fetched for one school.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "category", content = "flag")]
pub enum FetchCategory {
    Search,
    Profile,
    Facility,
    ReportCard,
    Enrollment(EnrollmentFlag),
    Statistics,
}

impl FetchCategory {
    /// Detail categories fanned out after a successful search, in merge order.
    pub const DETAILS: [FetchCategory; 9] = [
        FetchCategory::Profile,
        FetchCategory::Facility,
        FetchCategory::ReportCard,
        FetchCategory::Enrollment(EnrollmentFlag::Caste),
        FetchCategory::Enrollment(EnrollmentFlag::Minority),
        FetchCategory::Enrollment(EnrollmentFlag::Age),
        FetchCategory::Enrollment(EnrollmentFlag::Ews),
        FetchCategory::Enrollment(EnrollmentFlag::Other),
        FetchCategory::Statistics,
    ];

    pub fn name(self) -> String {
        match self {
            FetchCategory::Search => "search".to_string(),
            FetchCategory::Profile => "profile".to_string(),
            FetchCategory::Facility => "facility".to_string(),
            FetchCategory::ReportCard => "report-card".to_string(),
            FetchCategory::Enrollment(flag) => format!("enrollment-flag-{}", flag.code()),
            FetchCategory::Statistics => "statistics".to_string(),
        }
    }
}

impl fmt::Display for FetchCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Analyzing,
    ReadyToSync,
    Syncing,
    Paused,
    Cancelled,
    Complete,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Analyzing => "analyzing",
            SyncStatus::ReadyToSync => "ready_to_sync",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Paused => "paused",
            SyncStatus::Cancelled => "cancelled",
            SyncStatus::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// Transient state of the single active sync run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub total_identifiers: usize,
    pub pending_identifiers: Vec<String>,
    pub processed_count: usize,
    pub saved_count: usize,
    pub skipped_duplicate_count: usize,
    pub failed_count: usize,
    pub status: SyncStatus,
    pub current_chunk_index: usize,
}

impl SyncJob {
    pub fn progress_percent(&self) -> f64 {
        if self.pending_identifiers.is_empty() {
            return 0.0;
        }
        (self.processed_count as f64 / self.pending_identifiers.len() as f64) * 100.0
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, SyncStatus::Syncing | SyncStatus::Paused)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Info,
    Success,
    Error,
}

/// One entry of the append-only progress/log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub message: String,
    pub kind: LogKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udise_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl LogEvent {
    pub fn new(kind: LogKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            timestamp: Utc::now(),
            udise_code: None,
            stage: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogKind::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(LogKind::Success, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogKind::Error, message)
    }

    pub fn for_school(mut self, udise_code: impl Into<String>, stage: impl Into<String>) -> Self {
        self.udise_code = Some(udise_code.into());
        self.stage = Some(stage.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn academic_year_accepts_numeric_ids() {
        let year: AcademicYear =
            serde_json::from_str(r#"{"yearId": 11, "yearDesc": "2024-25"}"#).unwrap();
        assert_eq!(year, AcademicYear::new("11", "2024-25"));
    }

    #[test]
    fn flat_record_keeps_insertion_order() {
        let mut record = FlatRecord::new("09010100101");
        record.set_academic_year("2023-24");
        record.insert("school_name", "GPS Demo".into());
        let keys = record.keys().collect::<Vec<_>>();
        assert_eq!(keys, vec!["udise_code", "ay", "school_name"]);
        assert_eq!(record.udise_code(), Some("09010100101"));
        assert_eq!(record.academic_year(), Some("2023-24"));
    }

    #[test]
    fn flat_record_serializes_as_plain_object() {
        let mut record = FlatRecord::new("27210100");
        record.insert("total_students", Scalar::from(42));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json, serde_json::json!({"udise_code": "27210100", "total_students": 42}));
    }

    #[test]
    fn scalar_rejects_containers() {
        assert!(Scalar::from_json(&serde_json::json!({"a": 1})).is_none());
        assert!(Scalar::from_json(&serde_json::json!([1])).is_none());
        assert_eq!(
            Scalar::from_json(&serde_json::json!(true)),
            Some(Scalar::Text("true".into()))
        );
    }

    #[test]
    fn progress_uses_pending_as_denominator() {
        let job = SyncJob {
            pending_identifiers: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            processed_count: 1,
            ..Default::default()
        };
        assert_eq!(job.progress_percent(), 25.0);
        assert_eq!(SyncJob::default().progress_percent(), 0.0);
    }

    #[test]
    fn enrollment_flags_round_trip_codes() {
        for flag in EnrollmentFlag::ALL {
            assert_eq!(EnrollmentFlag::from_code(flag.code()), Some(flag));
        }
        assert_eq!(EnrollmentFlag::from_code(9), None);
    }
}
