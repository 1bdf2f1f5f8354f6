//! Record transformer: one search hit plus up to nine detail fragments merged
//! into a single [`FlatRecord`].

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use udise_adapters::mapping::{
    ColumnMapping, ENROLLMENT, ENROLLMENT_NAME_KEY, FACILITY, PROFILE, REPORT_CARD,
    SEARCH_SCHOOLS, STATISTICS_FIELDS,
};
use udise_adapters::naming::{group_prefix, namespaced_key, row_namespace, row_prefix, row_slug};
use udise_adapters::{school_id_of, ApiEnvelope, SchoolSource, SourceError};
use udise_core::{AcademicYear, EnrollmentFlag, FetchCategory, FlatRecord, Scalar};

const ENROLLMENT_TOTAL_KEY: &str = "schEnrollmentYearDataTotal";
const ENROLLMENT_ROWS_KEY: &str = "schEnrollmentYearDataDTOS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Search returned no school for the code.
    SourceNotFound,
    /// Search call itself failed (network, status, decode).
    Transport,
}

/// Identifier-scoped failure; no record is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub udise_code: String,
    pub stage: FetchCategory,
    pub kind: FailureKind,
    pub message: String,
}

/// One detail category that contributed nothing to the record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryUnavailable {
    pub category: FetchCategory,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedSchool {
    pub record: FlatRecord,
    pub unavailable: Vec<CategoryUnavailable>,
}

/// Search, fan out the detail calls concurrently, then merge in fixed order.
pub async fn fetch_school(
    source: &dyn SchoolSource,
    udise_code: &str,
    year: &AcademicYear,
) -> Result<FetchedSchool, RecordFailure> {
    let failure = |kind: FailureKind, message: String| RecordFailure {
        udise_code: udise_code.to_string(),
        stage: FetchCategory::Search,
        kind,
        message,
    };

    let search = source
        .search_school(udise_code)
        .await
        .map_err(|e| failure(FailureKind::Transport, e.to_string()))?;
    let Some(hit) = search.first_search_hit() else {
        let detail = search.message.as_deref().unwrap_or("empty search result");
        return Err(failure(
            FailureKind::SourceNotFound,
            format!("school {udise_code} not found ({detail})"),
        ));
    };
    let Some(school_id) = school_id_of(hit) else {
        return Err(failure(
            FailureKind::SourceNotFound,
            format!("search hit for {udise_code} has no schoolId"),
        ));
    };

    let details = join_all(
        FetchCategory::DETAILS
            .iter()
            .map(|category| source.fetch_detail(*category, &school_id, &year.year_id)),
    )
    .await;

    Ok(assemble(
        udise_code,
        year,
        hit,
        FetchCategory::DETAILS.into_iter().zip(details).collect(),
    ))
}

/// Pure merge step, kept separate from I/O so naming can be tested directly.
pub fn assemble(
    udise_code: &str,
    year: &AcademicYear,
    search_hit: &JsonValue,
    details: Vec<(FetchCategory, Result<ApiEnvelope, SourceError>)>,
) -> FetchedSchool {
    let mut record = FlatRecord::new(udise_code);
    record.set_academic_year(&year.year_desc);
    record.merge(SEARCH_SCHOOLS.transform(search_hit));
    // The API's own yearDesc can be stale; the operator's year is the dedup key.
    record.set_academic_year(&year.year_desc);

    let mut unavailable = Vec::new();
    for (category, response) in details {
        let envelope = match response {
            Ok(envelope) => envelope,
            Err(err) => {
                unavailable.push(CategoryUnavailable {
                    category,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        let Some(data) = envelope.payload() else {
            unavailable.push(CategoryUnavailable {
                category,
                reason: envelope
                    .message
                    .clone()
                    .unwrap_or_else(|| "no data".to_string()),
            });
            continue;
        };

        match category {
            FetchCategory::Profile => merge_mapped(&mut record, &PROFILE, data),
            FetchCategory::Facility => merge_mapped(&mut record, &FACILITY, data),
            FetchCategory::ReportCard => merge_mapped(&mut record, &REPORT_CARD, data),
            FetchCategory::Enrollment(flag) => merge_enrollment(&mut record, flag, data),
            FetchCategory::Statistics => merge_statistics(&mut record, data),
            FetchCategory::Search => {}
        }
    }

    FetchedSchool {
        record,
        unavailable,
    }
}

fn merge_mapped(record: &mut FlatRecord, mapping: &ColumnMapping, data: &JsonValue) {
    record.merge(mapping.transform(data));
}

fn merge_enrollment(record: &mut FlatRecord, flag: EnrollmentFlag, data: &JsonValue) {
    if let Some(total) = data.get(ENROLLMENT_TOTAL_KEY).filter(|v| v.is_object()) {
        let prefix = group_prefix(flag);
        for (key, value) in ENROLLMENT.transform(total) {
            if key != ENROLLMENT_NAME_KEY {
                record.insert(namespaced_key(prefix, &key), value);
            }
        }
    }

    let Some(rows) = data.get(ENROLLMENT_ROWS_KEY).and_then(JsonValue::as_array) else {
        return;
    };
    for (index, row) in rows.iter().enumerate() {
        let name = row.get("enrollmentName").and_then(JsonValue::as_str);
        let slug = row_slug(name, index);
        let namespace = row_namespace(row_prefix(flag, &slug), &slug);
        for (key, value) in ENROLLMENT.transform(row) {
            if key != ENROLLMENT_NAME_KEY {
                record.insert(namespaced_key(&namespace, &key), value);
            }
        }
    }
}

fn merge_statistics(record: &mut FlatRecord, data: &JsonValue) {
    for (source_key, output_key) in STATISTICS_FIELDS {
        match data.get(source_key).and_then(Scalar::from_json) {
            Some(Scalar::Null) | None => {}
            Some(value) => record.insert(output_key, value),
        }
    }
}
