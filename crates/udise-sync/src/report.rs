//! Per-run report files under `<reports_dir>/<run_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::SyncRunSummary;

pub const SUMMARY_FILE: &str = "run_summary.json";
pub const BRIEF_FILE: &str = "sync_brief.md";

pub async fn write_run_report(reports_root: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join(BRIEF_FILE), brief_markdown(summary))
        .await
        .context("writing sync_brief.md")?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join(SUMMARY_FILE), json)
        .await
        .context("writing run_summary.json")?;

    Ok(reports_dir)
}

pub fn brief_markdown(summary: &SyncRunSummary) -> String {
    let failures = if summary.failures.is_empty() {
        "- none".to_string()
    } else {
        summary
            .failures
            .iter()
            .map(|f| format!("- `{}` ({}): {}", f.udise_code, f.stage, f.message))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# UDISE+ Sync Brief\n\n- Run ID: `{}`\n- Academic year: {}\n- Outcome: {}\n- Started: {}\n- Finished: {}\n\n## Counts\n- Identifiers in file: {}\n- Already stored: {}\n- Pending: {}\n- Processed: {}\n- Saved: {}\n- Failed: {}\n- Save batches: {} ({} failed, {} records lost)\n\n## Failed identifiers\n{}\n",
        summary.run_id,
        summary.academic_year,
        summary.outcome,
        summary.started_at,
        summary.finished_at,
        summary.total_identifiers,
        summary.skipped_duplicates,
        summary.pending,
        summary.processed,
        summary.saved,
        summary.failed,
        summary.save_batches,
        summary.failed_batches,
        summary.lost_records,
        failures,
    )
}

/// Markdown index of the most recent `runs` reports, newest first.
///
/// Blocking; a reports root that does not exist yet yields an empty index.
pub fn recent_reports_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let mut lines = vec!["# UDISE+ Sync Reports".to_string(), String::new()];
    let entries = match std::fs::read_dir(reports_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            lines.push("No runs recorded yet.".to_string());
            return Ok(lines.join("\n"));
        }
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", reports_root.display()))
        }
    };
    let mut dirs = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    for dir in dirs.into_iter().take(runs.max(1)) {
        let summary_path = dir.path().join(SUMMARY_FILE);
        let summary: SyncRunSummary = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- year: {}", summary.academic_year));
        lines.push(format!("- outcome: {}", summary.outcome));
        lines.push(format!("- saved: {} of {} pending", summary.saved, summary.pending));
        lines.push(format!("- failed: {}", summary.failed));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use udise_core::{AcademicYear, FetchCategory, SyncStatus};
    use uuid::Uuid;

    use crate::transform::{FailureKind, RecordFailure};

    fn summary() -> SyncRunSummary {
        SyncRunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            academic_year: AcademicYear::new("10", "2023-24"),
            outcome: SyncStatus::Complete,
            total_identifiers: 3,
            skipped_duplicates: 1,
            pending: 2,
            processed: 2,
            saved: 1,
            failed: 1,
            chunks: 1,
            save_batches: 1,
            failed_batches: 0,
            lost_records: 0,
            failures: vec![RecordFailure {
                udise_code: "27210100".into(),
                stage: FetchCategory::Search,
                kind: FailureKind::SourceNotFound,
                message: "school 27210100 not found".into(),
            }],
        }
    }

    #[tokio::test]
    async fn writes_summary_and_brief() {
        let tmp = tempfile::tempdir().unwrap();
        let summary = summary();
        let dir = write_run_report(tmp.path(), &summary).await.unwrap();

        let brief = std::fs::read_to_string(dir.join(BRIEF_FILE)).unwrap();
        assert!(brief.contains("Outcome: complete"));
        assert!(brief.contains("`27210100` (search)"));

        let parsed: SyncRunSummary =
            serde_json::from_slice(&std::fs::read(dir.join(SUMMARY_FILE)).unwrap()).unwrap();
        assert_eq!(parsed.run_id, summary.run_id);
        assert_eq!(parsed.saved, 1);

        let index = recent_reports_markdown(tmp.path(), 5).unwrap();
        assert!(index.contains(&summary.run_id.to_string()));
        assert!(index.contains("saved: 1 of 2 pending"));
    }

    #[test]
    fn missing_reports_root_is_an_empty_index() {
        let tmp = tempfile::tempdir().unwrap();
        let index = recent_reports_markdown(&tmp.path().join("not-yet"), 5).unwrap();
        assert!(index.starts_with("# UDISE+ Sync Reports"));
        assert!(index.contains("No runs recorded yet."));
    }
}
