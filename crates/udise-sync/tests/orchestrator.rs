use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{watch, Notify};
use udise_adapters::{ApiEnvelope, SchoolSource, SourceError, SourceFile};
use udise_core::{
    AcademicYear, EnrollmentFlag, FetchCategory, FlatRecord, LogKind, Scalar, SyncJob, SyncStatus,
};
use udise_storage::MemoryGateway;
use udise_sync::{EventLog, EventSink, SyncEngine, SyncError, SyncTuning};

#[derive(Default)]
struct ScriptedSource {
    missing: HashSet<String>,
    hold: Option<(String, Arc<Notify>)>,
}

impl ScriptedSource {
    fn with_missing(codes: &[&str]) -> Self {
        Self {
            missing: codes.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    fn holding(code: &str, gate: Arc<Notify>) -> Self {
        Self {
            hold: Some((code.to_string(), gate)),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SchoolSource for ScriptedSource {
    async fn academic_years(&self) -> Result<Vec<AcademicYear>, SourceError> {
        Ok(vec![year()])
    }

    async fn search_school(&self, udise_code: &str) -> Result<ApiEnvelope, SourceError> {
        if let Some((held, gate)) = &self.hold {
            if held == udise_code {
                gate.notified().await;
            }
        }
        if self.missing.contains(udise_code) {
            return Ok(ApiEnvelope::ok(json!({"content": []})));
        }
        Ok(ApiEnvelope::ok(json!({
            "content": [{
                "schoolId": format!("sid-{udise_code}"),
                "schoolName": format!("School {udise_code}"),
                "yearDesc": "1999-00"
            }]
        })))
    }

    async fn fetch_detail(
        &self,
        category: FetchCategory,
        _school_id: &str,
        _year_id: &str,
    ) -> Result<ApiEnvelope, SourceError> {
        Ok(ApiEnvelope::ok(match category {
            FetchCategory::Profile => json!({"estdYear": 1990}),
            FetchCategory::Enrollment(EnrollmentFlag::Other) => json!({
                "schEnrollmentYearDataDTOS": [{"enrollmentName": "BPL", "total": 2}]
            }),
            FetchCategory::Enrollment(_) => json!({"schEnrollmentYearDataTotal": {"total": 22}}),
            FetchCategory::Statistics => json!({"totalBoy": 10, "totalGirl": 12, "totalCount": 22}),
            _ => json!({}),
        }))
    }
}

fn year() -> AcademicYear {
    AcademicYear::new("10", "2023-24")
}

fn codes(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("2721{i:04}")).collect()
}

fn tuning(chunk_size: usize, save_batch_size: usize) -> SyncTuning {
    SyncTuning {
        chunk_size,
        save_batch_size,
        pause_poll_ms: 10,
        ..SyncTuning::default()
    }
}

struct Harness {
    engine: Arc<SyncEngine>,
    gateway: Arc<MemoryGateway>,
    log: Arc<EventLog>,
}

fn harness(source: ScriptedSource, tuning: SyncTuning) -> Harness {
    harness_with_gateway(source, tuning, Arc::new(MemoryGateway::new()))
}

fn harness_with_gateway(
    source: ScriptedSource,
    tuning: SyncTuning,
    gateway: Arc<MemoryGateway>,
) -> Harness {
    let log = Arc::new(EventLog::new());
    let events: Arc<dyn EventSink> = log.clone();
    let engine = SyncEngine::new(Arc::new(source), gateway.clone(), events, tuning);
    Harness {
        engine: Arc::new(engine),
        gateway,
        log,
    }
}

async fn wait_for(rx: &mut watch::Receiver<SyncJob>, pred: impl FnMut(&SyncJob) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timed out waiting for job state")
        .expect("engine dropped");
}

#[tokio::test]
async fn scenario_23_ids_chunk_5_batch_10_all_succeed() {
    let h = harness(ScriptedSource::default(), tuning(5, 10));
    let report = h.engine.analyze_identifiers(codes(23), year()).await.unwrap();
    assert_eq!(report.pending.len(), 23);
    assert_eq!(report.sample.len(), 10);
    assert_eq!(h.engine.status(), SyncStatus::ReadyToSync);

    let summary = h.engine.confirm().await.unwrap();
    assert_eq!(summary.outcome, SyncStatus::Complete);
    assert_eq!(summary.chunks, 5);
    assert_eq!(summary.processed, 23);
    assert_eq!(summary.saved, 23);
    // Threshold is checked with >= after each chunk, so chunks 2 and 4 flush.
    assert_eq!(h.gateway.save_batches().await, vec![10, 10, 3]);
    assert_eq!(h.gateway.stored_count().await, 23);
    assert_eq!(h.engine.status(), SyncStatus::Idle);
}

#[tokio::test]
async fn scenario_23_ids_with_two_misses_flushes_twice() {
    let ids = codes(23);
    let source = ScriptedSource::with_missing(&[ids[10].as_str(), ids[11].as_str()]);
    let h = harness(source, tuning(5, 10));
    h.engine.analyze_identifiers(ids, year()).await.unwrap();

    let summary = h.engine.confirm().await.unwrap();
    assert_eq!(h.gateway.save_batches().await, vec![10, 11]);
    assert_eq!(summary.saved, 21);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.processed, 23);
}

#[tokio::test]
async fn missing_school_is_reported_and_run_continues() {
    let mut ids = codes(4);
    ids.insert(2, "27210100".to_string());
    let h = harness(ScriptedSource::with_missing(&["27210100"]), tuning(20, 100));
    h.engine.analyze_identifiers(ids, year()).await.unwrap();
    let summary = h.engine.confirm().await.unwrap();

    assert_eq!(summary.saved, 4);
    assert!(!h.gateway.contains("27210100", "2023-24").await);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].udise_code, "27210100");

    let not_found = h
        .log
        .snapshot()
        .into_iter()
        .filter(|e| e.udise_code.as_deref() == Some("27210100") && e.kind == LogKind::Error)
        .collect::<Vec<_>>();
    // Once from the preview sample and once from the run.
    assert_eq!(not_found.len(), 2);
    assert!(not_found.iter().all(|e| e.message.starts_with("SourceNotFound")));
}

#[tokio::test]
async fn stored_records_are_flat_and_keyed_by_selected_year() {
    let h = harness(ScriptedSource::default(), tuning(20, 100));
    h.engine.analyze_identifiers(codes(2), year()).await.unwrap();
    h.engine.confirm().await.unwrap();

    for record in h.gateway.stored().await {
        assert_eq!(record.academic_year(), Some("2023-24"));
        assert_eq!(record.get("bpl_total"), Some(&Scalar::from(2)));
        assert_eq!(record.get("caste_total"), Some(&Scalar::from(22)));
        assert_eq!(record.get("totalStudents"), Some(&Scalar::from(22)));
        for (key, value) in record.iter() {
            let json = serde_json::to_value(value).unwrap();
            assert!(!json.is_object() && !json.is_array(), "{key} is nested");
        }
    }
}

#[tokio::test]
async fn resync_of_stored_identifiers_is_a_no_op() {
    let h = harness(ScriptedSource::default(), tuning(5, 10));
    h.engine.analyze_identifiers(codes(7), year()).await.unwrap();
    h.engine.confirm().await.unwrap();
    let before = h.gateway.stored().await.len();

    let report = h.engine.analyze_identifiers(codes(7), year()).await.unwrap();
    assert!(!report.ready_to_sync());
    assert_eq!(report.skipped_duplicates, 7);
    assert_eq!(h.engine.status(), SyncStatus::Idle);
    assert!(matches!(
        h.engine.confirm().await,
        Err(SyncError::InvalidTransition { action: "confirm", .. })
    ));
    assert_eq!(h.gateway.stored().await.len(), before);
}

#[tokio::test]
async fn second_analysis_starts_a_fresh_log_segment() {
    let h = harness(ScriptedSource::with_missing(&["27210100"]), tuning(5, 10));
    h.engine
        .analyze_identifiers(vec!["27210100".into(), "1001".into()], year())
        .await
        .unwrap();
    h.engine.confirm().await.unwrap();
    let first_run = h.log.len();
    assert!(h.log.snapshot().iter().any(|e| e.message.starts_with("SourceNotFound")));

    h.engine.analyze_identifiers(codes(3), year()).await.unwrap();
    let events = h.log.snapshot();
    assert!(!events.iter().any(|e| e.udise_code.as_deref() == Some("27210100")));
    assert!(!events.iter().any(|e| e.message.starts_with("Sync complete")));

    let page = h.log.since(0);
    assert_eq!(page.first, first_run);
    assert_eq!(page.next, first_run + events.len());
}

#[tokio::test]
async fn gateway_skipped_rows_do_not_inflate_saved_count() {
    let gateway = Arc::new(MemoryGateway::new());
    let ids = codes(3);
    let mut existing = FlatRecord::new(ids[1].clone());
    existing.set_academic_year("2023-24");

    let h = harness_with_gateway(ScriptedSource::default(), tuning(5, 10), gateway.clone());
    h.engine.analyze_identifiers(ids, year()).await.unwrap();
    // Stored after analysis, before the save lands.
    gateway.seed([existing]).await;

    let summary = h.engine.confirm().await.unwrap();
    assert_eq!(summary.saved, 2);
    assert_eq!(gateway.stored_count().await, 3);
}

#[tokio::test]
async fn failed_save_batch_is_accepted_loss() {
    let gateway = Arc::new(MemoryGateway::new());
    gateway.fail_save_call(0).await;
    let h = harness_with_gateway(ScriptedSource::default(), tuning(5, 5), gateway.clone());
    h.engine.analyze_identifiers(codes(12), year()).await.unwrap();

    let summary = h.engine.confirm().await.unwrap();
    assert_eq!(summary.outcome, SyncStatus::Complete);
    assert_eq!(summary.save_batches, 3);
    assert_eq!(summary.failed_batches, 1);
    assert_eq!(summary.lost_records, 5);
    assert_eq!(summary.saved, 7);
    assert_eq!(gateway.stored_count().await, 7);
    assert!(h
        .log
        .snapshot()
        .iter()
        .any(|e| e.message.starts_with("PersistenceBatchFailure")));
}

#[tokio::test]
async fn pause_holds_between_chunks_and_resume_drops_nothing() {
    let ids = codes(12);
    let gate = Arc::new(Notify::new());
    let h = harness(ScriptedSource::holding(&ids[7], gate.clone()), tuning(5, 5));
    // One release for the preview sample, which also covers the held code.
    gate.notify_one();
    h.engine.analyze_identifiers(ids.clone(), year()).await.unwrap();

    let mut rx = h.engine.subscribe();
    let engine = h.engine.clone();
    let run = tokio::spawn(async move { engine.confirm().await });

    // Chunk 1 stalls on the held code once its four siblings finish.
    wait_for(&mut rx, |job| job.processed_count == 9).await;
    h.engine.pause().unwrap();
    assert_eq!(h.engine.status(), SyncStatus::Paused);
    gate.notify_one();

    // The in-flight chunk settles and flushes; chunk 2 does not start.
    wait_for(&mut rx, |job| job.saved_count == 10).await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    let paused = h.engine.snapshot();
    assert_eq!(paused.status, SyncStatus::Paused);
    assert_eq!(paused.processed_count, 10);

    h.engine.resume().unwrap();
    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.outcome, SyncStatus::Complete);
    assert_eq!(summary.processed, 12);
    assert_eq!(summary.saved, 12);
    for id in &ids {
        assert!(h.gateway.contains(id, "2023-24").await, "{id} missing");
    }
}

#[tokio::test]
async fn cancel_mid_chunk_discards_the_unflushed_buffer() {
    let ids = codes(10);
    let gate = Arc::new(Notify::new());
    let h = harness(ScriptedSource::holding(&ids[3], gate.clone()), tuning(5, 5));
    gate.notify_one();
    h.engine.analyze_identifiers(ids, year()).await.unwrap();

    let mut rx = h.engine.subscribe();
    let engine = h.engine.clone();
    let run = tokio::spawn(async move { engine.confirm().await });

    wait_for(&mut rx, |job| job.processed_count == 4).await;
    h.engine.cancel().unwrap();
    gate.notify_one();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.outcome, SyncStatus::Cancelled);
    assert_eq!(summary.processed, 5);
    assert_eq!(summary.saved, 0);
    assert!(h.gateway.save_batches().await.is_empty());
    assert_eq!(h.gateway.stored_count().await, 0);
    assert_eq!(h.engine.status(), SyncStatus::Idle);
}

#[tokio::test]
async fn cancel_while_paused_keeps_saved_batches_consistent() {
    let ids = codes(15);
    let gate = Arc::new(Notify::new());
    let h = harness(ScriptedSource::holding(&ids[7], gate.clone()), tuning(5, 5));
    gate.notify_one();
    h.engine.analyze_identifiers(ids, year()).await.unwrap();

    let mut rx = h.engine.subscribe();
    let engine = h.engine.clone();
    let run = tokio::spawn(async move { engine.confirm().await });

    wait_for(&mut rx, |job| job.processed_count == 9).await;
    h.engine.pause().unwrap();
    gate.notify_one();
    wait_for(&mut rx, |job| job.saved_count == 10).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    h.engine.cancel().unwrap();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.outcome, SyncStatus::Cancelled);
    assert_eq!(summary.processed, 10);
    assert_eq!(summary.saved, 10);
    assert_eq!(summary.saved, h.gateway.stored_count().await);
    assert_eq!(h.gateway.save_batches().await.iter().sum::<usize>(), summary.saved);
    assert!(h
        .log
        .snapshot()
        .iter()
        .any(|e| e.message.starts_with("Sync cancelled by user")));
}

#[tokio::test]
async fn control_operations_reject_invalid_states() {
    let h = harness(ScriptedSource::default(), tuning(5, 10));
    assert!(matches!(
        h.engine.confirm().await,
        Err(SyncError::InvalidTransition { status: SyncStatus::Idle, .. })
    ));
    assert!(h.engine.pause().is_err());
    assert!(h.engine.resume().is_err());
    assert!(h.engine.cancel().is_err());

    h.engine.analyze_identifiers(codes(2), year()).await.unwrap();
    assert!(h.engine.pause().is_err());
    h.engine.reset().await.unwrap();
    assert_eq!(h.engine.status(), SyncStatus::Idle);
    assert!(h.engine.confirm().await.is_err());
}

#[tokio::test]
async fn bad_file_returns_to_idle_with_error_event() {
    let h = harness(ScriptedSource::default(), tuning(5, 10));
    let file = SourceFile::new("schools.csv", "name,district\nA,B\n");
    let err = h.engine.analyze(&file, year()).await.unwrap_err();
    assert!(matches!(err, SyncError::SourceFileInvalid(_)));
    assert_eq!(h.engine.status(), SyncStatus::Idle);
    assert_eq!(h.log.count_kind(LogKind::Error), 1);

    let no_year = h
        .engine
        .analyze_identifiers(codes(1), AcademicYear::new("", ""))
        .await
        .unwrap_err();
    assert!(matches!(no_year, SyncError::NoYearSelected));
}

#[tokio::test]
async fn analyze_from_file_previews_sample() {
    let h = harness(
        ScriptedSource::default(),
        SyncTuning {
            sample_size: 2,
            ..tuning(5, 10)
        },
    );
    let file = SourceFile::new("list.csv", "UDISE Code\n1001\n1002\n1001\n1003\n");
    let report = h.engine.analyze(&file, year()).await.unwrap();
    assert_eq!(report.total_identifiers, 3);
    assert_eq!(report.sample.len(), 2);
    assert_eq!(h.engine.sample().await.len(), 2);

    let job = h.engine.snapshot();
    assert_eq!(job.status, SyncStatus::ReadyToSync);
    assert_eq!(job.pending_identifiers, vec!["1001", "1002", "1003"]);
}

#[tokio::test]
async fn run_report_is_written_when_configured() {
    let tmp = tempfile::tempdir().unwrap();
    let log = Arc::new(EventLog::new());
    let events: Arc<dyn EventSink> = log.clone();
    let engine = SyncEngine::new(
        Arc::new(ScriptedSource::default()),
        Arc::new(MemoryGateway::new()),
        events,
        tuning(5, 10),
    )
    .with_reports_dir(Some(tmp.path().to_path_buf()));

    engine.analyze_identifiers(codes(3), year()).await.unwrap();
    let summary = engine.confirm().await.unwrap();
    let dir = tmp.path().join(summary.run_id.to_string());
    assert!(dir.join(udise_sync::report::SUMMARY_FILE).exists());
    assert!(dir.join(udise_sync::report::BRIEF_FILE).exists());
    assert_eq!(engine.last_summary().await.unwrap().run_id, summary.run_id);
}
