//! Lifecycle controller state machine against the in-memory store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use assert_matches::assert_matches;
use plandiff_core::error::CoreError;
use plandiff_core::job::{Job, JobEvent, JobEventType, JobStatus};
use plandiff_core::models::{OverlayReport, ReportKind, Sheet};
use plandiff_core::store::{Changeset, StoreError};
use plandiff_db::MemoryStore;
use plandiff_events::JobEventBus;
use plandiff_worker::error::{JobError, JobResult};
use plandiff_worker::handlers::HandlerOutput;
use plandiff_worker::lifecycle::{Disposition, JobScope, LifecycleController, SkipReason};
use serde_json::json;

const JOB: &str = "job-1";

fn job(status: JobStatus) -> Job {
    Job {
        id: JOB.to_string(),
        job_type: "sheet.preprocess".to_string(),
        status,
        payload: json!({"sheet_id": "s-1"}),
        events: Vec::new(),
    }
}

fn scope() -> JobScope {
    JobScope::new(JOB, "sheet.preprocess")
}

fn seeded(status: JobStatus) -> (MemoryStore, LifecycleController) {
    let store = MemoryStore::new();
    store.insert_job(job(status));
    let lifecycle = LifecycleController::new(Arc::new(store.clone()));
    (store, lifecycle)
}

fn events_of(store: &MemoryStore, event_type: JobEventType) -> Vec<JobEvent> {
    store
        .snapshot_job(JOB)
        .map(|j| j.events.into_iter().filter(|e| e.event_type == event_type).collect())
        .unwrap_or_default()
}

fn sheet() -> Sheet {
    Sheet {
        id: "s-1".into(),
        drawing_id: "d-1".into(),
        sheet_number: "A-101".into(),
        image_path: "sheets/s-1.png".into(),
        width: None,
        height: None,
        grid_callouts: None,
        previous_sheet_id: None,
    }
}

async fn ok_output() -> JobResult<HandlerOutput> {
    let mut meta = serde_json::Map::new();
    meta.insert("calloutCount".into(), json!(4));
    Ok(HandlerOutput::new(Changeset::new(), meta))
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queued_job_runs_to_completed() {
    let (store, lifecycle) = seeded(JobStatus::Queued);

    let disposition = lifecycle.execute(&scope(), ok_output).await.unwrap();

    assert_eq!(disposition, Disposition::Completed);
    let job = store.snapshot_job(JOB).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let kinds: Vec<JobEventType> = job.events.iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec![JobEventType::Started, JobEventType::Completed]);
    assert_eq!(job.events[1].metadata.as_ref().unwrap()["calloutCount"], 4);
}

#[tokio::test]
async fn changeset_commits_with_completion() {
    let (store, lifecycle) = seeded(JobStatus::Queued);
    store.insert_sheet(sheet());

    lifecycle
        .execute(&scope(), || async {
            let mut updated = sheet();
            updated.width = Some(640);
            let mut changeset = Changeset::new();
            changeset.update_sheet(updated);
            Ok(HandlerOutput::new(changeset, Default::default()))
        })
        .await
        .unwrap();

    assert_eq!(store.snapshot_sheet("s-1").unwrap().width, Some(640));
}

#[tokio::test]
async fn committed_events_are_published() {
    let (_store, lifecycle) = seeded(JobStatus::Queued);
    let bus = Arc::new(JobEventBus::default());
    let mut rx = bus.subscribe();
    let lifecycle = lifecycle.with_bus(Arc::clone(&bus));

    lifecycle.execute(&scope(), ok_output).await.unwrap();

    assert_eq!(rx.recv().await.unwrap().event_type, JobEventType::Started);
    let completed = rx.recv().await.unwrap();
    assert_eq!(completed.event_type, JobEventType::Completed);
    assert_eq!(completed.job_id, JOB);
}

// ---------------------------------------------------------------------------
// Skips and redelivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn canceled_job_is_a_silent_no_op() {
    let (store, lifecycle) = seeded(JobStatus::Canceled);
    let ran = AtomicBool::new(false);

    let disposition = lifecycle
        .execute(&scope(), || async {
            ran.store(true, Ordering::SeqCst);
            ok_output().await
        })
        .await
        .unwrap();

    assert_eq!(disposition, Disposition::Skipped(SkipReason::Canceled));
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(store.mutation_count(), 0);
    assert!(store.snapshot_job(JOB).unwrap().events.is_empty());
}

#[tokio::test]
async fn completed_job_is_not_reprocessed() {
    let (store, lifecycle) = seeded(JobStatus::Completed);

    let disposition = lifecycle.execute(&scope(), ok_output).await.unwrap();

    assert_eq!(
        disposition,
        Disposition::Skipped(SkipReason::AlreadyFinished(JobStatus::Completed))
    );
    assert_eq!(store.mutation_count(), 0);
}

#[tokio::test]
async fn redelivery_does_not_duplicate_started_event() {
    let (store, lifecycle) = seeded(JobStatus::Queued);
    lifecycle.start(&scope()).await.unwrap();
    let after_first = store.mutation_count();

    // Second delivery of the same message while the job is still Started.
    assert_eq!(lifecycle.start(&scope()).await.unwrap(), None);

    assert_eq!(store.mutation_count(), after_first);
    assert_eq!(events_of(&store, JobEventType::Started).len(), 1);
}

#[tokio::test]
async fn cancellation_during_run_discards_results() {
    let (store, lifecycle) = seeded(JobStatus::Queued);
    store.insert_sheet(sheet());

    let disposition = lifecycle
        .execute(&scope(), || async {
            store.set_job_status(JOB, JobStatus::Canceled);
            let mut updated = sheet();
            updated.width = Some(640);
            let mut changeset = Changeset::new();
            changeset.update_sheet(updated);
            Ok(HandlerOutput::new(changeset, Default::default()))
        })
        .await
        .unwrap();

    assert_eq!(disposition, Disposition::Skipped(SkipReason::Canceled));
    assert_eq!(store.snapshot_sheet("s-1").unwrap().width, None);
    assert_eq!(store.snapshot_job(JOB).unwrap().status, JobStatus::Canceled);
    assert!(events_of(&store, JobEventType::Completed).is_empty());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn not_found_marks_started_job_failed_once() {
    let (store, lifecycle) = seeded(JobStatus::Started);

    let err = lifecycle
        .execute(&scope(), || async {
            Err(JobError::from(CoreError::not_found("sheet", "s-404")))
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), "NotFound");

    let job = store.snapshot_job(JOB).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let failed = events_of(&store, JobEventType::Failed);
    assert_eq!(failed.len(), 1);
    let meta = failed[0].metadata.as_ref().unwrap();
    assert_eq!(meta["errorType"], "NotFound");
    assert_eq!(meta["errorKind"], "permanent");

    // Marking again is a no-op on a terminal job.
    lifecycle.fail(&scope(), &err).await.unwrap();
    assert_eq!(events_of(&store, JobEventType::Failed).len(), 1);
}

#[tokio::test]
async fn transient_error_leaves_job_for_redelivery() {
    let (store, lifecycle) = seeded(JobStatus::Queued);

    let err = lifecycle
        .execute(&scope(), || async {
            Err(JobError::from(StoreError::Unavailable("pool timed out".into())))
        })
        .await
        .unwrap_err();

    assert!(err.is_transient());
    assert_eq!(store.snapshot_job(JOB).unwrap().status, JobStatus::Started);
    assert!(events_of(&store, JobEventType::Failed).is_empty());
}

#[tokio::test]
async fn failed_changeset_is_rolled_back_before_marking_failed() {
    let (store, lifecycle) = seeded(JobStatus::Queued);
    store.insert_sheet(sheet());

    let err = lifecycle
        .execute(&scope(), || async {
            let mut updated = sheet();
            updated.width = Some(640);
            let mut changeset = Changeset::new();
            changeset.update_sheet(updated);
            changeset.append_report(
                "ov-missing",
                OverlayReport {
                    kind: ReportKind::Change,
                    job_id: JOB.into(),
                    summary: String::new(),
                    regions: Vec::new(),
                    created_at: chrono::Utc::now(),
                },
            );
            Ok(HandlerOutput::new(changeset, Default::default()))
        })
        .await
        .unwrap_err();

    assert_matches!(err, JobError::Store(StoreError::Backend(_)));
    assert_eq!(store.snapshot_sheet("s-1").unwrap().width, None);
    assert_eq!(store.snapshot_job(JOB).unwrap().status, JobStatus::Failed);
    assert!(events_of(&store, JobEventType::Completed).is_empty());
}

#[tokio::test]
async fn missing_job_row_is_not_found_without_mutation() {
    let store = MemoryStore::new();
    let lifecycle = LifecycleController::new(Arc::new(store.clone()));

    let err = lifecycle.execute(&scope(), ok_output).await.unwrap_err();

    assert_matches!(err, JobError::Core(CoreError::NotFound { .. }));
    assert_eq!(store.mutation_count(), 0);
}
