//! Envelope to handler to store, end to end on in-memory collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use image::{GrayImage, Luma};
use plandiff_core::envelope::JobEnvelope;
use plandiff_core::error::CoreError;
use plandiff_core::job::{Job, JobEventType, JobStatus};
use plandiff_core::models::{AlignmentResult, Overlay, OverlayKind, ReportKind, Sheet};
use plandiff_core::queue::Subscription;
use plandiff_db::MemoryStore;
use plandiff_pipeline::config::PipelineConfig;
use plandiff_pipeline::raster::encode_gray_png;
use plandiff_pipeline::NoCalloutDetector;
use plandiff_worker::governor::FlowControl;
use plandiff_worker::lifecycle::Disposition;
use plandiff_worker::queue::MemoryQueue;
use plandiff_worker::runner::{Outcome, RunnerConfig};
use plandiff_worker::storage::MemoryObjectStore;
use plandiff_worker::{Dispatcher, HandlerContext, JobError, LifecycleController, Worker};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

struct Harness {
    store: MemoryStore,
    objects: Arc<MemoryObjectStore>,
    dispatcher: Arc<Dispatcher>,
}

impl Harness {
    fn new() -> Self {
        let store = MemoryStore::new();
        let objects = Arc::new(MemoryObjectStore::new());
        let ctx = HandlerContext::new(
            Arc::new(store.clone()),
            objects.clone(),
            Arc::new(NoCalloutDetector),
            &PipelineConfig::default(),
        )
        .unwrap();
        let lifecycle = LifecycleController::new(Arc::new(store.clone()));
        Self {
            store,
            objects,
            dispatcher: Arc::new(Dispatcher::new(ctx, lifecycle)),
        }
    }

    fn queue_job(&self, id: &str, job_type: &str) {
        self.store.insert_job(Job {
            id: id.into(),
            job_type: job_type.into(),
            status: JobStatus::Queued,
            payload: json!({}),
            events: Vec::new(),
        });
    }

    fn put_raster(&self, path: &str, img: &GrayImage) {
        self.objects.put(path, encode_gray_png(img).unwrap());
    }

    async fn dispatch(&self, envelope: Value) -> Result<Disposition, JobError> {
        let envelope = JobEnvelope::parse(envelope, None).unwrap();
        self.dispatcher.dispatch(&envelope, "msg-1").await
    }

    fn completed_metadata(&self, job_id: &str) -> serde_json::Map<String, Value> {
        let job = self.store.snapshot_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        job.events
            .into_iter()
            .find(|e| e.event_type == JobEventType::Completed)
            .and_then(|e| e.metadata)
            .unwrap()
    }

    fn failed_error_type(&self, job_id: &str) -> String {
        let job = self.store.snapshot_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let failed: Vec<_> = job
            .events
            .iter()
            .filter(|e| e.event_type == JobEventType::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        failed[0].metadata.as_ref().unwrap()["errorType"]
            .as_str()
            .unwrap()
            .to_string()
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn blank(size: u32) -> GrayImage {
    GrayImage::from_pixel(size, size, Luma([255]))
}

fn fill(img: &mut GrayImage, x0: u32, y0: u32, w: u32, h: u32, value: u8) {
    let (width, height) = img.dimensions();
    for y in y0..(y0 + h).min(height) {
        for x in x0..(x0 + w).min(width) {
            img.put_pixel(x, y, Luma([value]));
        }
    }
}

/// A seeded pseudo-drawing: filled columns and outlined rooms.
fn synthetic_sheet(seed: u64, size: u32) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut img = blank(size);
    for _ in 0..40 {
        let x = rng.random_range(10..size - 40);
        let y = rng.random_range(10..size - 40);
        let w = rng.random_range(6..30);
        let h = rng.random_range(6..30);
        fill(&mut img, x, y, w, h, 0);
    }
    for _ in 0..25 {
        let x = rng.random_range(10..size - 60);
        let y = rng.random_range(10..size - 60);
        let w = rng.random_range(20..50);
        let h = rng.random_range(20..50);
        fill(&mut img, x, y, w, 2, 0);
        fill(&mut img, x, y + h, w + 2, 2, 0);
        fill(&mut img, x, y, 2, h, 0);
        fill(&mut img, x + w, y, 2, h, 0);
    }
    img
}

fn identity_alignment() -> AlignmentResult {
    AlignmentResult {
        transform: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        scale: 1.0,
        rotation_degrees: 0.0,
        inlier_count: 50,
        match_count: 60,
        residual_px: 0.0,
        confidence: 50.0 / 60.0,
        grid_prior: false,
    }
}

/// Seed an overlay whose addition raster holds one filled square.
fn seed_overlay(h: &Harness, id: &str, job_id: &str) {
    let addition_path = format!("overlays/{id}/addition.png");
    let deletion_path = format!("overlays/{id}/deletion.png");
    let mut additions = blank(120);
    fill(&mut additions, 40, 40, 30, 30, 0);
    h.put_raster(&addition_path, &additions);
    h.put_raster(&deletion_path, &blank(120));
    h.store.insert_overlay(Overlay {
        id: id.into(),
        job_id: job_id.into(),
        kind: OverlayKind::Sheet,
        source_a_id: "s-new".into(),
        source_b_id: "s-old".into(),
        overlay_path: format!("overlays/{id}/overlay.png"),
        addition_path,
        deletion_path,
        alignment: identity_alignment(),
        reports: Vec::new(),
        created_at: chrono::Utc::now(),
    });
}

fn sheet(id: &str, drawing_id: &str, number: &str, previous: Option<&str>) -> Sheet {
    Sheet {
        id: id.into(),
        drawing_id: drawing_id.into(),
        sheet_number: number.into(),
        image_path: format!("sheets/{id}.png"),
        width: None,
        height: None,
        grid_callouts: None,
        previous_sheet_id: previous.map(Into::into),
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn change_detect_by_overlay_id_reports_one_addition() {
    let h = Harness::new();
    seed_overlay(&h, "ov-1", "gen-1");
    h.queue_job("job-1", "overlay.change.detect");

    let disposition = h
        .dispatch(json!({"type": "overlay.change.detect", "id": "job-1", "payload": {"overlayId": "ov-1"}}))
        .await
        .unwrap();

    assert_eq!(disposition, Disposition::Completed);
    let overlay = h.store.snapshot_overlays().remove(0);
    assert_eq!(overlay.reports.len(), 1);
    let report = &overlay.reports[0];
    assert_eq!(report.kind, ReportKind::Change);
    assert_eq!(report.job_id, "job-1");
    assert_eq!(report.regions.len(), 1);

    let meta = h.completed_metadata("job-1");
    assert_eq!(meta["overlayCount"], 1);
    assert_eq!(meta["additionRegions"], 1);
    assert_eq!(meta["deletionRegions"], 0);
}

#[tokio::test]
async fn clash_detect_covers_every_overlay_of_the_generating_job() {
    let h = Harness::new();
    seed_overlay(&h, "ov-1", "gen-1");
    seed_overlay(&h, "ov-2", "gen-1");
    seed_overlay(&h, "ov-3", "gen-2");
    h.queue_job("job-2", "overlay.clash.detect");

    h.dispatch(json!({
        "type": "overlay.clash.detect",
        "id": "job-2",
        "payload": {"sheetOverlayJobId": "gen-1"}
    }))
    .await
    .unwrap();

    let reported: Vec<String> = h
        .store
        .snapshot_overlays()
        .into_iter()
        .filter(|o| !o.reports.is_empty())
        .map(|o| o.id)
        .collect();
    assert_eq!(reported, vec!["ov-1".to_string(), "ov-2".to_string()]);
    let meta = h.completed_metadata("job-2");
    assert_eq!(meta["overlayCount"], 2);
    assert_eq!(meta["clashCount"], 2);
}

#[tokio::test]
async fn detect_without_overlays_fails_not_found() {
    let h = Harness::new();
    h.queue_job("job-3", "overlay.change.detect");

    let err = h
        .dispatch(json!({
            "type": "overlay.change.detect",
            "id": "job-3",
            "payload": {"overlay_job_id": "gen-404"}
        }))
        .await
        .unwrap_err();

    assert_matches!(err, JobError::Core(CoreError::NotFound { .. }));
    assert_eq!(h.failed_error_type("job-3"), "NotFound");
}

// ---------------------------------------------------------------------------
// Routing failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unsupported_type_marks_job_failed() {
    let h = Harness::new();
    h.queue_job("job-4", "sheet.teleport");

    let err = h
        .dispatch(json!({"type": "sheet.teleport", "id": "job-4", "payload": {}}))
        .await
        .unwrap_err();

    assert_matches!(err, JobError::Core(CoreError::UnsupportedJobType(_)));
    assert_eq!(h.failed_error_type("job-4"), "UnsupportedJobType");
}

#[tokio::test]
async fn schema_drift_is_rejected() {
    let h = Harness::new();
    h.queue_job("job-5", "sheet.preprocess");

    h.dispatch(json!({
        "type": "sheet.preprocess",
        "id": "job-5",
        "payload": {"sheetId": "s-1", "colorMode": "rgb"}
    }))
    .await
    .unwrap_err();

    assert_eq!(h.failed_error_type("job-5"), "ValidationError");
}

// ---------------------------------------------------------------------------
// Overlay generation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sheet_overlay_feeds_change_detection() {
    let h = Harness::new();
    let mut old = synthetic_sheet(42, 400);
    fill(&mut old, 150, 150, 80, 80, 255);
    let mut new = old.clone();
    fill(&mut new, 170, 170, 40, 40, 0);
    h.store.insert_sheet(sheet("s-old", "d-1", "A-101", None));
    h.store.insert_sheet(sheet("s-new", "d-2", "A-101", Some("s-old")));
    h.put_raster("sheets/s-old.png", &old);
    h.put_raster("sheets/s-new.png", &new);

    h.queue_job("gen-1", "sheet.overlay.generate");
    h.dispatch(json!({
        "type": "sheet.overlay.generate",
        "id": "gen-1",
        "payload": {"sheetAId": "s-new"}
    }))
    .await
    .unwrap();

    let overlays = h.store.snapshot_overlays();
    assert_eq!(overlays.len(), 1);
    let overlay = &overlays[0];
    assert_eq!(overlay.job_id, "gen-1");
    assert_eq!((overlay.source_a_id.as_str(), overlay.source_b_id.as_str()), ("s-new", "s-old"));
    assert!((overlay.alignment.scale - 1.0).abs() < 0.01);
    for path in [&overlay.overlay_path, &overlay.addition_path, &overlay.deletion_path] {
        assert!(h.objects.get(path).is_some(), "{path} uploaded");
    }
    let meta = h.completed_metadata("gen-1");
    assert_eq!(meta["overlayId"], overlay.id.as_str());
    assert_eq!(meta["gridPrior"], false);

    h.queue_job("det-1", "overlay.change.detect");
    h.dispatch(json!({
        "type": "overlay.change.detect",
        "id": "det-1",
        "payload": {"sheetOverlayJobId": "gen-1"}
    }))
    .await
    .unwrap();

    let meta = h.completed_metadata("det-1");
    assert!(meta["additionRegions"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn sheet_without_previous_revision_fails_validation() {
    let h = Harness::new();
    h.store.insert_sheet(sheet("s-1", "d-1", "A-101", None));
    h.queue_job("gen-2", "sheet.overlay.generate");

    let err = h
        .dispatch(json!({
            "type": "sheet.overlay.generate",
            "id": "gen-2",
            "payload": {"sheet_a_id": "s-1"}
        }))
        .await
        .unwrap_err();

    assert_matches!(err, JobError::Core(CoreError::Validation(_)));
    assert_eq!(h.failed_error_type("gen-2"), "ValidationError");
    assert!(h.store.snapshot_overlays().is_empty());
}

#[tokio::test]
async fn missing_raster_is_permanent() {
    let h = Harness::new();
    h.store.insert_sheet(sheet("s-old", "d-1", "A-101", None));
    h.store.insert_sheet(sheet("s-new", "d-2", "A-101", Some("s-old")));
    h.put_raster("sheets/s-new.png", &blank(64));
    h.queue_job("gen-3", "sheet.overlay.generate");

    let err = h
        .dispatch(json!({"type": "sheet.overlay.generate", "id": "gen-3", "payload": {"sheetAId": "s-new"}}))
        .await
        .unwrap_err();

    assert!(!err.is_transient());
    assert_eq!(h.failed_error_type("gen-3"), "MissingFile");
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

fn runner_config() -> RunnerConfig {
    RunnerConfig {
        poll_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(5),
        lease_extension_secs: 60,
        max_lease_secs: 1800,
    }
}

fn worker(h: &Harness, queue: &Arc<MemoryQueue>) -> Worker {
    Worker::new(
        queue.clone(),
        Arc::clone(&h.dispatcher),
        Arc::new(FlowControl::new(3, 64 * 1024 * 1024, 1024 * 1024)),
        runner_config(),
    )
}

#[tokio::test]
async fn malformed_envelope_is_acked() {
    let h = Harness::new();
    let queue = Arc::new(MemoryQueue::new());
    queue.push(b"{\"id\": \"job-1\"}".to_vec(), HashMap::new());
    let delivery = queue.pull().await.unwrap().unwrap();

    assert_eq!(worker(&h, &queue).handle(&delivery).await, Outcome::Ack);
}

#[tokio::test]
async fn transient_failure_is_nacked() {
    let h = Harness::new();
    h.queue_job("job-1", "sheet.preprocess");
    h.store.set_unavailable(true);
    let queue = Arc::new(MemoryQueue::new());
    queue.push_json(
        &json!({"type": "sheet.preprocess", "id": "job-1", "payload": {"sheetId": "s-1"}}),
        Some("sheet.preprocess"),
    );
    let delivery = queue.pull().await.unwrap().unwrap();

    assert_eq!(worker(&h, &queue).handle(&delivery).await, Outcome::Nack);
}

#[tokio::test]
async fn job_type_hint_mismatch_is_acked() {
    let h = Harness::new();
    let queue = Arc::new(MemoryQueue::new());
    queue.push_json(
        &json!({"type": "sheet.preprocess", "id": "job-1", "payload": {"sheetId": "s-1"}}),
        Some("drawing.preprocess"),
    );
    let delivery = queue.pull().await.unwrap().unwrap();

    assert_eq!(worker(&h, &queue).handle(&delivery).await, Outcome::Ack);
}

#[tokio::test]
async fn run_loop_processes_queue_until_cancelled() {
    let h = Harness::new();
    seed_overlay(&h, "ov-1", "gen-1");
    h.queue_job("job-1", "overlay.change.detect");
    h.queue_job("job-2", "overlay.clash.detect");
    let queue = Arc::new(MemoryQueue::new());
    let first = queue.push_json(
        &json!({"type": "overlay.change.detect", "id": "job-1", "payload": {"overlayId": "ov-1"}}),
        None,
    );
    let second = queue.push_json(
        &json!({"type": "overlay.clash.detect", "id": "job-2", "payload": {"overlayId": "ov-1"}}),
        None,
    );

    let cancel = CancellationToken::new();
    let handle = {
        let worker = worker(&h, &queue);
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    tokio::time::timeout(Duration::from_secs(10), async {
        while queue.acked().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    cancel.cancel();
    handle.await.unwrap();

    let mut acked = queue.acked();
    acked.sort();
    assert_eq!(acked, vec![first, second]);
    assert!(queue.nacked().is_empty());
    assert_eq!(h.store.snapshot_overlays()[0].reports.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn delivery_waiting_for_memory_keeps_its_lease_and_yields_to_shutdown() {
    let h = Harness::new();
    h.queue_job("job-1", "sheet.preprocess");
    let flow = Arc::new(FlowControl::new(2, 1024 * 1024, 0));
    let mut hog = flow.acquire_slot().await.unwrap();
    hog.reserve_payload(1024 * 1024).await.unwrap();
    assert_eq!(flow.available_memory_kib(), 0);

    let queue = Arc::new(MemoryQueue::new());
    let message_id = queue.push_json(
        &json!({"type": "sheet.preprocess", "id": "job-1", "payload": {"sheetId": "s-1"}}),
        None,
    );

    let cancel = CancellationToken::new();
    let handle = {
        let worker = Worker::new(queue.clone(), Arc::clone(&h.dispatcher), Arc::clone(&flow), runner_config());
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    // Renewal runs every 30 s while the payload reservation is blocked.
    tokio::time::sleep(Duration::from_secs(95)).await;
    let renewed: Vec<u64> = queue
        .extensions()
        .into_iter()
        .filter(|(id, _)| *id == message_id)
        .map(|(_, seconds)| seconds)
        .collect();
    assert_eq!(renewed, vec![60, 60, 60]);
    assert_eq!(h.store.snapshot_job("job-1").unwrap().status, JobStatus::Queued);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("shutdown must not wait on the memory budget")
        .unwrap();

    assert_eq!(queue.nacked(), vec![message_id]);
    assert!(queue.acked().is_empty());
    drop(hog);
}
