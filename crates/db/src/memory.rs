//! In-process store for local runs and tests.
//!
//! Transactions stage their writes and apply them on commit; dropping or
//! rolling back a transaction discards them. Every applied write bumps a
//! mutation counter that tests use to prove a path touched nothing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use plandiff_core::job::{Job, JobEvent, JobStatus};
use plandiff_core::models::{Block, Drawing, Overlay, OverlayReport, Sheet};
use plandiff_core::store::{Store, StoreError, StoreTx};
use plandiff_core::types::EntityId;

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<EntityId, Job>,
    drawings: BTreeMap<EntityId, Drawing>,
    sheets: BTreeMap<EntityId, Sheet>,
    blocks: BTreeMap<EntityId, Block>,
    overlays: BTreeMap<EntityId, Overlay>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    mutations: AtomicU64,
    unavailable: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Seeding (not counted as mutations)
    // -----------------------------------------------------------------------

    pub fn insert_job(&self, job: Job) {
        self.shared.lock().jobs.insert(job.id.clone(), job);
    }

    pub fn insert_drawing(&self, drawing: Drawing) {
        self.shared.lock().drawings.insert(drawing.id.clone(), drawing);
    }

    pub fn insert_sheet(&self, sheet: Sheet) {
        self.shared.lock().sheets.insert(sheet.id.clone(), sheet);
    }

    pub fn insert_block(&self, block: Block) {
        self.shared.lock().blocks.insert(block.id.clone(), block);
    }

    pub fn insert_overlay(&self, overlay: Overlay) {
        self.shared.lock().overlays.insert(overlay.id.clone(), overlay);
    }

    /// Change a job's status as an external actor would (e.g. cancel).
    pub fn set_job_status(&self, job_id: &str, status: JobStatus) {
        if let Some(job) = self.shared.lock().jobs.get_mut(job_id) {
            job.status = status;
        }
    }

    /// Simulate an outage: every call fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of writes applied by committed transactions.
    pub fn mutation_count(&self) -> u64 {
        self.shared.mutations.load(Ordering::SeqCst)
    }

    pub fn snapshot_job(&self, id: &str) -> Option<Job> {
        self.shared.lock().jobs.get(id).cloned()
    }

    pub fn snapshot_sheet(&self, id: &str) -> Option<Sheet> {
        self.shared.lock().sheets.get(id).cloned()
    }

    pub fn snapshot_overlays(&self) -> Vec<Overlay> {
        self.shared.lock().overlays.values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        self.shared.check_available()?;
        Ok(self.shared.lock().jobs.get(id).cloned())
    }

    async fn drawing(&self, id: &str) -> Result<Option<Drawing>, StoreError> {
        self.shared.check_available()?;
        Ok(self.shared.lock().drawings.get(id).cloned())
    }

    async fn sheet(&self, id: &str) -> Result<Option<Sheet>, StoreError> {
        self.shared.check_available()?;
        Ok(self.shared.lock().sheets.get(id).cloned())
    }

    async fn sheets_for_drawing(&self, drawing_id: &str) -> Result<Vec<Sheet>, StoreError> {
        self.shared.check_available()?;
        let mut sheets: Vec<Sheet> = self
            .shared
            .lock()
            .sheets
            .values()
            .filter(|s| s.drawing_id == drawing_id)
            .cloned()
            .collect();
        sheets.sort_by(|a, b| a.sheet_number.cmp(&b.sheet_number));
        Ok(sheets)
    }

    async fn block(&self, id: &str) -> Result<Option<Block>, StoreError> {
        self.shared.check_available()?;
        Ok(self.shared.lock().blocks.get(id).cloned())
    }

    async fn overlay(&self, id: &str) -> Result<Option<Overlay>, StoreError> {
        self.shared.check_available()?;
        Ok(self.shared.lock().overlays.get(id).cloned())
    }

    async fn overlays_for_job(&self, job_id: &str) -> Result<Vec<Overlay>, StoreError> {
        self.shared.check_available()?;
        let mut overlays: Vec<Overlay> = self
            .shared
            .lock()
            .overlays
            .values()
            .filter(|o| o.job_id == job_id)
            .cloned()
            .collect();
        overlays.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(overlays)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        self.shared.check_available()?;
        Ok(Box::new(MemoryStoreTx {
            shared: Arc::clone(&self.shared),
            staged: Vec::new(),
        }))
    }
}

#[derive(Debug)]
enum StagedWrite {
    JobStatus(EntityId, JobStatus),
    JobEvent(JobEvent),
    Sheet(Sheet),
    Overlay(Overlay),
    Report(EntityId, OverlayReport),
}

pub struct MemoryStoreTx {
    shared: Arc<Shared>,
    staged: Vec<StagedWrite>,
}

impl MemoryStoreTx {
    /// The committed job with this transaction's staged writes applied.
    fn visible_job(&self, id: &str) -> Option<Job> {
        let mut job = self.shared.lock().jobs.get(id).cloned()?;
        for write in &self.staged {
            match write {
                StagedWrite::JobStatus(job_id, status) if job_id == id => job.status = *status,
                StagedWrite::JobEvent(event) if event.job_id == id => {
                    job.append_event(event.clone());
                }
                _ => {}
            }
        }
        Some(job)
    }

    fn overlay_visible(&self, id: &str) -> bool {
        self.shared.lock().overlays.contains_key(id)
            || self
                .staged
                .iter()
                .any(|w| matches!(w, StagedWrite::Overlay(o) if o.id == id))
    }
}

#[async_trait]
impl StoreTx for MemoryStoreTx {
    async fn job_for_update(&mut self, id: &str) -> Result<Option<Job>, StoreError> {
        self.shared.check_available()?;
        Ok(self.visible_job(id))
    }

    async fn update_job_status(&mut self, job_id: &str, status: JobStatus) -> Result<(), StoreError> {
        self.shared.check_available()?;
        if self.visible_job(job_id).is_none() {
            return Err(StoreError::Backend(format!("job {job_id} vanished during update")));
        }
        self.staged.push(StagedWrite::JobStatus(job_id.to_string(), status));
        Ok(())
    }

    async fn append_job_event(&mut self, event: &JobEvent) -> Result<bool, StoreError> {
        self.shared.check_available()?;
        let Some(job) = self.visible_job(&event.job_id) else {
            return Err(StoreError::Backend(format!("job {} not found", event.job_id)));
        };
        if job.has_event(event.event_type) {
            return Ok(false);
        }
        self.staged.push(StagedWrite::JobEvent(event.clone()));
        Ok(true)
    }

    async fn update_sheet(&mut self, sheet: &Sheet) -> Result<(), StoreError> {
        self.shared.check_available()?;
        if !self.shared.lock().sheets.contains_key(&sheet.id) {
            return Err(StoreError::Backend(format!("sheet {} not found", sheet.id)));
        }
        self.staged.push(StagedWrite::Sheet(sheet.clone()));
        Ok(())
    }

    async fn insert_overlay(&mut self, overlay: &Overlay) -> Result<(), StoreError> {
        self.shared.check_available()?;
        if self.overlay_visible(&overlay.id) {
            return Err(StoreError::Backend(format!("overlay {} already exists", overlay.id)));
        }
        self.staged.push(StagedWrite::Overlay(overlay.clone()));
        Ok(())
    }

    async fn append_overlay_report(
        &mut self,
        overlay_id: &str,
        report: &OverlayReport,
    ) -> Result<(), StoreError> {
        self.shared.check_available()?;
        if !self.overlay_visible(overlay_id) {
            return Err(StoreError::Backend(format!("overlay {overlay_id} not found")));
        }
        self.staged.push(StagedWrite::Report(overlay_id.to_string(), report.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryStoreTx { shared, staged } = *self;
        shared.check_available()?;
        let mut state = shared.lock();
        let mut applied = 0u64;
        for write in staged {
            match write {
                StagedWrite::JobStatus(id, status) => {
                    if let Some(job) = state.jobs.get_mut(&id) {
                        job.status = status;
                        applied += 1;
                    }
                }
                StagedWrite::JobEvent(event) => {
                    if let Some(job) = state.jobs.get_mut(&event.job_id) {
                        if job.append_event(event) {
                            applied += 1;
                        }
                    }
                }
                StagedWrite::Sheet(sheet) => {
                    state.sheets.insert(sheet.id.clone(), sheet);
                    applied += 1;
                }
                StagedWrite::Overlay(overlay) => {
                    state.overlays.insert(overlay.id.clone(), overlay);
                    applied += 1;
                }
                StagedWrite::Report(id, report) => {
                    if let Some(overlay) = state.overlays.get_mut(&id) {
                        overlay.reports.push(report);
                        applied += 1;
                    }
                }
            }
        }
        drop(state);
        shared.mutations.fetch_add(applied, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use plandiff_core::job::JobEventType;

    use super::*;

    fn job(id: &str, status: JobStatus) -> Job {
        Job {
            id: id.to_string(),
            job_type: "sheet.preprocess".to_string(),
            status,
            payload: serde_json::json!({"sheet_id": "s-1"}),
            events: Vec::new(),
        }
    }

    #[tokio::test]
    async fn committed_writes_are_visible_and_counted() {
        let store = MemoryStore::new();
        store.insert_job(job("j-1", JobStatus::Queued));

        let mut tx = store.begin().await.unwrap();
        tx.update_job_status("j-1", JobStatus::Started).await.unwrap();
        let event = JobEvent::new("sheet.preprocess", "j-1", JobEventType::Started);
        assert!(tx.append_job_event(&event).await.unwrap());
        assert!(!tx.append_job_event(&event).await.unwrap());
        tx.commit().await.unwrap();

        let stored = store.job("j-1").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Started);
        assert_eq!(stored.events.len(), 1);
        assert_eq!(store.mutation_count(), 2);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = MemoryStore::new();
        store.insert_job(job("j-1", JobStatus::Queued));

        let mut tx = store.begin().await.unwrap();
        tx.update_job_status("j-1", JobStatus::Failed).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.snapshot_job("j-1").unwrap().status, JobStatus::Queued);
        assert_eq!(store.mutation_count(), 0);
    }

    #[tokio::test]
    async fn staged_writes_are_visible_inside_the_transaction() {
        let store = MemoryStore::new();
        store.insert_job(job("j-1", JobStatus::Queued));

        let mut tx = store.begin().await.unwrap();
        tx.update_job_status("j-1", JobStatus::Started).await.unwrap();
        let seen = tx.job_for_update("j-1").await.unwrap().unwrap();
        assert_eq!(seen.status, JobStatus::Started);
        assert_eq!(store.snapshot_job("j-1").unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn report_for_unknown_overlay_is_rejected() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let report = OverlayReport {
            kind: plandiff_core::models::ReportKind::Change,
            job_id: "j-1".into(),
            summary: "x".into(),
            regions: Vec::new(),
            created_at: chrono::Utc::now(),
        };
        assert_matches!(
            tx.append_overlay_report("missing", &report).await,
            Err(StoreError::Backend(_))
        );
    }

    #[tokio::test]
    async fn outage_is_transient() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.job("j-1").await.unwrap_err();
        assert_matches!(err, StoreError::Unavailable(_));
        assert!(err.kind().is_transient());
    }
}
