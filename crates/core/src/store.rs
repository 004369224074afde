//! Persistence collaborator interface.
//!
//! [`Store`] offers auto-commit reads for handlers and opens
//! [`StoreTx`] transactions for the lifecycle controller. Handlers never
//! write directly: they describe their writes as a [`Changeset`] which is
//! applied in the same transaction as the job's `Completed` transition.

use async_trait::async_trait;

use crate::error::ErrorKind;
use crate::job::{Job, JobEvent, JobStatus};
use crate::models::{Block, Drawing, Overlay, OverlayReport, Sheet};
use crate::types::EntityId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connectivity problems: pool exhaustion, timeouts, dropped connections.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The backend asked for the transaction to be retried.
    #[error("Store conflict: {0}")]
    Conflict(String),

    /// Any other backend failure, including rows that fail to decode.
    #[error("Store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) | Self::Conflict(_) => ErrorKind::Transient,
            Self::Backend(_) => ErrorKind::Permanent,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "StoreUnavailable",
            Self::Conflict(_) => "StoreConflict",
            Self::Backend(_) => "StoreError",
        }
    }
}

/// Shared handle to the persistence backend.
#[async_trait]
pub trait Store: Send + Sync {
    async fn job(&self, id: &str) -> Result<Option<Job>, StoreError>;
    async fn drawing(&self, id: &str) -> Result<Option<Drawing>, StoreError>;
    async fn sheet(&self, id: &str) -> Result<Option<Sheet>, StoreError>;
    /// Sheets of a drawing ordered by sheet number.
    async fn sheets_for_drawing(&self, drawing_id: &str) -> Result<Vec<Sheet>, StoreError>;
    async fn block(&self, id: &str) -> Result<Option<Block>, StoreError>;
    async fn overlay(&self, id: &str) -> Result<Option<Overlay>, StoreError>;
    /// Overlays produced by a generation job, oldest first.
    async fn overlays_for_job(&self, job_id: &str) -> Result<Vec<Overlay>, StoreError>;

    /// Open a transaction. All writes go through it.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;
}

/// One unit of atomicity. Dropping without `commit` discards all writes.
#[async_trait]
pub trait StoreTx: Send {
    /// Re-read a job inside the transaction, locking it against
    /// concurrent lifecycle transitions.
    async fn job_for_update(&mut self, id: &str) -> Result<Option<Job>, StoreError>;
    async fn update_job_status(&mut self, job_id: &str, status: JobStatus) -> Result<(), StoreError>;
    /// Insert `event` unless the job already has one of the same type.
    /// Returns `true` when inserted.
    async fn append_job_event(&mut self, event: &JobEvent) -> Result<bool, StoreError>;
    async fn update_sheet(&mut self, sheet: &Sheet) -> Result<(), StoreError>;
    async fn insert_overlay(&mut self, overlay: &Overlay) -> Result<(), StoreError>;
    async fn append_overlay_report(
        &mut self,
        overlay_id: &str,
        report: &OverlayReport,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Writes produced by a handler, applied atomically on completion.
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    pub sheets: Vec<Sheet>,
    pub overlays: Vec<Overlay>,
    pub reports: Vec<(EntityId, OverlayReport)>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_sheet(&mut self, sheet: Sheet) {
        self.sheets.push(sheet);
    }

    pub fn insert_overlay(&mut self, overlay: Overlay) {
        self.overlays.push(overlay);
    }

    pub fn append_report(&mut self, overlay_id: impl Into<EntityId>, report: OverlayReport) {
        self.reports.push((overlay_id.into(), report));
    }

    pub fn is_empty(&self) -> bool {
        self.sheets.is_empty() && self.overlays.is_empty() && self.reports.is_empty()
    }

    /// Apply every write through `tx`, in sheet, overlay, report order so
    /// reports may target overlays inserted by the same changeset.
    pub async fn apply(&self, tx: &mut dyn StoreTx) -> Result<(), StoreError> {
        for sheet in &self.sheets {
            tx.update_sheet(sheet).await?;
        }
        for overlay in &self.overlays {
            tx.insert_overlay(overlay).await?;
        }
        for (overlay_id, report) in &self.reports {
            tx.append_overlay_report(overlay_id, report).await?;
        }
        Ok(())
    }
}
