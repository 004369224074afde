//! Postgres implementation of the persistence collaborator.

use async_trait::async_trait;
use plandiff_core::job::{Job, JobEvent, JobStatus};
use plandiff_core::models::{Block, Drawing, Overlay, OverlayReport, Sheet};
use plandiff_core::store::{Store, StoreError, StoreTx};
use sqlx::{Postgres, Transaction};

use crate::error::store_error;
use crate::repositories::{DrawingRepo, JobRepo, OverlayRepo};
use crate::DbPool;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let Some(row) = JobRepo::find_by_id(&self.pool, id).await.map_err(store_error)? else {
            return Ok(None);
        };
        let events = JobRepo::list_events(&self.pool, id).await.map_err(store_error)?;
        row.into_job(events).map(Some)
    }

    async fn drawing(&self, id: &str) -> Result<Option<Drawing>, StoreError> {
        let row = DrawingRepo::find_drawing(&self.pool, id).await.map_err(store_error)?;
        Ok(row.map(Drawing::from))
    }

    async fn sheet(&self, id: &str) -> Result<Option<Sheet>, StoreError> {
        DrawingRepo::find_sheet(&self.pool, id)
            .await
            .map_err(store_error)?
            .map(Sheet::try_from)
            .transpose()
    }

    async fn sheets_for_drawing(&self, drawing_id: &str) -> Result<Vec<Sheet>, StoreError> {
        DrawingRepo::list_sheets(&self.pool, drawing_id)
            .await
            .map_err(store_error)?
            .into_iter()
            .map(Sheet::try_from)
            .collect()
    }

    async fn block(&self, id: &str) -> Result<Option<Block>, StoreError> {
        DrawingRepo::find_block(&self.pool, id)
            .await
            .map_err(store_error)?
            .map(Block::try_from)
            .transpose()
    }

    async fn overlay(&self, id: &str) -> Result<Option<Overlay>, StoreError> {
        OverlayRepo::find_by_id(&self.pool, id)
            .await
            .map_err(store_error)?
            .map(Overlay::try_from)
            .transpose()
    }

    async fn overlays_for_job(&self, job_id: &str) -> Result<Vec<Overlay>, StoreError> {
        OverlayRepo::list_by_job(&self.pool, job_id)
            .await
            .map_err(store_error)?
            .into_iter()
            .map(Overlay::try_from)
            .collect()
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await.map_err(store_error)?;
        Ok(Box::new(PgStoreTx { tx }))
    }
}

pub struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn job_for_update(&mut self, id: &str) -> Result<Option<Job>, StoreError> {
        let Some(row) = JobRepo::find_for_update(&mut *self.tx, id)
            .await
            .map_err(store_error)?
        else {
            return Ok(None);
        };
        let events = JobRepo::list_events(&mut *self.tx, id)
            .await
            .map_err(store_error)?;
        row.into_job(events).map(Some)
    }

    async fn update_job_status(&mut self, job_id: &str, status: JobStatus) -> Result<(), StoreError> {
        let updated = JobRepo::update_status(&mut *self.tx, job_id, status)
            .await
            .map_err(store_error)?;
        if !updated {
            return Err(StoreError::Backend(format!("job {job_id} vanished during update")));
        }
        Ok(())
    }

    async fn append_job_event(&mut self, event: &JobEvent) -> Result<bool, StoreError> {
        JobRepo::append_event(&mut *self.tx, event)
            .await
            .map_err(store_error)
    }

    async fn update_sheet(&mut self, sheet: &Sheet) -> Result<(), StoreError> {
        let updated = DrawingRepo::update_sheet_analysis(&mut *self.tx, sheet)
            .await
            .map_err(store_error)?;
        if !updated {
            return Err(StoreError::Backend(format!("sheet {} not found", sheet.id)));
        }
        Ok(())
    }

    async fn insert_overlay(&mut self, overlay: &Overlay) -> Result<(), StoreError> {
        OverlayRepo::insert(&mut *self.tx, overlay)
            .await
            .map_err(store_error)
    }

    async fn append_overlay_report(
        &mut self,
        overlay_id: &str,
        report: &OverlayReport,
    ) -> Result<(), StoreError> {
        let appended = OverlayRepo::append_report(&mut *self.tx, overlay_id, report)
            .await
            .map_err(store_error)?;
        if !appended {
            return Err(StoreError::Backend(format!("overlay {overlay_id} not found")));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(store_error)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(store_error)
    }
}
