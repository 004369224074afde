//! Repository for the `overlays` table.

use plandiff_core::models::{Overlay, OverlayReport};
use sqlx::postgres::PgExecutor;

use crate::models::overlay::OverlayRow;

const COLUMNS: &str = "\
    id, job_id, kind, source_a_id, source_b_id, \
    overlay_path, addition_path, deletion_path, alignment, reports, created_at";

pub struct OverlayRepo;

impl OverlayRepo {
    pub async fn find_by_id<'e, E: PgExecutor<'e>>(
        executor: E,
        id: &str,
    ) -> Result<Option<OverlayRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM overlays WHERE id = $1");
        sqlx::query_as::<_, OverlayRow>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Overlays produced by one generation job, oldest first.
    pub async fn list_by_job<'e, E: PgExecutor<'e>>(
        executor: E,
        job_id: &str,
    ) -> Result<Vec<OverlayRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM overlays WHERE job_id = $1 ORDER BY created_at, id"
        );
        sqlx::query_as::<_, OverlayRow>(&query)
            .bind(job_id)
            .fetch_all(executor)
            .await
    }

    pub async fn insert<'e, E: PgExecutor<'e>>(
        executor: E,
        overlay: &Overlay,
    ) -> Result<(), sqlx::Error> {
        let encode = |e: serde_json::Error| sqlx::Error::Encode(Box::new(e));
        let alignment = serde_json::to_value(&overlay.alignment).map_err(encode)?;
        let reports = serde_json::to_value(&overlay.reports).map_err(encode)?;
        sqlx::query(
            "INSERT INTO overlays \
                (id, job_id, kind, source_a_id, source_b_id, \
                 overlay_path, addition_path, deletion_path, alignment, reports, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&overlay.id)
        .bind(&overlay.job_id)
        .bind(overlay.kind.as_str())
        .bind(&overlay.source_a_id)
        .bind(&overlay.source_b_id)
        .bind(&overlay.overlay_path)
        .bind(&overlay.addition_path)
        .bind(&overlay.deletion_path)
        .bind(alignment)
        .bind(reports)
        .bind(overlay.created_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Append one report to the overlay's report list.
    ///
    /// Returns `false` if the overlay does not exist.
    pub async fn append_report<'e, E: PgExecutor<'e>>(
        executor: E,
        overlay_id: &str,
        report: &OverlayReport,
    ) -> Result<bool, sqlx::Error> {
        let report = serde_json::to_value(report).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let result = sqlx::query(
            "UPDATE overlays SET reports = reports || jsonb_build_array($2::jsonb) WHERE id = $1",
        )
        .bind(overlay_id)
        .bind(report)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
