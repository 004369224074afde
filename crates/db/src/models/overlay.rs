//! Rows of `overlays`.

use plandiff_core::models::{AlignmentResult, Overlay, OverlayKind, OverlayReport};
use plandiff_core::store::StoreError;
use plandiff_core::types::{EntityId, Timestamp};
use sqlx::FromRow;

use crate::error::decode_error;

#[derive(Debug, Clone, FromRow)]
pub struct OverlayRow {
    pub id: EntityId,
    pub job_id: EntityId,
    pub kind: String,
    pub source_a_id: EntityId,
    pub source_b_id: EntityId,
    pub overlay_path: String,
    pub addition_path: String,
    pub deletion_path: String,
    pub alignment: serde_json::Value,
    pub reports: serde_json::Value,
    pub created_at: Timestamp,
}

impl TryFrom<OverlayRow> for Overlay {
    type Error = StoreError;

    fn try_from(row: OverlayRow) -> Result<Self, Self::Error> {
        let kind = OverlayKind::parse(&row.kind)
            .ok_or_else(|| decode_error("overlay", &row.id, format!("unknown kind {}", row.kind)))?;
        let alignment: AlignmentResult = serde_json::from_value(row.alignment)
            .map_err(|e| decode_error("overlay", &row.id, e))?;
        let reports: Vec<OverlayReport> = serde_json::from_value(row.reports)
            .map_err(|e| decode_error("overlay", &row.id, e))?;
        Ok(Self {
            id: row.id,
            job_id: row.job_id,
            kind,
            source_a_id: row.source_a_id,
            source_b_id: row.source_b_id,
            overlay_path: row.overlay_path,
            addition_path: row.addition_path,
            deletion_path: row.deletion_path,
            alignment,
            reports,
            created_at: row.created_at,
        })
    }
}
