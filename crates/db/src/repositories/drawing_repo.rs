//! Repository for the `drawings`, `sheets` and `blocks` tables.

use plandiff_core::models::Sheet;
use sqlx::postgres::PgExecutor;

use crate::models::drawing::{BlockRow, DrawingRow, SheetRow};

const DRAWING_COLUMNS: &str = "id, name, previous_drawing_id";

const SHEET_COLUMNS: &str = "\
    id, drawing_id, sheet_number, image_path, width, height, \
    grid_callouts, previous_sheet_id";

const BLOCK_COLUMNS: &str = "\
    id, sheet_id, label, x_min, y_min, x_max, y_max, previous_block_id";

pub struct DrawingRepo;

impl DrawingRepo {
    pub async fn find_drawing<'e, E: PgExecutor<'e>>(
        executor: E,
        id: &str,
    ) -> Result<Option<DrawingRow>, sqlx::Error> {
        let query = format!("SELECT {DRAWING_COLUMNS} FROM drawings WHERE id = $1");
        sqlx::query_as::<_, DrawingRow>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn find_sheet<'e, E: PgExecutor<'e>>(
        executor: E,
        id: &str,
    ) -> Result<Option<SheetRow>, sqlx::Error> {
        let query = format!("SELECT {SHEET_COLUMNS} FROM sheets WHERE id = $1");
        sqlx::query_as::<_, SheetRow>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn list_sheets<'e, E: PgExecutor<'e>>(
        executor: E,
        drawing_id: &str,
    ) -> Result<Vec<SheetRow>, sqlx::Error> {
        let query = format!(
            "SELECT {SHEET_COLUMNS} FROM sheets WHERE drawing_id = $1 ORDER BY sheet_number"
        );
        sqlx::query_as::<_, SheetRow>(&query)
            .bind(drawing_id)
            .fetch_all(executor)
            .await
    }

    pub async fn find_block<'e, E: PgExecutor<'e>>(
        executor: E,
        id: &str,
    ) -> Result<Option<BlockRow>, sqlx::Error> {
        let query = format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE id = $1");
        sqlx::query_as::<_, BlockRow>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Persist the preprocessing results of a sheet.
    pub async fn update_sheet_analysis<'e, E: PgExecutor<'e>>(
        executor: E,
        sheet: &Sheet,
    ) -> Result<bool, sqlx::Error> {
        let callouts = sheet
            .grid_callouts
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let result = sqlx::query(
            "UPDATE sheets \
             SET width = $2, height = $3, grid_callouts = $4, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(&sheet.id)
        .bind(sheet.width.map(|w| w as i32))
        .bind(sheet.height.map(|h| h as i32))
        .bind(callouts)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
