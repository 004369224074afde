//! Rows of `drawings`, `sheets` and `blocks`.

use plandiff_core::models::{Block, BoundingBox, Drawing, Sheet};
use plandiff_core::store::StoreError;
use plandiff_core::types::EntityId;
use sqlx::FromRow;

use crate::error::decode_error;

#[derive(Debug, Clone, FromRow)]
pub struct DrawingRow {
    pub id: EntityId,
    pub name: String,
    pub previous_drawing_id: Option<EntityId>,
}

impl From<DrawingRow> for Drawing {
    fn from(row: DrawingRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            previous_drawing_id: row.previous_drawing_id,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SheetRow {
    pub id: EntityId,
    pub drawing_id: EntityId,
    pub sheet_number: String,
    pub image_path: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub grid_callouts: Option<serde_json::Value>,
    pub previous_sheet_id: Option<EntityId>,
}

impl TryFrom<SheetRow> for Sheet {
    type Error = StoreError;

    fn try_from(row: SheetRow) -> Result<Self, Self::Error> {
        let dimension = |v: Option<i32>, what: &str| {
            v.map(|v| u32::try_from(v).map_err(|_| decode_error("sheet", &row.id, format!("negative {what}"))))
                .transpose()
        };
        let width = dimension(row.width, "width")?;
        let height = dimension(row.height, "height")?;
        let grid_callouts = row
            .grid_callouts
            .clone()
            .map(serde_json::from_value::<Vec<BoundingBox>>)
            .transpose()
            .map_err(|e| decode_error("sheet", &row.id, e))?;
        Ok(Self {
            id: row.id,
            drawing_id: row.drawing_id,
            sheet_number: row.sheet_number,
            image_path: row.image_path,
            width,
            height,
            grid_callouts,
            previous_sheet_id: row.previous_sheet_id,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BlockRow {
    pub id: EntityId,
    pub sheet_id: EntityId,
    pub label: String,
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
    pub previous_block_id: Option<EntityId>,
}

impl TryFrom<BlockRow> for Block {
    type Error = StoreError;

    fn try_from(row: BlockRow) -> Result<Self, Self::Error> {
        let coord = |v: i32| {
            u32::try_from(v).map_err(|_| decode_error("block", &row.id, "negative coordinate"))
        };
        Ok(Self {
            x_min: coord(row.x_min)?,
            y_min: coord(row.y_min)?,
            x_max: coord(row.x_max)?,
            y_max: coord(row.y_max)?,
            id: row.id,
            sheet_id: row.sheet_id,
            label: row.label,
            previous_block_id: row.previous_block_id,
        })
    }
}
