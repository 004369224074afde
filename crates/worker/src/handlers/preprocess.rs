//! `sheet.preprocess` and `drawing.preprocess`.
//!
//! Decodes each sheet raster, records its dimensions and caches the grid
//! callouts found by the inference collaborator for later Stage-A use.

use plandiff_core::models::Sheet;
use plandiff_core::payload::{DrawingPreprocessPayload, SheetPreprocessPayload};
use plandiff_core::store::Changeset;
use plandiff_core::usage::UsageAccumulator;
use serde_json::json;

use super::{found, load_raster, metadata, HandlerContext, HandlerOutput};
use crate::error::JobResult;

pub async fn sheet(ctx: &HandlerContext, payload: SheetPreprocessPayload) -> JobResult<HandlerOutput> {
    let mut usage = UsageAccumulator::new();
    let sheet = found(
        "sheet",
        &payload.sheet_id,
        ctx.store.sheet(&payload.sheet_id).await?,
    )?;

    let sheet = preprocess_sheet(ctx, sheet, &mut usage).await?;
    let meta = metadata(json!({
        "width": sheet.width,
        "height": sheet.height,
        "calloutCount": callout_count(&sheet),
    }));

    let mut changeset = Changeset::new();
    changeset.update_sheet(sheet);
    Ok(HandlerOutput::new(changeset, meta).with_usage(usage.finish()))
}

pub async fn drawing(
    ctx: &HandlerContext,
    payload: DrawingPreprocessPayload,
) -> JobResult<HandlerOutput> {
    let mut usage = UsageAccumulator::new();
    let drawing = found(
        "drawing",
        &payload.drawing_id,
        ctx.store.drawing(&payload.drawing_id).await?,
    )?;
    let sheets = ctx.store.sheets_for_drawing(&drawing.id).await?;

    let mut changeset = Changeset::new();
    let mut callouts = 0;
    for sheet in sheets {
        let sheet = preprocess_sheet(ctx, sheet, &mut usage).await?;
        callouts += callout_count(&sheet);
        changeset.update_sheet(sheet);
    }

    tracing::info!(
        drawing_id = %drawing.id,
        sheets = changeset.sheets.len(),
        callouts,
        "Drawing preprocessed"
    );
    let meta = metadata(json!({
        "sheetCount": changeset.sheets.len(),
        "calloutCount": callouts,
    }));
    Ok(HandlerOutput::new(changeset, meta).with_usage(usage.finish()))
}

async fn preprocess_sheet(
    ctx: &HandlerContext,
    mut sheet: Sheet,
    usage: &mut UsageAccumulator,
) -> JobResult<Sheet> {
    let image = load_raster(ctx, &sheet.image_path).await?;
    let callouts = ctx.detector.detect_callouts(&image, usage).await?;

    tracing::debug!(
        sheet_id = %sheet.id,
        width = image.width(),
        height = image.height(),
        callouts = callouts.len(),
        "Sheet preprocessed"
    );
    sheet.width = Some(image.width());
    sheet.height = Some(image.height());
    sheet.grid_callouts = Some(callouts);
    Ok(sheet)
}

fn callout_count(sheet: &Sheet) -> usize {
    sheet.grid_callouts.as_ref().map_or(0, Vec::len)
}
