//! `sheet.overlay.generate`, `block.overlay.generate` and
//! `drawing.overlay.generate`.
//!
//! `a` is the newer revision and `b` the older one; `a` is registered onto
//! `b` and every artifact is rendered in `b`'s frame.

use std::collections::BTreeMap;

use futures::future::{try_join, try_join3};
use image::GrayImage;
use plandiff_core::error::CoreError;
use plandiff_core::models::{AlignmentResult, Block, BoundingBox, Overlay, OverlayKind, Sheet};
use plandiff_core::payload::{BlockOverlayPayload, DrawingOverlayPayload, SheetOverlayPayload};
use plandiff_core::store::Changeset;
use plandiff_core::types::EntityId;
use plandiff_core::usage::UsageAccumulator;
use plandiff_pipeline::raster::{crop, encode_gray_png, encode_rgb_png};
use plandiff_pipeline::{grid_prior, render_diff, Similarity, VisionError};
use serde_json::json;

use super::{found, load_raster, metadata, upload_png, HandlerContext, HandlerOutput};
use crate::error::JobResult;

/// One side of a comparison.
struct Side {
    id: EntityId,
    image: GrayImage,
    /// Cached grid callouts in this raster's coordinates, if known.
    callouts: Option<Vec<BoundingBox>>,
}

struct Rendered {
    alignment: AlignmentResult,
    overlay: Vec<u8>,
    additions: Vec<u8>,
    deletions: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn sheet(
    ctx: &HandlerContext,
    job_id: &EntityId,
    payload: SheetOverlayPayload,
) -> JobResult<HandlerOutput> {
    let mut usage = UsageAccumulator::new();
    let a = load_sheet(ctx, &payload.sheet_a_id).await?;
    let b_id = payload
        .sheet_b_id
        .clone()
        .or_else(|| a.previous_sheet_id.clone())
        .ok_or_else(|| {
            CoreError::Validation(format!(
                "sheet {} has no previous revision and no sheet_b_id was given",
                a.id
            ))
        })?;
    let b = load_sheet(ctx, &b_id).await?;

    let overlay = compare_sheets(
        ctx,
        job_id,
        &a,
        &b,
        payload.use_grid_alignment.unwrap_or(true),
        &mut usage,
    )
    .await?;

    let meta = alignment_metadata(&overlay);
    let mut changeset = Changeset::new();
    changeset.insert_overlay(overlay);
    Ok(HandlerOutput::new(changeset, meta).with_usage(usage.finish()))
}

pub async fn block(
    ctx: &HandlerContext,
    job_id: &EntityId,
    payload: BlockOverlayPayload,
) -> JobResult<HandlerOutput> {
    let mut usage = UsageAccumulator::new();
    let a = load_block(ctx, &payload.block_a_id).await?;
    let b_id = payload
        .block_b_id
        .clone()
        .or_else(|| a.previous_block_id.clone())
        .ok_or_else(|| {
            CoreError::Validation(format!(
                "block {} has no previous revision and no block_b_id was given",
                a.id
            ))
        })?;
    let b = load_block(ctx, &b_id).await?;
    let (sheet_a, sheet_b) = try_join(load_sheet(ctx, &a.sheet_id), load_sheet(ctx, &b.sheet_id)).await?;
    let (raster_a, raster_b) = try_join(
        load_raster(ctx, &sheet_a.image_path),
        load_raster(ctx, &sheet_b.image_path),
    )
    .await?;

    let (crop_a, crop_b) = (a.clone(), b.clone());
    let (image_a, image_b) = tokio::task::spawn_blocking(move || {
        Ok::<_, VisionError>((crop_block(&raster_a, &crop_a)?, crop_block(&raster_b, &crop_b)?))
    })
    .await??;

    let new = Side {
        id: a.id.clone(),
        image: image_a,
        callouts: sheet_a.grid_callouts.as_deref().map(|c| callouts_within(c, &a)),
    };
    let old = Side {
        id: b.id.clone(),
        image: image_b,
        callouts: sheet_b.grid_callouts.as_deref().map(|c| callouts_within(c, &b)),
    };
    let overlay = generate(
        ctx,
        job_id,
        OverlayKind::Block,
        new,
        old,
        payload.use_grid_alignment.unwrap_or(true),
        &mut usage,
    )
    .await?;

    let meta = alignment_metadata(&overlay);
    let mut changeset = Changeset::new();
    changeset.insert_overlay(overlay);
    Ok(HandlerOutput::new(changeset, meta).with_usage(usage.finish()))
}

/// Pair sheets of two drawing revisions by sheet number and overlay each
/// pair.
pub async fn drawing(
    ctx: &HandlerContext,
    job_id: &EntityId,
    payload: DrawingOverlayPayload,
) -> JobResult<HandlerOutput> {
    let mut usage = UsageAccumulator::new();
    let a = found(
        "drawing",
        &payload.drawing_a_id,
        ctx.store.drawing(&payload.drawing_a_id).await?,
    )?;
    let b_id = payload
        .drawing_b_id
        .clone()
        .or_else(|| a.previous_drawing_id.clone())
        .ok_or_else(|| {
            CoreError::Validation(format!(
                "drawing {} has no previous revision and no drawing_b_id was given",
                a.id
            ))
        })?;
    let b = found("drawing", &b_id, ctx.store.drawing(&b_id).await?)?;

    let sheets_a = ctx.store.sheets_for_drawing(&a.id).await?;
    let sheets_b = ctx.store.sheets_for_drawing(&b.id).await?;
    let (pairs, unpaired) = pair_sheets(&sheets_a, &sheets_b);
    if pairs.is_empty() {
        return Err(CoreError::Validation(format!(
            "drawings {} and {} share no sheet numbers",
            a.id, b.id
        ))
        .into());
    }

    let use_grid = payload.use_grid_alignment.unwrap_or(true);
    let mut changeset = Changeset::new();
    let mut paired_numbers = Vec::with_capacity(pairs.len());
    // Sequential so only one pair of rasters is resident at a time.
    for (sheet_a, sheet_b) in pairs {
        let overlay = compare_sheets(ctx, job_id, sheet_a, sheet_b, use_grid, &mut usage).await?;
        paired_numbers.push(sheet_a.sheet_number.clone());
        changeset.insert_overlay(overlay);
    }

    tracing::info!(
        drawing_a_id = %a.id,
        drawing_b_id = %b.id,
        overlays = changeset.overlays.len(),
        unpaired = unpaired.len(),
        "Drawing overlays generated"
    );
    let overlay_ids: Vec<&str> = changeset.overlays.iter().map(|o| o.id.as_str()).collect();
    let meta = metadata(json!({
        "overlayIds": overlay_ids,
        "pairedSheets": paired_numbers,
        "unpairedSheets": unpaired,
    }));
    Ok(HandlerOutput::new(changeset, meta).with_usage(usage.finish()))
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

async fn compare_sheets(
    ctx: &HandlerContext,
    job_id: &EntityId,
    a: &Sheet,
    b: &Sheet,
    use_grid: bool,
    usage: &mut UsageAccumulator,
) -> JobResult<Overlay> {
    let (image_a, image_b) =
        try_join(load_raster(ctx, &a.image_path), load_raster(ctx, &b.image_path)).await?;
    let new = Side {
        id: a.id.clone(),
        image: image_a,
        callouts: a.grid_callouts.clone(),
    };
    let old = Side {
        id: b.id.clone(),
        image: image_b,
        callouts: b.grid_callouts.clone(),
    };
    generate(ctx, job_id, OverlayKind::Sheet, new, old, use_grid, usage).await
}

async fn generate(
    ctx: &HandlerContext,
    job_id: &EntityId,
    kind: OverlayKind,
    new: Side,
    old: Side,
    use_grid: bool,
    usage: &mut UsageAccumulator,
) -> JobResult<Overlay> {
    let prior = if use_grid {
        let new_callouts = resolve_callouts(ctx, &new, usage).await;
        let old_callouts = resolve_callouts(ctx, &old, usage).await;
        grid_prior(&new_callouts, &old_callouts)
    } else {
        None
    };

    let engine = ctx.engine.clone();
    let diff = ctx.diff.clone();
    let (new_image, old_image) = (new.image, old.image);
    let rendered = tokio::task::spawn_blocking(move || -> Result<Rendered, VisionError> {
        let alignment = engine.align(&new_image, &old_image, prior.as_ref())?;
        let transform = Similarity::from_matrix(&alignment.transform);
        let artifacts = render_diff(&new_image, &old_image, &transform, &diff)?;
        Ok(Rendered {
            overlay: encode_rgb_png(&artifacts.overlay)?,
            additions: encode_gray_png(&artifacts.additions)?,
            deletions: encode_gray_png(&artifacts.deletions)?,
            alignment,
        })
    })
    .await??;

    let overlay_id = uuid::Uuid::now_v7().to_string();
    let overlay_path = format!("overlays/{overlay_id}/overlay.png");
    let addition_path = format!("overlays/{overlay_id}/addition.png");
    let deletion_path = format!("overlays/{overlay_id}/deletion.png");
    try_join3(
        upload_png(ctx, &overlay_path, rendered.overlay),
        upload_png(ctx, &addition_path, rendered.additions),
        upload_png(ctx, &deletion_path, rendered.deletions),
    )
    .await?;

    tracing::info!(
        overlay_id = %overlay_id,
        kind = kind.as_str(),
        source_a_id = %new.id,
        source_b_id = %old.id,
        "Overlay artifacts uploaded"
    );
    Ok(Overlay {
        id: overlay_id,
        job_id: job_id.clone(),
        kind,
        source_a_id: new.id,
        source_b_id: old.id,
        overlay_path,
        addition_path,
        deletion_path,
        alignment: rendered.alignment,
        reports: Vec::new(),
        created_at: chrono::Utc::now(),
    })
}

/// Cached callouts win; otherwise ask the detector. Detector failures
/// only cost the grid prior.
async fn resolve_callouts(
    ctx: &HandlerContext,
    side: &Side,
    usage: &mut UsageAccumulator,
) -> Vec<BoundingBox> {
    if let Some(cached) = &side.callouts {
        return cached.clone();
    }
    match ctx.detector.detect_callouts(&side.image, usage).await {
        Ok(callouts) => callouts,
        Err(e) => {
            tracing::warn!(
                source_id = %side.id,
                error = %e,
                "Callout detection failed, continuing without grid prior"
            );
            Vec::new()
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn load_sheet(ctx: &HandlerContext, id: &str) -> JobResult<Sheet> {
    found("sheet", id, ctx.store.sheet(id).await?)
}

async fn load_block(ctx: &HandlerContext, id: &str) -> JobResult<Block> {
    found("block", id, ctx.store.block(id).await?)
}

fn crop_block(sheet: &GrayImage, block: &Block) -> Result<GrayImage, VisionError> {
    crop(sheet, block.x_min, block.y_min, block.width(), block.height())
}

/// Sheet callouts whose centroid falls inside `block`, shifted into the
/// block's coordinates.
fn callouts_within(callouts: &[BoundingBox], block: &Block) -> Vec<BoundingBox> {
    let (x0, y0) = (f64::from(block.x_min), f64::from(block.y_min));
    let (x1, y1) = (f64::from(block.x_max), f64::from(block.y_max));
    callouts
        .iter()
        .filter(|c| {
            let (cx, cy) = c.centroid();
            cx >= x0 && cx < x1 && cy >= y0 && cy < y1
        })
        .map(|c| BoundingBox {
            label: c.label.clone(),
            x_min: c.x_min - x0,
            y_min: c.y_min - y0,
            x_max: c.x_max - x0,
            y_max: c.y_max - y0,
        })
        .collect()
}

/// Match sheets by sheet number. Returns the pairs and the numbers that
/// exist on only one side.
fn pair_sheets<'a>(a: &'a [Sheet], b: &'a [Sheet]) -> (Vec<(&'a Sheet, &'a Sheet)>, Vec<String>) {
    let by_number: BTreeMap<&str, &Sheet> = b.iter().map(|s| (s.sheet_number.as_str(), s)).collect();
    let mut pairs = Vec::new();
    let mut unpaired = Vec::new();
    for sheet in a {
        match by_number.get(sheet.sheet_number.as_str()) {
            Some(old) => pairs.push((sheet, *old)),
            None => unpaired.push(sheet.sheet_number.clone()),
        }
    }
    for sheet in b {
        if !a.iter().any(|s| s.sheet_number == sheet.sheet_number) {
            unpaired.push(sheet.sheet_number.clone());
        }
    }
    (pairs, unpaired)
}

fn alignment_metadata(overlay: &Overlay) -> plandiff_core::types::JsonMap {
    let a = &overlay.alignment;
    metadata(json!({
        "overlayId": overlay.id,
        "scale": a.scale,
        "rotationDegrees": a.rotation_degrees,
        "inlierCount": a.inlier_count,
        "confidence": a.confidence,
        "gridPrior": a.grid_prior,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet(id: &str, number: &str) -> Sheet {
        Sheet {
            id: id.into(),
            drawing_id: "d".into(),
            sheet_number: number.into(),
            image_path: format!("sheets/{id}.png"),
            width: None,
            height: None,
            grid_callouts: None,
            previous_sheet_id: None,
        }
    }

    fn block(x_min: u32, y_min: u32, x_max: u32, y_max: u32) -> Block {
        Block {
            id: "b".into(),
            sheet_id: "s".into(),
            label: "Detail 3".into(),
            x_min,
            y_min,
            x_max,
            y_max,
            previous_block_id: None,
        }
    }

    #[test]
    fn sheets_pair_by_number() {
        let a = vec![sheet("a1", "A-101"), sheet("a2", "A-102"), sheet("a3", "A-201")];
        let b = vec![sheet("b1", "A-102"), sheet("b2", "A-101"), sheet("b3", "S-001")];
        let (pairs, unpaired) = pair_sheets(&a, &b);
        let ids: Vec<(&str, &str)> = pairs.iter().map(|(x, y)| (x.id.as_str(), y.id.as_str())).collect();
        assert_eq!(ids, vec![("a1", "b2"), ("a2", "b1")]);
        assert_eq!(unpaired, vec!["A-201".to_string(), "S-001".to_string()]);
    }

    #[test]
    fn callouts_are_clipped_and_shifted_into_block() {
        let bubble = |label: &str, cx: f64, cy: f64| BoundingBox {
            label: label.into(),
            x_min: cx - 5.0,
            y_min: cy - 5.0,
            x_max: cx + 5.0,
            y_max: cy + 5.0,
        };
        let callouts = vec![bubble("1", 150.0, 120.0), bubble("2", 400.0, 120.0)];
        let inside = callouts_within(&callouts, &block(100, 100, 300, 300));
        assert_eq!(inside.len(), 1);
        assert_eq!(inside[0].label, "1");
        assert_eq!(inside[0].centroid(), (50.0, 20.0));
    }

    #[test]
    fn block_crop_uses_block_rectangle() {
        let img = GrayImage::new(200, 100);
        let cropped = crop_block(&img, &block(10, 20, 60, 90)).unwrap();
        assert_eq!(cropped.dimensions(), (50, 70));
    }
}
