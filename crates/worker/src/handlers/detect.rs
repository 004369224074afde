//! `overlay.change.detect` and `overlay.clash.detect`.
//!
//! Both read the addition and deletion rasters of existing overlays,
//! extract connected regions and attach a report to each overlay.

use futures::future::try_join;
use plandiff_core::error::CoreError;
use plandiff_core::models::{Overlay, OverlayReport, Region};
use plandiff_core::payload::{OverlayTarget, OverlayTargetPayload};
use plandiff_core::store::Changeset;
use plandiff_core::types::{EntityId, Timestamp};
use plandiff_pipeline::report::{change_report, clash_report};
use plandiff_pipeline::{extract_regions, Polarity};
use serde_json::json;

use super::{found, load_raster, metadata, HandlerContext, HandlerOutput};
use crate::error::JobResult;

type ReportFn = fn(&EntityId, &[Region], &[Region], Timestamp) -> OverlayReport;

pub async fn change(
    ctx: &HandlerContext,
    job_id: &EntityId,
    payload: OverlayTargetPayload,
) -> JobResult<HandlerOutput> {
    let scan = scan(ctx, job_id, &payload, change_report).await?;
    let meta = metadata(json!({
        "overlayCount": scan.overlay_count,
        "additionRegions": scan.additions,
        "deletionRegions": scan.deletions,
    }));
    Ok(HandlerOutput::new(scan.changeset, meta))
}

pub async fn clash(
    ctx: &HandlerContext,
    job_id: &EntityId,
    payload: OverlayTargetPayload,
) -> JobResult<HandlerOutput> {
    let scan = scan(ctx, job_id, &payload, clash_report).await?;
    let meta = metadata(json!({
        "overlayCount": scan.overlay_count,
        "clashCount": scan.additions + scan.deletions,
    }));
    Ok(HandlerOutput::new(scan.changeset, meta))
}

struct Scan {
    changeset: Changeset,
    overlay_count: usize,
    additions: usize,
    deletions: usize,
}

async fn scan(
    ctx: &HandlerContext,
    job_id: &EntityId,
    payload: &OverlayTargetPayload,
    build: ReportFn,
) -> JobResult<Scan> {
    let overlays = resolve_overlays(ctx, payload.target()?).await?;
    let mut scan = Scan {
        changeset: Changeset::new(),
        overlay_count: overlays.len(),
        additions: 0,
        deletions: 0,
    };

    for overlay in overlays {
        let (additions, deletions) = regions_of(ctx, &overlay).await?;
        tracing::debug!(
            overlay_id = %overlay.id,
            additions = additions.len(),
            deletions = deletions.len(),
            "Regions extracted"
        );
        scan.additions += additions.len();
        scan.deletions += deletions.len();
        let report = build(job_id, &additions, &deletions, chrono::Utc::now());
        scan.changeset.append_report(overlay.id, report);
    }
    Ok(scan)
}

async fn resolve_overlays(ctx: &HandlerContext, target: OverlayTarget) -> JobResult<Vec<Overlay>> {
    match target {
        OverlayTarget::ProducedBy { field, job_id } => {
            let overlays = ctx.store.overlays_for_job(&job_id).await?;
            if overlays.is_empty() {
                return Err(CoreError::not_found("overlay", format!("{field}={job_id}")).into());
            }
            Ok(overlays)
        }
        OverlayTarget::Overlay(id) => {
            let overlay = found("overlay", &id, ctx.store.overlay(&id).await?)?;
            Ok(vec![overlay])
        }
    }
}

async fn regions_of(ctx: &HandlerContext, overlay: &Overlay) -> JobResult<(Vec<Region>, Vec<Region>)> {
    let (additions, deletions) = try_join(
        load_raster(ctx, &overlay.addition_path),
        load_raster(ctx, &overlay.deletion_path),
    )
    .await?;
    let diff = ctx.diff.clone();
    let regions = tokio::task::spawn_blocking(move || {
        (
            extract_regions(&additions, Polarity::Addition, &diff),
            extract_regions(&deletions, Polarity::Deletion, &diff),
        )
    })
    .await?;
    Ok(regions)
}
