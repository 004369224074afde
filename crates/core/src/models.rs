//! Entities read and written through the persistence collaborator, plus
//! the value types exchanged between the alignment and diff stages.

use serde::{Deserialize, Serialize};

use crate::types::{EntityId, Timestamp};

// ---------------------------------------------------------------------------
// Drawings, sheets, blocks
// ---------------------------------------------------------------------------

/// One revision of a drawing set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drawing {
    pub id: EntityId,
    pub name: String,
    /// The revision this one supersedes, if any.
    pub previous_drawing_id: Option<EntityId>,
}

/// A single rasterised sheet of a drawing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub id: EntityId,
    pub drawing_id: EntityId,
    /// Sheet number as printed in the title block (e.g. `"A-101"`).
    pub sheet_number: String,
    /// Object-store path of the sheet raster.
    pub image_path: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Grid callouts cached by `sheet.preprocess`.
    pub grid_callouts: Option<Vec<BoundingBox>>,
    pub previous_sheet_id: Option<EntityId>,
}

/// A rectangular area of a sheet (e.g. a detail or a plan view).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: EntityId,
    pub sheet_id: EntityId,
    pub label: String,
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
    pub previous_block_id: Option<EntityId>,
}

impl Block {
    pub fn width(&self) -> u32 {
        self.x_max.saturating_sub(self.x_min)
    }

    pub fn height(&self) -> u32 {
        self.y_max.saturating_sub(self.y_min)
    }
}

// ---------------------------------------------------------------------------
// Detection / alignment values
// ---------------------------------------------------------------------------

/// A labelled box returned by callout detection, in raster pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub label: String,
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl BoundingBox {
    pub fn centroid(&self) -> (f64, f64) {
        (
            (self.x_min + self.x_max) / 2.0,
            (self.y_min + self.y_max) / 2.0,
        )
    }
}

/// Outcome of registering a `new` raster onto an `old` one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentResult {
    /// Row-major 3x3 matrix mapping `new` pixel coordinates into `old`.
    pub transform: [[f64; 3]; 3],
    pub scale: f64,
    pub rotation_degrees: f64,
    pub inlier_count: usize,
    pub match_count: usize,
    /// RMS reprojection error of the inliers, in pixels.
    pub residual_px: f64,
    /// Inlier ratio in `0.0..=1.0`.
    pub confidence: f64,
    /// Whether a grid-callout prior seeded the estimate.
    pub grid_prior: bool,
}

/// A connected change area in pixel coordinates of a raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub label: String,
    pub x_min: u32,
    pub x_max: u32,
    pub y_min: u32,
    pub y_max: u32,
    pub description: String,
}

// ---------------------------------------------------------------------------
// Overlays and reports
// ---------------------------------------------------------------------------

/// What an overlay compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayKind {
    Sheet,
    Block,
}

impl OverlayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sheet => "sheet",
            Self::Block => "block",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sheet" => Some(Self::Sheet),
            "block" => Some(Self::Block),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Change,
    Clash,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Change => "change",
            Self::Clash => "clash",
        }
    }
}

/// A change or clash report attached to an overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayReport {
    pub kind: ReportKind,
    /// The detection job that produced the report.
    pub job_id: EntityId,
    pub summary: String,
    pub regions: Vec<Region>,
    pub created_at: Timestamp,
}

/// The artifact produced by comparing two rasters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub id: EntityId,
    /// The overlay-generation job that produced this overlay.
    pub job_id: EntityId,
    pub kind: OverlayKind,
    /// Newer sheet/block.
    pub source_a_id: EntityId,
    /// Older sheet/block.
    pub source_b_id: EntityId,
    pub overlay_path: String,
    pub addition_path: String,
    pub deletion_path: String,
    pub alignment: AlignmentResult,
    /// Accumulated reports; appended to, never truncated.
    pub reports: Vec<OverlayReport>,
    pub created_at: Timestamp,
}
