//! Job-type registry and strongly-typed payloads.
//!
//! Every supported job type maps to one [`JobPayload`] variant. Payloads
//! are decoded strictly: unknown fields are rejected so that schema drift
//! between producer and worker fails closed instead of being ignored.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::job::EventSubject;
use crate::types::{EntityId, JsonMap};

// ---------------------------------------------------------------------------
// JobType
// ---------------------------------------------------------------------------

pub const JOB_DRAWING_PREPROCESS: &str = "drawing.preprocess";
pub const JOB_SHEET_PREPROCESS: &str = "sheet.preprocess";
pub const JOB_DRAWING_OVERLAY: &str = "drawing.overlay.generate";
pub const JOB_SHEET_OVERLAY: &str = "sheet.overlay.generate";
pub const JOB_BLOCK_OVERLAY: &str = "block.overlay.generate";
pub const JOB_CHANGE_DETECT: &str = "overlay.change.detect";
pub const JOB_CLASH_DETECT: &str = "overlay.clash.detect";

/// Stable job-type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    DrawingPreprocess,
    SheetPreprocess,
    DrawingOverlay,
    SheetOverlay,
    BlockOverlay,
    ChangeDetect,
    ClashDetect,
}

impl JobType {
    /// Every registered job type, in registry order.
    pub const ALL: [JobType; 7] = [
        JobType::DrawingPreprocess,
        JobType::SheetPreprocess,
        JobType::DrawingOverlay,
        JobType::SheetOverlay,
        JobType::BlockOverlay,
        JobType::ChangeDetect,
        JobType::ClashDetect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DrawingPreprocess => JOB_DRAWING_PREPROCESS,
            Self::SheetPreprocess => JOB_SHEET_PREPROCESS,
            Self::DrawingOverlay => JOB_DRAWING_OVERLAY,
            Self::SheetOverlay => JOB_SHEET_OVERLAY,
            Self::BlockOverlay => JOB_BLOCK_OVERLAY,
            Self::ChangeDetect => JOB_CHANGE_DETECT,
            Self::ClashDetect => JOB_CLASH_DETECT,
        }
    }

    /// Resolve a wire identifier, failing with `UnsupportedJobType`.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoreError::UnsupportedJobType(s.to_string()))
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payload schemas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DrawingPreprocessPayload {
    #[validate(length(min = 1))]
    pub drawing_id: EntityId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SheetPreprocessPayload {
    #[validate(length(min = 1))]
    pub sheet_id: EntityId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DrawingOverlayPayload {
    #[validate(length(min = 1))]
    pub drawing_a_id: EntityId,
    #[validate(length(min = 1))]
    pub drawing_b_id: Option<EntityId>,
    pub use_grid_alignment: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SheetOverlayPayload {
    #[validate(length(min = 1))]
    pub sheet_a_id: EntityId,
    #[validate(length(min = 1))]
    pub sheet_b_id: Option<EntityId>,
    pub use_grid_alignment: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct BlockOverlayPayload {
    #[validate(length(min = 1))]
    pub block_a_id: EntityId,
    #[validate(length(min = 1))]
    pub block_b_id: Option<EntityId>,
    pub use_grid_alignment: Option<bool>,
}

/// Shared payload of `overlay.change.detect` and `overlay.clash.detect`.
///
/// Exactly one identifying field is required; when several are supplied
/// the first in [`OverlayTargetPayload::target`] priority order wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct OverlayTargetPayload {
    pub overlay_job_id: Option<EntityId>,
    pub block_overlay_job_id: Option<EntityId>,
    pub sheet_overlay_job_id: Option<EntityId>,
    pub drawing_overlay_job_id: Option<EntityId>,
    pub overlay_id: Option<EntityId>,
}

/// How a detection job locates the overlays it works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayTarget {
    /// All overlays produced by the given generation job.
    ProducedBy { field: &'static str, job_id: EntityId },
    /// A single overlay by id.
    Overlay(EntityId),
}

impl OverlayTargetPayload {
    /// Resolve the identifying field in priority order:
    /// `overlay_job_id`, `block_overlay_job_id`, `sheet_overlay_job_id`,
    /// `drawing_overlay_job_id`, then `overlay_id`.
    pub fn target(&self) -> Result<OverlayTarget, CoreError> {
        let job_fields = [
            ("overlay_job_id", &self.overlay_job_id),
            ("block_overlay_job_id", &self.block_overlay_job_id),
            ("sheet_overlay_job_id", &self.sheet_overlay_job_id),
            ("drawing_overlay_job_id", &self.drawing_overlay_job_id),
        ];
        for (field, value) in job_fields {
            if let Some(id) = non_blank(value) {
                return Ok(OverlayTarget::ProducedBy {
                    field,
                    job_id: id.to_string(),
                });
            }
        }
        if let Some(id) = non_blank(&self.overlay_id) {
            return Ok(OverlayTarget::Overlay(id.to_string()));
        }
        Err(CoreError::Validation(
            "one of overlay_job_id, block_overlay_job_id, sheet_overlay_job_id, \
             drawing_overlay_job_id or overlay_id is required"
                .to_string(),
        ))
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// JobPayload
// ---------------------------------------------------------------------------

/// Decoded payload, one variant per job type.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    DrawingPreprocess(DrawingPreprocessPayload),
    SheetPreprocess(SheetPreprocessPayload),
    DrawingOverlay(DrawingOverlayPayload),
    SheetOverlay(SheetOverlayPayload),
    BlockOverlay(BlockOverlayPayload),
    ChangeDetect(OverlayTargetPayload),
    ClashDetect(OverlayTargetPayload),
}

/// Structured log fields derived from a payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogContext {
    pub drawing_id: Option<EntityId>,
    pub sheet_id: Option<EntityId>,
    pub block_id: Option<EntityId>,
    pub overlay_id: Option<EntityId>,
}

impl JobPayload {
    /// Decode a normalised payload map into the schema of `job_type`.
    pub fn decode(job_type: JobType, payload: &JsonMap) -> Result<Self, CoreError> {
        Ok(match job_type {
            JobType::DrawingPreprocess => Self::DrawingPreprocess(decode_schema(job_type, payload)?),
            JobType::SheetPreprocess => Self::SheetPreprocess(decode_schema(job_type, payload)?),
            JobType::DrawingOverlay => Self::DrawingOverlay(decode_schema(job_type, payload)?),
            JobType::SheetOverlay => Self::SheetOverlay(decode_schema(job_type, payload)?),
            JobType::BlockOverlay => Self::BlockOverlay(decode_schema(job_type, payload)?),
            JobType::ChangeDetect => {
                let p: OverlayTargetPayload = decode_schema(job_type, payload)?;
                p.target()?;
                Self::ChangeDetect(p)
            }
            JobType::ClashDetect => {
                let p: OverlayTargetPayload = decode_schema(job_type, payload)?;
                p.target()?;
                Self::ClashDetect(p)
            }
        })
    }

    pub fn job_type(&self) -> JobType {
        match self {
            Self::DrawingPreprocess(_) => JobType::DrawingPreprocess,
            Self::SheetPreprocess(_) => JobType::SheetPreprocess,
            Self::DrawingOverlay(_) => JobType::DrawingOverlay,
            Self::SheetOverlay(_) => JobType::SheetOverlay,
            Self::BlockOverlay(_) => JobType::BlockOverlay,
            Self::ChangeDetect(_) => JobType::ChangeDetect,
            Self::ClashDetect(_) => JobType::ClashDetect,
        }
    }

    pub fn log_context(&self) -> LogContext {
        match self {
            Self::DrawingPreprocess(p) => LogContext {
                drawing_id: Some(p.drawing_id.clone()),
                ..Default::default()
            },
            Self::SheetPreprocess(p) => LogContext {
                sheet_id: Some(p.sheet_id.clone()),
                ..Default::default()
            },
            Self::DrawingOverlay(p) => LogContext {
                drawing_id: Some(p.drawing_a_id.clone()),
                ..Default::default()
            },
            Self::SheetOverlay(p) => LogContext {
                sheet_id: Some(p.sheet_a_id.clone()),
                ..Default::default()
            },
            Self::BlockOverlay(p) => LogContext {
                block_id: Some(p.block_a_id.clone()),
                ..Default::default()
            },
            Self::ChangeDetect(p) | Self::ClashDetect(p) => LogContext {
                overlay_id: p.overlay_id.clone(),
                ..Default::default()
            },
        }
    }

    /// Entity ids that lifecycle events are attributed to.
    pub fn event_subject(&self) -> EventSubject {
        let ctx = self.log_context();
        EventSubject {
            drawing_id: ctx.drawing_id,
            sheet_id: ctx.sheet_id,
            block_id: ctx.block_id,
        }
    }
}

fn decode_schema<T>(job_type: JobType, payload: &JsonMap) -> Result<T, CoreError>
where
    T: DeserializeOwned + Validate,
{
    let value = serde_json::Value::Object(payload.clone());
    let decoded: T = serde_json::from_value(value)
        .map_err(|e| CoreError::Validation(format!("{job_type} payload: {e}")))?;
    decoded
        .validate()
        .map_err(|e| CoreError::Validation(format!("{job_type} payload: {e}")))?;
    Ok(decoded)
}
