//! Job handlers, one module per job family.
//!
//! Handlers read through the [`Store`] but never write to it: they return
//! a [`HandlerOutput`] whose changeset the lifecycle controller applies in
//! the same transaction as the `Completed` transition.

pub mod detect;
pub mod overlay;
pub mod preprocess;

use std::sync::Arc;

use image::GrayImage;
use plandiff_core::error::CoreError;
use plandiff_core::storage::{ObjectStore, CONTENT_TYPE_PNG};
use plandiff_core::store::{Changeset, Store};
use plandiff_core::types::JsonMap;
use plandiff_core::usage::LlmUsage;
use plandiff_pipeline::config::PipelineConfig;
use plandiff_pipeline::{raster, AlignmentEngine, CalloutDetector, DiffConfig, VisionError};

use crate::error::{JobError, JobResult};

/// Collaborators and settings shared by every handler.
///
/// Built once at startup and passed to the dispatcher.
#[derive(Clone)]
pub struct HandlerContext {
    pub store: Arc<dyn Store>,
    pub objects: Arc<dyn ObjectStore>,
    pub detector: Arc<dyn CalloutDetector>,
    pub engine: AlignmentEngine,
    pub diff: DiffConfig,
}

impl HandlerContext {
    pub fn new(
        store: Arc<dyn Store>,
        objects: Arc<dyn ObjectStore>,
        detector: Arc<dyn CalloutDetector>,
        pipeline: &PipelineConfig,
    ) -> Result<Self, VisionError> {
        pipeline.validate()?;
        Ok(Self {
            store,
            objects,
            detector,
            engine: AlignmentEngine::new(pipeline.alignment.clone())?,
            diff: pipeline.diff.clone(),
        })
    }
}

/// What a successful handler hands back to the lifecycle controller.
#[derive(Debug, Default)]
pub struct HandlerOutput {
    pub changeset: Changeset,
    /// Recorded on the `completed` event.
    pub metadata: JsonMap,
    pub usage: Option<LlmUsage>,
}

impl HandlerOutput {
    pub fn new(changeset: Changeset, metadata: JsonMap) -> Self {
        Self {
            changeset,
            metadata,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: Option<LlmUsage>) -> Self {
        self.usage = usage;
        self
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Event metadata from a `json!` object literal.
pub(crate) fn metadata(value: serde_json::Value) -> JsonMap {
    match value {
        serde_json::Value::Object(map) => map,
        _ => JsonMap::new(),
    }
}

/// Unwrap a lookup, turning `None` into a permanent `NotFound`.
pub(crate) fn found<T>(entity: &'static str, id: &str, value: Option<T>) -> JobResult<T> {
    value.ok_or_else(|| CoreError::not_found(entity, id).into())
}

/// Download and decode a raster on the blocking pool.
pub(crate) async fn load_raster(ctx: &HandlerContext, path: &str) -> JobResult<GrayImage> {
    let bytes = ctx.objects.download_to_bytes(path).await?;
    let owned_path = path.to_string();
    tokio::task::spawn_blocking(move || {
        raster::decode_gray(&bytes).map_err(|e| {
            JobError::from(CoreError::InvalidImage {
                path: owned_path,
                reason: e.to_string(),
            })
        })
    })
    .await?
}

/// Upload a PNG-encoded artifact.
pub(crate) async fn upload_png(ctx: &HandlerContext, path: &str, bytes: Vec<u8>) -> JobResult<()> {
    ctx.objects
        .upload_bytes(path, bytes, CONTENT_TYPE_PNG)
        .await?;
    Ok(())
}
