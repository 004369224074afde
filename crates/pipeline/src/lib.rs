//! Alignment and diff pipeline.
//!
//! Everything here is synchronous and CPU-bound; async callers run it on
//! a blocking thread. The only async seam is [`grid::CalloutDetector`],
//! the external inference collaborator used by Stage A.

pub mod align;
pub mod config;
pub mod constrained;
pub mod diff;
pub mod error;
pub mod features;
pub mod grid;
pub mod matching;
pub mod ransac;
pub mod raster;
pub mod regions;
pub mod report;
pub mod transform;

pub use align::AlignmentEngine;
pub use config::{AlignmentConfig, DiffConfig, PipelineConfig};
pub use diff::{render_diff, DiffArtifacts};
pub use error::VisionError;
pub use grid::{grid_prior, CalloutDetector, GridPrior, NoCalloutDetector};
pub use regions::{extract_regions, Polarity};
pub use transform::Similarity;
