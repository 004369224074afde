//! Tunables for the alignment and diff stages.
//!
//! Defaults match the values the worker ships with; every field can be
//! overridden from the environment by the worker's configuration loader.

use serde::{Deserialize, Serialize};

use crate::error::VisionError;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_MAX_FEATURES: usize = 1000;
pub const DEFAULT_MARGIN_FRACTION: f64 = 0.2;
pub const DEFAULT_MAX_DIMENSION: u32 = 2000;
pub const DEFAULT_RATIO_THRESHOLD: f64 = 0.75;
pub const DEFAULT_RANSAC_REPROJ_THRESHOLD: f64 = 15.0;
pub const DEFAULT_RANSAC_MAX_ITERS: usize = 5000;
pub const DEFAULT_RANSAC_CONFIDENCE: f64 = 0.95;
pub const DEFAULT_RANSAC_SEED: u64 = 0x5eed_0f_a11_9e;
pub const DEFAULT_SCALE_BOUNDS: (f64, f64) = (0.3, 3.0);
pub const DEFAULT_ROTATION_BOUNDS_DEG: (f64, f64) = (-30.0, 30.0);

/// Minimum number of ratio-test survivors required by Stage B.
pub const MIN_FEATURE_MATCHES: usize = 4;

/// Minimum matched grid lines per axis required by Stage A.
pub const MIN_GRID_MATCHES_PER_AXIS: usize = 2;

pub const DEFAULT_INTENSITY_THRESHOLD: u8 = 40;
pub const DEFAULT_BINARIZE_THRESHOLD: u8 = 200;
pub const DEFAULT_OPENING_KERNEL: u32 = 3;
pub const DEFAULT_MIN_REGION_AREA: u32 = 120;

// ---------------------------------------------------------------------------
// AlignmentConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentConfig {
    /// Keypoints kept per image, strongest first.
    pub max_features: usize,
    /// Fraction of width/height excluded from each edge during detection.
    pub margin_fraction: f64,
    /// Rasters are downscaled so their longer side is at most this many
    /// pixels before keypoint detection.
    pub max_dimension: u32,
    /// Lowe's ratio-test threshold.
    pub ratio_threshold: f64,
    /// RANSAC inlier threshold in full-resolution pixels.
    pub ransac_reproj_threshold: f64,
    pub ransac_max_iters: usize,
    pub ransac_confidence: f64,
    /// Seed for RANSAC sampling; fixed so reruns are reproducible.
    pub ransac_seed: u64,
    pub scale_min: f64,
    pub scale_max: f64,
    pub rotation_min_deg: f64,
    pub rotation_max_deg: f64,
    /// Results with a lower inlier ratio are rejected. `0.0` disables.
    pub min_confidence: f64,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            max_features: DEFAULT_MAX_FEATURES,
            margin_fraction: DEFAULT_MARGIN_FRACTION,
            max_dimension: DEFAULT_MAX_DIMENSION,
            ratio_threshold: DEFAULT_RATIO_THRESHOLD,
            ransac_reproj_threshold: DEFAULT_RANSAC_REPROJ_THRESHOLD,
            ransac_max_iters: DEFAULT_RANSAC_MAX_ITERS,
            ransac_confidence: DEFAULT_RANSAC_CONFIDENCE,
            ransac_seed: DEFAULT_RANSAC_SEED,
            scale_min: DEFAULT_SCALE_BOUNDS.0,
            scale_max: DEFAULT_SCALE_BOUNDS.1,
            rotation_min_deg: DEFAULT_ROTATION_BOUNDS_DEG.0,
            rotation_max_deg: DEFAULT_ROTATION_BOUNDS_DEG.1,
            min_confidence: 0.0,
        }
    }
}

impl AlignmentConfig {
    pub fn scale_in_bounds(&self, scale: f64) -> bool {
        scale.is_finite() && scale >= self.scale_min && scale <= self.scale_max
    }

    pub fn rotation_in_bounds(&self, degrees: f64) -> bool {
        degrees.is_finite() && degrees >= self.rotation_min_deg && degrees <= self.rotation_max_deg
    }

    pub fn validate(&self) -> Result<(), VisionError> {
        if self.max_features < MIN_FEATURE_MATCHES {
            return Err(VisionError::Config(format!(
                "max_features must be at least {MIN_FEATURE_MATCHES}"
            )));
        }
        if !(0.0..0.5).contains(&self.margin_fraction) {
            return Err(VisionError::Config(
                "margin_fraction must be in [0.0, 0.5)".to_string(),
            ));
        }
        if self.max_dimension < 64 {
            return Err(VisionError::Config(
                "max_dimension must be at least 64".to_string(),
            ));
        }
        if !(self.ratio_threshold > 0.0 && self.ratio_threshold <= 1.0) {
            return Err(VisionError::Config(
                "ratio_threshold must be in (0.0, 1.0]".to_string(),
            ));
        }
        if !(self.ransac_reproj_threshold > 0.0) {
            return Err(VisionError::Config(
                "ransac_reproj_threshold must be positive".to_string(),
            ));
        }
        if self.ransac_max_iters == 0 {
            return Err(VisionError::Config(
                "ransac_max_iters must be positive".to_string(),
            ));
        }
        if !(self.ransac_confidence > 0.0 && self.ransac_confidence < 1.0) {
            return Err(VisionError::Config(
                "ransac_confidence must be in (0.0, 1.0)".to_string(),
            ));
        }
        if !(self.scale_min > 0.0 && self.scale_min <= 1.0 && self.scale_max >= 1.0) {
            return Err(VisionError::Config(
                "scale bounds must satisfy 0 < scale_min <= 1 <= scale_max".to_string(),
            ));
        }
        if !(self.rotation_min_deg <= 0.0
            && self.rotation_max_deg >= 0.0
            && self.rotation_min_deg >= -180.0
            && self.rotation_max_deg <= 180.0)
        {
            return Err(VisionError::Config(
                "rotation bounds must satisfy -180 <= min <= 0 <= max <= 180".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(VisionError::Config(
                "min_confidence must be in [0.0, 1.0]".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DiffConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffConfig {
    /// Minimum intensity difference (0-255) counted as a change.
    pub intensity_threshold: u8,
    /// Pixels darker than this are foreground during region extraction.
    pub binarize_threshold: u8,
    /// Side length of the square opening structuring element.
    pub opening_kernel: u32,
    /// Components with fewer pixels are discarded.
    pub min_region_area: u32,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            intensity_threshold: DEFAULT_INTENSITY_THRESHOLD,
            binarize_threshold: DEFAULT_BINARIZE_THRESHOLD,
            opening_kernel: DEFAULT_OPENING_KERNEL,
            min_region_area: DEFAULT_MIN_REGION_AREA,
        }
    }
}

impl DiffConfig {
    pub fn validate(&self) -> Result<(), VisionError> {
        if self.intensity_threshold == 0 {
            return Err(VisionError::Config(
                "intensity_threshold must be positive".to_string(),
            ));
        }
        if self.opening_kernel == 0 || self.opening_kernel % 2 == 0 {
            return Err(VisionError::Config(
                "opening_kernel must be a positive odd number".to_string(),
            ));
        }
        Ok(())
    }
}

/// Alignment plus diff settings, shared by every handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub alignment: AlignmentConfig,
    pub diff: DiffConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), VisionError> {
        self.alignment.validate()?;
        self.diff.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn bound_checks_are_inclusive() {
        let cfg = AlignmentConfig::default();
        assert!(cfg.scale_in_bounds(0.3));
        assert!(cfg.scale_in_bounds(3.0));
        assert!(!cfg.scale_in_bounds(3.0001));
        assert!(cfg.rotation_in_bounds(-30.0));
        assert!(!cfg.rotation_in_bounds(30.5));
        assert!(!cfg.scale_in_bounds(f64::NAN));
    }

    #[test]
    fn invalid_ratio_rejected() {
        let cfg = AlignmentConfig {
            ratio_threshold: 1.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn even_opening_kernel_rejected() {
        let cfg = DiffConfig {
            opening_kernel: 4,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
