//! Two-stage registration of a `new` raster onto an `old` one.
//!
//! Stage A (optional) supplies a [`GridPrior`]; Stage B detects and
//! matches keypoints, estimates a similarity with RANSAC on the
//! prior-mapped points and composes it with the prior. Estimates that
//! leave the configured scale/rotation box are re-solved with a bounded
//! fit before being rejected.

use std::time::Instant;

use image::GrayImage;
use plandiff_core::models::AlignmentResult;

use crate::config::{AlignmentConfig, MIN_FEATURE_MATCHES};
use crate::constrained::{refine_bounded, Bounds};
use crate::error::VisionError;
use crate::features::{self, DetectorParams, Keypoint};
use crate::grid::GridPrior;
use crate::matching::ratio_match;
use crate::raster::downscale;
use crate::ransac::{self, RansacParams};
use crate::transform::{rms_error, Point, Similarity};

#[derive(Debug, Clone)]
pub struct AlignmentEngine {
    config: AlignmentConfig,
}

impl AlignmentEngine {
    pub fn new(config: AlignmentConfig) -> Result<Self, VisionError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AlignmentConfig {
        &self.config
    }

    /// Register `new` onto `old`. The returned transform maps `new` pixel
    /// coordinates into `old`.
    pub fn align(
        &self,
        new: &GrayImage,
        old: &GrayImage,
        prior: Option<&GridPrior>,
    ) -> Result<AlignmentResult, VisionError> {
        let started = Instant::now();
        let new_kps = self.keypoints(new);
        let old_kps = self.keypoints(old);
        let matches = ratio_match(&new_kps, &old_kps, self.config.ratio_threshold);

        tracing::debug!(
            new_keypoints = new_kps.len(),
            old_keypoints = old_kps.len(),
            matches = matches.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Feature matching finished"
        );

        let src: Vec<Point> = matches
            .iter()
            .map(|m| (new_kps[m.query].x, new_kps[m.query].y))
            .collect();
        let dst: Vec<Point> = matches
            .iter()
            .map(|m| (old_kps[m.train].x, old_kps[m.train].y))
            .collect();

        self.estimate(&src, &dst, prior)
    }

    /// Estimate the bounded transform from matched point pairs.
    pub fn estimate(
        &self,
        src: &[Point],
        dst: &[Point],
        prior: Option<&GridPrior>,
    ) -> Result<AlignmentResult, VisionError> {
        let n = src.len().min(dst.len());
        if n < MIN_FEATURE_MATCHES {
            return Err(VisionError::InsufficientFeatureMatches {
                found: n,
                required: MIN_FEATURE_MATCHES,
            });
        }
        let (src, dst) = (&src[..n], &dst[..n]);
        let cfg = &self.config;

        let prior_t = prior.map(|p| p.transform).unwrap_or_default();
        let mapped: Vec<Point> = src.iter().map(|p| prior_t.apply(p.0, p.1)).collect();

        let params = RansacParams {
            threshold: cfg.ransac_reproj_threshold,
            max_iters: cfg.ransac_max_iters,
            confidence: cfg.ransac_confidence,
            seed: cfg.ransac_seed,
        };
        let estimate = ransac::estimate(&mapped, dst, &params).ok_or(
            VisionError::InsufficientFeatureMatches {
                found: n,
                required: MIN_FEATURE_MATCHES,
            },
        )?;

        let composed = estimate.transform.compose(&prior_t);
        let (transform, scale, rotation_degrees) = if self.within_bounds(&composed) {
            (composed, composed.scale(), composed.rotation_degrees())
        } else {
            tracing::info!(
                scale = composed.scale(),
                rotation_degrees = composed.rotation_degrees(),
                "Estimate outside bounds, re-solving with bounded fit"
            );
            let bounds = Bounds {
                scale_min: cfg.scale_min,
                scale_max: cfg.scale_max,
                rotation_min_deg: cfg.rotation_min_deg,
                rotation_max_deg: cfg.rotation_max_deg,
            };
            // The bounded fit is inside the box by construction; its chosen
            // parameters are reported rather than re-derived from the matrix.
            match refine_bounded(src, dst, &estimate.inliers, &bounds, cfg.ransac_reproj_threshold) {
                Some((fit, _)) => (fit.transform, fit.scale, fit.rotation_degrees),
                None => {
                    return Err(VisionError::TransformOutOfBounds {
                        scale: composed.scale(),
                        rotation_degrees: composed.rotation_degrees(),
                    })
                }
            }
        };

        // Consensus under the accepted transform, in original coordinates.
        let inliers = ransac::inliers_of(&transform, src, dst, cfg.ransac_reproj_threshold);
        let confidence = inliers.len() as f64 / n as f64;
        if confidence < cfg.min_confidence {
            return Err(VisionError::LowConfidence {
                confidence,
                minimum: cfg.min_confidence,
            });
        }

        let result = AlignmentResult {
            transform: transform.to_matrix(),
            scale,
            rotation_degrees,
            inlier_count: inliers.len(),
            match_count: n,
            residual_px: rms_error(&transform, src, dst, &inliers),
            confidence,
            grid_prior: prior.is_some(),
        };
        tracing::info!(
            scale = result.scale,
            rotation_degrees = result.rotation_degrees,
            inliers = result.inlier_count,
            matches = result.match_count,
            residual_px = result.residual_px,
            grid_prior = result.grid_prior,
            "Alignment estimated"
        );
        Ok(result)
    }

    fn within_bounds(&self, t: &Similarity) -> bool {
        t.is_finite()
            && self.config.scale_in_bounds(t.scale())
            && self.config.rotation_in_bounds(t.rotation_degrees())
    }

    /// Detect on a downscaled copy and map positions back to full
    /// resolution.
    fn keypoints(&self, img: &GrayImage) -> Vec<Keypoint> {
        let (small, factor) = downscale(img, self.config.max_dimension);
        let mut kps = features::detect(
            &small,
            DetectorParams {
                max_features: self.config.max_features,
                margin_fraction: self.config.margin_fraction,
            },
        );
        if factor != 1.0 {
            for kp in &mut kps {
                kp.x *= factor;
                kp.y *= factor;
            }
        }
        kps
    }
}
