//! The per-frame detection engine.
//!
//! [`Detector`] owns a validated configuration and the template store, and
//! turns one BGR frame into one [`LogoResult`] per configured logo. The
//! frame is rectified once; each logo is then processed independently in
//! configuration order.

mod fallback;
#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::time::Instant;

use image::GrayImage;
use nalgebra::Matrix3;

use crate::config::{validate_homography_cells, ConfigError, DetectorConfig, LogoSpec};
use crate::features;
use crate::geometry::{
    angle_deg, circular_angle_diff, l2, mm_to_px, normalize_angle_deg, polygon_centroid, px_to_mm,
};
use crate::homography::{fit_ransac, is_pose_plausible, project};
use crate::imgops::{extract_roi, stretch_contrast, warp_perspective, BgrFrame, FrameError};
use crate::matching::match_descriptors;
use crate::template::{Template, TemplateStore};
use crate::{DetectOutcome, LogoResult, METHOD_TEMPLATE_FALLBACK};

/// Minimum ratio-test survivors before RANSAC is attempted.
const MIN_TENTATIVE_MATCHES: usize = 4;

/// Primary detection interface.
///
/// Construct once per configuration (templates are loaded and described at
/// construction), then call [`Detector::detect`] per frame. A single
/// instance is not synchronised; callers wanting parallelism construct one
/// detector per worker.
pub struct Detector {
    config: DetectorConfig,
    templates: TemplateStore,
    plane_h: Option<Matrix3<f64>>,
}

impl Detector {
    /// Validate the configuration, load all templates, and build the engine.
    pub fn new(config: DetectorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let templates = TemplateStore::load(&config.logos, &config.features)?;
        let plane_h = config.plane.homography.as_ref().map(mat3_from_rows);

        tracing::info!(
            "detector ready: {} logos, {} features, plate {}x{} mm at {} mm/px",
            templates.len(),
            config.features.kind.name(),
            config.plane.width_mm,
            config.plane.height_mm,
            config.plane.mm_per_px,
        );
        Ok(Self {
            config,
            templates,
            plane_h,
        })
    }

    /// Access the validated configuration.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Retained keypoints per template, for diagnostics.
    pub fn template_keypoint_counts(&self) -> Vec<(String, usize)> {
        self.templates.keypoint_counts()
    }

    /// Detect all configured logos using the configured calibration.
    pub fn detect(&self, frame: &BgrFrame<'_>) -> Result<Vec<LogoResult>, FrameError> {
        self.detect_with_homography(frame, None)
    }

    /// Detect with a per-call homography overriding the configured one.
    pub fn detect_with_homography(
        &self,
        frame: &BgrFrame<'_>,
        homography: Option<&[[f64; 3]; 3]>,
    ) -> Result<Vec<LogoResult>, FrameError> {
        let gray = frame.to_gray();

        let h = match homography {
            Some(cells) => {
                validate_homography_cells(cells)
                    .map_err(|reason| FrameError::invalid(format!("per-call homography {reason}")))?;
                Some(mat3_from_rows(cells))
            }
            None => self.plane_h,
        };

        let rectified = match h {
            Some(m) => warp_perspective(
                &gray,
                &m,
                self.config.plane.width_px(),
                self.config.plane.height_px(),
            )
            .ok_or_else(|| FrameError::invalid("homography is not invertible"))?,
            None => gray,
        };

        let mut results = Vec::with_capacity(self.config.logos.len());
        for (index, spec) in self.config.logos.iter().enumerate() {
            let started = Instant::now();
            let mut result = self.detect_logo(&rectified, index, spec);
            result.processing_time_ms = started.elapsed().as_secs_f64() * 1e3;
            tracing::debug!(
                "logo '{}': {:?} in {:.2} ms",
                spec.name,
                result.outcome,
                result.processing_time_ms,
            );
            results.push(result);
        }
        Ok(results)
    }

    /// Expected centre of every logo in rectified-frame pixels.
    pub fn expected_positions_px(&self) -> BTreeMap<String, [f64; 2]> {
        self.config
            .logos
            .iter()
            .map(|spec| {
                let p = mm_to_px(
                    spec.position_mm[0],
                    spec.position_mm[1],
                    self.config.plane.mm_per_px,
                );
                (spec.name.clone(), p)
            })
            .collect()
    }

    /// Search-window bounds `[x1, y1, x2, y2]` for a logo in rectified-frame
    /// pixels, unclipped. `None` for an unknown logo name.
    pub fn roi_bounds_px(&self, name: &str) -> Option<[i64; 4]> {
        let spec = self.config.logos.iter().find(|s| s.name == name)?;
        let center = mm_to_px(
            spec.position_mm[0],
            spec.position_mm[1],
            self.config.plane.mm_per_px,
        );
        let [w, h] = roi_size_px(spec, self.config.plane.mm_per_px);
        let x1 = (center[0] - w as f64 / 2.0).round() as i64;
        let y1 = (center[1] - h as f64 / 2.0).round() as i64;
        Some([x1, y1, x1 + w as i64, y1 + h as i64])
    }

    // ── Per-logo pipeline ────────────────────────────────────────────────

    fn detect_logo(&self, rectified: &GrayImage, index: usize, spec: &LogoSpec) -> LogoResult {
        let mm_per_px = self.config.plane.mm_per_px;
        let expected_px = mm_to_px(spec.position_mm[0], spec.position_mm[1], mm_per_px);
        let size_px = roi_size_px(spec, mm_per_px);

        let Some(patch) = extract_roi(rectified, expected_px, size_px) else {
            return LogoResult::not_found(&spec.name, DetectOutcome::RoiOutside);
        };
        let roi_gray = stretch_contrast(&patch.image);
        let template = self.templates.get(index);

        match self.primary_path(&roi_gray, patch.offset, template, spec) {
            Ok(result) => result,
            Err(primary_outcome) => {
                if !self.config.fallback.enabled {
                    return LogoResult::not_found(&spec.name, primary_outcome);
                }
                tracing::debug!(
                    "logo '{}': primary path failed ({:?}), trying fallback",
                    spec.name,
                    primary_outcome,
                );
                match fallback::run(&roi_gray, template, &self.config.fallback) {
                    Some(hit) => self.assemble_fallback(hit, patch.offset, spec),
                    None => LogoResult::not_found(&spec.name, DetectOutcome::FallbackFailed),
                }
            }
        }
    }

    /// Feature matching + RANSAC + pose decomposition. On failure returns
    /// the terminal outcome the caller should report (or fall back from).
    fn primary_path(
        &self,
        roi: &GrayImage,
        roi_offset: [i64; 2],
        template: &Template,
        spec: &LogoSpec,
    ) -> Result<LogoResult, DetectOutcome> {
        if template.features.descriptors.len() < MIN_TENTATIVE_MATCHES {
            return Err(DetectOutcome::TooFewMatches);
        }
        let roi_feats = features::extract(roi, None, &self.config.features);
        if roi_feats.len() < MIN_TENTATIVE_MATCHES {
            return Err(DetectOutcome::TooFewMatches);
        }

        let matches = match_descriptors(
            &template.features.descriptors,
            &roi_feats.descriptors,
            &self.config.matching,
        );
        if matches.len() < MIN_TENTATIVE_MATCHES {
            return Err(DetectOutcome::TooFewMatches);
        }

        let src: Vec<[f64; 2]> = matches
            .iter()
            .map(|m| {
                let kp = &template.features.keypoints[m.query];
                [kp.x as f64, kp.y as f64]
            })
            .collect();
        let dst: Vec<[f64; 2]> = matches
            .iter()
            .map(|m| {
                let kp = &roi_feats.keypoints[m.train];
                [kp.x as f64, kp.y as f64]
            })
            .collect();

        let thresholds = &self.config.thresholds;
        let fit = fit_ransac(
            &src,
            &dst,
            thresholds.max_reproj_error_px,
            thresholds.min_inliers,
            &self.config.ransac,
        )
        .map_err(|e| {
            tracing::debug!("logo '{}': RANSAC rejected: {e}", spec.name);
            DetectOutcome::RansacRejected
        })?;

        if fit.n_inliers < thresholds.min_inliers
            || fit.mean_inlier_error > thresholds.max_reproj_error_px
            || !is_pose_plausible(&fit.h)
        {
            return Err(DetectOutcome::RansacRejected);
        }

        // Pose: project the canonical corner quad, take its centroid as the
        // centre and the top edge's direction as the rotation.
        let corners = template.corners();
        let projected: Vec<[f64; 2]> = corners
            .iter()
            .map(|c| project(&fit.h, c[0], c[1]))
            .collect::<Option<_>>()
            .ok_or(DetectOutcome::RansacRejected)?;
        let center_roi = polygon_centroid(&projected).ok_or(DetectOutcome::RansacRejected)?;
        let mm_per_px = self.config.plane.mm_per_px;
        let detected_mm = px_to_mm(
            center_roi[0] + roi_offset[0] as f64,
            center_roi[1] + roi_offset[1] as f64,
            mm_per_px,
        );
        let detected_angle = normalize_angle_deg(angle_deg(projected[0], projected[1]));

        let error_mm = l2(detected_mm, spec.position_mm);
        let angle_error = circular_angle_diff(detected_angle, spec.angle_deg);

        // Confidence: inlier ratio tempered by the normalised reprojection
        // error. Monotone up in inliers, down in error; always in [0, 1].
        let inlier_ratio = fit.n_inliers as f64 / matches.len() as f64;
        let temper = 1.0 / (1.0 + fit.mean_inlier_error / thresholds.max_reproj_error_px);
        let confidence = (inlier_ratio * temper).clamp(0.0, 1.0);

        Ok(LogoResult {
            name: spec.name.clone(),
            found: true,
            position_mm: Some(detected_mm),
            angle_deg: Some(detected_angle),
            error_mm: Some(error_mm),
            angle_error_deg: Some(angle_error),
            confidence: Some(confidence),
            inliers: Some(fit.n_inliers),
            reproj_error_px: Some(fit.mean_inlier_error),
            method_used: Some(format!("{}+RANSAC", self.config.features.kind.name())),
            processing_time_ms: 0.0,
            meets_position_tolerance: error_mm <= thresholds.max_position_error_mm,
            meets_angle_tolerance: angle_error <= thresholds.max_angle_error_deg,
            outcome: DetectOutcome::FoundPrimary,
        })
    }

    fn assemble_fallback(
        &self,
        hit: fallback::FallbackHit,
        roi_offset: [i64; 2],
        spec: &LogoSpec,
    ) -> LogoResult {
        let thresholds = &self.config.thresholds;
        let detected_mm = px_to_mm(
            hit.center_roi_px[0] + roi_offset[0] as f64,
            hit.center_roi_px[1] + roi_offset[1] as f64,
            self.config.plane.mm_per_px,
        );
        let detected_angle = normalize_angle_deg(hit.angle_deg);
        let error_mm = l2(detected_mm, spec.position_mm);
        let angle_error = circular_angle_diff(detected_angle, spec.angle_deg);

        LogoResult {
            name: spec.name.clone(),
            found: true,
            position_mm: Some(detected_mm),
            angle_deg: Some(detected_angle),
            error_mm: Some(error_mm),
            angle_error_deg: Some(angle_error),
            confidence: Some(hit.score.clamp(0.0, 1.0)),
            inliers: None,
            reproj_error_px: None,
            method_used: Some(METHOD_TEMPLATE_FALLBACK.to_owned()),
            processing_time_ms: 0.0,
            meets_position_tolerance: error_mm <= thresholds.max_position_error_mm,
            meets_angle_tolerance: angle_error <= thresholds.max_angle_error_deg,
            outcome: DetectOutcome::FoundFallback,
        }
    }
}

/// Search window size in pixels for a logo spec.
fn roi_size_px(spec: &LogoSpec, mm_per_px: f64) -> [u32; 2] {
    let w = (spec.roi.width_mm * spec.roi.margin_factor / mm_per_px).round().max(1.0) as u32;
    let h = (spec.roi.height_mm * spec.roi.margin_factor / mm_per_px).round().max(1.0) as u32;
    [w, h]
}

fn mat3_from_rows(cells: &[[f64; 3]; 3]) -> Matrix3<f64> {
    Matrix3::from_row_slice(&[
        cells[0][0],
        cells[0][1],
        cells[0][2],
        cells[1][0],
        cells[1][1],
        cells[1][2],
        cells[2][0],
        cells[2][1],
        cells[2][2],
    ])
}
