//! platemark — planar logo alignment detector for textile press platens.
//!
//! Given a calibrated overhead camera, the detector measures where each
//! configured logo actually sits on the plate and how far that is from where
//! it should sit. The pipeline stages are:
//!
//! 1. **Rectify** – warp the camera frame into plate coordinates through the
//!    calibration homography (millimetres relate to pixels by a single
//!    scalar after this step).
//! 2. **ROI** – cut a clipped search window around each logo's expected
//!    position.
//! 3. **Primary detection** – feature extraction (ORB/AKAZE/SIFT), ratio-test
//!    descriptor matching, seeded-RANSAC homography, pose decomposition and
//!    acceptance gating.
//! 4. **Fallback** – masked normalised cross-correlation over a
//!    (scale × angle) hypothesis grid when the primary path fails.
//! 5. **Result assembly** – one [`LogoResult`] per configured logo, in
//!    configuration order.
//!
//! # Public API
//! [`Detector`] is the primary entry point; [`DetectorConfig`] describes the
//! plate, the logos and the acceptance policy. Results serialise to flat
//! JSON-compatible records.
//!
//! The engine is synchronous and stateless across frames: templates are
//! loaded and described once at construction, each `detect` call is
//! independent, and identical inputs with an identical RANSAC seed reproduce
//! identical measurements.

mod calibration;
mod config;
mod engine;
mod features;
mod geometry;
mod homography;
mod imgops;
mod mask;
mod matching;
mod template;
#[cfg(test)]
mod test_utils;

pub use calibration::{CalibrationData, CalibrationError};
pub use config::{
    ConfigError, DetectorConfig, FallbackParams, FeatureKind, FeatureParams, LogoSpec,
    MaskMethod, MatchAlgorithm, MatchingParams, PlaneConfig, RoiSpec, Thresholds,
};
pub use engine::Detector;
pub use homography::RansacParams;
pub use imgops::{BgrFrame, FrameError};

/// Method label reported for fallback detections.
pub const METHOD_TEMPLATE_FALLBACK: &str = "template_fallback";

/// Terminal state of one logo in one frame.
///
/// Purely observational: retained for diagnostics, never fed back into the
/// engine. Not part of the serialised result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectOutcome {
    /// The search window lies entirely off the rectified frame.
    RoiOutside,
    /// Ratio-test/cross-check survivors below the minimum.
    TooFewMatches,
    /// Homography inliers or reprojection error out of bounds, or the model
    /// failed the plausibility gates.
    RansacRejected,
    /// Primary feature path accepted.
    FoundPrimary,
    /// Primary rejected; fallback correlation peak above threshold.
    FoundFallback,
    /// Both paths failed (or fallback disabled).
    FallbackFailed,
}

impl DetectOutcome {
    /// Whether this outcome carries a pose.
    pub fn is_found(self) -> bool {
        matches!(self, Self::FoundPrimary | Self::FoundFallback)
    }
}

/// Per-logo detection record.
///
/// Pose fields are `Some` exactly when `found` is true; nulls are emitted
/// explicitly on serialisation. The tolerance flags are advisory: a logo may
/// be found and still out of tolerance, which is precisely the operator
/// feedback signal.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogoResult {
    pub name: String,
    pub found: bool,
    /// Detected centre on the plate, millimetres.
    pub position_mm: Option<[f64; 2]>,
    /// Detected in-plane rotation, degrees, in `(-180, 180]`.
    pub angle_deg: Option<f64>,
    /// Euclidean distance from expected to detected centre, millimetres.
    pub error_mm: Option<f64>,
    /// Minimum circular difference from the expected angle, degrees.
    pub angle_error_deg: Option<f64>,
    /// Detection confidence in `[0, 1]`.
    pub confidence: Option<f64>,
    /// RANSAC inlier count (primary path only).
    pub inliers: Option<usize>,
    /// Mean per-inlier reprojection error, pixels (primary path only).
    pub reproj_error_px: Option<f64>,
    /// `"<FAMILY>+RANSAC"` or [`METHOD_TEMPLATE_FALLBACK`].
    pub method_used: Option<String>,
    /// Wall-clock time spent on this logo, milliseconds.
    pub processing_time_ms: f64,
    pub meets_position_tolerance: bool,
    pub meets_angle_tolerance: bool,
    /// Diagnostic terminal state; not serialised.
    #[serde(skip)]
    pub outcome: DetectOutcome,
}

impl LogoResult {
    /// An empty not-found record for `name` with the given outcome.
    pub(crate) fn not_found(name: &str, outcome: DetectOutcome) -> Self {
        Self {
            name: name.to_owned(),
            found: false,
            position_mm: None,
            angle_deg: None,
            error_mm: None,
            angle_error_deg: None,
            confidence: None,
            inliers: None,
            reproj_error_px: None,
            method_used: None,
            processing_time_ms: 0.0,
            meets_position_tolerance: false,
            meets_angle_tolerance: false,
            outcome,
        }
    }
}
