//! Detector configuration: plate geometry, logo specifications, acceptance
//! thresholds, and the parameter blocks for feature extraction, matching and
//! the fallback matcher.
//!
//! Configuration is validated once, at detector construction. The validation
//! here is the engine's own second pass: loaders may have shaped the data
//! already, but the engine still refuses anything it cannot run with.

use std::path::PathBuf;

use crate::homography::RansacParams;

/// Construction-time failure. Fatal: a detector is never built from a
/// configuration that produced one of these.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration{}: {field}: {reason}", logo_suffix(.logo))]
    InvalidConfiguration {
        /// Offending logo, when the field belongs to one.
        logo: Option<String>,
        field: &'static str,
        reason: String,
    },
    #[error("template for logo '{logo}' unavailable at {}: {reason}", .path.display())]
    TemplateUnavailable {
        logo: String,
        path: PathBuf,
        reason: String,
    },
    #[error("template for logo '{logo}' yields {keypoints} keypoints, minimum is {minimum}")]
    TemplateTooWeak {
        logo: String,
        keypoints: usize,
        minimum: usize,
    },
}

fn logo_suffix(logo: &Option<String>) -> String {
    match logo {
        Some(name) => format!(" (logo '{name}')"),
        None => String::new(),
    }
}

/// Physical plate context. `mm_per_px` is millimetres per pixel and is valid
/// only after rectification.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PlaneConfig {
    pub width_mm: f64,
    pub height_mm: f64,
    pub mm_per_px: f64,
    /// Raw camera pixels → rectified plate pixels. Absent means the frame is
    /// already plate-aligned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homography: Option<[[f64; 3]; 3]>,
}

impl PlaneConfig {
    /// Rectified plate width in pixels.
    pub fn width_px(&self) -> u32 {
        (self.width_mm / self.mm_per_px).round() as u32
    }

    /// Rectified plate height in pixels.
    pub fn height_px(&self) -> u32 {
        (self.height_mm / self.mm_per_px).round() as u32
    }
}

/// Search region around a logo's expected position.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct RoiSpec {
    /// Nominal logo footprint width in millimetres.
    pub width_mm: f64,
    /// Nominal logo footprint height in millimetres.
    pub height_mm: f64,
    /// Multiplier (≥ 1) applied to both axes to form the search window.
    #[serde(default = "default_margin_factor")]
    pub margin_factor: f64,
}

fn default_margin_factor() -> f64 {
    1.2
}

/// How to derive a binary silhouette mask from a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskMethod {
    /// Binarise the alpha plane at its midpoint.
    Threshold,
    /// Fill the external contours of the alpha plane.
    Contour,
    /// Iterative foreground segmentation seeded by the alpha hint.
    Grabcut,
}

/// A single logo to detect.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogoSpec {
    /// Unique identifier; results carry it back verbatim.
    pub name: String,
    /// Reference image; must exist and decode at construction.
    pub template_path: PathBuf,
    /// Expected centre on the plate, millimetres.
    pub position_mm: [f64; 2],
    /// Expected in-plane rotation, degrees, in `(-180, 180]`.
    #[serde(default)]
    pub angle_deg: f64,
    pub roi: RoiSpec,
    /// Expect the template to carry a usable alpha silhouette.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_transparency: Option<bool>,
    /// Mask derivation method when transparency is in play.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transparency_method: Option<MaskMethod>,
}

/// Acceptance policy for a detection.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct Thresholds {
    /// Centre deviation tolerance, millimetres.
    pub max_position_error_mm: f64,
    /// Rotation deviation tolerance, degrees (circular difference).
    pub max_angle_error_deg: f64,
    /// Minimum RANSAC inliers for a valid pose.
    pub min_inliers: usize,
    /// Maximum mean per-inlier reprojection error, pixels.
    pub max_reproj_error_px: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_position_error_mm: 3.0,
            max_angle_error_deg: 5.0,
            min_inliers: 15,
            max_reproj_error_px: 3.0,
        }
    }
}

/// Descriptor family. Selects both the extractor and its natural distance
/// metric: Hamming for the binary families, L2 for SIFT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeatureKind {
    Orb,
    Akaze,
    Sift,
}

impl FeatureKind {
    /// Display name used in `LogoResult::method_used`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Orb => "ORB",
            Self::Akaze => "AKAZE",
            Self::Sift => "SIFT",
        }
    }

    /// Whether descriptors of this family are binary (Hamming metric).
    pub fn is_binary(self) -> bool {
        matches!(self, Self::Orb | Self::Akaze)
    }
}

/// Feature extraction parameters.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct FeatureParams {
    #[serde(rename = "type")]
    pub kind: FeatureKind,
    /// Cap on retained keypoints per image.
    pub nfeatures: usize,
    /// Pyramid decimation ratio (> 1).
    pub scale_factor: f64,
    /// Number of pyramid levels.
    pub nlevels: usize,
    /// Border inside which ORB keypoints are suppressed, pixels.
    #[serde(default = "default_edge_threshold")]
    pub edge_threshold: u32,
    /// ORB descriptor sampling patch side, pixels.
    #[serde(default = "default_patch_size")]
    pub patch_size: u32,
}

fn default_edge_threshold() -> u32 {
    16
}

fn default_patch_size() -> u32 {
    31
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            kind: FeatureKind::Orb,
            nfeatures: 1500,
            scale_factor: 1.2,
            nlevels: 8,
            edge_threshold: default_edge_threshold(),
            patch_size: default_patch_size(),
        }
    }
}

/// Descriptor matching algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchAlgorithm {
    /// Exhaustive 2-NN search. The only variant currently implemented;
    /// indexed approximate search is reserved for larger descriptor sets.
    Bruteforce,
}

/// Descriptor matching policy.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct MatchingParams {
    pub algorithm: MatchAlgorithm,
    /// Lowe ratio cutoff in `(0, 1)`: keep a match only when
    /// `best < ratio · second_best`.
    pub ratio_test_threshold: f64,
    /// Additionally require the match to be mutual best.
    pub cross_check: bool,
}

impl Default for MatchingParams {
    fn default() -> Self {
        Self {
            algorithm: MatchAlgorithm::Bruteforce,
            ratio_test_threshold: 0.75,
            cross_check: false,
        }
    }
}

/// Secondary detector: exhaustive template matching over a pose grid.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FallbackParams {
    pub enabled: bool,
    /// Candidate template scale multipliers.
    pub scales: Vec<f64>,
    /// Candidate in-plane rotations, degrees.
    pub angles_deg: Vec<f64>,
    /// Minimum normalised cross-correlation peak, `(0, 1]`.
    pub match_threshold: f64,
}

impl Default for FallbackParams {
    fn default() -> Self {
        Self {
            enabled: true,
            scales: vec![0.8, 0.9, 1.0, 1.1, 1.2],
            angles_deg: vec![-10.0, -5.0, 0.0, 5.0, 10.0],
            match_threshold: 0.7,
        }
    }
}

/// Complete detector configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DetectorConfig {
    pub plane: PlaneConfig,
    pub logos: Vec<LogoSpec>,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub features: FeatureParams,
    #[serde(default)]
    pub matching: MatchingParams,
    #[serde(default)]
    pub ransac: RansacParams,
    #[serde(default)]
    pub fallback: FallbackParams,
}

impl DetectorConfig {
    /// Parse a configuration from a JSON string.
    pub fn from_json_str(data: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(data).map_err(|e| ConfigError::InvalidConfiguration {
            logo: None,
            field: "json",
            reason: e.to_string(),
        })
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidConfiguration {
            logo: None,
            field: "path",
            reason: format!("{}: {e}", path.display()),
        })?;
        Self::from_json_str(&data)
    }

    /// Engine-side validation pass. Checks everything the engine relies on;
    /// returns the first violation with the offending logo and field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |logo: Option<&str>, field: &'static str, reason: String| {
            Err(ConfigError::InvalidConfiguration {
                logo: logo.map(str::to_owned),
                field,
                reason,
            })
        };

        let p = &self.plane;
        if !(p.width_mm > 0.0 && p.width_mm.is_finite()) {
            return invalid(None, "plane.width_mm", format!("must be positive, got {}", p.width_mm));
        }
        if !(p.height_mm > 0.0 && p.height_mm.is_finite()) {
            return invalid(None, "plane.height_mm", format!("must be positive, got {}", p.height_mm));
        }
        if !(p.mm_per_px > 0.0 && p.mm_per_px.is_finite()) {
            return invalid(None, "plane.mm_per_px", format!("must be positive, got {}", p.mm_per_px));
        }
        if let Some(h) = &p.homography {
            validate_homography_cells(h)
                .map_err(|reason| ConfigError::InvalidConfiguration {
                    logo: None,
                    field: "plane.homography",
                    reason,
                })?;
        }

        if self.logos.is_empty() {
            return invalid(None, "logos", "at least one logo is required".into());
        }
        for (i, logo) in self.logos.iter().enumerate() {
            let name = logo.name.as_str();
            if name.is_empty() {
                return invalid(None, "logos.name", format!("logo #{i} has an empty name"));
            }
            if self.logos[..i].iter().any(|other| other.name == logo.name) {
                return invalid(Some(name), "name", "duplicate logo name".into());
            }
            let [x, y] = logo.position_mm;
            if !(x.is_finite() && y.is_finite() && x > 0.0 && x < p.width_mm && y > 0.0 && y < p.height_mm) {
                return invalid(
                    Some(name),
                    "position_mm",
                    format!("({x}, {y}) must lie strictly inside the {}x{} mm plate", p.width_mm, p.height_mm),
                );
            }
            if !(logo.angle_deg.is_finite() && logo.angle_deg > -180.0 && logo.angle_deg <= 180.0) {
                return invalid(
                    Some(name),
                    "angle_deg",
                    format!("{} must lie in (-180, 180]", logo.angle_deg),
                );
            }
            if !(logo.roi.width_mm > 0.0 && logo.roi.height_mm > 0.0) {
                return invalid(Some(name), "roi", "dimensions must be positive".into());
            }
            if !(logo.roi.margin_factor >= 1.0 && logo.roi.margin_factor.is_finite()) {
                return invalid(
                    Some(name),
                    "roi.margin_factor",
                    format!("{} must be >= 1", logo.roi.margin_factor),
                );
            }
        }

        let t = &self.thresholds;
        if !(t.max_position_error_mm > 0.0) {
            return invalid(None, "thresholds.max_position_error_mm", "must be positive".into());
        }
        if !(t.max_angle_error_deg > 0.0) {
            return invalid(None, "thresholds.max_angle_error_deg", "must be positive".into());
        }
        if t.min_inliers == 0 {
            return invalid(None, "thresholds.min_inliers", "must be positive".into());
        }
        if !(t.max_reproj_error_px > 0.0) {
            return invalid(None, "thresholds.max_reproj_error_px", "must be positive".into());
        }

        let f = &self.features;
        if f.nfeatures == 0 {
            return invalid(None, "features.nfeatures", "must be positive".into());
        }
        if !(f.scale_factor > 1.0) {
            return invalid(None, "features.scale_factor", format!("{} must be > 1", f.scale_factor));
        }
        if f.nlevels == 0 {
            return invalid(None, "features.nlevels", "must be positive".into());
        }

        let m = &self.matching;
        if !(m.ratio_test_threshold > 0.0 && m.ratio_test_threshold < 1.0) {
            return invalid(
                None,
                "matching.ratio_test_threshold",
                format!("{} must lie in (0, 1)", m.ratio_test_threshold),
            );
        }

        if self.ransac.max_iters == 0 {
            return invalid(None, "ransac.max_iters", "must be positive".into());
        }

        let fb = &self.fallback;
        if fb.enabled {
            if fb.scales.is_empty() || fb.angles_deg.is_empty() {
                return invalid(None, "fallback", "enabled but scale/angle grid is empty".into());
            }
        }
        if fb.scales.iter().any(|&s| !(s > 0.0 && s.is_finite())) {
            return invalid(None, "fallback.scales", "all scales must be positive".into());
        }
        if fb.angles_deg.iter().any(|a| !a.is_finite()) {
            return invalid(None, "fallback.angles_deg", "all angles must be finite".into());
        }
        if !(fb.match_threshold > 0.0 && fb.match_threshold <= 1.0) {
            return invalid(
                None,
                "fallback.match_threshold",
                format!("{} must lie in (0, 1]", fb.match_threshold),
            );
        }

        Ok(())
    }
}

/// Numeric validity of a row-major 3×3 homography: finite, non-singular.
pub(crate) fn validate_homography_cells(h: &[[f64; 3]; 3]) -> Result<(), String> {
    if h.iter().flatten().any(|v| !v.is_finite()) {
        return Err("contains non-finite values".into());
    }
    let m = nalgebra::Matrix3::from_row_slice(&[
        h[0][0], h[0][1], h[0][2], h[1][0], h[1][1], h[1][2], h[2][0], h[2][1], h[2][2],
    ]);
    if m.determinant().abs() < 1e-10 {
        return Err("matrix is singular".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> DetectorConfig {
        DetectorConfig {
            plane: PlaneConfig {
                width_mm: 300.0,
                height_mm: 200.0,
                mm_per_px: 0.5,
                homography: None,
            },
            logos: vec![LogoSpec {
                name: "chest".into(),
                template_path: PathBuf::from("chest.png"),
                position_mm: [150.0, 100.0],
                angle_deg: 0.0,
                roi: RoiSpec {
                    width_mm: 50.0,
                    height_mm: 40.0,
                    margin_factor: 1.2,
                },
                has_transparency: None,
                transparency_method: None,
            }],
            thresholds: Thresholds::default(),
            features: FeatureParams::default(),
            matching: MatchingParams::default(),
            ransac: RansacParams::default(),
            fallback: FallbackParams::default(),
        }
    }

    #[test]
    fn minimal_config_is_valid() {
        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn plane_pixel_extent_uses_mm_per_px() {
        let cfg = minimal_config();
        assert_eq!(cfg.plane.width_px(), 600);
        assert_eq!(cfg.plane.height_px(), 400);
    }

    #[test]
    fn position_outside_plate_is_rejected() {
        let mut cfg = minimal_config();
        cfg.logos[0].position_mm = [350.0, 100.0];
        let err = cfg.validate().unwrap_err();
        match err {
            ConfigError::InvalidConfiguration { logo, field, .. } => {
                assert_eq!(logo.as_deref(), Some("chest"));
                assert_eq!(field, "position_mm");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut cfg = minimal_config();
        let mut dup = cfg.logos[0].clone();
        dup.position_mm = [100.0, 100.0];
        cfg.logos.push(dup);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn margin_below_one_is_rejected() {
        let mut cfg = minimal_config();
        cfg.logos[0].roi.margin_factor = 0.9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ratio_test_bounds_are_enforced() {
        let mut cfg = minimal_config();
        cfg.matching.ratio_test_threshold = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn singular_plane_homography_is_rejected() {
        let mut cfg = minimal_config();
        cfg.plane.homography = Some([[1.0, 0.0, 0.0], [2.0, 0.0, 0.0], [0.0, 0.0, 1.0]]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn feature_kind_json_spelling() {
        let cfg = minimal_config();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"type\":\"ORB\""));
        let back = DetectorConfig::from_json_str(&json).unwrap();
        assert_eq!(back.features.kind, FeatureKind::Orb);
    }

    #[test]
    fn empty_fallback_grid_only_matters_when_enabled() {
        let mut cfg = minimal_config();
        cfg.fallback.scales.clear();
        assert!(cfg.validate().is_err());
        cfg.fallback.enabled = false;
        assert!(cfg.validate().is_ok());
    }
}
