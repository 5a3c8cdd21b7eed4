//! Reference-template store.
//!
//! Templates are loaded exactly once, at detector construction: image decode,
//! silhouette mask derivation, and feature extraction all happen here, and
//! the results are owned read-only for the detector's lifetime.

use image::GrayImage;

use crate::config::{ConfigError, FeatureParams, LogoSpec, MaskMethod};
use crate::features::{self, Features};
use crate::imgops::stretch_contrast;
use crate::mask;

/// A template must yield at least this many keypoints to be usable.
pub const MIN_TEMPLATE_FEATURES: usize = 10;

/// One loaded reference template.
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    /// Contrast-stretched grayscale used for matching and fallback.
    pub gray: GrayImage,
    /// Silhouette mask, when transparency is in play.
    pub mask: Option<GrayImage>,
    /// Keypoints and descriptors, extracted once.
    pub features: Features,
}

impl Template {
    pub fn width(&self) -> u32 {
        self.gray.width()
    }

    pub fn height(&self) -> u32 {
        self.gray.height()
    }

    /// Canonical corner quadrilateral used for pose decomposition.
    pub fn corners(&self) -> [[f64; 2]; 4] {
        let (w, h) = (self.width() as f64, self.height() as f64);
        [[0.0, 0.0], [w, 0.0], [w, h], [0.0, h]]
    }
}

/// All templates, in configuration order.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    templates: Vec<Template>,
}

impl TemplateStore {
    /// Load every logo's template, derive masks, and extract features.
    ///
    /// Fails with a construction error on the first missing, undecodable, or
    /// feature-poor template.
    pub fn load(logos: &[LogoSpec], feature_params: &FeatureParams) -> Result<Self, ConfigError> {
        let mut templates = Vec::with_capacity(logos.len());
        for spec in logos {
            templates.push(load_one(spec, feature_params)?);
        }
        Ok(Self { templates })
    }

    pub fn get(&self, index: usize) -> &Template {
        &self.templates[index]
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Retained keypoint count per template, for diagnostics.
    pub fn keypoint_counts(&self) -> Vec<(String, usize)> {
        self.templates
            .iter()
            .map(|t| (t.name.clone(), t.features.len()))
            .collect()
    }
}

fn load_one(spec: &LogoSpec, feature_params: &FeatureParams) -> Result<Template, ConfigError> {
    let unavailable = |reason: String| ConfigError::TemplateUnavailable {
        logo: spec.name.clone(),
        path: spec.template_path.clone(),
        reason,
    };

    if !spec.template_path.exists() {
        return Err(unavailable("file not found".into()));
    }
    let decoded = image::open(&spec.template_path).map_err(|e| unavailable(e.to_string()))?;
    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(unavailable("image is empty".into()));
    }

    let has_alpha = decoded.color().has_alpha();
    let gray = stretch_contrast(&decoded.to_luma8());

    // Transparency is governed by the mask pipeline: an explicit `false`
    // disables it even when an alpha channel exists; otherwise any alpha
    // channel (or an explicit `true`) routes through the configured method.
    let wants_mask = match spec.has_transparency {
        Some(false) => false,
        Some(true) => true,
        None => has_alpha,
    };
    let mask_img = if wants_mask {
        let method = spec.transparency_method.unwrap_or(MaskMethod::Threshold);
        let alpha = if has_alpha {
            mask::alpha_plane(&decoded.to_rgba8())
        } else {
            mask::synthesize_alpha_hint(&gray)
        };
        let derived = mask::derive_mask(&alpha, &gray, method);
        let cov = mask::coverage(&derived);
        if cov < 0.05 {
            tracing::warn!(
                "template '{}': silhouette covers only {:.1}% of the image",
                spec.name,
                cov * 100.0,
            );
        }
        Some(derived)
    } else {
        None
    };

    let features = features::extract(&gray, mask_img.as_ref(), feature_params);
    if features.len() < MIN_TEMPLATE_FEATURES {
        return Err(ConfigError::TemplateTooWeak {
            logo: spec.name.clone(),
            keypoints: features.len(),
            minimum: MIN_TEMPLATE_FEATURES,
        });
    }

    tracing::debug!(
        "template '{}' loaded: {}x{}, {} keypoints, mask={}",
        spec.name,
        gray.width(),
        gray.height(),
        features.len(),
        mask_img.is_some(),
    );

    Ok(Template {
        name: spec.name.clone(),
        gray,
        mask: mask_img,
        features,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoiSpec;
    use crate::test_utils::{synthetic_logo, write_temp_png};

    fn spec_for(path: std::path::PathBuf) -> LogoSpec {
        LogoSpec {
            name: "chest".into(),
            template_path: path,
            position_mm: [100.0, 100.0],
            angle_deg: 0.0,
            roi: RoiSpec {
                width_mm: 50.0,
                height_mm: 40.0,
                margin_factor: 1.2,
            },
            has_transparency: None,
            transparency_method: None,
        }
    }

    #[test]
    fn textured_template_loads_with_features() {
        let img = synthetic_logo(100, 80, 21);
        let path = write_temp_png("store_textured", &img);
        let store = TemplateStore::load(&[spec_for(path)], &FeatureParams::default()).unwrap();
        assert_eq!(store.len(), 1);
        let t = store.get(0);
        assert_eq!(t.corners()[2], [100.0, 80.0]);
        assert!(t.features.len() >= MIN_TEMPLATE_FEATURES);
        assert_eq!(store.keypoint_counts()[0].0, "chest");
    }

    #[test]
    fn missing_file_is_template_unavailable() {
        let spec = spec_for(std::path::PathBuf::from("/nonexistent/logo.png"));
        let err = TemplateStore::load(&[spec], &FeatureParams::default()).unwrap_err();
        assert!(matches!(err, ConfigError::TemplateUnavailable { .. }));
    }

    #[test]
    fn featureless_template_is_too_weak() {
        let img = GrayImage::from_pixel(64, 64, image::Luma([200]));
        let path = write_temp_png("store_flat", &img);
        let err = TemplateStore::load(&[spec_for(path)], &FeatureParams::default()).unwrap_err();
        match err {
            ConfigError::TemplateTooWeak { logo, minimum, .. } => {
                assert_eq!(logo, "chest");
                assert_eq!(minimum, MIN_TEMPLATE_FEATURES);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
