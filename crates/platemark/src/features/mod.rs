//! Feature extraction behind a single family switch.
//!
//! Three descriptor families are available: ORB (binary, the default and the
//! one tuned hardest for press-plate templates), an AKAZE-style binary
//! extractor, and a SIFT-style float extractor. The family fixes the distance
//! metric used downstream: Hamming for binary descriptors, L2 for float.

mod akaze;
mod orb;
mod sift;

use image::GrayImage;

use crate::config::{FeatureKind, FeatureParams};

/// A detected interest point in image coordinates.
#[derive(Debug, Clone, Copy)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Detector response; higher is stronger.
    pub response: f32,
    /// Dominant orientation, radians.
    pub angle: f32,
    /// Pyramid level the point was detected on.
    pub octave: u8,
}

/// Descriptors for a keypoint set, one row per keypoint.
#[derive(Debug, Clone)]
pub enum DescriptorSet {
    /// 256-bit binary descriptors (ORB, AKAZE). Hamming metric.
    Binary(Vec<[u8; 32]>),
    /// 128-dimensional float descriptors (SIFT). L2 metric.
    Float(Vec<[f32; 128]>),
}

impl DescriptorSet {
    pub fn len(&self) -> usize {
        match self {
            Self::Binary(rows) => rows.len(),
            Self::Float(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn empty_like(kind: FeatureKind) -> Self {
        if kind.is_binary() {
            Self::Binary(Vec::new())
        } else {
            Self::Float(Vec::new())
        }
    }

    fn retain_rows(&mut self, keep: &[bool]) {
        match self {
            Self::Binary(rows) => {
                let mut it = keep.iter();
                rows.retain(|_| *it.next().unwrap());
            }
            Self::Float(rows) => {
                let mut it = keep.iter();
                rows.retain(|_| *it.next().unwrap());
            }
        }
    }
}

/// Keypoints plus their aligned descriptors.
#[derive(Debug, Clone)]
pub struct Features {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: DescriptorSet,
}

impl Features {
    pub fn empty(kind: FeatureKind) -> Self {
        Self {
            keypoints: Vec::new(),
            descriptors: DescriptorSet::empty_like(kind),
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Extract features of the configured family.
///
/// When `mask` is present, keypoints whose centre falls on a zero mask pixel
/// are dropped (with their descriptor rows) before the result is returned.
pub fn extract(gray: &GrayImage, mask: Option<&GrayImage>, params: &FeatureParams) -> Features {
    let mut feats = match params.kind {
        FeatureKind::Orb => orb::extract(gray, params),
        FeatureKind::Akaze => akaze::extract(gray, params),
        FeatureKind::Sift => sift::extract(gray, params),
    };
    if let Some(mask) = mask {
        apply_mask(&mut feats, mask);
    }
    feats
}

fn apply_mask(feats: &mut Features, mask: &GrayImage) {
    let keep: Vec<bool> = feats
        .keypoints
        .iter()
        .map(|kp| {
            let x = kp.x.round() as i64;
            let y = kp.y.round() as i64;
            x >= 0
                && y >= 0
                && x < mask.width() as i64
                && y < mask.height() as i64
                && mask.get_pixel(x as u32, y as u32)[0] != 0
        })
        .collect();
    let mut it = keep.iter();
    feats.keypoints.retain(|_| *it.next().unwrap());
    feats.descriptors.retain_rows(&keep);
}

/// Deterministic strongest-first ordering: response descending, position as
/// the tie-break so equal responses never depend on intermediate sort state.
pub(crate) fn sort_strongest_first(keypoints: &mut [(Keypoint, usize)]) {
    keypoints.sort_by(|(a, _), (b, _)| {
        b.response
            .partial_cmp(&a.response)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| (a.y, a.x).partial_cmp(&(b.y, b.x)).unwrap_or(std::cmp::Ordering::Equal))
    });
}
