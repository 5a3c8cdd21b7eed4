//! AKAZE-style extractor: scale-space Hessian extrema with a binary
//! grid-comparison descriptor.
//!
//! The scale space approximates the nonlinear diffusion pyramid with
//! Gaussian smoothing at geometrically increasing sigmas; detection is by
//! scale-normalised determinant of Hessian. Descriptors are LDB-like mean
//! intensity comparisons between rotated cell pairs, packed to 256 bits.

use image::{GrayImage, ImageBuffer, Luma};

use super::{sort_strongest_first, DescriptorSet, Features, Keypoint};
use crate::config::FeatureParams;

type GrayF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

const BASE_SIGMA: f32 = 1.6;
const DET_THRESHOLD: f32 = 6.0;
const PATCH_RADIUS: f32 = 12.0;
/// Cell grid side for the descriptor; 36 cells give 630 ordered pairs, the
/// first 256 are used.
const GRID: usize = 6;

fn to_f32(img: &GrayImage) -> GrayF32 {
    let (w, h) = img.dimensions();
    let mut out = GrayF32::new(w, h);
    for (x, y, p) in img.enumerate_pixels() {
        out.put_pixel(x, y, Luma([p[0] as f32]));
    }
    out
}

#[inline]
fn at(img: &GrayF32, x: i32, y: i32) -> f32 {
    let cx = x.clamp(0, img.width() as i32 - 1) as u32;
    let cy = y.clamp(0, img.height() as i32 - 1) as u32;
    img.get_pixel(cx, cy)[0]
}

/// Scale-normalised determinant of Hessian at a pixel.
fn hessian_det(img: &GrayF32, x: i32, y: i32, sigma: f32) -> f32 {
    let step = sigma.round().max(1.0) as i32;
    let lxx = at(img, x + step, y) + at(img, x - step, y) - 2.0 * at(img, x, y);
    let lyy = at(img, x, y + step) + at(img, x, y - step) - 2.0 * at(img, x, y);
    let lxy = (at(img, x + step, y + step) + at(img, x - step, y - step)
        - at(img, x + step, y - step)
        - at(img, x - step, y + step))
        / 4.0;
    (lxx * lyy - lxy * lxy) / (step * step) as f32
}

fn orientation(img: &GrayF32, x: i32, y: i32, radius: i32) -> f32 {
    let mut m01 = 0.0f32;
    let mut m10 = 0.0f32;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let v = at(img, x + dx, y + dy);
            m10 += v * dx as f32;
            m01 += v * dy as f32;
        }
    }
    m01.atan2(m10)
}

/// Mean intensity of a small cell centred at a rotated offset.
fn cell_mean(img: &GrayF32, cx: f32, cy: f32) -> f32 {
    let mut sum = 0.0f32;
    for dy in -1..=1 {
        for dx in -1..=1 {
            sum += at(img, (cx + dx as f32).round() as i32, (cy + dy as f32).round() as i32);
        }
    }
    sum / 9.0
}

fn ldb_descriptor(img: &GrayF32, x: f32, y: f32, angle: f32) -> [u8; 32] {
    let (sin_a, cos_a) = angle.sin_cos();

    // Rotated centres of the GRID×GRID cells spanning the patch.
    let mut means = [0.0f32; GRID * GRID];
    let span = 2.0 * PATCH_RADIUS / GRID as f32;
    for gy in 0..GRID {
        for gx in 0..GRID {
            let ox = -PATCH_RADIUS + span * (gx as f32 + 0.5);
            let oy = -PATCH_RADIUS + span * (gy as f32 + 0.5);
            let rx = ox * cos_a - oy * sin_a;
            let ry = ox * sin_a + oy * cos_a;
            means[gy * GRID + gx] = cell_mean(img, x + rx, y + ry);
        }
    }

    let mut desc = [0u8; 32];
    let mut bit = 0usize;
    'outer: for i in 0..means.len() {
        for j in (i + 1)..means.len() {
            if means[i] < means[j] {
                desc[bit / 8] |= 1 << (bit % 8);
            }
            bit += 1;
            if bit == 256 {
                break 'outer;
            }
        }
    }
    desc
}

pub(super) fn extract(gray: &GrayImage, params: &FeatureParams) -> Features {
    let base = to_f32(gray);
    let margin = PATCH_RADIUS.ceil() as i32 + 2;
    let (w, h) = (gray.width() as i32, gray.height() as i32);
    if w <= 2 * margin || h <= 2 * margin {
        return Features::empty(crate::config::FeatureKind::Akaze);
    }

    let mut scored: Vec<(Keypoint, [u8; 32])> = Vec::new();
    for octave in 0..params.nlevels.min(6) {
        let sigma = BASE_SIGMA * (params.scale_factor as f32).powi(octave as i32);
        let smoothed = imageproc::filter::gaussian_blur_f32(&base, sigma);

        let mut level_kps = Vec::new();
        for y in margin..(h - margin) {
            for x in margin..(w - margin) {
                let det = hessian_det(&smoothed, x, y, sigma);
                if det <= DET_THRESHOLD {
                    continue;
                }
                // 3×3 spatial maximum within the level.
                let is_max = (-1..=1).all(|dy| {
                    (-1..=1).all(|dx| {
                        (dx == 0 && dy == 0) || det >= hessian_det(&smoothed, x + dx, y + dy, sigma)
                    })
                });
                if !is_max {
                    continue;
                }
                level_kps.push(Keypoint {
                    x: x as f32,
                    y: y as f32,
                    response: det,
                    angle: 0.0,
                    octave: octave as u8,
                });
            }
        }

        for mut kp in level_kps {
            kp.angle = orientation(&smoothed, kp.x as i32, kp.y as i32, PATCH_RADIUS as i32 / 2);
            let desc = ldb_descriptor(&smoothed, kp.x, kp.y, kp.angle);
            scored.push((kp, desc));
        }
    }

    let mut indexed: Vec<(Keypoint, usize)> =
        scored.iter().enumerate().map(|(i, (k, _))| (*k, i)).collect();
    sort_strongest_first(&mut indexed);

    // Spatial dedup across octaves: keep the strongest within 3 px.
    let mut keypoints: Vec<Keypoint> = Vec::new();
    let mut rows: Vec<[u8; 32]> = Vec::new();
    for (kp, idx) in indexed {
        let close = keypoints
            .iter()
            .any(|k| (k.x - kp.x).abs() < 3.0 && (k.y - kp.y).abs() < 3.0);
        if close {
            continue;
        }
        keypoints.push(kp);
        rows.push(scored[idx].1);
        if keypoints.len() >= params.nfeatures {
            break;
        }
    }

    Features {
        keypoints,
        descriptors: DescriptorSet::Binary(rows),
    }
}
