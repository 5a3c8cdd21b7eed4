//! SIFT-style extractor: difference-of-Gaussian extrema with 128-D gradient
//! orientation histogram descriptors (L2 metric).

use image::{imageops, GrayImage, ImageBuffer, Luma};

use super::{sort_strongest_first, DescriptorSet, Features, Keypoint};
use crate::config::FeatureParams;

type GrayF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

const BASE_SIGMA: f32 = 1.6;
/// Scale intervals per octave.
const INTERVALS: usize = 3;
const DOG_THRESHOLD: f32 = 4.0;
/// Principal-curvature ratio bound for edge rejection.
const EDGE_RATIO: f32 = 10.0;

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

fn subtract(a: &GrayF32, b: &GrayF32) -> GrayF32 {
    let (w, h) = a.dimensions();
    let mut out = GrayF32::new(w, h);
    for y in 0..h {
        for x in 0..w {
            out.put_pixel(x, y, Luma([a.get_pixel(x, y)[0] - b.get_pixel(x, y)[0]]));
        }
    }
    out
}

/// Gradient (magnitude, orientation) at a pixel of a Gaussian level.
#[inline]
fn gradient(img: &GrayF32, x: i32, y: i32) -> (f32, f32) {
    let dx = at(img, x + 1, y) - at(img, x - 1, y);
    let dy = at(img, x, y + 1) - at(img, x, y - 1);
    ((dx * dx + dy * dy).sqrt(), dy.atan2(dx))
}

fn is_extremum(below: &GrayF32, mid: &GrayF32, above: &GrayF32, x: i32, y: i32) -> bool {
    let v = at(mid, x, y);
    if v.abs() <= DOG_THRESHOLD {
        return false;
    }
    let mut lo = true;
    let mut hi = true;
    for dy in -1..=1 {
        for dx in -1..=1 {
            for img in [below, mid, above] {
                let n = at(img, x + dx, y + dy);
                if std::ptr::eq(img, mid) && dx == 0 && dy == 0 {
                    continue;
                }
                hi &= v >= n;
                lo &= v <= n;
            }
        }
    }
    hi || lo
}

/// Reject edge-like responses via the DoG Hessian curvature ratio.
fn passes_edge_test(dog: &GrayF32, x: i32, y: i32) -> bool {
    let dxx = at(dog, x + 1, y) + at(dog, x - 1, y) - 2.0 * at(dog, x, y);
    let dyy = at(dog, x, y + 1) + at(dog, x, y - 1) - 2.0 * at(dog, x, y);
    let dxy = (at(dog, x + 1, y + 1) + at(dog, x - 1, y - 1)
        - at(dog, x + 1, y - 1)
        - at(dog, x - 1, y + 1))
        / 4.0;
    let tr = dxx + dyy;
    let det = dxx * dyy - dxy * dxy;
    if det <= 0.0 {
        return false;
    }
    tr * tr / det < (EDGE_RATIO + 1.0) * (EDGE_RATIO + 1.0) / EDGE_RATIO
}

/// Dominant gradient orientation over a circular window (36-bin histogram).
fn dominant_orientation(level: &GrayF32, x: i32, y: i32) -> f32 {
    const BINS: usize = 36;
    let radius = 8;
    let mut hist = [0.0f32; BINS];
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let (mag, ori) = gradient(level, x + dx, y + dy);
            let mut bin =
                ((ori + std::f32::consts::PI) / (2.0 * std::f32::consts::PI) * BINS as f32) as usize;
            if bin >= BINS {
                bin = BINS - 1;
            }
            hist[bin] += mag;
        }
    }
    let best = hist
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0);
    (best as f32 + 0.5) / BINS as f32 * 2.0 * std::f32::consts::PI - std::f32::consts::PI
}

/// 4×4 spatial cells × 8 orientation bins over a rotated 16×16 patch.
fn descriptor(level: &GrayF32, x: f32, y: f32, angle: f32) -> [f32; 128] {
    let (sin_a, cos_a) = angle.sin_cos();
    let mut desc = [0.0f32; 128];

    for sy in -8i32..8 {
        for sx in -8i32..8 {
            // Patch coordinates rotated into image space.
            let rx = sx as f32 * cos_a - sy as f32 * sin_a;
            let ry = sx as f32 * sin_a + sy as f32 * cos_a;
            let (mag, ori) = gradient(level, (x + rx).round() as i32, (y + ry).round() as i32);
            let rel = ori - angle;

            let cell_x = ((sx + 8) / 4) as usize;
            let cell_y = ((sy + 8) / 4) as usize;
            let norm = (rel + std::f32::consts::PI).rem_euclid(2.0 * std::f32::consts::PI);
            let mut bin = (norm / (2.0 * std::f32::consts::PI) * 8.0) as usize;
            if bin >= 8 {
                bin = 7;
            }
            desc[(cell_y * 4 + cell_x) * 8 + bin] += mag;
        }
    }

    // Normalise, clamp, renormalise (illumination robustness).
    let mut norm = desc.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for v in desc.iter_mut() {
            *v = (*v / norm).min(0.2);
        }
        norm = desc.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 1e-12 {
            for v in desc.iter_mut() {
                *v /= norm;
            }
        }
    }
    desc
}

pub(super) fn extract(gray: &GrayImage, params: &FeatureParams) -> Features {
    let margin = 10i32;
    let mut scored: Vec<(Keypoint, [f32; 128])> = Vec::new();

    let mut octave_base = to_f32(gray);
    let octaves = params.nlevels.clamp(1, 4);
    let k = 2.0f32.powf(1.0 / INTERVALS as f32);

    for octave in 0..octaves {
        let (w, h) = (octave_base.width() as i32, octave_base.height() as i32);
        if w <= 2 * margin || h <= 2 * margin {
            break;
        }

        // Gaussian ladder and its DoG stack.
        let mut gaussians = Vec::with_capacity(INTERVALS + 3);
        for i in 0..(INTERVALS + 3) {
            let sigma = BASE_SIGMA * k.powi(i as i32);
            gaussians.push(imageproc::filter::gaussian_blur_f32(&octave_base, sigma));
        }
        let dogs: Vec<GrayF32> = gaussians
            .windows(2)
            .map(|pair| subtract(&pair[1], &pair[0]))
            .collect();

        let octave_scale = (1u32 << octave) as f32;
        for s in 1..(dogs.len() - 1) {
            for y in margin..(h - margin) {
                for x in margin..(w - margin) {
                    if !is_extremum(&dogs[s - 1], &dogs[s], &dogs[s + 1], x, y) {
                        continue;
                    }
                    if !passes_edge_test(&dogs[s], x, y) {
                        continue;
                    }
                    let level = &gaussians[s];
                    let angle = dominant_orientation(level, x, y);
                    let desc = descriptor(level, x as f32, y as f32, angle);
                    scored.push((
                        Keypoint {
                            x: x as f32 * octave_scale,
                            y: y as f32 * octave_scale,
                            response: at(&dogs[s], x, y).abs(),
                            angle,
                            octave: octave as u8,
                        },
                        desc,
                    ));
                }
            }
        }

        let nw = octave_base.width() / 2;
        let nh = octave_base.height() / 2;
        if nw < 2 * margin as u32 || nh < 2 * margin as u32 {
            break;
        }
        octave_base = imageops::resize(&octave_base, nw, nh, imageops::FilterType::Triangle);
    }

    let mut indexed: Vec<(Keypoint, usize)> =
        scored.iter().enumerate().map(|(i, (kp, _))| (*kp, i)).collect();
    sort_strongest_first(&mut indexed);
    indexed.truncate(params.nfeatures);

    let mut keypoints = Vec::with_capacity(indexed.len());
    let mut rows = Vec::with_capacity(indexed.len());
    for (kp, idx) in indexed {
        keypoints.push(kp);
        rows.push(scored[idx].1);
    }

    Features {
        keypoints,
        descriptors: DescriptorSet::Float(rows),
    }
}
