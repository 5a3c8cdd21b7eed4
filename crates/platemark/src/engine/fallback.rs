//! Fallback detector: exhaustive masked template correlation over a
//! (scale × angle) hypothesis grid.
//!
//! Runs only when the primary feature path has failed, and never overrides
//! it. Each hypothesis renders a rotated and scaled copy of the template
//! (and of its silhouette mask) and scans it across the ROI with
//! zero-normalised cross-correlation restricted to the mask.

use image::{GrayImage, Luma};

use crate::config::FallbackParams;
use crate::imgops::sample_bilinear;
use crate::template::Template;

/// Winning correlation peak across the hypothesis grid.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FallbackHit {
    /// Detected centre in ROI pixel coordinates.
    pub center_roi_px: [f64; 2],
    /// The hypothesis rotation, degrees.
    pub angle_deg: f64,
    /// ZNCC peak value in `[-1, 1]`.
    pub score: f64,
}

/// A rendered hypothesis: transformed template plus validity mask.
struct Rendered {
    gray: GrayImage,
    mask: GrayImage,
}

/// Render the template rotated by `angle_deg` and scaled by `scale` into a
/// tight bounding box. Pixels outside the transformed template (or outside
/// its silhouette) are masked out.
fn render_hypothesis(
    template: &GrayImage,
    silhouette: Option<&GrayImage>,
    scale: f64,
    angle_deg: f64,
) -> Rendered {
    let (w, h) = (template.width() as f64, template.height() as f64);
    let rad = angle_deg.to_radians();
    let (sin_a, cos_a) = rad.sin_cos();

    let out_w = ((w * cos_a.abs() + h * sin_a.abs()) * scale).ceil().max(1.0) as u32;
    let out_h = ((w * sin_a.abs() + h * cos_a.abs()) * scale).ceil().max(1.0) as u32;
    let (ocx, ocy) = (out_w as f64 / 2.0, out_h as f64 / 2.0);

    let mut gray = GrayImage::new(out_w, out_h);
    let mut mask = GrayImage::new(out_w, out_h);
    for y in 0..out_h {
        for x in 0..out_w {
            let dx = x as f64 + 0.5 - ocx;
            let dy = y as f64 + 0.5 - ocy;
            // Inverse rotation and scale back into template coordinates,
            // then from continuous centers to pixel-index space.
            let ux = (dx * cos_a + dy * sin_a) / scale + w / 2.0 - 0.5;
            let uy = (-dx * sin_a + dy * cos_a) / scale + h / 2.0 - 0.5;
            if ux < 0.0 || uy < 0.0 || ux > w - 1.0 || uy > h - 1.0 {
                continue;
            }
            if let Some(sil) = silhouette {
                if sil.get_pixel(ux.round() as u32, uy.round() as u32)[0] == 0 {
                    continue;
                }
            }
            gray.put_pixel(x, y, Luma([sample_bilinear(template, ux as f32, uy as f32)]));
            mask.put_pixel(x, y, Luma([255]));
        }
    }
    Rendered { gray, mask }
}

/// Masked template statistics precomputed once per hypothesis.
struct ScanPlan {
    /// Masked pixels as (dx, dy, value).
    taps: Vec<(u32, u32, f32)>,
    sum_t: f64,
    denom_t: f64,
}

impl ScanPlan {
    fn new(rendered: &Rendered) -> Option<Self> {
        let mut taps = Vec::new();
        let mut sum_t = 0.0f64;
        let mut sum_t2 = 0.0f64;
        for (x, y, p) in rendered.mask.enumerate_pixels() {
            if p[0] == 0 {
                continue;
            }
            let v = rendered.gray.get_pixel(x, y)[0] as f32;
            taps.push((x, y, v));
            sum_t += v as f64;
            sum_t2 += (v as f64) * (v as f64);
        }
        if taps.len() < 16 {
            return None;
        }
        let n = taps.len() as f64;
        let denom_t = sum_t2 - sum_t * sum_t / n;
        if denom_t <= 1e-6 {
            // Flat hypothesis carries no correlation signal.
            return None;
        }
        Some(Self {
            taps,
            sum_t,
            denom_t,
        })
    }

    /// ZNCC of the plan against the ROI window at `(ox, oy)`.
    fn score_at(&self, roi: &GrayImage, ox: u32, oy: u32) -> f64 {
        let n = self.taps.len() as f64;
        let mut sum_r = 0.0f64;
        let mut sum_r2 = 0.0f64;
        let mut sum_tr = 0.0f64;
        for &(dx, dy, t) in &self.taps {
            let r = roi.get_pixel(ox + dx, oy + dy)[0] as f64;
            sum_r += r;
            sum_r2 += r * r;
            sum_tr += t as f64 * r;
        }
        let denom_r = sum_r2 - sum_r * sum_r / n;
        if denom_r <= 1e-6 {
            return 0.0;
        }
        let cov = sum_tr - self.sum_t * sum_r / n;
        cov / (self.denom_t * denom_r).sqrt()
    }
}

/// Scan every hypothesis over the ROI and return the best peak, if it
/// strictly exceeds the configured threshold.
pub(crate) fn run(roi: &GrayImage, template: &Template, params: &FallbackParams) -> Option<FallbackHit> {
    let mut best: Option<FallbackHit> = None;

    for &scale in &params.scales {
        for &angle in &params.angles_deg {
            let rendered =
                render_hypothesis(&template.gray, template.mask.as_ref(), scale, angle);
            let (tw, th) = rendered.gray.dimensions();
            if tw > roi.width() || th > roi.height() {
                continue;
            }
            let Some(plan) = ScanPlan::new(&rendered) else {
                continue;
            };

            for oy in 0..=(roi.height() - th) {
                for ox in 0..=(roi.width() - tw) {
                    let score = plan.score_at(roi, ox, oy);
                    let better = match &best {
                        Some(b) => score > b.score,
                        None => true,
                    };
                    if better {
                        best = Some(FallbackHit {
                            center_roi_px: [
                                ox as f64 + tw as f64 / 2.0,
                                oy as f64 + th as f64 / 2.0,
                            ],
                            angle_deg: angle,
                            score,
                        });
                    }
                }
            }
        }
    }

    match best {
        Some(hit) if hit.score > params.match_threshold => {
            tracing::debug!(
                "fallback peak {:.3} at roi ({:.1}, {:.1}), angle {:.1}",
                hit.score,
                hit.center_roi_px[0],
                hit.center_roi_px[1],
                hit.angle_deg,
            );
            Some(hit)
        }
        _ => None,
    }
}
