//! Shared test helpers: synthetic logo/plate rendering and temp-file plumbing.
//!
//! Consolidated here so the feature extractors, the template store, and the
//! end-to-end engine tests all draw the same scenes.

use image::{GrayImage, Luma};
use rand::prelude::*;

/// Render a feature-rich synthetic logo: high-contrast rectangles scattered
/// over a light background. Deterministic in `seed`.
pub(crate) fn synthetic_logo(w: u32, h: u32, seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut img = GrayImage::from_pixel(w, h, Luma([225]));
    let blocks = ((w * h) / 250).max(12);
    for _ in 0..blocks {
        let bw = rng.gen_range(4..(w / 4).max(5));
        let bh = rng.gen_range(4..(h / 4).max(5));
        let x0 = rng.gen_range(0..w.saturating_sub(bw).max(1));
        let y0 = rng.gen_range(0..h.saturating_sub(bh).max(1));
        let v: u8 = if rng.gen_bool(0.7) {
            rng.gen_range(0..70)
        } else {
            rng.gen_range(120..180)
        };
        for y in y0..(y0 + bh).min(h) {
            for x in x0..(x0 + bw).min(w) {
                img.put_pixel(x, y, Luma([v]));
            }
        }
    }
    img
}

/// Write a grayscale image to a temp PNG and return the path.
pub(crate) fn write_temp_png(tag: &str, img: &GrayImage) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("platemark_test_{}_{}.png", tag, std::process::id()));
    img.save(&path).expect("write temp png");
    path
}

/// Paste `patch` onto `canvas`, rotated by `angle_deg` and scaled by `scale`,
/// centred at `(cx, cy)`. Canvas pixels outside the transformed patch are
/// left untouched.
pub(crate) fn paste_transformed(
    canvas: &mut GrayImage,
    patch: &GrayImage,
    cx: f64,
    cy: f64,
    angle_deg: f64,
    scale: f64,
) {
    let (pw, ph) = (patch.width() as f64, patch.height() as f64);
    let rad = angle_deg.to_radians();
    let (sin_a, cos_a) = rad.sin_cos();
    // Conservative bounding half-extent of the transformed patch.
    let half = 0.5 * scale * (pw + ph);

    let x_min = ((cx - half).floor() as i64).max(0);
    let y_min = ((cy - half).floor() as i64).max(0);
    let x_max = ((cx + half).ceil() as i64).min(canvas.width() as i64);
    let y_max = ((cy + half).ceil() as i64).min(canvas.height() as i64);

    for y in y_min..y_max {
        for x in x_min..x_max {
            // Inverse transform into patch coordinates.
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let ux = (dx * cos_a + dy * sin_a) / scale + pw / 2.0;
            let uy = (-dx * sin_a + dy * cos_a) / scale + ph / 2.0;
            if ux < 0.0 || uy < 0.0 || ux >= pw - 1.0 || uy >= ph - 1.0 {
                continue;
            }
            let v = crate::imgops::sample_bilinear(patch, ux as f32, uy as f32);
            canvas.put_pixel(x as u32, y as u32, Luma([v]));
        }
    }
}

/// Expand a grayscale image into a packed BGR buffer.
pub(crate) fn gray_to_bgr(img: &GrayImage) -> Vec<u8> {
    let mut out = Vec::with_capacity((img.width() * img.height() * 3) as usize);
    for p in img.pixels() {
        out.extend_from_slice(&[p[0], p[0], p[0]]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_logo_is_deterministic() {
        let a = synthetic_logo(64, 48, 5);
        let b = synthetic_logo(64, 48, 5);
        assert_eq!(a.as_raw(), b.as_raw());
        let c = synthetic_logo(64, 48, 6);
        assert_ne!(a.as_raw(), c.as_raw());
    }

    #[test]
    fn identity_paste_copies_pixels() {
        let patch = synthetic_logo(40, 30, 2);
        let mut canvas = GrayImage::from_pixel(100, 100, Luma([255]));
        paste_transformed(&mut canvas, &patch, 50.0, 50.0, 0.0, 1.0);
        // Interior of the pasted patch matches the source exactly.
        for y in 2..28u32 {
            for x in 2..38u32 {
                let canvas_px = canvas.get_pixel(30 + x, 35 + y)[0];
                assert_eq!(canvas_px, patch.get_pixel(x, y)[0], "at ({x},{y})");
            }
        }
    }
}
