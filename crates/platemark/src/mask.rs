//! Template silhouette masks.
//!
//! A mask restricts which template pixels participate in feature extraction
//! and fallback correlation. It is derived from the alpha plane (or from an
//! intensity-based hint when no alpha is present) by one of three methods.

use image::{GrayImage, Luma, RgbaImage};

use crate::config::MaskMethod;

const ALPHA_MIDPOINT: u8 = 128;
const SEED_FG: u8 = 224;
const SEED_BG: u8 = 32;

/// Extract the alpha plane of an RGBA template.
pub fn alpha_plane(rgba: &RgbaImage) -> GrayImage {
    let mut out = GrayImage::new(rgba.width(), rgba.height());
    for (x, y, p) in rgba.enumerate_pixels() {
        out.put_pixel(x, y, Luma([p[3]]));
    }
    out
}

/// Build an alpha-like hint for templates without an alpha channel.
///
/// Background intensity is estimated from the image border; the hint is the
/// absolute deviation from it, stretched to 8 bits.
pub fn synthesize_alpha_hint(gray: &GrayImage) -> GrayImage {
    let (w, h) = gray.dimensions();
    let mut border: Vec<u8> = Vec::with_capacity((2 * (w + h)) as usize);
    for x in 0..w {
        border.push(gray.get_pixel(x, 0)[0]);
        border.push(gray.get_pixel(x, h - 1)[0]);
    }
    for y in 0..h {
        border.push(gray.get_pixel(0, y)[0]);
        border.push(gray.get_pixel(w - 1, y)[0]);
    }
    border.sort_unstable();
    let bg = border[border.len() / 2] as i32;

    let mut out = GrayImage::new(w, h);
    for (x, y, p) in gray.enumerate_pixels() {
        let dev = (p[0] as i32 - bg).unsigned_abs().min(127) as u32;
        out.put_pixel(x, y, Luma([(dev * 2).min(255) as u8]));
    }
    out
}

/// Derive a binary silhouette (0 or 255) from an alpha plane or hint.
pub fn derive_mask(alpha: &GrayImage, gray: &GrayImage, method: MaskMethod) -> GrayImage {
    match method {
        MaskMethod::Threshold => binarize(alpha, ALPHA_MIDPOINT),
        MaskMethod::Contour => fill_external(&binarize(alpha, ALPHA_MIDPOINT)),
        MaskMethod::Grabcut => iterative_segmentation(alpha, gray),
    }
}

fn binarize(img: &GrayImage, threshold: u8) -> GrayImage {
    let mut out = GrayImage::new(img.width(), img.height());
    for (x, y, p) in img.enumerate_pixels() {
        out.put_pixel(x, y, Luma([if p[0] >= threshold { 255 } else { 0 }]));
    }
    out
}

/// Fill the interior of every external contour: any background region not
/// connected to the image border becomes foreground.
fn fill_external(binary: &GrayImage) -> GrayImage {
    let (w, h) = binary.dimensions();
    let (wi, hi) = (w as i32, h as i32);
    let mut outside = vec![false; (w * h) as usize];
    let mut queue: Vec<(i32, i32)> = Vec::new();

    let mut push = |queue: &mut Vec<(i32, i32)>, outside: &mut Vec<bool>, x: i32, y: i32| {
        if x < 0 || y < 0 || x >= wi || y >= hi {
            return;
        }
        let idx = (y * wi + x) as usize;
        if outside[idx] || binary.get_pixel(x as u32, y as u32)[0] != 0 {
            return;
        }
        outside[idx] = true;
        queue.push((x, y));
    };

    for x in 0..wi {
        push(&mut queue, &mut outside, x, 0);
        push(&mut queue, &mut outside, x, hi - 1);
    }
    for y in 0..hi {
        push(&mut queue, &mut outside, 0, y);
        push(&mut queue, &mut outside, wi - 1, y);
    }
    while let Some((x, y)) = queue.pop() {
        push(&mut queue, &mut outside, x - 1, y);
        push(&mut queue, &mut outside, x + 1, y);
        push(&mut queue, &mut outside, x, y - 1);
        push(&mut queue, &mut outside, x, y + 1);
    }

    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let v = if outside[(y * w + x) as usize] { 0 } else { 255 };
            out.put_pixel(x, y, Luma([v]));
        }
    }
    out
}

/// Iterative two-class segmentation seeded by the alpha hint.
///
/// Strong alpha values pin pixels to their class; the uncertain band is
/// reassigned each round to the nearer class intensity mean. Converges in a
/// handful of rounds and is fully deterministic.
fn iterative_segmentation(alpha: &GrayImage, gray: &GrayImage) -> GrayImage {
    const ROUNDS: usize = 5;
    let (w, h) = alpha.dimensions();
    let n = (w * h) as usize;

    let mut fg = vec![false; n];
    let mut pinned = vec![false; n];
    for (i, p) in alpha.pixels().enumerate() {
        fg[i] = p[0] >= ALPHA_MIDPOINT;
        pinned[i] = p[0] >= SEED_FG || p[0] < SEED_BG;
    }

    for _ in 0..ROUNDS {
        let (mut fg_sum, mut fg_n, mut bg_sum, mut bg_n) = (0u64, 0u64, 0u64, 0u64);
        for (i, p) in gray.pixels().enumerate() {
            if fg[i] {
                fg_sum += p[0] as u64;
                fg_n += 1;
            } else {
                bg_sum += p[0] as u64;
                bg_n += 1;
            }
        }
        if fg_n == 0 || bg_n == 0 {
            break;
        }
        let fg_mean = fg_sum as f64 / fg_n as f64;
        let bg_mean = bg_sum as f64 / bg_n as f64;

        let mut changed = false;
        for (i, p) in gray.pixels().enumerate() {
            if pinned[i] {
                continue;
            }
            let v = p[0] as f64;
            let to_fg = (v - fg_mean).abs() < (v - bg_mean).abs();
            if to_fg != fg[i] {
                fg[i] = to_fg;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let v = if fg[(y * w + x) as usize] { 255 } else { 0 };
            out.put_pixel(x, y, Luma([v]));
        }
    }
    // Holes inside the silhouette carry no matchable pixels either way;
    // close them like the contour method does.
    fill_external(&out)
}

/// Fraction of mask pixels that are foreground.
pub fn coverage(mask: &GrayImage) -> f64 {
    let total = (mask.width() * mask.height()) as f64;
    if total == 0.0 {
        return 0.0;
    }
    let on = mask.pixels().filter(|p| p[0] != 0).count() as f64;
    on / total
}
