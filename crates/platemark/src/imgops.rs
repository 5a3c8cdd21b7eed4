//! Frame views, grayscale conversion, perspective warping, and ROI extraction.
//!
//! The engine measures in millimetres; everything in this module works in
//! pixels on [`image::GrayImage`] buffers. Warping uses inverse mapping with
//! bilinear sampling so the output is defined for every destination pixel.

use image::GrayImage;
use nalgebra::{Matrix3, Vector3};

/// Borrowed view over a packed BGR frame (`height × width × 3`, 8-bit).
///
/// The buffer is owned by the caller; the engine never retains it beyond a
/// single `detect` call.
#[derive(Debug, Clone, Copy)]
pub struct BgrFrame<'a> {
    width: u32,
    height: u32,
    data: &'a [u8],
}

/// Rejection of a detect call's inputs before any per-logo work.
///
/// Fatal for that call only: the caller may retry with a corrected frame.
/// Covers empty or malformed frame buffers and a numerically unusable
/// per-call homography override.
#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },
}

impl FrameError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidFrame {
            reason: reason.into(),
        }
    }
}

impl<'a> BgrFrame<'a> {
    /// Wrap a packed BGR buffer, validating its dimensions.
    pub fn new(width: u32, height: u32, data: &'a [u8]) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::invalid(format!(
                "zero-size frame ({width}x{height})"
            )));
        }
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(FrameError::invalid(format!(
                "buffer holds {} bytes, expected {expected} for {width}x{height} BGR",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// BT.601 luma conversion. BGR channel order: weights are applied as
    /// `0.114·B + 0.587·G + 0.299·R`.
    pub fn to_gray(&self) -> GrayImage {
        let mut out = GrayImage::new(self.width, self.height);
        for (i, px) in self.data.chunks_exact(3).enumerate() {
            let (b, g, r) = (px[0] as f32, px[1] as f32, px[2] as f32);
            let v = (0.114 * b + 0.587 * g + 0.299 * r).round().clamp(0.0, 255.0) as u8;
            let x = (i as u32) % self.width;
            let y = (i as u32) / self.width;
            out.put_pixel(x, y, image::Luma([v]));
        }
        out
    }
}

/// Linear min/max contrast stretch to the full 8-bit range.
///
/// Deterministic stand-in for adaptive equalization; flat images pass
/// through unchanged.
pub fn stretch_contrast(img: &GrayImage) -> GrayImage {
    let (mut lo, mut hi) = (u8::MAX, u8::MIN);
    for p in img.pixels() {
        lo = lo.min(p[0]);
        hi = hi.max(p[0]);
    }
    if hi <= lo {
        return img.clone();
    }
    let span = (hi - lo) as f32;
    let mut out = GrayImage::new(img.width(), img.height());
    for (x, y, p) in img.enumerate_pixels() {
        let v = ((p[0] - lo) as f32 * 255.0 / span).round() as u8;
        out.put_pixel(x, y, image::Luma([v]));
    }
    out
}

#[inline]
fn get_clamped(img: &GrayImage, x: i32, y: i32) -> u8 {
    if x < 0 || y < 0 || x >= img.width() as i32 || y >= img.height() as i32 {
        return 0;
    }
    img.get_pixel(x as u32, y as u32)[0]
}

/// Bilinear sample at a fractional pixel position. Out-of-bounds taps read 0.
pub fn sample_bilinear(img: &GrayImage, x: f32, y: f32) -> u8 {
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = get_clamped(img, x0, y0) as f32;
    let p10 = get_clamped(img, x0 + 1, y0) as f32;
    let p01 = get_clamped(img, x0, y0 + 1) as f32;
    let p11 = get_clamped(img, x0 + 1, y0 + 1) as f32;

    let a = p00 + fx * (p10 - p00);
    let b = p01 + fx * (p11 - p01);
    (a + fy * (b - a)).clamp(0.0, 255.0) as u8
}

/// Warp `src` through `h_dst_from_src` into a `out_w × out_h` image.
///
/// `h_dst_from_src` maps source pixels into destination pixels; internally
/// the inverse is applied per destination pixel (sampled at pixel centers).
/// Returns `None` when the homography is not invertible.
pub fn warp_perspective(
    src: &GrayImage,
    h_dst_from_src: &Matrix3<f64>,
    out_w: u32,
    out_h: u32,
) -> Option<GrayImage> {
    let h_src_from_dst = h_dst_from_src.try_inverse()?;
    let mut out = GrayImage::new(out_w, out_h);
    for y in 0..out_h {
        for x in 0..out_w {
            let p = h_src_from_dst * Vector3::new(x as f64 + 0.5, y as f64 + 0.5, 1.0);
            if p[2].abs() < 1e-12 {
                continue;
            }
            // Continuous coordinates back to pixel-index space.
            let sx = (p[0] / p[2] - 0.5) as f32;
            let sy = (p[1] / p[2] - 0.5) as f32;
            out.put_pixel(x, y, image::Luma([sample_bilinear(src, sx, sy)]));
        }
    }
    Some(out)
}

/// A search window clipped against the parent frame.
#[derive(Debug, Clone)]
pub struct RoiPatch {
    /// The clipped sub-image.
    pub image: GrayImage,
    /// Pixel position of the patch origin in the parent frame. Added to any
    /// coordinate recovered in patch space to get frame-space coordinates.
    pub offset: [i64; 2],
}

/// Extract the sub-image of `size_px` centred on `center_px`, clipped to the
/// frame. Returns `None` when the window has no overlap with the frame.
pub fn extract_roi(img: &GrayImage, center_px: [f64; 2], size_px: [u32; 2]) -> Option<RoiPatch> {
    if size_px[0] == 0 || size_px[1] == 0 {
        return None;
    }
    let x1 = (center_px[0] - size_px[0] as f64 / 2.0).round() as i64;
    let y1 = (center_px[1] - size_px[1] as f64 / 2.0).round() as i64;
    let x2 = x1 + size_px[0] as i64;
    let y2 = y1 + size_px[1] as i64;

    let cx1 = x1.max(0);
    let cy1 = y1.max(0);
    let cx2 = x2.min(img.width() as i64);
    let cy2 = y2.min(img.height() as i64);
    if cx1 >= cx2 || cy1 >= cy2 {
        return None;
    }

    let w = (cx2 - cx1) as u32;
    let h = (cy2 - cy1) as u32;
    let mut patch = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let p = img.get_pixel((cx1 as u32) + x, (cy1 as u32) + y);
            patch.put_pixel(x, y, *p);
        }
    }
    Some(RoiPatch {
        image: patch,
        offset: [cx1, cy1],
    })
}
