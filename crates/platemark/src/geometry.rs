//! Planar geometry primitives shared by the detection pipeline.
//!
//! All engine-level measurements are expressed in millimetres; pixel space is
//! entered only at the boundary to image operations. The single scale factor
//! `mm_per_px` is millimetres per pixel: `mm = px * mm_per_px`.

/// Angle of the vector `p1 - p0` in degrees, range `(-180, 180]`.
pub fn angle_deg(p0: [f64; 2], p1: [f64; 2]) -> f64 {
    let dx = p1[0] - p0[0];
    let dy = p1[1] - p0[1];
    dy.atan2(dx).to_degrees()
}

/// Euclidean distance between two points.
pub fn l2(a: [f64; 2], b: [f64; 2]) -> f64 {
    let dx = b[0] - a[0];
    let dy = b[1] - a[1];
    (dx * dx + dy * dy).sqrt()
}

/// Arithmetic-mean centroid of a vertex set. `None` for an empty slice.
pub fn polygon_centroid(points: &[[f64; 2]]) -> Option<[f64; 2]> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let sx: f64 = points.iter().map(|p| p[0]).sum();
    let sy: f64 = points.iter().map(|p| p[1]).sum();
    Some([sx / n, sy / n])
}

/// Wrap an angle in degrees into `(-180, 180]`.
pub fn normalize_angle_deg(a: f64) -> f64 {
    let mut r = a % 360.0;
    if r <= -180.0 {
        r += 360.0;
    } else if r > 180.0 {
        r -= 360.0;
    }
    r
}

/// Minimum circular difference between two angles in degrees, range `[0, 180]`.
pub fn circular_angle_diff(a: f64, b: f64) -> f64 {
    let d = (a - b).abs() % 360.0;
    d.min(360.0 - d)
}

/// Convert a millimetre coordinate to pixels (`px = mm / mm_per_px`).
pub fn mm_to_px(x_mm: f64, y_mm: f64, mm_per_px: f64) -> [f64; 2] {
    [x_mm / mm_per_px, y_mm / mm_per_px]
}

/// Convert a pixel coordinate to millimetres (`mm = px * mm_per_px`).
pub fn px_to_mm(x_px: f64, y_px: f64, mm_per_px: f64) -> [f64; 2] {
    [x_px * mm_per_px, y_px * mm_per_px]
}
