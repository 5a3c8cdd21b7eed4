//! ORB: FAST-9 corners with rotated BRIEF descriptors over an image pyramid.

use image::{imageops, GrayImage};

use super::{sort_strongest_first, DescriptorSet, Features, Keypoint};
use crate::config::FeatureParams;

/// FAST intensity threshold. Templates are contrast-stretched before
/// extraction, so a fixed threshold behaves consistently across inputs.
const FAST_THRESHOLD: u8 = 20;

/// Circle offsets for the FAST-9 segment test, clockwise from north.
const FAST_RING: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// Learned 256-pair BRIEF sampling pattern (offsets within a 31px patch).
const BRIEF_PATTERN: [(i8, i8, i8, i8); 256] = [
    (8, -3, 9, 5), (-11, 9, -8, 2), (3, -12, -13, 2), (-3, -7, -4, 5),
    (1, -11, 12, -2), (1, -1, 11, -1), (4, -2, -5, -8), (2, -13, -8, 9),
    (-11, 1, 6, 2), (11, 11, 12, -1), (6, -12, -9, -8), (12, 5, 3, -6),
    (1, 1, -4, -1), (7, -4, -6, 7), (-3, 2, 9, -8), (-4, -8, 3, 3),
    (-5, 3, 0, -4), (2, -11, -13, 0), (10, 5, 5, 2), (0, 9, 10, -3),
    (5, -8, -10, 1), (8, 3, -8, -5), (2, -6, -9, -4), (-12, 2, 0, -10),
    (5, -10, -7, -2), (-7, 9, -1, 0), (0, -1, -3, 3), (-12, 5, -2, -1),
    (-1, 1, -5, -11), (-1, 2, -3, 0), (-5, -6, 7, -1), (4, 7, 0, -8),
    (-9, 9, 3, -13), (7, -3, 13, -7), (10, -4, -5, 3), (6, 1, -13, -13),
    (-12, -11, 7, 0), (0, -1, -8, -6), (-10, -5, -6, 7), (10, 2, -6, -12),
    (-11, 8, 4, -2), (9, 0, -11, -4), (0, 11, 6, -11), (4, 1, -10, -3),
    (-6, 12, 1, 12), (-4, -8, 8, -7), (-3, 0, 8, 3), (3, 3, -3, -1),
    (-6, -11, -2, 12), (0, -3, -6, -3), (-6, 3, -12, -8), (6, 3, -2, -10),
    (-3, -10, -1, 0), (11, 2, 11, 3), (1, -8, -10, 8), (2, -2, -7, 8),
    (0, -13, 13, 0), (6, -9, -1, -1), (7, 5, 6, 3), (-13, 7, -7, -7),
    (-5, -13, 5, -11), (6, 7, -2, 12), (-6, -11, 8, 6), (-2, -2, -5, 9),
    (5, 4, 7, -6), (0, 11, -4, -5), (10, 1, 2, -8), (-3, -10, -10, -10),
    (1, 9, 6, -5), (-7, -11, 11, 3), (11, -2, -4, 3), (7, -1, 5, 12),
    (-5, 5, -2, -5), (8, -11, -1, -13), (-13, 2, -11, -8), (-2, 9, 5, 0),
    (2, -5, 2, 0), (3, -13, -12, 9), (6, -3, 5, 4), (10, 10, 1, -9),
    (-13, -8, -4, 10), (2, -2, -3, 8), (-13, -11, -8, -3), (2, -4, -7, -3),
    (12, 0, -2, 13), (-11, 7, -10, -1), (-5, -10, 0, -11), (6, 7, 12, -3),
    (-1, -1, 8, -6), (-6, 3, -1, -3), (-2, -11, -11, -3), (12, -2, 3, -10),
    (-11, -1, -2, -8), (3, -1, 7, 3), (2, -2, -12, 12), (6, -4, 12, -2),
    (-3, 11, 2, -12), (-1, 3, 2, 3), (1, 3, -11, -3), (2, -8, -7, -5),
    (0, -5, -11, -6), (-12, 8, -2, 9), (3, -7, 9, -8), (-10, -6, -1, -11),
    (11, -6, -3, -13), (3, 0, 0, -8), (-5, -2, -1, -13), (-8, -5, -10, -13),
    (7, -13, 0, -3), (1, -4, -1, -13), (6, -5, -7, 8), (8, 7, -5, -13),
    (2, 0, -8, -6), (-8, -3, -13, -6), (-6, 5, 0, 6), (-8, 8, -9, 1),
    (10, 1, -9, 4), (-4, -8, -5, 7), (7, 7, 10, -8), (-7, -3, -1, 1),
    (10, -1, 3, 1), (5, 6, -10, -8), (-6, -13, 5, -8), (4, -3, -4, -13),
    (-3, 4, -2, -13), (10, -11, 9, 11), (-9, 0, 12, 2), (-4, -2, 13, -6),
    (2, -10, -6, 1), (11, -13, 4, -13), (1, -1, 1, 9), (1, -5, -13, -5),
    (7, 4, 12, -7), (0, -2, -8, 3), (7, 2, 2, -8), (-2, 7, -12, -4),
    (1, 11, 6, -2), (-1, -1, -4, 10), (0, 8, 0, -13), (3, 12, 5, -13),
    (-9, -1, 9, -13), (12, 4, -6, -4), (-13, 13, 1, -4), (0, -2, -7, -9),
    (10, -8, -13, 3), (2, -13, 6, 8), (10, -6, -7, 0), (-11, 7, -1, -7),
    (12, 0, 5, -4), (-7, -8, 4, -12), (-13, 5, -5, -2), (0, 5, 4, 4),
    (-2, -11, -1, 8), (9, 3, -1, -12), (0, 6, -10, 12), (1, -8, -7, -10),
    (-6, 4, -6, 3), (5, 1, -3, -9), (-6, 6, -6, 3), (7, -8, 1, -7),
    (3, 8, -9, -5), (2, -4, 5, 7), (11, 4, 6, -3), (-8, -1, 11, -1),
    (-3, -6, -10, -8), (2, 7, 3, -12), (-4, -10, 12, -3), (1, -2, -4, 6),
    (3, 11, -11, 0), (-6, 2, 3, -8), (6, 12, 0, -13), (3, 2, -2, -5),
    (-4, 1, -6, 5), (-12, 0, -13, 9), (-6, 2, 7, -8), (-2, -4, -6, 5),
    (0, 0, 0, -13), (9, -13, -2, 0), (3, -13, 5, -12), (10, 11, -13, -13),
    (-2, 3, -12, 3), (11, 7, -7, 0), (12, 2, 1, -13), (12, -11, 12, -8),
    (-7, -2, -4, -7), (7, 5, -1, -13), (-5, -8, -9, 10), (6, 0, -3, -13),
    (12, 4, -13, 1), (-7, 8, 8, -3), (10, -4, 0, -13), (2, 1, -7, 0),
    (-5, 4, 2, -8), (12, 8, 4, -13), (8, 7, -10, 0), (-3, 6, -2, 4),
    (-5, -1, -8, -12), (4, -1, -2, -10), (6, -4, -13, 9), (-7, 8, -6, -12),
    (-10, 2, -13, 10), (-1, -7, 0, 2), (-5, 6, -5, -12), (6, -13, 7, -3),
    (-13, 2, -1, 8), (2, 8, -13, 0), (-6, -9, 1, -4), (-9, 13, 0, -13),
    (-2, -3, 8, 0), (4, 0, -11, 12), (0, 3, -10, 10), (-6, -9, -3, -2),
    (9, -4, -6, 2), (5, 0, -13, -10), (-3, -8, -13, 3), (-12, -1, -4, -2),
    (7, -9, -4, 3), (-8, -4, 1, 11), (11, 6, 2, -12), (6, 6, -8, 12),
    (-3, -8, 2, -10), (2, 5, -8, 8), (-9, 8, -6, -8), (-4, 0, -11, -7),
    (7, 6, -3, 8), (-5, 7, -12, 5), (2, -8, -5, 1), (0, 4, -5, -3),
    (9, -9, -6, -12), (0, -13, 0, -13), (-7, -11, -3, -13), (6, -12, -7, 10),
    (6, -8, -13, 7), (8, 7, -11, -1), (-11, -5, -6, 9), (6, 4, 2, -13),
    (-1, -6, 3, -9), (1, -4, 4, -3), (-6, 8, -12, 0), (-11, 3, -6, 2),
    (7, -10, 11, -6), (5, 0, 12, -13), (4, -8, 1, -1), (-13, 12, -6, 3),
    (1, 4, -9, -2), (-8, -12, -8, 7), (-9, 5, 0, -5), (9, 7, 5, 3),
    (-12, -2, 8, -8), (3, 7, 12, -8), (-13, 3, -1, -1), (-10, -4, -10, 12),
    (5, -2, 0, 13), (-7, 1, -12, 8), (2, 9, -5, -11), (11, -13, 0, 2),
];

#[inline]
fn px(img: &GrayImage, x: i32, y: i32) -> u8 {
    let cx = x.clamp(0, img.width() as i32 - 1) as u32;
    let cy = y.clamp(0, img.height() as i32 - 1) as u32;
    img.get_pixel(cx, cy)[0]
}

/// Quick cardinal-point rejection before the full segment test.
fn fast_precheck(img: &GrayImage, x: i32, y: i32, center: u8) -> bool {
    let hi = center.saturating_add(FAST_THRESHOLD);
    let lo = center.saturating_sub(FAST_THRESHOLD);
    let cardinal = [
        px(img, x, y - 3),
        px(img, x + 3, y),
        px(img, x, y + 3),
        px(img, x - 3, y),
    ];
    let bright = cardinal.iter().filter(|&&p| p > hi).count();
    let dark = cardinal.iter().filter(|&&p| p < lo).count();
    bright >= 3 || dark >= 3
}

/// FAST-9: at least 9 consecutive ring pixels all brighter or all darker
/// than the centre by the threshold.
fn fast_segment_test(img: &GrayImage, x: i32, y: i32, center: u8) -> bool {
    let hi = center.saturating_add(FAST_THRESHOLD);
    let lo = center.saturating_sub(FAST_THRESHOLD);

    let mut run_bright = 0u32;
    let mut run_dark = 0u32;
    let mut best_bright = 0u32;
    let mut best_dark = 0u32;
    for i in 0..(FAST_RING.len() * 2) {
        let (dx, dy) = FAST_RING[i % FAST_RING.len()];
        let p = px(img, x + dx, y + dy);
        if p > hi {
            run_bright += 1;
            run_dark = 0;
            best_bright = best_bright.max(run_bright);
        } else if p < lo {
            run_dark += 1;
            run_bright = 0;
            best_dark = best_dark.max(run_dark);
        } else {
            run_bright = 0;
            run_dark = 0;
        }
    }
    best_bright >= 9 || best_dark >= 9
}

/// Corner response: sum of absolute ring-to-centre differences. Cheap,
/// deterministic, and monotone in local contrast.
fn corner_response(img: &GrayImage, x: i32, y: i32) -> f32 {
    let center = px(img, x, y) as i32;
    FAST_RING
        .iter()
        .map(|&(dx, dy)| (px(img, x + dx, y + dy) as i32 - center).abs())
        .sum::<i32>() as f32
}

/// Dominant orientation via the intensity centroid of a circular patch.
fn orientation(img: &GrayImage, x: i32, y: i32, radius: i32) -> f32 {
    let mut m01 = 0.0f32;
    let mut m10 = 0.0f32;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let v = px(img, x + dx, y + dy) as f32;
            m10 += v * dx as f32;
            m01 += v * dy as f32;
        }
    }
    m01.atan2(m10)
}

/// Rotated BRIEF over the learned pattern, 256 bits packed into 32 bytes.
fn brief_descriptor(img: &GrayImage, x: i32, y: i32, angle: f32) -> [u8; 32] {
    let (sin_a, cos_a) = angle.sin_cos();
    let mut desc = [0u8; 32];
    for (byte_idx, tests) in BRIEF_PATTERN.chunks(8).enumerate() {
        let mut byte = 0u8;
        for (bit, &(ax, ay, bx, by)) in tests.iter().enumerate() {
            let r1x = (ax as f32 * cos_a - ay as f32 * sin_a).round() as i32;
            let r1y = (ax as f32 * sin_a + ay as f32 * cos_a).round() as i32;
            let r2x = (bx as f32 * cos_a - by as f32 * sin_a).round() as i32;
            let r2y = (bx as f32 * sin_a + by as f32 * cos_a).round() as i32;
            if px(img, x + r1x, y + r1y) < px(img, x + r2x, y + r2y) {
                byte |= 1 << bit;
            }
        }
        desc[byte_idx] = byte;
    }
    desc
}

/// Grid NMS keeping the strongest corner per cell neighbourhood.
fn suppress(corners: Vec<Keypoint>, cap: usize) -> Vec<Keypoint> {
    const CELL: f32 = 5.0;
    let mut indexed: Vec<(Keypoint, usize)> =
        corners.into_iter().enumerate().map(|(i, k)| (k, i)).collect();
    sort_strongest_first(&mut indexed);

    let mut occupied = std::collections::HashSet::new();
    let mut kept = Vec::new();
    for (kp, _) in indexed {
        let gx = (kp.x / CELL).floor() as i32;
        let gy = (kp.y / CELL).floor() as i32;
        let free = (-1..=1).all(|dy| (-1..=1).all(|dx| !occupied.contains(&(gx + dx, gy + dy))));
        if free {
            occupied.insert((gx, gy));
            kept.push(kp);
            if kept.len() >= cap {
                break;
            }
        }
    }
    kept
}

pub(super) fn extract(gray: &GrayImage, params: &FeatureParams) -> Features {
    let margin = params.edge_threshold.max(3) as i32;
    let orient_radius = (params.patch_size / 2).max(3) as i32;

    let mut scored: Vec<(Keypoint, [u8; 32])> = Vec::new();
    let mut level = gray.clone();
    let mut scale = 1.0f32;

    for octave in 0..params.nlevels {
        if octave > 0 {
            let nw = (level.width() as f64 / params.scale_factor) as u32;
            let nh = (level.height() as f64 / params.scale_factor) as u32;
            if nw < (2 * margin as u32 + 8) || nh < (2 * margin as u32 + 8) {
                break;
            }
            level = imageops::resize(&level, nw, nh, imageops::FilterType::Triangle);
            scale *= params.scale_factor as f32;
        }

        let (w, h) = (level.width() as i32, level.height() as i32);
        let mut corners = Vec::new();
        for y in margin..(h - margin) {
            for x in margin..(w - margin) {
                let center = px(&level, x, y);
                if !fast_precheck(&level, x, y, center) {
                    continue;
                }
                if !fast_segment_test(&level, x, y, center) {
                    continue;
                }
                corners.push(Keypoint {
                    x: x as f32,
                    y: y as f32,
                    response: corner_response(&level, x, y),
                    angle: 0.0,
                    octave: octave as u8,
                });
            }
        }

        for mut kp in suppress(corners, params.nfeatures) {
            let (lx, ly) = (kp.x as i32, kp.y as i32);
            kp.angle = orientation(&level, lx, ly, orient_radius);
            let desc = brief_descriptor(&level, lx, ly, kp.angle);
            kp.x *= scale;
            kp.y *= scale;
            scored.push((kp, desc));
        }
    }

    // Keep the strongest nfeatures across all levels.
    let mut indexed: Vec<(Keypoint, usize)> =
        scored.iter().enumerate().map(|(i, (k, _))| (*k, i)).collect();
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
        descriptors: DescriptorSet::Binary(rows),
    }
}
