//! Template-to-ROI homography estimation and the plausibility gates applied
//! to a fitted model before it is trusted for pose recovery.
//!
//! Press-plate viewing geometry is nearly fronto-parallel: after
//! rectification the projective component of any acceptable model is tiny,
//! so `h33` never approaches zero. The estimator leans on that and solves
//! the homography in inhomogeneous form (`h33` fixed to 1), reducing each
//! fit to an 8×8 normal system over similarity-normalised coordinates.
//! Models that would violate the assumption are exactly the ones
//! [`is_pose_plausible`] rejects anyway.

use nalgebra::{Cholesky, Matrix3, SMatrix, SVector, Vector3};
use rand::prelude::*;
use rand::seq::index;

/// Failure of direct or robust homography estimation.
///
/// At frame time these are detection failures, not call failures: the engine
/// converts them into a `NotFound` outcome and optionally runs the fallback.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum HomographyError {
    #[error("too few correspondences: need {needed}, got {got}")]
    TooFewPoints { needed: usize, got: usize },
    #[error("numerical failure: {0}")]
    NumericalFailure(String),
    #[error("insufficient inliers: need {needed}, found {found}")]
    InsufficientInliers { needed: usize, found: usize },
}

/// Project a 2D point through a 3×3 homography: `H · [x, y, 1]ᵀ → [u, v]`.
///
/// `None` when the point maps to the line at infinity.
pub fn project(h: &Matrix3<f64>, x: f64, y: f64) -> Option<[f64; 2]> {
    let p = h * Vector3::new(x, y, 1.0);
    (p[2].abs() > 1e-12).then(|| [p[0] / p[2], p[1] / p[2]])
}

/// Reprojection residual `‖project(H, src) − dst‖`; infinite when the
/// source point cannot be projected.
pub fn reprojection_error(h: &Matrix3<f64>, src: [f64; 2], dst: [f64; 2]) -> f64 {
    match project(h, src[0], src[1]) {
        Some([u, v]) => ((u - dst[0]).powi(2) + (v - dst[1]).powi(2)).sqrt(),
        None => f64::INFINITY,
    }
}

// ── Direct fit ───────────────────────────────────────────────────────────

/// Similarity conditioning of a point set: centroid at the origin, RMS
/// radius √2. Applied to both sides before the solve and undone in closed
/// form afterwards.
#[derive(Debug, Clone, Copy)]
struct Conditioner {
    scale: f64,
    cx: f64,
    cy: f64,
}

impl Conditioner {
    fn fit(pts: &[[f64; 2]]) -> Self {
        let n = pts.len() as f64;
        let cx = pts.iter().map(|p| p[0]).sum::<f64>() / n;
        let cy = pts.iter().map(|p| p[1]).sum::<f64>() / n;
        let rms = (pts
            .iter()
            .map(|p| (p[0] - cx).powi(2) + (p[1] - cy).powi(2))
            .sum::<f64>()
            / n)
            .sqrt();
        let scale = if rms > 1e-12 {
            std::f64::consts::SQRT_2 / rms
        } else {
            1.0
        };
        Self { scale, cx, cy }
    }

    fn apply(&self, p: [f64; 2]) -> [f64; 2] {
        [(p[0] - self.cx) * self.scale, (p[1] - self.cy) * self.scale]
    }

    /// The conditioning transform as a matrix.
    fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.scale,
            0.0,
            -self.scale * self.cx,
            0.0,
            self.scale,
            -self.scale * self.cy,
            0.0,
            0.0,
            1.0,
        )
    }

    /// Closed-form inverse of the conditioning transform.
    fn inverse_matrix(&self) -> Matrix3<f64> {
        let inv = 1.0 / self.scale;
        Matrix3::new(inv, 0.0, self.cx, 0.0, inv, self.cy, 0.0, 0.0, 1.0)
    }
}

/// Rank-one update of the normal system for one measurement row.
fn accumulate(m: &mut SMatrix<f64, 8, 8>, v: &mut SVector<f64, 8>, row: &[f64; 8], rhs: f64) {
    for i in 0..8 {
        v[i] += row[i] * rhs;
        for j in 0..8 {
            m[(i, j)] += row[i] * row[j];
        }
    }
}

/// Estimate a homography from ≥4 correspondences.
///
/// `src` are template pixels, `dst` are ROI pixels. Both sets are
/// similarity-conditioned; the eight unknowns (with `h33 = 1`) are solved
/// from the accumulated normal equations by Cholesky factorisation. Returns
/// H with `dst ≈ project(H, src)` and `h[2][2] == 1`.
pub fn estimate_homography(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
) -> Result<Matrix3<f64>, HomographyError> {
    let n = src.len();
    if n < 4 || dst.len() < 4 {
        return Err(HomographyError::TooFewPoints {
            needed: 4,
            got: n.min(dst.len()),
        });
    }
    if dst.len() != n {
        return Err(HomographyError::NumericalFailure(
            "correspondence sets differ in length".into(),
        ));
    }

    let cond_src = Conditioner::fit(src);
    let cond_dst = Conditioner::fit(dst);

    // Each correspondence contributes two rows in the unknowns
    // [h11 h12 h13 h21 h22 h23 h31 h32]:
    //   u: [x, y, 1, 0, 0, 0, -u·x, -u·y] = u
    //   v: [0, 0, 0, x, y, 1, -v·x, -v·y] = v
    let mut m = SMatrix::<f64, 8, 8>::zeros();
    let mut rhs = SVector::<f64, 8>::zeros();
    for (s, d) in src.iter().zip(dst) {
        let [x, y] = cond_src.apply(*s);
        let [u, v] = cond_dst.apply(*d);
        accumulate(&mut m, &mut rhs, &[x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y], u);
        accumulate(&mut m, &mut rhs, &[0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y], v);
    }

    let h8 = Cholesky::new(m)
        .ok_or_else(|| {
            HomographyError::NumericalFailure("normal equations are rank deficient".into())
        })?
        .solve(&rhs);

    // On conditioned coordinates a well-posed solve stays O(1); a blow-up
    // means the system was rank deficient up to rounding.
    if h8.iter().any(|v| !v.is_finite() || v.abs() > 1e8) {
        return Err(HomographyError::NumericalFailure(
            "normal equations are ill-conditioned".into(),
        ));
    }

    let h_conditioned = Matrix3::new(h8[0], h8[1], h8[2], h8[3], h8[4], h8[5], h8[6], h8[7], 1.0);
    let h = cond_dst.inverse_matrix() * h_conditioned * cond_src.matrix();

    let anchor = h[(2, 2)];
    if anchor.abs() < 1e-12 {
        return Err(HomographyError::NumericalFailure(
            "model places the template at infinity".into(),
        ));
    }
    Ok(h / anchor)
}

// ── RANSAC ───────────────────────────────────────────────────────────────

/// RANSAC controls. The inlier tolerance and acceptance minimum come from
/// the detector thresholds, so only the iteration budget and seed live here.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct RansacParams {
    /// Upper bound on minimal-sample iterations; the loop usually stops far
    /// earlier once the consensus makes further sampling pointless.
    pub max_iters: usize,
    /// Seed for the sampling RNG. Identical inputs and seed reproduce the
    /// fit bit-for-bit.
    pub seed: u64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iters: 500,
            seed: 7,
        }
    }
}

/// Robust fit result.
#[derive(Debug, Clone)]
pub struct RansacFit {
    /// Refitted homography over the final inlier set.
    pub h: Matrix3<f64>,
    /// Inlier mask aligned with the input correspondences.
    pub inlier_mask: Vec<bool>,
    /// Number of inliers under the refitted model.
    pub n_inliers: usize,
    /// Mean reprojection error over the inliers, in pixels.
    pub mean_inlier_error: f64,
}

/// Stop once a sample drawn entirely from inliers is this likely to have
/// been seen already.
const SAMPLE_CONFIDENCE: f64 = 0.99;

/// Iterations required to hit [`SAMPLE_CONFIDENCE`] at a given inlier ratio.
fn iterations_needed(inlier_ratio: f64, cap: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return cap;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let miss = 1.0 - inlier_ratio.powi(4);
    if miss < 1e-12 {
        return 1;
    }
    let needed = ((1.0 - SAMPLE_CONFIDENCE).ln() / miss.ln()).ceil();
    if needed.is_finite() && needed >= 1.0 {
        (needed as usize).min(cap)
    } else {
        cap
    }
}

/// Whether three points are (nearly) collinear: the angle they span is
/// below ~0.6 degrees.
fn collinear(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> bool {
    let (abx, aby) = (b[0] - a[0], b[1] - a[1]);
    let (acx, acy) = (c[0] - a[0], c[1] - a[1]);
    let cross = (abx * acy - aby * acx).abs();
    let reach = (abx * abx + aby * aby).sqrt() * (acx * acx + acy * acy).sqrt();
    cross < 1e-2 * reach.max(1e-12)
}

/// A minimal sample is unusable when any three of its points fall on a line.
fn sample_is_degenerate(pts: &[[f64; 2]; 4]) -> bool {
    for skip in 0..4 {
        let kept: Vec<[f64; 2]> = (0..4).filter(|&i| i != skip).map(|i| pts[i]).collect();
        if collinear(kept[0], kept[1], kept[2]) {
            return true;
        }
    }
    false
}

/// Fit a homography with RANSAC over `src → dst` correspondences.
///
/// Candidate selection is by inlier count, ties broken by lower mean inlier
/// reprojection error; inlier tests use a strict `< tol_px` comparison.
/// The iteration budget adapts downward as the best consensus grows, and
/// the winner is polished by refitting over its consensus set for as long
/// as that improves it.
pub fn fit_ransac(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
    tol_px: f64,
    min_inliers: usize,
    params: &RansacParams,
) -> Result<RansacFit, HomographyError> {
    let n = src.len();
    if n < 4 || dst.len() != n {
        return Err(HomographyError::TooFewPoints {
            needed: 4,
            got: n.min(dst.len()),
        });
    }
    let floor = min_inliers.max(4);
    let mut rng = StdRng::seed_from_u64(params.seed);

    let consensus = |h: &Matrix3<f64>| {
        let mut mask = vec![false; n];
        let mut count = 0usize;
        let mut err_sum = 0.0f64;
        for i in 0..n {
            let err = reprojection_error(h, src[i], dst[i]);
            if err < tol_px {
                mask[i] = true;
                count += 1;
                err_sum += err;
            }
        }
        let mean = if count > 0 {
            err_sum / count as f64
        } else {
            f64::INFINITY
        };
        (mask, count, mean)
    };

    let mut best: Option<(Matrix3<f64>, usize, f64)> = None;
    let mut budget = params.max_iters.max(1);
    let mut iteration = 0usize;
    while iteration < budget {
        iteration += 1;

        let picks = index::sample(&mut rng, n, 4).into_vec();
        let sample_src = [src[picks[0]], src[picks[1]], src[picks[2]], src[picks[3]]];
        let sample_dst = [dst[picks[0]], dst[picks[1]], dst[picks[2]], dst[picks[3]]];
        if sample_is_degenerate(&sample_src) || sample_is_degenerate(&sample_dst) {
            continue;
        }
        let Ok(h) = estimate_homography(&sample_src, &sample_dst) else {
            continue;
        };

        let (_, count, mean) = consensus(&h);
        if count < 4 {
            continue;
        }
        let improves = match &best {
            None => true,
            Some((_, best_count, best_mean)) => {
                count > *best_count || (count == *best_count && mean < *best_mean)
            }
        };
        if improves {
            best = Some((h, count, mean));
            budget = iterations_needed(count as f64 / n as f64, params.max_iters);
        }
    }

    let (seed_h, seed_count, _) = best.ok_or(HomographyError::InsufficientInliers {
        needed: floor,
        found: 0,
    })?;
    if seed_count < floor {
        return Err(HomographyError::InsufficientInliers {
            needed: floor,
            found: seed_count,
        });
    }

    // Polish: refit over the consensus set while that keeps improving it.
    let mut h = seed_h;
    let (mut mask, mut count, mut mean) = consensus(&h);
    for _ in 0..3 {
        let in_src: Vec<[f64; 2]> = (0..n).filter(|&i| mask[i]).map(|i| src[i]).collect();
        let in_dst: Vec<[f64; 2]> = (0..n).filter(|&i| mask[i]).map(|i| dst[i]).collect();
        let Ok(refit) = estimate_homography(&in_src, &in_dst) else {
            break;
        };
        let (refit_mask, refit_count, refit_mean) = consensus(&refit);
        if refit_count > count || (refit_count == count && refit_mean < mean) {
            h = refit;
            mask = refit_mask;
            count = refit_count;
            mean = refit_mean;
        } else {
            break;
        }
    }
    if count < floor {
        return Err(HomographyError::InsufficientInliers {
            needed: floor,
            found: count,
        });
    }

    Ok(RansacFit {
        h,
        inlier_mask: mask,
        n_inliers: count,
        mean_inlier_error: mean,
    })
}

// ── Model plausibility gates ─────────────────────────────────────────────

/// Maximum accepted condition number of the top-left 2×2 linear part.
const MAX_CONDITION: f64 = 12.0;

/// Singular values of the top-left 2×2 linear part, `s1 ≥ s2 ≥ 0`.
fn linear_part_singular_values(h: &Matrix3<f64>) -> [f64; 2] {
    let (a, b, c, d) = (h[(0, 0)], h[(0, 1)], h[(1, 0)], h[(1, 1)]);
    let q = a * a + b * b + c * c + d * d;
    let det = a * d - b * c;
    let root = ((q * q / 4.0 - det * det).max(0.0)).sqrt();
    let s1 = (q / 2.0 + root).max(0.0).sqrt();
    let s2 = (q / 2.0 - root).max(0.0).sqrt();
    [s1, s2]
}

/// Reject homographies that cannot describe a mildly perspective view of a
/// planar logo: mirrored or degenerate linear parts, extreme anisotropy.
pub fn is_pose_plausible(h: &Matrix3<f64>) -> bool {
    if h.iter().any(|v| !v.is_finite()) {
        return false;
    }
    let det2 = h[(0, 0)] * h[(1, 1)] - h[(0, 1)] * h[(1, 0)];
    if det2 <= 0.0 {
        return false;
    }
    let [s1, s2] = linear_part_singular_values(h);
    if s2 <= 1e-9 || s1 / s2 > MAX_CONDITION {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_homography() -> Matrix3<f64> {
        // Scale + translate + mild perspective.
        Matrix3::new(1.4, 0.05, 120.0, -0.03, 1.5, 80.0, 0.0001, -0.00005, 1.0)
    }

    #[test]
    fn exact_four_points_are_reproduced() {
        let h_true = test_homography();
        let src = [[0.0, 0.0], [100.0, 0.0], [100.0, 100.0], [0.0, 100.0]];
        let dst: Vec<[f64; 2]> = src
            .iter()
            .map(|s| project(&h_true, s[0], s[1]).unwrap())
            .collect();

        let h_est = estimate_homography(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            assert!(reprojection_error(&h_est, *s, *d) < 1e-6);
        }
    }

    #[test]
    fn overdetermined_grid_is_reproduced() {
        let h_true = test_homography();
        let mut src = Vec::new();
        let mut dst = Vec::new();
        for i in 0..5 {
            for j in 0..5 {
                let s = [i as f64 * 20.0, j as f64 * 20.0];
                dst.push(project(&h_true, s[0], s[1]).unwrap());
                src.push(s);
            }
        }
        let h_est = estimate_homography(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            assert!(reprojection_error(&h_est, *s, *d) < 1e-6);
        }
    }

    #[test]
    fn collinear_correspondences_are_rejected() {
        // Every point on one line: the normal system loses rank.
        let src: Vec<[f64; 2]> = (0..6).map(|i| [i as f64 * 10.0, i as f64 * 5.0]).collect();
        let dst = src.clone();
        assert!(matches!(
            estimate_homography(&src, &dst),
            Err(HomographyError::NumericalFailure(_))
        ));
    }

    #[test]
    fn projection_at_infinity_is_none() {
        // Third row chosen so [1, 0, 1] maps to w = 0.
        let h = Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, -1.0, 0.0, 1.0);
        assert!(project(&h, 1.0, 0.0).is_none());
        assert!(project(&h, 0.0, 0.0).is_some());
    }

    #[test]
    fn ransac_survives_outliers() {
        let h_true = test_homography();
        let mut rng = StdRng::seed_from_u64(42);

        let mut src = Vec::new();
        let mut dst = Vec::new();
        for i in 0..20 {
            let s = [(i % 5) as f64 * 30.0, (i / 5) as f64 * 30.0];
            let d = project(&h_true, s[0], s[1]).unwrap();
            src.push(s);
            dst.push([d[0] + rng.gen_range(-0.4..0.4), d[1] + rng.gen_range(-0.4..0.4)]);
        }
        for _ in 0..8 {
            src.push([rng.gen_range(0.0..100.0), rng.gen_range(0.0..100.0)]);
            dst.push([rng.gen_range(0.0..600.0), rng.gen_range(0.0..400.0)]);
        }

        let params = RansacParams {
            max_iters: 1000,
            seed: 99,
        };
        let fit = fit_ransac(&src, &dst, 3.0, 6, &params).unwrap();
        assert!(fit.n_inliers >= 18, "only {} inliers", fit.n_inliers);
        assert!(fit.mean_inlier_error < 1.0);
    }

    #[test]
    fn ransac_is_deterministic_for_a_fixed_seed() {
        let h_true = test_homography();
        let mut src = Vec::new();
        let mut dst = Vec::new();
        for i in 0..16 {
            let s = [(i % 4) as f64 * 25.0, (i / 4) as f64 * 25.0];
            src.push(s);
            dst.push(project(&h_true, s[0], s[1]).unwrap());
        }
        let params = RansacParams {
            max_iters: 200,
            seed: 1234,
        };
        let a = fit_ransac(&src, &dst, 2.0, 4, &params).unwrap();
        let b = fit_ransac(&src, &dst, 2.0, 4, &params).unwrap();
        assert_eq!(a.h, b.h);
        assert_eq!(a.inlier_mask, b.inlier_mask);
        assert_eq!(a.mean_inlier_error.to_bits(), b.mean_inlier_error.to_bits());
    }

    #[test]
    fn too_few_points_is_an_error() {
        let pts = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]];
        assert!(matches!(
            estimate_homography(&pts, &pts),
            Err(HomographyError::TooFewPoints { .. })
        ));
        let params = RansacParams::default();
        assert!(fit_ransac(&pts, &pts, 3.0, 4, &params).is_err());
    }

    #[test]
    fn degenerate_samples_are_detected() {
        assert!(sample_is_degenerate(&[
            [0.0, 0.0],
            [10.0, 0.0],
            [20.0, 0.0],
            [5.0, 30.0],
        ]));
        assert!(!sample_is_degenerate(&[
            [0.0, 0.0],
            [10.0, 0.0],
            [10.0, 10.0],
            [0.0, 10.0],
        ]));
    }

    #[test]
    fn pure_rotations_are_plausible() {
        for deg in [-135.0f64, -10.0, 0.0, 7.5, 90.0, 179.0] {
            let r = deg.to_radians();
            let h = Matrix3::new(r.cos(), -r.sin(), 5.0, r.sin(), r.cos(), -3.0, 0.0, 0.0, 1.0);
            assert!(is_pose_plausible(&h), "rotation {deg} rejected");
        }
    }

    #[test]
    fn plausibility_rejects_mirrors_and_collapses() {
        // Mirror: negative determinant.
        let mirror = Matrix3::new(-1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        assert!(!is_pose_plausible(&mirror));
        // Near-rank-1 linear part.
        let collapse = Matrix3::new(1.0, 1.0, 0.0, 1.0, 1.0000001, 0.0, 0.0, 0.0, 1.0);
        assert!(!is_pose_plausible(&collapse));
        // Extreme anisotropic shear.
        let shear = Matrix3::new(30.0, 0.0, 0.0, 0.0, 0.5, 0.0, 0.0, 0.0, 1.0);
        assert!(!is_pose_plausible(&shear));
        // Mild perspective passes.
        assert!(is_pose_plausible(&test_homography()));
    }
}
