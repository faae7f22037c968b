//! Robust plane-to-plane homography fitting.
//!
//! The direct linear transform runs on coordinates conditioned into
//! `[-1, 1]²` (per-axis bounding-box mapping), solved by SVD of the
//! stacked design matrix. Robustness comes from an adaptive MSAC loop:
//! minimal samples are screened for collinearity, models are ranked by
//! truncated reprojection cost, and the iteration budget shrinks as the
//! inlier ratio firms up.
//!
//! The tracker consumes [`HomographyInfo`]: the fitted matrix, the
//! per-correspondence inlier mask, and a single validity bit. A fit is
//! valid only when enough inliers support it, the matrix is
//! well-conditioned, and the warped unit square stays a convex
//! quadrilateral with consistent winding.

use nalgebra::{DMatrix, Matrix3};
use rand::prelude::*;

use crate::imgproc::perspective_transform;

const MIN_CORRESPONDENCES: usize = 4;
const MSAC_MAX_ITERS: usize = 500;
const MSAC_CONFIDENCE: f64 = 0.995;
const RNG_SEED: u64 = 0x6b8b4567;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HomographyError {
    #[error("need at least {MIN_CORRESPONDENCES} point pairs, got {0}")]
    NotEnoughPoints(usize),
    #[error("source and destination point counts differ")]
    LengthMismatch,
    #[error("degenerate point configuration")]
    Degenerate,
}

/// Result of a robust homography fit.
#[derive(Debug, Clone)]
pub struct HomographyInfo {
    /// `true` when the fit passed every acceptance gate. The matrix and
    /// mask are only meaningful when set.
    pub valid: bool,
    pub homography: Matrix3<f64>,
    /// Per-input-correspondence inlier flags.
    pub status: Vec<bool>,
    pub n_inliers: usize,
}

impl HomographyInfo {
    fn invalid(n: usize) -> Self {
        Self {
            valid: false,
            homography: Matrix3::identity(),
            status: vec![false; n],
            n_inliers: 0,
        }
    }
}

#[inline]
fn reprojection_sq(h: &Matrix3<f64>, src: &[f64; 2], dst: &[f64; 2]) -> f64 {
    let p = perspective_transform(h, *src);
    if !p[0].is_finite() || !p[1].is_finite() {
        return f64::INFINITY;
    }
    let dx = p[0] - dst[0];
    let dy = p[1] - dst[1];
    dx * dx + dy * dy
}

/// Affine map taking the points' bounding box onto `[-1, 1]²`. Keeps the
/// DLT system well-conditioned even for wildly anisotropic inputs.
fn conditioning_transform(pts: &[[f64; 2]]) -> Matrix3<f64> {
    let mut lo = [f64::MAX; 2];
    let mut hi = [f64::MIN; 2];
    for p in pts {
        for axis in 0..2 {
            lo[axis] = lo[axis].min(p[axis]);
            hi[axis] = hi[axis].max(p[axis]);
        }
    }
    let sx = 2.0 / (hi[0] - lo[0]).max(1e-9);
    let sy = 2.0 / (hi[1] - lo[1]).max(1e-9);
    Matrix3::new(
        sx,
        0.0,
        -1.0 - sx * lo[0],
        0.0,
        sy,
        -1.0 - sy * lo[1],
        0.0,
        0.0,
        1.0,
    )
}

/// Estimate a homography from ≥4 correspondences such that
/// `dst ≈ H · src`.
///
/// Both point sets are conditioned independently; the stacked 2n×9
/// system is solved by SVD, taking the right singular vector of the
/// smallest singular value.
pub fn estimate_homography_dlt(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
) -> Result<Matrix3<f64>, HomographyError> {
    let n = src.len();
    if n != dst.len() {
        return Err(HomographyError::LengthMismatch);
    }
    if n < MIN_CORRESPONDENCES {
        return Err(HomographyError::NotEnoughPoints(n));
    }

    let t_src = conditioning_transform(src);
    let t_dst = conditioning_transform(dst);

    let mut rows = Vec::with_capacity(2 * n * 9);
    for (s, d) in src.iter().zip(dst) {
        let [x, y] = perspective_transform(&t_src, *s);
        let [u, v] = perspective_transform(&t_dst, *d);
        rows.extend_from_slice(&[x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y, -u]);
        rows.extend_from_slice(&[0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y, -v]);
    }
    // Pad to at least 9 rows: the thin SVD of a wide matrix would not
    // carry the null-space direction for a minimal 4-point system.
    let row_count = (2 * n).max(9);
    rows.resize(row_count * 9, 0.0);
    let design = DMatrix::from_row_slice(row_count, 9, &rows);

    let svd = design.svd(false, true);
    let v_t = svd.v_t.ok_or(HomographyError::Degenerate)?;

    // Pick the null-space direction explicitly rather than trusting the
    // singular value ordering.
    let mut weakest = 0;
    for i in 1..svd.singular_values.len() {
        if svd.singular_values[i] < svd.singular_values[weakest] {
            weakest = i;
        }
    }
    let h_row = v_t.row(weakest);
    let h_conditioned = Matrix3::new(
        h_row[0], h_row[1], h_row[2], h_row[3], h_row[4], h_row[5], h_row[6], h_row[7], h_row[8],
    );

    let h = t_dst.try_inverse().ok_or(HomographyError::Degenerate)? * h_conditioned * t_src;
    let scale = h[(2, 2)];
    if scale.abs() > 1e-14 {
        Ok(h / scale)
    } else {
        Ok(h)
    }
}

/// Draw `k` distinct indices from `0..n` by a partial shuffle.
pub(crate) fn draw_sample(rng: &mut StdRng, n: usize, k: usize) -> Vec<usize> {
    let mut pool: Vec<usize> = (0..n).collect();
    for slot in 0..k {
        let j = rng.gen_range(slot..n);
        pool.swap(slot, j);
    }
    pool.truncate(k);
    pool
}

/// A minimal sample is unusable when any three of its source points are
/// (nearly) collinear.
fn sample_is_degenerate(picks: &[usize], pts: &[[f64; 2]]) -> bool {
    for skip in 0..picks.len() {
        let tri: Vec<&[f64; 2]> = picks
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != skip)
            .map(|(_, &p)| &pts[p])
            .collect();
        let area2 = (tri[1][0] - tri[0][0]) * (tri[2][1] - tri[0][1])
            - (tri[1][1] - tri[0][1]) * (tri[2][0] - tri[0][0]);
        if area2.abs() < 1e-9 {
            return true;
        }
    }
    false
}

/// Truncated-cost model score: inliers contribute their squared error,
/// outliers a constant penalty. Lower is better.
fn score_model(
    h: &Matrix3<f64>,
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
    thresh_sq: f64,
) -> (Vec<bool>, usize, f64) {
    let mut mask = vec![false; src.len()];
    let mut inliers = 0usize;
    let mut cost = 0.0f64;
    for (i, (s, d)) in src.iter().zip(dst).enumerate() {
        let err = reprojection_sq(h, s, d);
        if err < thresh_sq {
            mask[i] = true;
            inliers += 1;
            cost += err;
        } else {
            cost += thresh_sq;
        }
    }
    (mask, inliers, cost)
}

/// Iterations needed to hit [`MSAC_CONFIDENCE`] of drawing one
/// all-inlier minimal sample at the observed inlier ratio.
fn iterations_for_ratio(inliers: usize, total: usize) -> usize {
    let w = inliers as f64 / total as f64;
    let p_good_sample = w.powi(MIN_CORRESPONDENCES as i32);
    if p_good_sample <= f64::EPSILON {
        return MSAC_MAX_ITERS;
    }
    if p_good_sample >= 1.0 - f64::EPSILON {
        return 1;
    }
    let needed = (1.0 - MSAC_CONFIDENCE).ln() / (1.0 - p_good_sample).ln();
    needed.ceil().min(MSAC_MAX_ITERS as f64) as usize
}

/// The warped unit square must stay convex with consistent winding.
/// Catches flips and near-degenerate fits that still have ≥4 inliers.
fn warped_square_is_convex(h: &Matrix3<f64>) -> bool {
    let square = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
    let mut warped = [[0.0f64; 2]; 4];
    for (w, s) in warped.iter_mut().zip(square.iter()) {
        *w = perspective_transform(h, *s);
        if !w[0].is_finite() || !w[1].is_finite() {
            return false;
        }
    }
    let mut sign = 0.0f64;
    for i in 0..4 {
        let a = warped[i];
        let b = warped[(i + 1) % 4];
        let c = warped[(i + 2) % 4];
        let cross = (b[0] - a[0]) * (c[1] - b[1]) - (b[1] - a[1]) * (c[0] - b[0]);
        if cross.abs() < 1e-12 {
            return false;
        }
        if sign == 0.0 {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
    }
    true
}

/// Robust homography fit. MSAC over collinearity-screened minimal
/// samples with an adaptive iteration budget; the winning model is
/// refit on its inliers and rescored. Never fails — an unfittable input
/// yields `valid == false`.
pub fn find_homography_ransac(src: &[[f64; 2]], dst: &[[f64; 2]], threshold: f64) -> HomographyInfo {
    let n = src.len();
    if n < MIN_CORRESPONDENCES || dst.len() != n {
        return HomographyInfo::invalid(n);
    }
    let thresh_sq = threshold * threshold;

    let mut rng = StdRng::seed_from_u64(RNG_SEED);
    let mut best: Option<(f64, Matrix3<f64>, Vec<bool>)> = None;
    let mut budget = MSAC_MAX_ITERS;
    let mut iteration = 0usize;

    while iteration < budget {
        iteration += 1;

        let picks = draw_sample(&mut rng, n, MIN_CORRESPONDENCES);
        if sample_is_degenerate(&picks, src) {
            continue;
        }
        let sample_src: Vec<[f64; 2]> = picks.iter().map(|&i| src[i]).collect();
        let sample_dst: Vec<[f64; 2]> = picks.iter().map(|&i| dst[i]).collect();
        let Ok(model) = estimate_homography_dlt(&sample_src, &sample_dst) else {
            continue;
        };

        let (mask, inliers, cost) = score_model(&model, src, dst, thresh_sq);
        if inliers < MIN_CORRESPONDENCES {
            continue;
        }
        if best.as_ref().map_or(true, |(best_cost, _, _)| cost < *best_cost) {
            budget = budget.min(iterations_for_ratio(inliers, n));
            best = Some((cost, model, mask));
        }
    }

    let Some((_, consensus_model, consensus_mask)) = best else {
        return HomographyInfo::invalid(n);
    };

    // Refit on the consensus set, then rescore everything against the
    // refined model.
    let refit_src: Vec<[f64; 2]> = consensus_mask
        .iter()
        .zip(src)
        .filter_map(|(&m, &p)| m.then_some(p))
        .collect();
    let refit_dst: Vec<[f64; 2]> = consensus_mask
        .iter()
        .zip(dst)
        .filter_map(|(&m, &p)| m.then_some(p))
        .collect();
    let refined = estimate_homography_dlt(&refit_src, &refit_dst).unwrap_or(consensus_model);
    let (status, n_inliers, _) = score_model(&refined, src, dst, thresh_sq);

    let valid = n_inliers >= MIN_CORRESPONDENCES
        && refined.determinant().abs() > 1e-9
        && warped_square_is_convex(&refined);

    HomographyInfo {
        valid,
        homography: refined,
        status,
        n_inliers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn reference_warp() -> Matrix3<f64> {
        // Shear + anisotropic scale + offset, with gentle perspective.
        Matrix3::new(
            1.8, -0.12, 95.0, 0.07, 2.1, -30.0, 3.0e-4, -1.2e-4, 1.0,
        )
    }

    fn reproj(h: &Matrix3<f64>, s: &[f64; 2], d: &[f64; 2]) -> f64 {
        reprojection_sq(h, s, d).sqrt()
    }

    #[test]
    fn four_exact_points_reproduce_the_warp() {
        let truth = reference_warp();
        let src = [[0.0, 0.0], [64.0, 0.0], [64.0, 48.0], [0.0, 48.0]];
        let dst: Vec<[f64; 2]> = src.iter().map(|s| perspective_transform(&truth, *s)).collect();

        let est = estimate_homography_dlt(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            assert!(reproj(&est, s, d) < 1e-6);
        }
    }

    #[test]
    fn overdetermined_fit_stays_consistent() {
        let truth = reference_warp();
        let mut src = Vec::new();
        let mut dst = Vec::new();
        for i in 0..6 {
            for j in 0..4 {
                let s = [6.0 + i as f64 * 15.0, 3.0 + j as f64 * 18.0];
                src.push(s);
                dst.push(perspective_transform(&truth, s));
            }
        }
        let est = estimate_homography_dlt(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            assert!(reproj(&est, s, d) < 1e-6);
        }
    }

    #[test]
    fn anisotropic_spans_are_conditioned_away() {
        // x spans three orders of magnitude more than y; the bounding-box
        // conditioning must keep the solve accurate anyway.
        let truth = Matrix3::new(0.9, 0.0, 12.0, 0.02, 1.1, -4.0, 1e-5, 0.0, 1.0);
        let mut src = Vec::new();
        let mut dst = Vec::new();
        for i in 0..12 {
            let s = [i as f64 * 180.0, (i % 3) as f64 * 0.75];
            src.push(s);
            dst.push(perspective_transform(&truth, s));
        }
        let est = estimate_homography_dlt(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            assert!(reproj(&est, s, d) < 1e-6, "error {}", reproj(&est, s, d));
        }
    }

    #[test]
    fn msac_recovers_under_contamination() {
        let truth = reference_warp();
        let mut rng = StdRng::seed_from_u64(17);

        let mut src = Vec::new();
        let mut dst = Vec::new();
        for i in 0..24 {
            let s = [(i % 6) as f64 * 22.0 + 4.0, (i / 6) as f64 * 26.0 + 2.0];
            let d = perspective_transform(&truth, s);
            src.push(s);
            dst.push([d[0] + rng.gen_range(-0.4..0.4), d[1] + rng.gen_range(-0.4..0.4)]);
        }
        for _ in 0..9 {
            src.push([rng.gen_range(0.0..130.0), rng.gen_range(0.0..110.0)]);
            dst.push([rng.gen_range(0.0..900.0), rng.gen_range(0.0..700.0)]);
        }

        let info = find_homography_ransac(&src, &dst, 2.0);
        assert!(info.valid);
        assert!(info.n_inliers >= 21, "only {} inliers", info.n_inliers);
        for i in 0..24 {
            assert!(reproj(&info.homography, &src[i], &dst[i]) < 4.0);
        }
    }

    #[test]
    fn too_few_points_is_invalid_not_fatal() {
        let pts = [[0.0, 0.0], [9.0, 1.0], [4.0, 7.0]];
        let info = find_homography_ransac(&pts, &pts, 2.5);
        assert!(!info.valid);
        assert_eq!(info.status.len(), 3);
    }

    #[test]
    fn collinear_sources_never_produce_a_model() {
        // Every minimal sample is degenerate, so no model survives.
        let src: Vec<[f64; 2]> = (0..10).map(|i| [i as f64 * 5.0, i as f64 * 2.5]).collect();
        let dst: Vec<[f64; 2]> = src.iter().map(|p| [p[0] + 10.0, p[1] - 3.0]).collect();
        let info = find_homography_ransac(&src, &dst, 2.5);
        assert!(!info.valid);
    }

    #[test]
    fn horizon_crossing_fails_convexity_gate() {
        // When the projective horizon crosses the unit square the warped
        // quad self-intersects; the winding test must reject it.
        let h_twist = Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, -1.5, 0.0, 1.0);
        assert!(!warped_square_is_convex(&h_twist));
        assert!(warped_square_is_convex(&reference_warp()));
    }

    #[test]
    fn estimate_inverts_cleanly() {
        let h = reference_warp();
        let h_inv = h.try_inverse().unwrap();
        let p = [12.5, 61.0];
        let q = perspective_transform(&h, p);
        let back = perspective_transform(&h_inv, q);
        assert_relative_eq!(p[0], back[0], epsilon = 1e-8);
        assert_relative_eq!(p[1], back[1], epsilon = 1e-8);
    }
}
