//! Camera pose recovery from 2D↔3D correspondences.
//!
//! All object points handed in by the tracker lie on the marker plane
//! (z = 0), so PnP reduces to decomposing an object-plane→image
//! homography estimated in normalized (undistorted) camera coordinates.
//! A RANSAC loop over 4-point hypotheses provides the outlier
//! robustness, and the winning hypothesis is refit on its inliers.

use nalgebra::{Matrix3, Matrix3x4, Vector3};
use rand::prelude::*;

use crate::camera::CameraModel;
use crate::homography::{draw_sample, estimate_homography_dlt};

/// PnP RANSAC tuning.
#[derive(Debug, Clone)]
pub struct PnpRansacConfig {
    pub max_iters: usize,
    /// Reprojection inlier threshold in pixels.
    pub reproj_threshold: f64,
    pub min_inliers: usize,
}

impl Default for PnpRansacConfig {
    fn default() -> Self {
        Self {
            max_iters: 100,
            reproj_threshold: 8.0,
            min_inliers: 4,
        }
    }
}

/// Solve the camera pose from coplanar (z = 0) object points and their
/// pixel observations. Returns the 3×4 `[R | t]` matrix mapping object
/// coordinates into the camera frame, or `None` when no acceptable
/// consensus exists.
pub fn solve_planar_pnp_ransac(
    object_points: &[[f64; 3]],
    image_points: &[[f64; 2]],
    camera: &CameraModel,
    config: &PnpRansacConfig,
) -> Option<Matrix3x4<f64>> {
    let n = object_points.len();
    if n < 4 || image_points.len() != n {
        return None;
    }

    // Work in normalized, undistorted coordinates so the homography is
    // independent of K and the lens model.
    let obj2d: Vec<[f64; 2]> = object_points.iter().map(|p| [p[0], p[1]]).collect();
    let mut normalized = Vec::with_capacity(n);
    for p in image_points {
        normalized.push(camera.undistort_to_normalized(*p)?);
    }

    let mut rng = StdRng::seed_from_u64(0x243f6a88);
    let mut best_count = 0usize;
    let mut best_mask = vec![false; n];

    for _ in 0..config.max_iters {
        let picks = draw_sample(&mut rng, n, 4);
        let sample_obj: Vec<[f64; 2]> = picks.iter().map(|&i| obj2d[i]).collect();
        let sample_img: Vec<[f64; 2]> = picks.iter().map(|&i| normalized[i]).collect();
        let Ok(h) = estimate_homography_dlt(&sample_obj, &sample_img) else {
            continue;
        };
        let Some(pose) = pose_from_planar_homography(&h) else {
            continue;
        };

        let mut count = 0usize;
        let mut mask = vec![false; n];
        for i in 0..n {
            if reprojection_error(&pose, &object_points[i], &image_points[i], camera)
                < config.reproj_threshold
            {
                mask[i] = true;
                count += 1;
            }
        }
        if count > best_count {
            best_count = count;
            best_mask = mask;
            if count == n {
                break;
            }
        }
    }

    if best_count < config.min_inliers {
        return None;
    }

    let in_src: Vec<[f64; 2]> = (0..n).filter(|&i| best_mask[i]).map(|i| obj2d[i]).collect();
    let in_dst: Vec<[f64; 2]> = (0..n)
        .filter(|&i| best_mask[i])
        .map(|i| normalized[i])
        .collect();
    let h = estimate_homography_dlt(&in_src, &in_dst).ok()?;
    pose_from_planar_homography(&h)
}

/// Reprojection error of one correspondence under a pose, in pixels.
pub fn reprojection_error(
    pose: &Matrix3x4<f64>,
    object_point: &[f64; 3],
    image_point: &[f64; 2],
    camera: &CameraModel,
) -> f64 {
    let p = Vector3::new(object_point[0], object_point[1], object_point[2]);
    let p_cam = pose.fixed_view::<3, 3>(0, 0) * p + pose.column(3);
    match camera.project(&p_cam) {
        Some(pix) => {
            let dx = pix[0] - image_point[0];
            let dy = pix[1] - image_point[1];
            (dx * dx + dy * dy).sqrt()
        }
        None => f64::INFINITY,
    }
}

/// Decompose an object-plane→normalized-image homography into `[R | t]`.
///
/// The first two homography columns are the rotation's first two columns
/// up to a common scale; the third column is the translation. The
/// rotation is re-orthonormalized by SVD and the sign is fixed so the
/// plane sits in front of the camera.
fn pose_from_planar_homography(h: &Matrix3<f64>) -> Option<Matrix3x4<f64>> {
    let h1 = h.column(0);
    let h2 = h.column(1);
    let n1 = h1.norm();
    let n2 = h2.norm();
    if n1 < 1e-12 || n2 < 1e-12 {
        return None;
    }
    let lambda = 2.0 / (n1 + n2);

    let mut r1 = h1 * lambda;
    let mut r2 = h2 * lambda;
    let mut t = h.column(2) * lambda;

    // The marker must be in front of the camera.
    if t[2] < 0.0 {
        r1 = -r1;
        r2 = -r2;
        t = -t;
    }
    let r3 = r1.cross(&r2);
    let mut r = Matrix3::from_columns(&[r1, r2, r3]);

    // Nearest true rotation in the Frobenius sense.
    let svd = r.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        r = u_fixed * v_t;
    }

    let mut pose = Matrix3x4::zeros();
    pose.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
    pose.column_mut(3).copy_from(&t);
    Some(pose)
}
