//! Camera intrinsics and lens distortion.
//!
//! [`CameraParams`] mirrors the calibration struct handed in by the host
//! application: frame size, a row-major 3×4 intrinsics-extended matrix
//! (only the left 3×3 block is used), and one of two distortion
//! coefficient layouts selected by `dist_function_version`.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Calibration input as supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraParams {
    /// Frame width in pixels.
    pub xsize: i32,
    /// Frame height in pixels.
    pub ysize: i32,
    /// Row-major 3×4 matrix; the leftmost 3×3 block is the pinhole `K`.
    pub mat: [[f64; 4]; 3],
    /// Distortion layout selector: 4 → 5-coefficient radial-tangential,
    /// 5 → 12-coefficient rational + thin-prism.
    pub dist_function_version: i32,
    /// Distortion coefficients; length 5 (version 4) or 12 (version 5).
    pub dist_factor: Vec<f64>,
}

/// Lens distortion model applied in normalized pinhole coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum Distortion {
    /// No distortion (also the fallback for unsupported versions).
    None,
    /// Brown-Conrady `[k1, k2, p1, p2, k3]`.
    RadialTangential([f64; 5]),
    /// Rational model with thin prism:
    /// `[k1, k2, p1, p2, k3, k4, k5, k6, s1, s2, s3, s4]`.
    Rational([f64; 12]),
}

impl Distortion {
    /// Apply distortion to normalized coordinates.
    pub fn distort(&self, xn: [f64; 2]) -> [f64; 2] {
        let [x, y] = xn;
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        match self {
            Distortion::None => xn,
            Distortion::RadialTangential([k1, k2, p1, p2, k3]) => {
                let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
                let x_tan = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
                let y_tan = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
                [x * radial + x_tan, y * radial + y_tan]
            }
            Distortion::Rational([k1, k2, p1, p2, k3, k4, k5, k6, s1, s2, s3, s4]) => {
                let num = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
                let den = 1.0 + k4 * r2 + k5 * r4 + k6 * r6;
                let radial = if den.abs() > 1e-15 { num / den } else { num };
                let x_tan = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
                let y_tan = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
                [
                    x * radial + x_tan + s1 * r2 + s2 * r4,
                    y * radial + y_tan + s3 * r2 + s4 * r4,
                ]
            }
        }
    }
}

/// Pinhole camera: `K` plus distortion, derived once from [`CameraParams`].
#[derive(Debug, Clone)]
pub struct CameraModel {
    pub k: Matrix3<f64>,
    pub k_inv: Matrix3<f64>,
    pub distortion: Distortion,
}

impl CameraModel {
    /// Build from caller-supplied calibration. An unsupported distortion
    /// version is reported and leaves the distortion empty.
    pub fn from_params(params: &CameraParams) -> Self {
        let mut k = Matrix3::zeros();
        for i in 0..3 {
            for j in 0..3 {
                k[(i, j)] = params.mat[i][j];
            }
        }
        let distortion = match params.dist_function_version {
            4 => {
                let mut c = [0.0; 5];
                for (dst, src) in c.iter_mut().zip(params.dist_factor.iter()).take(4) {
                    *dst = *src;
                }
                // k3 stays zero for this layout.
                Distortion::RadialTangential(c)
            }
            5 => {
                let mut c = [0.0; 12];
                for (dst, src) in c.iter_mut().zip(params.dist_factor.iter()) {
                    *dst = *src;
                }
                Distortion::Rational(c)
            }
            v => {
                tracing::warn!(version = v, "unsupported camera parameters");
                Distortion::None
            }
        };
        let k_inv = k.try_inverse().unwrap_or_else(Matrix3::identity);
        Self {
            k,
            k_inv,
            distortion,
        }
    }

    /// Convert a pixel coordinate to normalized pinhole coordinates,
    /// ignoring distortion.
    pub fn pixel_to_normalized(&self, pixel: [f64; 2]) -> [f64; 2] {
        let v = self.k_inv * Vector3::new(pixel[0], pixel[1], 1.0);
        [v[0] / v[2], v[1] / v[2]]
    }

    /// Project normalized coordinates to pixels, applying distortion.
    pub fn normalized_to_pixel(&self, xn: [f64; 2]) -> [f64; 2] {
        let d = self.distortion.distort(xn);
        let v = self.k * Vector3::new(d[0], d[1], 1.0);
        [v[0] / v[2], v[1] / v[2]]
    }

    /// Project a camera-frame 3D point to pixel coordinates. Points at or
    /// behind the camera plane return `None`.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<[f64; 2]> {
        if p_cam[2] <= 1e-9 {
            return None;
        }
        let pix = self.normalized_to_pixel([p_cam[0] / p_cam[2], p_cam[1] / p_cam[2]]);
        if pix[0].is_finite() && pix[1].is_finite() {
            Some(pix)
        } else {
            None
        }
    }

    /// Undistort a pixel to normalized coordinates by fixed-point
    /// iteration on the radial/tangential terms.
    pub fn undistort_to_normalized(&self, pixel: [f64; 2]) -> Option<[f64; 2]> {
        let xd = self.pixel_to_normalized(pixel);
        if matches!(self.distortion, Distortion::None) {
            return Some(xd);
        }
        let mut x = xd[0];
        let mut y = xd[1];
        for _ in 0..15 {
            let distorted = self.distortion.distort([x, y]);
            let dx = distorted[0] - xd[0];
            let dy = distorted[1] - xd[1];
            x -= dx;
            y -= dy;
            if !x.is_finite() || !y.is_finite() {
                return None;
            }
            if (dx * dx + dy * dy).sqrt() < 1e-12 {
                break;
            }
        }
        Some([x, y])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params(version: i32, dist: Vec<f64>) -> CameraParams {
        CameraParams {
            xsize: 640,
            ysize: 480,
            mat: [
                [620.0, 0.0, 320.0, 0.0],
                [0.0, 620.0, 240.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
            dist_function_version: version,
            dist_factor: dist,
        }
    }

    #[test]
    fn version4_uses_four_coefficients_and_zero_k3() {
        let cam = CameraModel::from_params(&sample_params(4, vec![-0.1, 0.02, 0.001, -0.001, 9.9]));
        match cam.distortion {
            Distortion::RadialTangential(c) => {
                assert_eq!(c, [-0.1, 0.02, 0.001, -0.001, 0.0]);
            }
            _ => panic!("expected radial-tangential model"),
        }
    }

    #[test]
    fn version5_reads_twelve_coefficients() {
        let coeffs: Vec<f64> = (0..12).map(|i| i as f64 * 0.001).collect();
        let cam = CameraModel::from_params(&sample_params(5, coeffs.clone()));
        match cam.distortion {
            Distortion::Rational(c) => assert_eq!(c.to_vec(), coeffs),
            _ => panic!("expected rational model"),
        }
    }

    #[test]
    fn unknown_version_leaves_distortion_empty() {
        let cam = CameraModel::from_params(&sample_params(7, vec![0.5; 5]));
        assert_eq!(cam.distortion, Distortion::None);
    }

    #[test]
    fn undistort_inverts_distort() {
        let cam = CameraModel::from_params(&sample_params(4, vec![-0.12, 0.03, 0.001, -0.0008, 0.0]));
        let xn = [0.21, -0.14];
        let pix = cam.normalized_to_pixel(xn);
        let back = cam.undistort_to_normalized(pix).unwrap();
        assert!((back[0] - xn[0]).abs() < 1e-8);
        assert!((back[1] - xn[1]).abs() < 1e-8);
    }

    #[test]
    fn projection_rejects_points_behind_camera() {
        let cam = CameraModel::from_params(&sample_params(4, vec![0.0; 5]));
        assert!(cam.project(&Vector3::new(0.1, 0.1, -1.0)).is_none());
        let pix = cam.project(&Vector3::new(0.0, 0.0, 2.0)).unwrap();
        assert!((pix[0] - 320.0).abs() < 1e-9);
        assert!((pix[1] - 240.0).abs() < 1e-9);
    }
}
