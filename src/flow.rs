//! Sparse pyramidal Lucas-Kanade optical flow.
//!
//! Frames are ingested once per `process_frame` call into a
//! [`FlowPyramid`] (float levels plus Scharr gradients); the tracker
//! keeps the previous frame's pyramid and runs the flow both forward and
//! backward, keeping only points that converge in both directions.

use image::GrayImage;
use rayon::prelude::*;

use crate::imgproc::{pyr_down, Plane};

/// Maximum pyramid level used by the flow (0 = base only).
pub const FLOW_MAX_PYR_LEVEL: usize = 3;
/// LK integration window edge length.
pub const FLOW_WIN_SIZE: usize = 21;
const HALF_WIN: i32 = (FLOW_WIN_SIZE as i32 - 1) / 2;
const WIN_PIXELS: usize = FLOW_WIN_SIZE * FLOW_WIN_SIZE;
/// Gauss-Newton iteration cap per level.
const MAX_ITERS: usize = 30;
/// Convergence epsilon on the incremental update.
const EPSILON: f32 = 0.01;
/// Minimum normalized eigenvalue of the structure tensor.
const MIN_EIGEN: f32 = 1e-4;

/// Image pyramid with per-level gradients, ready for LK in either
/// temporal direction.
#[derive(Debug, Clone)]
pub struct FlowPyramid {
    levels: Vec<Plane>,
    grad_x: Vec<Plane>,
    grad_y: Vec<Plane>,
}

impl FlowPyramid {
    /// Build levels `0..=FLOW_MAX_PYR_LEVEL` from a grayscale frame.
    pub fn build(frame: &GrayImage) -> Self {
        let mut images = vec![frame.clone()];
        for i in 1..=FLOW_MAX_PYR_LEVEL {
            images.push(pyr_down(&images[i - 1]));
        }
        let levels: Vec<Plane> = images.iter().map(Plane::from_gray).collect();
        let grad_x: Vec<Plane> = levels.iter().map(|l| scharr(l, true)).collect();
        let grad_y: Vec<Plane> = levels.iter().map(|l| scharr(l, false)).collect();
        Self {
            levels,
            grad_x,
            grad_y,
        }
    }

    pub fn base_width(&self) -> usize {
        self.levels[0].width
    }

    pub fn base_height(&self) -> usize {
        self.levels[0].height
    }
}

/// Normalized Scharr derivative along one axis.
fn scharr(src: &Plane, horizontal: bool) -> Plane {
    const SMOOTH: [f32; 3] = [3.0 / 16.0, 10.0 / 16.0, 3.0 / 16.0];
    const DIFF: [f32; 3] = [-0.5, 0.0, 0.5];
    let (w, h) = (src.width, src.height);
    let mut out = Plane::zeros(w, h);
    if w < 3 || h < 3 {
        return out;
    }
    let (kx, ky) = if horizontal {
        (DIFF, SMOOTH)
    } else {
        (SMOOTH, DIFF)
    };
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let mut acc = 0.0f32;
            for (j, cy) in ky.iter().enumerate() {
                for (i, cx) in kx.iter().enumerate() {
                    acc += cy * cx * src.get(x + i - 1, y + j - 1);
                }
            }
            out.data[y * w + x] = acc;
        }
    }
    out
}

/// Track `points` from `prev` to `next`. Returns the tracked positions
/// and a per-point convergence flag.
pub fn calc_optical_flow_pyr_lk(
    prev: &FlowPyramid,
    next: &FlowPyramid,
    points: &[[f64; 2]],
) -> (Vec<[f64; 2]>, Vec<bool>) {
    let results: Vec<([f64; 2], bool)> = points
        .par_iter()
        .map(|&p| track_point(prev, next, p))
        .collect();
    let mut out_pts = Vec::with_capacity(points.len());
    let mut status = Vec::with_capacity(points.len());
    for (p, s) in results {
        out_pts.push(p);
        status.push(s);
    }
    (out_pts, status)
}

/// Forward then backward flow; a point survives only when both passes
/// converge. Returns forward-tracked positions with the combined flags.
pub fn bidirectional_flow(
    prev: &FlowPyramid,
    next: &FlowPyramid,
    points: &[[f64; 2]],
) -> (Vec<[f64; 2]>, Vec<bool>) {
    let (forward, status_fwd) = calc_optical_flow_pyr_lk(prev, next, points);
    let (_, status_bwd) = calc_optical_flow_pyr_lk(next, prev, &forward);
    let status: Vec<bool> = status_fwd
        .iter()
        .zip(&status_bwd)
        .map(|(&a, &b)| a && b)
        .collect();
    (forward, status)
}

fn track_point(prev: &FlowPyramid, next: &FlowPyramid, point: [f64; 2]) -> ([f64; 2], bool) {
    let mut dx = 0.0f32;
    let mut dy = 0.0f32;
    let mut valid = true;

    for lvl in (0..=FLOW_MAX_PYR_LEVEL).rev() {
        let scale = 1.0 / (1 << lvl) as f32;
        let xc = point[0] as f32 * scale;
        let yc = point[1] as f32 * scale;
        if lvl < FLOW_MAX_PYR_LEVEL {
            dx *= 2.0;
            dy *= 2.0;
        }

        let prev_img = &prev.levels[lvl];
        let next_img = &next.levels[lvl];
        let gx = &prev.grad_x[lvl];
        let gy = &prev.grad_y[lvl];

        // Template patch and structure tensor around the source point.
        let mut patch = [0.0f32; WIN_PIXELS];
        let mut gx_patch = [0.0f32; WIN_PIXELS];
        let mut gy_patch = [0.0f32; WIN_PIXELS];
        let mut a = 0.0f32;
        let mut b = 0.0f32;
        let mut c = 0.0f32;
        let mut idx = 0usize;
        for wy in -HALF_WIN..=HALF_WIN {
            for wx in -HALF_WIN..=HALF_WIN {
                let px = xc + wx as f32;
                let py = yc + wy as f32;
                let i0 = prev_img.sample_clamped(px, py);
                let ixv = gx.sample_clamped(px, py);
                let iyv = gy.sample_clamped(px, py);
                patch[idx] = i0;
                gx_patch[idx] = ixv;
                gy_patch[idx] = iyv;
                a += ixv * ixv;
                b += ixv * iyv;
                c += iyv * iyv;
                idx += 1;
            }
        }

        let det = a * c - b * b;
        let trace = a + c;
        let lambda_min = 0.5 * (trace - ((a - c) * (a - c) + 4.0 * b * b).sqrt());
        if det.abs() < 1e-7 || lambda_min / (WIN_PIXELS as f32) < MIN_EIGEN {
            valid = false;
            break;
        }
        let inv_det = 1.0 / det;

        for _ in 0..MAX_ITERS {
            let mut d = 0.0f32;
            let mut e = 0.0f32;
            let mut idx = 0usize;
            for wy in -HALF_WIN..=HALF_WIN {
                for wx in -HALF_WIN..=HALF_WIN {
                    let i1 = next_img.sample_clamped(xc + dx + wx as f32, yc + dy + wy as f32);
                    let it = i1 - patch[idx];
                    d -= gx_patch[idx] * it;
                    e -= gy_patch[idx] * it;
                    idx += 1;
                }
            }
            let delta_x = inv_det * (c * d - b * e);
            let delta_y = inv_det * (-b * d + a * e);
            dx += delta_x;
            dy += delta_y;
            if delta_x * delta_x + delta_y * delta_y < EPSILON * EPSILON {
                break;
            }
        }
    }

    let out = [point[0] + dx as f64, point[1] + dy as f64];
    if valid {
        let w = next.base_width() as f64;
        let h = next.base_height() as f64;
        valid = out[0] >= 0.0 && out[1] >= 0.0 && out[0] < w && out[1] < h;
    }
    (if valid { out } else { point }, valid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textured(size: u32, dx: f32, dy: f32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            let xf = x as f32 - dx;
            let yf = y as f32 - dy;
            let v = 128.0
                + 50.0 * (xf * 0.13).sin()
                + 45.0 * (yf * 0.17).cos()
                + 25.0 * ((xf + yf) * 0.07).sin();
            image::Luma([v.clamp(0.0, 255.0) as u8])
        })
    }

    #[test]
    fn integer_translation_is_recovered() {
        let a = FlowPyramid::build(&textured(128, 0.0, 0.0));
        let b = FlowPyramid::build(&textured(128, 5.0, -3.0));
        let pts = vec![[64.0, 64.0], [40.0, 70.0], [80.0, 50.0]];
        let (tracked, status) = calc_optical_flow_pyr_lk(&a, &b, &pts);
        for i in 0..pts.len() {
            assert!(status[i], "point {i} lost");
            assert!((tracked[i][0] - pts[i][0] - 5.0).abs() < 0.3);
            assert!((tracked[i][1] - pts[i][1] + 3.0).abs() < 0.3);
        }
    }

    #[test]
    fn subpixel_translation_is_recovered() {
        let a = FlowPyramid::build(&textured(128, 0.0, 0.0));
        let b = FlowPyramid::build(&textured(128, 0.4, -0.7));
        let (tracked, status) = calc_optical_flow_pyr_lk(&a, &b, &[[64.0, 64.0]]);
        assert!(status[0]);
        assert!((tracked[0][0] - 64.4).abs() < 0.2);
        assert!((tracked[0][1] - 63.3).abs() < 0.2);
    }

    #[test]
    fn large_motion_crosses_pyramid_levels() {
        let a = FlowPyramid::build(&textured(256, 0.0, 0.0));
        let b = FlowPyramid::build(&textured(256, 18.0, 12.0));
        let (tracked, status) = calc_optical_flow_pyr_lk(&a, &b, &[[128.0, 128.0]]);
        assert!(status[0]);
        assert!((tracked[0][0] - 146.0).abs() < 1.5);
        assert!((tracked[0][1] - 140.0).abs() < 1.5);
    }

    #[test]
    fn flat_region_is_rejected() {
        let flat = GrayImage::from_pixel(128, 128, image::Luma([120]));
        let p = FlowPyramid::build(&flat);
        let (_, status) = calc_optical_flow_pyr_lk(&p, &p, &[[64.0, 64.0]]);
        assert!(!status[0]);
    }

    #[test]
    fn zero_motion_stays_put() {
        let p = FlowPyramid::build(&textured(128, 0.0, 0.0));
        let (tracked, status) = bidirectional_flow(&p, &p, &[[64.0, 64.0]]);
        assert!(status[0]);
        assert!((tracked[0][0] - 64.0).abs() < 0.1);
        assert!((tracked[0][1] - 64.0).abs() < 0.1);
    }

    #[test]
    fn bidirectional_reports_forward_positions() {
        let a = FlowPyramid::build(&textured(128, 0.0, 0.0));
        let b = FlowPyramid::build(&textured(128, 4.0, 2.0));
        let pts = vec![[64.0, 64.0], [50.0, 40.0]];
        let (forward, _) = calc_optical_flow_pyr_lk(&a, &b, &pts);
        let (both, status) = bidirectional_flow(&a, &b, &pts);
        assert_eq!(forward, both);
        assert!(status.iter().all(|&s| s));
    }
}
