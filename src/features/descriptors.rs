//! Descriptor extraction: steered binary point-pair tests (Hamming
//! matching) and gradient-orientation histograms (L2 matching).

use image::GrayImage;
use rand::prelude::*;
use std::sync::OnceLock;

use crate::imgproc::Plane;

/// Number of point-pair tests in the binary descriptor (32 bytes).
pub const BINARY_BITS: usize = 256;
/// Binary descriptor width in bytes.
pub const BINARY_BYTES: usize = BINARY_BITS / 8;
/// Float descriptor dimensionality: 4×4 cells × 8 orientation bins.
pub const FLOAT_DIMS: usize = 128;

const PATCH_RADIUS: f32 = 13.0;

/// Fixed point-pair pattern, generated once from a constant seed so
/// descriptors are stable across runs and database reloads.
fn brief_pattern() -> &'static [[f32; 4]; BINARY_BITS] {
    static PATTERN: OnceLock<[[f32; 4]; BINARY_BITS]> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(0x5f3759df);
        let mut pairs = [[0.0f32; 4]; BINARY_BITS];
        for pair in &mut pairs {
            for v in pair.iter_mut() {
                *v = rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS);
            }
        }
        pairs
    })
}

/// Steered 256-bit binary descriptor around `(x, y)` (level coordinates),
/// pattern rotated by the keypoint orientation.
pub fn describe_binary(plane: &Plane, x: f32, y: f32, angle: f32) -> [u8; BINARY_BYTES] {
    let (sin, cos) = angle.sin_cos();
    let mut out = [0u8; BINARY_BYTES];
    for (bit, pair) in brief_pattern().iter().enumerate() {
        let [ax, ay, bx, by] = *pair;
        let pa = plane.sample_clamped(x + cos * ax - sin * ay, y + sin * ax + cos * ay);
        let pb = plane.sample_clamped(x + cos * bx - sin * by, y + sin * bx + cos * by);
        if pa < pb {
            out[bit / 8] |= 1 << (bit % 8);
        }
    }
    out
}

/// Gradient-orientation histogram descriptor: a 16×16 patch (rotated to
/// the keypoint orientation) split into 4×4 cells of 8 orientation bins,
/// Gaussian-weighted, L2-normalized with a 0.2 clamp-and-renormalize.
pub fn describe_float(plane: &Plane, x: f32, y: f32, angle: f32) -> [f32; FLOAT_DIMS] {
    const HALF: i32 = 8;
    let (sin, cos) = angle.sin_cos();
    let mut hist = [0.0f32; FLOAT_DIMS];

    // Sample an 18×18 rotated grid once so gradients come from central
    // differences in the rotated frame.
    let mut patch = [[0.0f32; 18]; 18];
    for (row, prow) in patch.iter_mut().enumerate() {
        for (col, pv) in prow.iter_mut().enumerate() {
            let u = col as f32 - 8.5;
            let v = row as f32 - 8.5;
            *pv = plane.sample_clamped(x + cos * u - sin * v, y + sin * u + cos * v);
        }
    }

    for row in 0..16 {
        for col in 0..16 {
            let gx = patch[row + 1][col + 2] - patch[row + 1][col];
            let gy = patch[row + 2][col + 1] - patch[row][col + 1];
            let mag = (gx * gx + gy * gy).sqrt();
            if mag < 1e-6 {
                continue;
            }
            let theta = gy.atan2(gx);

            let du = col as f32 - 7.5;
            let dv = row as f32 - 7.5;
            let weight = (-(du * du + dv * dv) / (2.0 * (HALF as f32).powi(2))).exp();

            let cell = (row / 4) * 4 + col / 4;
            let mut bin_f = theta * (8.0 / std::f32::consts::TAU);
            if bin_f < 0.0 {
                bin_f += 8.0;
            }
            let b0 = bin_f.floor() as usize % 8;
            let b1 = (b0 + 1) % 8;
            let frac = bin_f - bin_f.floor();
            hist[cell * 8 + b0] += mag * weight * (1.0 - frac);
            hist[cell * 8 + b1] += mag * weight * frac;
        }
    }

    l2_normalize(&mut hist);
    for v in &mut hist {
        *v = v.min(0.2);
    }
    l2_normalize(&mut hist);
    hist
}

fn l2_normalize(v: &mut [f32; FLOAT_DIMS]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[inline]
pub fn hamming_distance(a: &[u8; BINARY_BYTES], b: &[u8; BINARY_BYTES]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[inline]
pub fn l2_distance(a: &[f32; FLOAT_DIMS], b: &[f32; FLOAT_DIMS]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

pub(crate) fn plane_of(img: &GrayImage) -> Plane {
    Plane::from_gray(img)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textured(size: u32, shift: f32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            let v = 128.0
                + 60.0 * ((x as f32 + shift) * 0.35).sin()
                + 50.0 * ((y as f32 - shift) * 0.28).cos();
            image::Luma([v.clamp(0.0, 255.0) as u8])
        })
    }

    #[test]
    fn binary_descriptor_is_deterministic() {
        let p = plane_of(&textured(64, 0.0));
        let a = describe_binary(&p, 32.0, 32.0, 0.3);
        let b = describe_binary(&p, 32.0, 32.0, 0.3);
        assert_eq!(a, b);
    }

    #[test]
    fn same_patch_matches_closer_than_distant_patch() {
        let p = plane_of(&textured(96, 0.0));
        let q = plane_of(&textured(96, 0.4));
        let here = describe_binary(&p, 48.0, 48.0, 0.0);
        let same = describe_binary(&q, 48.0, 48.0, 0.0);
        let elsewhere = describe_binary(&p, 70.0, 25.0, 0.0);
        assert!(hamming_distance(&here, &same) < hamming_distance(&here, &elsewhere));
    }

    #[test]
    fn float_descriptor_is_unit_norm() {
        let p = plane_of(&textured(64, 0.0));
        let d = describe_float(&p, 32.0, 32.0, 0.0);
        let norm: f32 = d.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "norm {norm}");
    }

    #[test]
    fn float_descriptor_separates_patches() {
        let p = plane_of(&textured(96, 0.0));
        let q = plane_of(&textured(96, 0.4));
        let here = describe_float(&p, 48.0, 48.0, 0.0);
        let same = describe_float(&q, 48.0, 48.0, 0.0);
        let elsewhere = describe_float(&p, 70.0, 25.0, 0.0);
        assert!(l2_distance(&here, &same) < l2_distance(&here, &elsewhere));
    }
}
