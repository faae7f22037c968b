//! Harris corner detection for template anchor selection.
//!
//! Corners feed the per-level tracking point selectors: they must be
//! well-separated, away from the image border, and ordered so the
//! strongest responses win when a cap applies.

use image::GrayImage;

use crate::imgproc::Plane;

/// Harris detector tuning.
#[derive(Debug, Clone)]
pub struct HarrisConfig {
    /// Corner-vs-edge sensitivity in the response `det − k·tr²`.
    pub k: f32,
    /// Acceptance threshold as a fraction of the strongest response.
    pub quality_level: f32,
    /// Corners within this many pixels of the border are ignored.
    pub border: u32,
    /// Maximum number of corners returned; `<= 0` means no cap.
    pub max_corners: i32,
}

impl Default for HarrisConfig {
    fn default() -> Self {
        Self {
            k: 0.04,
            quality_level: 0.01,
            border: 10,
            max_corners: 200,
        }
    }
}

/// Harris corner detector over a grayscale image.
#[derive(Debug, Clone, Default)]
pub struct HarrisCornerDetector {
    pub config: HarrisConfig,
}

impl HarrisCornerDetector {
    pub fn new(config: HarrisConfig) -> Self {
        Self { config }
    }

    /// Detect corners, strongest first, at sub-pixel precision.
    pub fn find_corners(&self, img: &GrayImage) -> Vec<[f32; 2]> {
        let w = img.width() as usize;
        let h = img.height() as usize;
        let border = (self.config.border as usize).max(2);
        if w <= 2 * border || h <= 2 * border {
            return Vec::new();
        }

        let response = self.corner_response(img);

        let mut max_response = 0.0f32;
        for &r in &response.data {
            max_response = max_response.max(r);
        }
        if max_response <= 0.0 {
            return Vec::new();
        }
        let threshold = self.config.quality_level * max_response;

        // Threshold + 3×3 non-maximum suppression inside the border.
        let mut corners: Vec<(f32, [f32; 2])> = Vec::new();
        for y in border..h - border {
            for x in border..w - border {
                let r = response.get(x, y);
                if r <= threshold {
                    continue;
                }
                let mut is_max = true;
                'nms: for dy in -1i32..=1 {
                    for dx in -1i32..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let nv =
                            response.get((x as i32 + dx) as usize, (y as i32 + dy) as usize);
                        if nv > r {
                            is_max = false;
                            break 'nms;
                        }
                    }
                }
                if is_max {
                    corners.push((r, refine_subpixel(&response, x, y)));
                }
            }
        }

        corners.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        if self.config.max_corners > 0 {
            corners.truncate(self.config.max_corners as usize);
        }
        corners.into_iter().map(|(_, p)| p).collect()
    }

    /// Harris response map: Sobel gradients, 3×3-windowed structure
    /// tensor, `det(M) − k·trace(M)²`.
    fn corner_response(&self, img: &GrayImage) -> Plane {
        let w = img.width() as usize;
        let h = img.height() as usize;
        let src = Plane::from_gray(img);

        let mut ixx = Plane::zeros(w, h);
        let mut iyy = Plane::zeros(w, h);
        let mut ixy = Plane::zeros(w, h);
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let gx = src.get(x + 1, y - 1) - src.get(x - 1, y - 1)
                    + 2.0 * (src.get(x + 1, y) - src.get(x - 1, y))
                    + src.get(x + 1, y + 1) - src.get(x - 1, y + 1);
                let gy = src.get(x - 1, y + 1) - src.get(x - 1, y - 1)
                    + 2.0 * (src.get(x, y + 1) - src.get(x, y - 1))
                    + src.get(x + 1, y + 1) - src.get(x + 1, y - 1);
                let i = y * w + x;
                ixx.data[i] = gx * gx;
                iyy.data[i] = gy * gy;
                ixy.data[i] = gx * gy;
            }
        }

        let mut response = Plane::zeros(w, h);
        for y in 2..h - 2 {
            for x in 2..w - 2 {
                let mut a = 0.0f32;
                let mut b = 0.0f32;
                let mut c = 0.0f32;
                for dy in -1i32..=1 {
                    for dx in -1i32..=1 {
                        let i = (y as i32 + dy) as usize * w + (x as i32 + dx) as usize;
                        a += ixx.data[i];
                        b += iyy.data[i];
                        c += ixy.data[i];
                    }
                }
                let det = a * b - c * c;
                let trace = a + b;
                response.data[y * w + x] = det - self.config.k * trace * trace;
            }
        }
        response
    }
}

/// Quadratic peak interpolation of the response surface around an
/// integer maximum.
fn refine_subpixel(response: &Plane, x: usize, y: usize) -> [f32; 2] {
    let center = response.get(x, y);
    let dx = parabola_offset(response.get(x - 1, y), center, response.get(x + 1, y));
    let dy = parabola_offset(response.get(x, y - 1), center, response.get(x, y + 1));
    [x as f32 + dx, y as f32 + dy]
}

#[inline]
fn parabola_offset(left: f32, center: f32, right: f32) -> f32 {
    let denom = left - 2.0 * center + right;
    if denom.abs() < 1e-12 {
        return 0.0;
    }
    (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
}
