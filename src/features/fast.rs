//! FAST segment-test keypoints with Harris ranking and intensity-centroid
//! orientation.

use image::GrayImage;

/// Bresenham circle of radius 3 used by the segment test.
const CIRCLE: [(i32, i32); 16] = [
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

const ARC_LENGTH: usize = 9;

/// Raw FAST corner at integer coordinates with its segment score.
#[derive(Debug, Clone, Copy)]
pub struct FastCorner {
    pub x: u32,
    pub y: u32,
    pub score: f32,
}

#[inline]
fn pixel(raw: &[u8], stride: usize, x: i32, y: i32) -> i32 {
    raw[y as usize * stride + x as usize] as i32
}

/// FAST-9 detection with 3×3 non-maximum suppression on the segment
/// score. `border` additionally keeps corners clear of the edges so the
/// descriptor patch always fits.
pub fn detect_fast(img: &GrayImage, threshold: u8, border: u32) -> Vec<FastCorner> {
    let w = img.width() as i32;
    let h = img.height() as i32;
    let border = border.max(3) as i32;
    if w <= 2 * border || h <= 2 * border {
        return Vec::new();
    }
    let raw = img.as_raw();
    let stride = img.width() as usize;
    let t = threshold as i32;

    let mut scores = vec![0.0f32; (w * h) as usize];
    let mut candidates: Vec<(i32, i32)> = Vec::new();

    for y in border..h - border {
        for x in border..w - border {
            let p = pixel(raw, stride, x, y);
            let hi = p + t;
            let lo = p - t;

            // Cardinal short-circuit: a 9-long arc must include 3 of
            // the 4 compass points on the brighter or darker side.
            let mut n_hi = 0;
            let mut n_lo = 0;
            for &(dx, dy) in &[CIRCLE[0], CIRCLE[4], CIRCLE[8], CIRCLE[12]] {
                let v = pixel(raw, stride, x + dx, y + dy);
                if v > hi {
                    n_hi += 1;
                } else if v < lo {
                    n_lo += 1;
                }
            }
            if n_hi < 3 && n_lo < 3 {
                continue;
            }

            let vals: Vec<i32> = CIRCLE
                .iter()
                .map(|&(dx, dy)| pixel(raw, stride, x + dx, y + dy))
                .collect();

            if let Some(score) = segment_score(&vals, p, t) {
                scores[(y * w + x) as usize] = score;
                candidates.push((x, y));
            }
        }
    }

    let mut corners = Vec::with_capacity(candidates.len() / 2);
    'cand: for (x, y) in candidates {
        let s = scores[(y * w + x) as usize];
        for dy in -1i32..=1 {
            for dx in -1i32..=1 {
                if (dx != 0 || dy != 0) && scores[((y + dy) * w + x + dx) as usize] > s {
                    continue 'cand;
                }
            }
        }
        corners.push(FastCorner {
            x: x as u32,
            y: y as u32,
            score: s,
        });
    }
    corners
}

/// Score of the best contiguous arc of length ≥ 9 on either side of the
/// threshold band, or `None` when no such arc exists. The score is the
/// summed excess over the threshold, so stronger corners rank higher.
fn segment_score(vals: &[i32], p: i32, t: i32) -> Option<f32> {
    let mut best: Option<f32> = None;
    for brighter in [true, false] {
        let mut run = 0usize;
        let mut run_sum = 0i32;
        let mut best_here: Option<f32> = None;
        // Walk the circle twice to catch wrap-around arcs.
        for i in 0..CIRCLE.len() * 2 {
            let v = vals[i % CIRCLE.len()];
            let excess = if brighter { v - (p + t) } else { (p - t) - v };
            if excess > 0 {
                run += 1;
                run_sum += excess;
                if run >= ARC_LENGTH {
                    let s = run_sum as f32;
                    best_here = Some(best_here.map_or(s, |b: f32| b.max(s)));
                }
                if run >= CIRCLE.len() {
                    break;
                }
            } else {
                run = 0;
                run_sum = 0;
            }
        }
        if let Some(s) = best_here {
            best = Some(best.map_or(s, |b: f32| b.max(s)));
        }
    }
    best
}

/// Harris response at a single location, structure tensor over a 7×7
/// window of Sobel gradients. Used to re-rank FAST candidates.
pub fn harris_score_at(img: &GrayImage, x: u32, y: u32, k: f32) -> f32 {
    let w = img.width() as i32;
    let h = img.height() as i32;
    let (x, y) = (x as i32, y as i32);
    if x < 4 || y < 4 || x >= w - 4 || y >= h - 4 {
        return 0.0;
    }
    let raw = img.as_raw();
    let stride = img.width() as usize;

    let mut a = 0.0f32;
    let mut b = 0.0f32;
    let mut c = 0.0f32;
    for dy in -3i32..=3 {
        for dx in -3i32..=3 {
            let cx = x + dx;
            let cy = y + dy;
            let gx = (pixel(raw, stride, cx + 1, cy - 1) - pixel(raw, stride, cx - 1, cy - 1)
                + 2 * (pixel(raw, stride, cx + 1, cy) - pixel(raw, stride, cx - 1, cy))
                + pixel(raw, stride, cx + 1, cy + 1)
                - pixel(raw, stride, cx - 1, cy + 1)) as f32;
            let gy = (pixel(raw, stride, cx - 1, cy + 1) - pixel(raw, stride, cx - 1, cy - 1)
                + 2 * (pixel(raw, stride, cx, cy + 1) - pixel(raw, stride, cx, cy - 1))
                + pixel(raw, stride, cx + 1, cy + 1)
                - pixel(raw, stride, cx + 1, cy - 1)) as f32;
            a += gx * gx;
            b += gy * gy;
            c += gx * gy;
        }
    }
    let det = a * b - c * c;
    let trace = a + b;
    det - k * trace * trace
}

/// Intensity-centroid orientation over a disk around the keypoint.
pub fn orientation_at(img: &GrayImage, x: u32, y: u32, radius: i32) -> f32 {
    let w = img.width() as i32;
    let h = img.height() as i32;
    let (x, y) = (x as i32, y as i32);
    let raw = img.as_raw();
    let stride = img.width() as usize;

    let mut m10 = 0.0f32;
    let mut m01 = 0.0f32;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let cx = (x + dx).clamp(0, w - 1);
            let cy = (y + dy).clamp(0, h - 1);
            let v = pixel(raw, stride, cx, cy) as f32;
            m10 += dx as f32 * v;
            m01 += dy as f32 * v;
        }
    }
    m01.atan2(m10)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dark_square_on_light(size: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            if (20..44).contains(&x) && (20..44).contains(&y) {
                image::Luma([30])
            } else {
                image::Luma([220])
            }
        })
    }

    #[test]
    fn square_corners_are_detected() {
        let img = dark_square_on_light(64);
        let corners = detect_fast(&img, 20, 3);
        assert!(!corners.is_empty());
        // All detections cluster near the four square corners.
        for c in &corners {
            let near = [(20, 20), (43, 20), (20, 43), (43, 43)]
                .iter()
                .any(|&(cx, cy): &(i32, i32)| {
                    (c.x as i32 - cx).abs() <= 3 && (c.y as i32 - cy).abs() <= 3
                });
            assert!(near, "stray corner at ({}, {})", c.x, c.y);
        }
    }

    #[test]
    fn flat_image_has_no_corners() {
        let img = GrayImage::from_pixel(48, 48, image::Luma([127]));
        assert!(detect_fast(&img, 20, 3).is_empty());
    }

    #[test]
    fn orientation_points_at_mass() {
        // Bright mass strictly to the right of the center: orientation ~0.
        let img = GrayImage::from_fn(31, 31, |x, _| {
            image::Luma(if x > 15 { [250] } else { [5] })
        });
        let angle = orientation_at(&img, 15, 15, 7);
        assert!(angle.abs() < 0.2, "angle {angle}");
    }
}
