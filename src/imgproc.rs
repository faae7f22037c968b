//! Image-plane primitives shared by the tracking pipeline.
//!
//! Everything here operates on [`image::GrayImage`] buffers or on the
//! float planes derived from them: pyramid downsampling, perspective
//! warping, normalized template correlation, polygon rasterization for
//! feature masks, and the integer rectangle arithmetic the template
//! matcher leans on.

use image::GrayImage;
use nalgebra::{Matrix3, Vector3};

/// Axis-aligned integer rectangle (`x`, `y` top-left corner).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle covering a full image.
    pub fn of_image(img: &GrayImage) -> Self {
        Self::new(0, 0, img.width() as i32, img.height() as i32)
    }

    /// Minimal integer rectangle containing all `points`.
    pub fn bounding(points: &[[f64; 2]]) -> Self {
        let mut min_x = f64::MAX;
        let mut min_y = f64::MAX;
        let mut max_x = f64::MIN;
        let mut max_y = f64::MIN;
        for p in points {
            min_x = min_x.min(p[0]);
            min_y = min_y.min(p[1]);
            max_x = max_x.max(p[0]);
            max_y = max_y.max(p[1]);
        }
        let x = min_x.floor() as i32;
        let y = min_y.floor() as i32;
        Self::new(x, y, max_x.ceil() as i32 - x, max_y.ceil() as i32 - y)
    }

    pub fn area(&self) -> i64 {
        if self.width <= 0 || self.height <= 0 {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    /// Grow the rectangle by `amount` pixels on every side.
    pub fn inflate(&self, amount: i32) -> Self {
        Self::new(
            self.x - amount,
            self.y - amount,
            self.width + 2 * amount,
            self.height + 2 * amount,
        )
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.width).min(other.x + other.width);
        let y1 = (self.y + self.height).min(other.y + other.height);
        Rect::new(x0, y0, (x1 - x0).max(0), (y1 - y0).max(0))
    }

    /// `true` when `inner` lies entirely within `self`.
    pub fn contains_rect(&self, inner: &Rect) -> bool {
        self.intersect(inner) == *inner
    }

    /// The four corners, clockwise from the top-left.
    pub fn corners(&self) -> [[f64; 2]; 4] {
        let (x, y) = (self.x as f64, self.y as f64);
        let (w, h) = (self.width as f64, self.height as f64);
        [[x, y], [x + w, y], [x + w, y + h], [x, y + h]]
    }
}

/// Single-channel float plane. Intermediate representation for gradient
/// images and correlation surfaces.
#[derive(Debug, Clone)]
pub struct Plane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl Plane {
    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    pub fn from_gray(img: &GrayImage) -> Self {
        Self {
            width: img.width() as usize,
            height: img.height() as usize,
            data: img.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }

    /// Crop of a grayscale image converted to float. `rect` must be inside
    /// the image.
    pub fn from_gray_rect(img: &GrayImage, rect: &Rect) -> Self {
        let mut data = Vec::with_capacity((rect.width * rect.height) as usize);
        let raw = img.as_raw();
        let stride = img.width() as usize;
        for row in rect.y..rect.y + rect.height {
            let start = row as usize * stride + rect.x as usize;
            data.extend(
                raw[start..start + rect.width as usize]
                    .iter()
                    .map(|&v| v as f32),
            );
        }
        Self {
            width: rect.width as usize,
            height: rect.height as usize,
            data,
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Bilinear sample with coordinates clamped to the plane borders.
    #[inline]
    pub fn sample_clamped(&self, x: f32, y: f32) -> f32 {
        let xf = x.clamp(0.0, (self.width - 1) as f32);
        let yf = y.clamp(0.0, (self.height - 1) as f32);
        let x0 = xf.floor() as usize;
        let y0 = yf.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let ax = xf - x0 as f32;
        let ay = yf - y0 as f32;
        let i00 = self.get(x0, y0);
        let i10 = self.get(x1, y0);
        let i01 = self.get(x0, y1);
        let i11 = self.get(x1, y1);
        (1.0 - ax) * (1.0 - ay) * i00 + ax * (1.0 - ay) * i10 + (1.0 - ax) * ay * i01 + ax * ay * i11
    }

    /// Linearly rescale values so the current min/max map to `lo`/`hi`.
    pub fn normalize_to_range(&self, lo: f32, hi: f32) -> Plane {
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for &v in &self.data {
            min = min.min(v);
            max = max.max(v);
        }
        let span = max - min;
        let scale = if span > 0.0 { (hi - lo) / span } else { 0.0 };
        Plane {
            width: self.width,
            height: self.height,
            data: self.data.iter().map(|&v| lo + (v - min) * scale).collect(),
        }
    }

    pub fn min_and_max(&self) -> (f32, f32) {
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for &v in &self.data {
            min = min.min(v);
            max = max.max(v);
        }
        (min, max)
    }
}

#[inline]
fn reflect101(i: i32, n: i32) -> i32 {
    // Border handling for the pyramid blur: ...cba|abcd|cba...
    let mut i = i;
    if i < 0 {
        i = -i;
    }
    if i >= n {
        i = 2 * n - 2 - i;
    }
    i.clamp(0, n - 1)
}

/// Halve an image: 5-tap Gaussian blur followed by even-pixel decimation.
/// The output dimensions follow the `(n + 1) / 2` convention.
pub fn pyr_down(src: &GrayImage) -> GrayImage {
    const KERNEL: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];
    let w = src.width() as i32;
    let h = src.height() as i32;
    let out_w = (src.width() + 1) / 2;
    let out_h = (src.height() + 1) / 2;
    let raw = src.as_raw();

    // Horizontal pass at full height, sampled only at even columns.
    let mut tmp = vec![0.0f32; out_w as usize * h as usize];
    for y in 0..h {
        let row = y as usize * w as usize;
        for ox in 0..out_w as i32 {
            let cx = 2 * ox;
            let mut acc = 0.0f32;
            for (k, coef) in KERNEL.iter().enumerate() {
                let sx = reflect101(cx + k as i32 - 2, w);
                acc += coef * raw[row + sx as usize] as f32;
            }
            tmp[y as usize * out_w as usize + ox as usize] = acc;
        }
    }

    // Vertical pass, sampled at even rows.
    let mut out_raw = vec![0u8; out_w as usize * out_h as usize];
    for oy in 0..out_h as i32 {
        let cy = 2 * oy;
        for ox in 0..out_w as usize {
            let mut acc = 0.0f32;
            for (k, coef) in KERNEL.iter().enumerate() {
                let sy = reflect101(cy + k as i32 - 2, h);
                acc += coef * tmp[sy as usize * out_w as usize + ox];
            }
            out_raw[oy as usize * out_w as usize + ox] = acc.round().clamp(0.0, 255.0) as u8;
        }
    }
    GrayImage::from_raw(out_w, out_h, out_raw).expect("buffer sized to dimensions")
}

/// Resize with bilinear interpolation. Used by the multi-scale feature
/// detector, where level ratios are not powers of two.
pub fn resize_bilinear(src: &GrayImage, out_w: u32, out_h: u32) -> GrayImage {
    let plane = Plane::from_gray(src);
    let mut out = GrayImage::new(out_w, out_h);
    let sx = src.width() as f32 / out_w as f32;
    let sy = src.height() as f32 / out_h as f32;
    for y in 0..out_h {
        for x in 0..out_w {
            let v = plane.sample_clamped((x as f32 + 0.5) * sx - 0.5, (y as f32 + 0.5) * sy - 0.5);
            out.put_pixel(x, y, image::Luma([v.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

/// Project a 2D point through a 3×3 homography.
pub fn perspective_transform(h: &Matrix3<f64>, p: [f64; 2]) -> [f64; 2] {
    let q = h * Vector3::new(p[0], p[1], 1.0);
    if q[2].abs() < 1e-15 {
        return [f64::NAN, f64::NAN];
    }
    [q[0] / q[2], q[1] / q[2]]
}

/// Project a set of points through a homography.
pub fn perspective_transform_all(h: &Matrix3<f64>, pts: &[[f64; 2]]) -> Vec<[f64; 2]> {
    pts.iter().map(|&p| perspective_transform(h, p)).collect()
}

/// Warp `src` through `h` (mapping source → destination coordinates)
/// into an `out_w` × `out_h` image. Pixels mapping outside the source
/// read as black.
pub fn warp_perspective(src: &GrayImage, h: &Matrix3<f64>, out_w: u32, out_h: u32) -> GrayImage {
    let mut out = GrayImage::new(out_w, out_h);
    let Some(h_inv) = h.try_inverse() else {
        return out;
    };
    let plane = Plane::from_gray(src);
    let (sw, sh) = (src.width() as f64, src.height() as f64);
    for y in 0..out_h {
        for x in 0..out_w {
            let p = perspective_transform(&h_inv, [x as f64, y as f64]);
            if p[0].is_finite() && p[0] > -1.0 && p[0] < sw && p[1] > -1.0 && p[1] < sh {
                let v = plane.sample_clamped(p[0] as f32, p[1] as f32);
                out.put_pixel(x, y, image::Luma([v.round().clamp(0.0, 255.0) as u8]));
            }
        }
    }
    out
}

/// Normalized squared-difference template correlation.
///
/// Returns the score surface minimum and its location, or `None` when
/// the template does not fit inside the search image. Scores are in
/// `[0, 1]`-ish range with 0 a perfect match, matching the SQDIFF_NORMED
/// convention.
pub fn match_template_sqdiff_normed(search: &Plane, templ: &Plane) -> Option<(f32, (u32, u32))> {
    if search.width < templ.width || search.height < templ.height {
        return None;
    }
    let res_w = search.width - templ.width + 1;
    let res_h = search.height - templ.height + 1;

    let templ_sq: f64 = templ.data.iter().map(|&t| (t as f64) * (t as f64)).sum();

    let mut best = f32::MAX;
    let mut best_loc = (0u32, 0u32);
    for oy in 0..res_h {
        for ox in 0..res_w {
            let mut sq_diff = 0.0f64;
            let mut search_sq = 0.0f64;
            for ty in 0..templ.height {
                let srow = (oy + ty) * search.width + ox;
                let trow = ty * templ.width;
                for tx in 0..templ.width {
                    let s = search.data[srow + tx] as f64;
                    let t = templ.data[trow + tx] as f64;
                    let d = s - t;
                    sq_diff += d * d;
                    search_sq += s * s;
                }
            }
            let denom = (templ_sq * search_sq).sqrt();
            let score = if denom > 1e-12 {
                (sq_diff / denom) as f32
            } else {
                1.0
            };
            if score < best {
                best = score;
                best_loc = (ox as u32, oy as u32);
            }
        }
    }
    Some((best, best_loc))
}

/// Even-odd test; points on an edge are not considered inside.
pub fn polygon_contains(poly: &[[f64; 2]], p: [f64; 2]) -> bool {
    let n = poly.len();
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (poly[i][0], poly[i][1]);
        let (xj, yj) = (poly[j][0], poly[j][1]);
        if (yi > p[1]) != (yj > p[1]) {
            let x_cross = (xj - xi) * (p[1] - yi) / (yj - yi) + xi;
            if p[0] < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Rasterize a filled polygon into `mask` with `value`, scanline by
/// scanline. Used to black out already-detected trackables before
/// feature detection.
pub fn fill_polygon(mask: &mut GrayImage, poly: &[[f64; 2]], value: u8) {
    let h = mask.height() as i32;
    let w = mask.width() as i32;
    let y_min = poly
        .iter()
        .map(|p| p[1])
        .fold(f64::MAX, f64::min)
        .floor()
        .max(0.0) as i32;
    let y_max = poly
        .iter()
        .map(|p| p[1])
        .fold(f64::MIN, f64::max)
        .ceil()
        .min((h - 1) as f64) as i32;

    let n = poly.len();
    let mut crossings: Vec<f64> = Vec::with_capacity(n);
    for y in y_min..=y_max {
        let yc = y as f64 + 0.5;
        crossings.clear();
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = (poly[i][0], poly[i][1]);
            let (xj, yj) = (poly[j][0], poly[j][1]);
            if (yi > yc) != (yj > yc) {
                crossings.push((xj - xi) * (yc - yi) / (yj - yi) + xi);
            }
            j = i;
        }
        crossings.sort_by(|a, b| a.total_cmp(b));
        for pair in crossings.chunks(2) {
            if let [x0, x1] = pair {
                let a = x0.floor().max(0.0) as i32;
                let b = x1.ceil().min((w - 1) as f64) as i32;
                for x in a..=b {
                    mask.put_pixel(x as u32, y as u32, image::Luma([value]));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| image::Luma([((x * 2 + y) % 256) as u8]))
    }

    #[test]
    fn pyr_down_uses_half_up_convention() {
        let img = gradient_image(11, 7);
        let down = pyr_down(&img);
        assert_eq!(down.width(), 6);
        assert_eq!(down.height(), 4);
    }

    #[test]
    fn pyr_down_preserves_constant_image() {
        let img = GrayImage::from_pixel(16, 16, image::Luma([100]));
        let down = pyr_down(&img);
        assert!(down.pixels().all(|p| p.0[0] == 100));
    }

    #[test]
    fn rect_intersection_and_containment() {
        let frame = Rect::new(0, 0, 100, 80);
        let inside = Rect::new(10, 10, 20, 20);
        let escaping = Rect::new(90, 70, 20, 20);
        assert!(frame.contains_rect(&inside));
        assert!(!frame.contains_rect(&escaping));
        assert_eq!(frame.intersect(&escaping), Rect::new(90, 70, 10, 10));
    }

    #[test]
    fn rect_inflate_grows_both_sides() {
        let r = Rect::new(5, 5, 10, 10).inflate(3);
        assert_eq!(r, Rect::new(2, 2, 16, 16));
    }

    #[test]
    fn identity_warp_is_lossless() {
        let img = gradient_image(20, 20);
        let out = warp_perspective(&img, &Matrix3::identity(), 20, 20);
        assert_eq!(img.as_raw(), out.as_raw());
    }

    #[test]
    fn template_match_finds_embedded_patch() {
        let img = gradient_image(40, 40);
        let patch_rect = Rect::new(12, 17, 9, 9);
        let patch = Plane::from_gray_rect(&img, &patch_rect);
        let search = Plane::from_gray(&img);
        let (score, (x, y)) = match_template_sqdiff_normed(&search, &patch).unwrap();
        assert!(score < 1e-6, "self-match score should be ~0, got {score}");
        assert_eq!((x, y), (12, 17));
    }

    #[test]
    fn template_match_rejects_oversized_template() {
        let img = gradient_image(8, 8);
        let templ = Plane::from_gray(&gradient_image(10, 10));
        assert!(match_template_sqdiff_normed(&Plane::from_gray(&img), &templ).is_none());
    }

    #[test]
    fn polygon_test_is_strict() {
        let quad = [[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]];
        assert!(polygon_contains(&quad, [5.0, 5.0]));
        assert!(!polygon_contains(&quad, [15.0, 5.0]));
        assert!(!polygon_contains(&quad, [-0.1, 5.0]));
    }

    #[test]
    fn fill_polygon_blacks_out_region() {
        let mut mask = GrayImage::from_pixel(20, 20, image::Luma([1]));
        fill_polygon(&mut mask, &[[4.0, 4.0], [15.0, 4.0], [15.0, 15.0], [4.0, 15.0]], 0);
        assert_eq!(mask.get_pixel(10, 10).0[0], 0);
        assert_eq!(mask.get_pixel(1, 1).0[0], 1);
        assert_eq!(mask.get_pixel(18, 18).0[0], 1);
    }

    #[test]
    fn normalize_matches_target_range() {
        let p = Plane {
            width: 3,
            height: 1,
            data: vec![10.0, 20.0, 30.0],
        };
        let n = p.normalize_to_range(100.0, 200.0);
        assert_eq!(n.data, vec![100.0, 150.0, 200.0]);
    }
}
