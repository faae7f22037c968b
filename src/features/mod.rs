//! Keypoint detection, description, and matching.
//!
//! Two interchangeable detector kinds share one multi-scale FAST
//! front-end and differ in extraction parameters, descriptor payload,
//! and matching metric: [`DetectorKind::Blob`] produces float
//! gradient-histogram descriptors compared with L2,
//! [`DetectorKind::Binary`] produces steered binary descriptors compared
//! with Hamming distance.

mod descriptors;
mod fast;

use image::GrayImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::imgproc::resize_bilinear;

pub use descriptors::{BINARY_BYTES, FLOAT_DIMS};

/// Detector variant. The discriminants are the on-disk `featureType`
/// encoding of the trackable database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorKind {
    /// Float descriptors, L2 metric.
    Blob = 0,
    /// Binary descriptors, Hamming metric.
    Binary = 1,
}

impl DetectorKind {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Blob),
            1 => Some(Self::Binary),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// A detected keypoint in the coordinates of the image it was found in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Support region diameter in pixels.
    pub size: f32,
    /// Orientation in radians.
    pub angle: f32,
    pub response: f32,
    /// Scale-pyramid level the keypoint was found at.
    pub octave: i32,
}

/// Descriptor matrix; the variant matches the detector kind that
/// produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptors {
    Binary(Vec<[u8; BINARY_BYTES]>),
    Float(Vec<[f32; FLOAT_DIMS]>),
}

impl Descriptors {
    pub fn len(&self) -> usize {
        match self {
            Self::Binary(rows) => rows.len(),
            Self::Float(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> DetectorKind {
        match self {
            Self::Binary(_) => DetectorKind::Binary,
            Self::Float(_) => DetectorKind::Blob,
        }
    }
}

/// One nearest-neighbour candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DMatch {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: f32,
}

/// The two nearest train candidates for a query descriptor, feeding the
/// downstream ratio test.
#[derive(Debug, Clone, Copy)]
pub struct MatchPair {
    pub best: DMatch,
    pub second: DMatch,
}

#[derive(Debug, Clone, Copy)]
struct KindParams {
    fast_threshold: u8,
    n_levels: usize,
    level_scale: f32,
    max_keypoints: usize,
}

impl KindParams {
    fn of(kind: DetectorKind) -> Self {
        match kind {
            DetectorKind::Binary => Self {
                fast_threshold: 20,
                n_levels: 8,
                level_scale: 1.2,
                max_keypoints: 500,
            },
            DetectorKind::Blob => Self {
                fast_threshold: 12,
                n_levels: 6,
                level_scale: 1.3,
                max_keypoints: 500,
            },
        }
    }
}

/// Keypoint detector + descriptor extractor + matcher, parameterized by
/// [`DetectorKind`].
#[derive(Debug, Clone)]
pub struct FeatureDetector {
    kind: DetectorKind,
}

/// Border (in level pixels) keeping descriptor patches inside the image.
const DETECT_BORDER: u32 = 16;
const HARRIS_K: f32 = 0.04;
const ORIENTATION_RADIUS: i32 = 7;
const MIN_LEVEL_DIM: u32 = 48;

impl FeatureDetector {
    pub fn new(kind: DetectorKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> DetectorKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: DetectorKind) {
        self.kind = kind;
    }

    /// Detect keypoints over the scale pyramid. Where `mask` is zero
    /// (base-image coordinates), keypoints are suppressed.
    pub fn detect(&self, image: &GrayImage, mask: Option<&GrayImage>) -> Vec<Keypoint> {
        let params = KindParams::of(self.kind);
        let levels = self.build_levels(image, &params);

        let mut keypoints: Vec<Keypoint> = Vec::new();
        for (octave, level) in levels.iter().enumerate() {
            let scale_x = image.width() as f32 / level.width() as f32;
            let scale_y = image.height() as f32 / level.height() as f32;
            for corner in fast::detect_fast(level, params.fast_threshold, DETECT_BORDER) {
                let response = fast::harris_score_at(level, corner.x, corner.y, HARRIS_K);
                if response <= 0.0 {
                    continue;
                }
                let angle = fast::orientation_at(level, corner.x, corner.y, ORIENTATION_RADIUS);
                keypoints.push(Keypoint {
                    x: corner.x as f32 * scale_x,
                    y: corner.y as f32 * scale_y,
                    size: 31.0 * scale_x,
                    angle,
                    response,
                    octave: octave as i32,
                });
            }
        }

        if let Some(mask) = mask {
            keypoints.retain(|kp| {
                let x = (kp.x.round() as u32).min(mask.width() - 1);
                let y = (kp.y.round() as u32).min(mask.height() - 1);
                mask.get_pixel(x, y).0[0] != 0
            });
        }

        keypoints
            .sort_by(|a, b| b.response.partial_cmp(&a.response).unwrap_or(std::cmp::Ordering::Equal));
        keypoints.truncate(params.max_keypoints);
        keypoints
    }

    /// Compute one descriptor per keypoint, in keypoint order.
    pub fn describe(&self, image: &GrayImage, keypoints: &[Keypoint]) -> Descriptors {
        let params = KindParams::of(self.kind);
        let levels = self.build_levels(image, &params);
        let planes: Vec<crate::imgproc::Plane> =
            levels.iter().map(descriptors::plane_of).collect();
        let scales: Vec<(f32, f32)> = levels
            .iter()
            .map(|l| {
                (
                    image.width() as f32 / l.width() as f32,
                    image.height() as f32 / l.height() as f32,
                )
            })
            .collect();

        let locate = |kp: &Keypoint| {
            let octave = (kp.octave.max(0) as usize).min(planes.len() - 1);
            let (sx, sy) = scales[octave];
            (octave, kp.x / sx, kp.y / sy)
        };

        match self.kind {
            DetectorKind::Binary => Descriptors::Binary(
                keypoints
                    .par_iter()
                    .map(|kp| {
                        let (octave, x, y) = locate(kp);
                        descriptors::describe_binary(&planes[octave], x, y, kp.angle)
                    })
                    .collect(),
            ),
            DetectorKind::Blob => Descriptors::Float(
                keypoints
                    .par_iter()
                    .map(|kp| {
                        let (octave, x, y) = locate(kp);
                        descriptors::describe_float(&planes[octave], x, y, kp.angle)
                    })
                    .collect(),
            ),
        }
    }

    fn build_levels(&self, image: &GrayImage, params: &KindParams) -> Vec<GrayImage> {
        let mut levels = vec![image.clone()];
        for i in 1..params.n_levels {
            let s = params.level_scale.powi(i as i32);
            let w = (image.width() as f32 / s).round() as u32;
            let h = (image.height() as f32 / s).round() as u32;
            if w < MIN_LEVEL_DIM || h < MIN_LEVEL_DIM {
                break;
            }
            levels.push(resize_bilinear(image, w, h));
        }
        levels
    }
}

/// For each query descriptor, yield its two nearest neighbours in the
/// train set. Lazy: distances for a query are computed when its pair is
/// pulled. Mixed-kind inputs and train sets smaller than two yield
/// nothing.
pub fn knn_match2<'a>(
    query: &'a Descriptors,
    train: &'a Descriptors,
) -> impl Iterator<Item = MatchPair> + 'a {
    let compatible = query.kind() == train.kind() && train.len() >= 2;
    let n = if compatible { query.len() } else { 0 };
    (0..n).map(move |qi| {
        let mut best = DMatch {
            query_idx: qi,
            train_idx: 0,
            distance: f32::MAX,
        };
        let mut second = best;
        let mut consider = |ti: usize, d: f32| {
            if d < best.distance {
                second = best;
                best = DMatch {
                    query_idx: qi,
                    train_idx: ti,
                    distance: d,
                };
            } else if d < second.distance {
                second = DMatch {
                    query_idx: qi,
                    train_idx: ti,
                    distance: d,
                };
            }
        };
        match (query, train) {
            (Descriptors::Binary(qs), Descriptors::Binary(ts)) => {
                for (ti, t) in ts.iter().enumerate() {
                    consider(ti, descriptors::hamming_distance(&qs[qi], t) as f32);
                }
            }
            (Descriptors::Float(qs), Descriptors::Float(ts)) => {
                for (ti, t) in ts.iter().enumerate() {
                    consider(ti, descriptors::l2_distance(&qs[qi], t));
                }
            }
            _ => unreachable!("kind compatibility checked above"),
        }
        MatchPair { best, second }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textured(size: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            let v = 128.0
                + 55.0 * (x as f32 * 0.31).sin() * (y as f32 * 0.17).cos()
                + 45.0 * ((x as f32 * 0.07 + y as f32 * 0.23).sin());
            image::Luma([v.clamp(0.0, 255.0) as u8])
        })
    }

    #[test]
    fn descriptor_count_matches_keypoint_count() {
        for kind in [DetectorKind::Binary, DetectorKind::Blob] {
            let det = FeatureDetector::new(kind);
            let img = textured(200);
            let kps = det.detect(&img, None);
            assert!(!kps.is_empty());
            let descs = det.describe(&img, &kps);
            assert_eq!(descs.len(), kps.len());
            assert_eq!(descs.kind(), kind);
        }
    }

    #[test]
    fn mask_suppresses_keypoints() {
        let det = FeatureDetector::new(DetectorKind::Binary);
        let img = textured(200);

        // Zero out the left half.
        let mask = GrayImage::from_fn(200, 200, |x, _| {
            image::Luma(if x < 100 { [0] } else { [1] })
        });
        let kps = det.detect(&img, Some(&mask));
        assert!(!kps.is_empty());
        assert!(kps.iter().all(|kp| kp.x >= 99.0));
    }

    #[test]
    fn self_matching_is_near_perfect() {
        let det = FeatureDetector::new(DetectorKind::Binary);
        let img = textured(200);
        let kps = det.detect(&img, None);
        let descs = det.describe(&img, &kps);

        let mut exact = 0usize;
        let mut total = 0usize;
        for pair in knn_match2(&descs, &descs) {
            total += 1;
            if pair.best.train_idx == pair.best.query_idx && pair.best.distance == 0.0 {
                exact += 1;
            }
        }
        assert!(total > 0);
        assert!(exact * 10 >= total * 9, "{exact}/{total} self-matches");
    }

    #[test]
    fn mismatched_kinds_yield_no_pairs() {
        let a = Descriptors::Binary(vec![[0u8; BINARY_BYTES]; 4]);
        let b = Descriptors::Float(vec![[0f32; FLOAT_DIMS]; 4]);
        assert_eq!(knn_match2(&a, &b).count(), 0);
    }

    #[test]
    fn tiny_train_set_yields_no_pairs() {
        let a = Descriptors::Binary(vec![[1u8; BINARY_BYTES]; 4]);
        let b = Descriptors::Binary(vec![[1u8; BINARY_BYTES]; 1]);
        assert_eq!(knn_match2(&a, &b).count(), 0);
    }

    #[test]
    fn keypoints_are_ranked_by_response() {
        let det = FeatureDetector::new(DetectorKind::Binary);
        let kps = det.detect(&textured(200), None);
        for w in kps.windows(2) {
            assert!(w[0].response >= w[1].response);
        }
    }
}
