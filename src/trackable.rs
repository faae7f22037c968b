//! Per-reference-image tracking state.
//!
//! A [`Trackable`] bundles everything derived from one reference image:
//! the shared base image and its pyramid, detector output, Harris
//! template anchors per level, one selection state per level, and the
//! live geometry (homography, pose, bounding box, flags).

use std::sync::Arc;

use image::GrayImage;
use nalgebra::{Matrix3, Matrix3x4};

use crate::features::{Descriptors, FeatureDetector, Keypoint};
use crate::harris::HarrisCornerDetector;
use crate::imgproc::{perspective_transform_all, pyr_down};
use crate::selector::TrackingPointSelector;

/// Highest stored pyramid level for template matching (0 = base only).
pub const TEMPLATE_MAX_PYR_LEVEL: usize = 2;

/// A reference image plus all data the tracker derives from it.
#[derive(Debug, Clone)]
pub struct Trackable {
    pub id: i32,
    pub filename: String,
    /// Pixel → world-unit scale for pose output.
    pub scale: f32,
    /// The caller's base image buffer; held read-only for the life of
    /// the trackable.
    pub(crate) base_buffer: Arc<[u8]>,
    /// Pyramid; `images[0]` is the reference at native resolution.
    pub(crate) images: Vec<GrayImage>,
    pub(crate) feature_points: Vec<Keypoint>,
    pub(crate) descriptors: Descriptors,
    /// Harris corners per pyramid level, in level coordinates.
    pub(crate) corner_points: Vec<Vec<[f32; 2]>>,
    pub(crate) selectors: Vec<TrackingPointSelector>,
    /// Reference image corners: (0,0), (W,0), (W,H), (0,H).
    pub(crate) bbox: [[f64; 2]; 4],
    /// `bbox` under the current homography, in frame coordinates.
    pub(crate) bbox_transformed: [[f64; 2]; 4],
    /// Valid iff `is_detected`.
    pub(crate) homography: Matrix3<f64>,
    /// Valid iff `is_detected || is_tracking`.
    pub(crate) pose: Matrix3x4<f64>,
    pub(crate) is_detected: bool,
    pub(crate) is_tracking: bool,
    /// Forces a selector reseed before the next tracking pass.
    pub(crate) reset_tracks: bool,
    pub(crate) template_pyr_level: usize,
}

impl Trackable {
    /// Build a trackable from a caller-owned grayscale buffer. Returns
    /// `None` when the buffer does not match the stated dimensions.
    pub(crate) fn from_buffer(
        buffer: Arc<[u8]>,
        filename: &str,
        width: u32,
        height: u32,
        id: i32,
        scale: f32,
        detector: &FeatureDetector,
        harris: &HarrisCornerDetector,
    ) -> Option<Self> {
        if buffer.len() != (width * height) as usize {
            return None;
        }
        let base = GrayImage::from_raw(width, height, buffer.to_vec())?;
        let feature_points = detector.detect(&base, None);
        let descriptors = detector.describe(&base, &feature_points);
        Some(Self::assemble(
            buffer,
            base,
            filename,
            id,
            scale,
            feature_points,
            descriptors,
            None,
            harris,
        ))
    }

    /// Shared constructor: derives the pyramid, per-level corners (the
    /// base level's may be supplied, e.g. from a database), and the
    /// per-level selectors.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        base_buffer: Arc<[u8]>,
        base: GrayImage,
        filename: &str,
        id: i32,
        scale: f32,
        feature_points: Vec<Keypoint>,
        descriptors: Descriptors,
        base_corners: Option<Vec<[f32; 2]>>,
        harris: &HarrisCornerDetector,
    ) -> Self {
        let width = base.width();
        let height = base.height();

        let mut images = vec![base];
        for level in 1..=TEMPLATE_MAX_PYR_LEVEL {
            images.push(pyr_down(&images[level - 1]));
        }

        let mut corner_points = Vec::with_capacity(images.len());
        for (level, img) in images.iter().enumerate() {
            if level == 0 {
                match &base_corners {
                    Some(c) => corner_points.push(c.clone()),
                    None => corner_points.push(harris.find_corners(img)),
                }
            } else {
                corner_points.push(harris.find_corners(img));
            }
        }

        let selectors: Vec<TrackingPointSelector> = images
            .iter()
            .zip(&corner_points)
            .enumerate()
            .map(|(level, (img, corners))| {
                TrackingPointSelector::new(
                    corners.clone(),
                    img.width(),
                    img.height(),
                    width,
                    height,
                    id as u64 ^ ((level as u64) << 32),
                )
            })
            .collect();

        let bbox = [
            [0.0, 0.0],
            [width as f64, 0.0],
            [width as f64, height as f64],
            [0.0, height as f64],
        ];

        Self {
            id,
            filename: filename.to_string(),
            scale,
            base_buffer,
            images,
            feature_points,
            descriptors,
            corner_points,
            selectors,
            bbox,
            bbox_transformed: bbox,
            homography: Matrix3::identity(),
            pose: Matrix3x4::zeros(),
            is_detected: false,
            is_tracking: false,
            reset_tracks: false,
            template_pyr_level: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.images[0].width()
    }

    pub fn height(&self) -> u32 {
        self.images[0].height()
    }

    pub fn is_visible(&self) -> bool {
        self.is_detected || self.is_tracking
    }

    /// Install a freshly estimated homography and move the bounding box
    /// with it.
    pub(crate) fn set_homography(&mut self, h: Matrix3<f64>) {
        self.homography = h;
        let transformed = perspective_transform_all(&h, &self.bbox);
        for (dst, src) in self.bbox_transformed.iter_mut().zip(transformed) {
            *dst = src;
        }
    }

    /// Drop all live tracking state, as after a lost frame.
    pub(crate) fn clear_tracking(&mut self) {
        self.is_detected = false;
        self.is_tracking = false;
    }

    /// Immediately reseed every level's anchor selection.
    pub(crate) fn reset_all_selections(&mut self) {
        for sel in &mut self.selectors {
            sel.reset_selection();
        }
    }

    /// Defer a reseed of every level to its next `initial_features`.
    pub(crate) fn flag_selections_stale(&mut self) {
        for sel in &mut self.selectors {
            sel.mark_stale();
        }
    }
}

/// Copy-out snapshot of a trackable's reference image and metadata.
#[derive(Debug, Clone)]
pub struct TrackedImageInfo {
    pub uid: i32,
    pub scale: f32,
    pub filename: String,
    pub image_data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
}
