//! The frame-loop orchestrator.
//!
//! [`Tracker`] owns the trackable library and runs the two-stage
//! pipeline on every frame: a capacity-gated detection phase (descriptor
//! matching against not-yet-detected trackables) and a tracking phase
//! (bidirectional pyramidal LK refined by warped-template matching),
//! followed by pose recovery for every visible trackable.

mod detection;
mod template;

use std::path::Path;
use std::sync::Arc;

use image::GrayImage;

pub use template::TemplateMatchCounters;

use crate::camera::{CameraModel, CameraParams};
use crate::config::TrackerConfig;
use crate::database;
use crate::features::{DetectorKind, FeatureDetector};
use crate::flow::{bidirectional_flow, FlowPyramid};
use crate::harris::HarrisCornerDetector;
use crate::homography::find_homography_ransac;
use crate::pose::solve_planar_pnp_ransac;
use crate::trackable::{Trackable, TrackedImageInfo, TEMPLATE_MAX_PYR_LEVEL};

/// Planar natural-feature tracker.
///
/// Construct, [`initialise`](Self::initialise) with camera parameters,
/// register reference images, then feed grayscale frames through
/// [`process_frame`](Self::process_frame) and query poses by id.
pub struct Tracker {
    pub(crate) config: TrackerConfig,
    pub(crate) feature_detector: FeatureDetector,
    pub(crate) trackables: Vec<Trackable>,
    pub(crate) currently_tracked: usize,
    pub(crate) frame_count: u64,
    frame_size: [u32; 2],
    pub(crate) feature_detect_pyr_level: u32,
    pub(crate) feature_detect_scale: [f64; 2],
    pub(crate) camera: Option<CameraModel>,
    pyramid: Option<FlowPyramid>,
    prev_pyramid: Option<FlowPyramid>,
    pub(crate) template_counters: TemplateMatchCounters,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    pub fn new() -> Self {
        Self::with_config(TrackerConfig::default())
    }

    pub fn with_config(config: TrackerConfig) -> Self {
        Self {
            feature_detector: FeatureDetector::new(DetectorKind::Blob),
            config,
            trackables: Vec::new(),
            currently_tracked: 0,
            frame_count: 0,
            frame_size: [0, 0],
            feature_detect_pyr_level: 0,
            feature_detect_scale: [1.0, 1.0],
            camera: None,
            pyramid: None,
            prev_pyramid: None,
            template_counters: TemplateMatchCounters::default(),
        }
    }

    /// Bind the tracker to a frame geometry and camera model. Resets all
    /// per-session tracking state; registered trackables survive but
    /// drop back to undetected.
    pub fn initialise(&mut self, params: &CameraParams) {
        self.frame_size = [params.xsize.max(0) as u32, params.ysize.max(0) as u32];

        // Downsampling level for the feature-detection frame, derived
        // from the configured minimum effective size.
        let [min_x, min_y] = self.config.min_detection_size;
        let lx = (self.frame_size[0].max(1) as f64).log2() - (min_x.max(1) as f64).log2();
        let ly = (self.frame_size[1].max(1) as f64).log2() - (min_y.max(1) as f64).log2();
        self.feature_detect_pyr_level = lx.floor().min(ly.floor()).max(0.0) as u32;
        self.feature_detect_scale =
            pyr_down_scale_factor(self.feature_detect_pyr_level, self.frame_size);

        self.camera = Some(CameraModel::from_params(params));
        self.pyramid = None;
        self.prev_pyramid = None;
        self.currently_tracked = 0;
        for t in &mut self.trackables {
            t.clear_tracking();
        }
    }

    /// Ingest one grayscale frame supplied as a raw byte buffer of the
    /// initialised frame size.
    pub fn process_frame(&mut self, frame: &[u8]) {
        let [w, h] = self.frame_size;
        if w == 0 || h == 0 || frame.len() != (w as usize * h as usize) {
            tracing::warn!(
                got = frame.len(),
                expected = w as usize * h as usize,
                "frame buffer does not match initialised size"
            );
            return;
        }
        let Some(frame) = GrayImage::from_raw(w, h, frame.to_vec()) else {
            return;
        };
        self.process_frame_image(&frame);
    }

    /// Ingest one grayscale frame.
    pub fn process_frame_image(&mut self, frame: &GrayImage) {
        self.pyramid = Some(FlowPyramid::build(frame));

        // Detection phase: only while capacity remains.
        let newly_detected = if self.currently_tracked < self.config.max_markers_to_track {
            self.run_detection_phase(frame)
        } else {
            None
        };

        // Tracking phase. A trackable detected this frame sits out until
        // the next frame, when a previous pyramid exists for it.
        if self.currently_tracked > 0 && self.frame_count > 0 && self.prev_pyramid.is_some() {
            for i in 0..self.trackables.len() {
                if !self.trackables[i].is_detected || newly_detected == Some(i) {
                    continue;
                }
                self.track_one(frame, i);
            }
        }

        // Pose recovery for everything still visible.
        self.solve_poses();

        self.prev_pyramid = self.pyramid.take();
        self.frame_count += 1;
    }

    fn track_one(&mut self, frame: &GrayImage, index: usize) {
        // Pick the template pyramid level from the homography scale:
        // log2(1/sqrt(|det H|)), truncated, clamped to stored levels.
        {
            let t = &mut self.trackables[index];
            let det = t.homography.determinant().abs() as f32;
            let level = if det > 0.0 {
                ((1.0 / det.sqrt()).log2() as i32).clamp(0, TEMPLATE_MAX_PYR_LEVEL as i32)
            } else {
                0
            };
            t.template_pyr_level = level as usize;
            if t.reset_tracks {
                t.flag_selections_stale();
                t.reset_tracks = false;
            }
        }

        let (points, warped) = {
            let t = &mut self.trackables[index];
            let level = t.template_pyr_level;
            let points = t.selectors[level].initial_features();
            let warped = t.selectors[level].tracked_features_warped(&t.homography);
            (points, warped)
        };

        if self.run_optical_flow(index, &points, &warped) {
            self.run_template_matching(frame, index);
        }
    }

    /// Bidirectional LK from the previous frame's warped anchor
    /// positions into the current frame. Survivors feed a homography
    /// update; failure drops the trackable.
    fn run_optical_flow(&mut self, index: usize, points: &[[f64; 2]], warped: &[[f64; 2]]) -> bool {
        let (prev, cur) = match (&self.prev_pyramid, &self.pyramid) {
            (Some(p), Some(c)) => (p, c),
            _ => return false,
        };
        let (tracked, status) = bidirectional_flow(prev, cur, warped);

        let mut src = Vec::new();
        let mut dst = Vec::new();
        for j in 0..points.len() {
            if status[j] {
                src.push(points[j]);
                dst.push(tracked[j]);
            }
        }

        let level = self.trackables[index].template_pyr_level;
        if !self.update_trackable_homography(index, level, &src, &dst, &status) {
            self.drop_trackable(index);
            return false;
        }
        self.trackables[index].is_tracking = true;
        true
    }

    /// Refit the trackable's homography from matched (reference, frame)
    /// pairs. `selection_mask` flags which of the selector's tracked
    /// points produced a pair; surviving points keep their slot, RANSAC
    /// outliers and unmatched points are retired.
    pub(crate) fn update_trackable_homography(
        &mut self,
        index: usize,
        level: usize,
        src: &[[f64; 2]],
        dst: &[[f64; 2]],
        selection_mask: &[bool],
    ) -> bool {
        if src.len() <= 4 {
            return false;
        }
        let info = find_homography_ransac(src, dst, self.config.ransac_thresh);
        if !info.valid {
            return false;
        }

        // Fold the RANSAC verdicts back onto the full tracked set.
        let mut keep = Vec::with_capacity(selection_mask.len());
        let mut k = 0usize;
        for &selected in selection_mask {
            if selected {
                keep.push(info.status[k]);
                k += 1;
            } else {
                keep.push(false);
            }
        }

        let frame_count = self.frame_count;
        let t = &mut self.trackables[index];
        t.selectors[level].update_point_status(&keep);
        t.set_homography(info.homography);
        if frame_count > 1 {
            t.reset_all_selections();
        }
        true
    }

    fn drop_trackable(&mut self, index: usize) {
        let t = &mut self.trackables[index];
        if t.is_detected {
            self.currently_tracked = self.currently_tracked.saturating_sub(1);
        }
        t.clear_tracking();
    }

    fn solve_poses(&mut self) {
        let Some(camera) = self.camera.clone() else {
            return;
        };
        for t in &mut self.trackables {
            if !t.is_visible() {
                continue;
            }
            let level = t.template_pyr_level;
            let image_points = t.selectors[level].tracked_features_warped(&t.homography);
            let object_points = t.selectors[level].tracked_features_3d(t.scale);
            if let Some(pose) =
                solve_planar_pnp_ransac(&object_points, &image_points, &camera, &self.config.pnp)
            {
                t.pose = pose;
            }
        }
    }

    // ── Trackable library management ─────────────────────────────────

    /// Register a reference image. The buffer is shared with the caller
    /// and treated as read-only; it must be `width * height` grayscale
    /// bytes. Returns `false` when the buffer does not match.
    pub fn add_marker(
        &mut self,
        buffer: Arc<[u8]>,
        filename: &str,
        width: u32,
        height: u32,
        id: i32,
        scale: f32,
    ) -> bool {
        let harris = HarrisCornerDetector::new(self.config.harris.clone());
        match Trackable::from_buffer(
            buffer,
            filename,
            width,
            height,
            id,
            scale,
            &self.feature_detector,
            &harris,
        ) {
            Some(t) => {
                self.trackables.push(t);
                tracing::info!(id, filename, "2D marker added");
                true
            }
            None => {
                tracing::warn!(id, "marker buffer does not match stated dimensions");
                false
            }
        }
    }

    pub fn remove_all_markers(&mut self) {
        self.trackables.clear();
        self.currently_tracked = 0;
    }

    /// Write the trackable library to disk. Failures are logged and
    /// reported as `false`.
    pub fn save_database(&self, path: &Path) -> bool {
        match database::save_database(path, self.feature_detector.kind(), &self.trackables) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(path = %path.display(), %err, "could not write trackable database");
                false
            }
        }
    }

    /// Replace the trackable library from disk. On failure the tracker
    /// is left untouched. The stored feature-detector kind replaces the
    /// tracker's current one.
    pub fn load_database(&mut self, path: &Path) -> bool {
        let harris = HarrisCornerDetector::new(self.config.harris.clone());
        match database::load_database(path, &harris) {
            Ok((kind, trackables)) => {
                self.feature_detector.set_kind(kind);
                self.trackables = trackables;
                self.currently_tracked = 0;
                true
            }
            Err(err) => {
                tracing::error!(path = %path.display(), %err, "could not read trackable database");
                false
            }
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Current pose of a visible trackable as a single-precision 3×4
    /// row-major matrix.
    pub fn trackable_pose(&self, id: i32) -> Option<[[f32; 4]; 3]> {
        let t = self.trackables.iter().find(|t| t.id == id)?;
        if !t.is_visible() {
            return None;
        }
        let mut out = [[0.0f32; 4]; 3];
        for (r, row) in out.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = t.pose[(r, c)] as f32;
            }
        }
        Some(out)
    }

    pub fn is_trackable_visible(&self, id: i32) -> bool {
        self.trackables
            .iter()
            .any(|t| t.id == id && t.is_visible())
    }

    pub fn has_trackables(&self) -> bool {
        !self.trackables.is_empty()
    }

    pub fn image_ids(&self) -> Vec<i32> {
        self.trackables.iter().map(|t| t.id).collect()
    }

    pub fn change_image_id(&mut self, old_id: i32, new_id: i32) -> bool {
        match self.trackables.iter_mut().find(|t| t.id == old_id) {
            Some(t) => {
                t.id = new_id;
                true
            }
            None => false,
        }
    }

    /// Snapshot of a trackable's reference image and metadata.
    pub fn trackable_image_info(&self, id: i32) -> Option<TrackedImageInfo> {
        let t = self.trackables.iter().find(|t| t.id == id)?;
        Some(TrackedImageInfo {
            uid: t.id,
            scale: t.scale,
            filename: t.filename.clone(),
            image_data: t.base_buffer.clone(),
            width: t.width(),
            height: t.height(),
        })
    }

    /// Rejection statistics from the most recent template-matching run.
    pub fn template_match_counters(&self) -> TemplateMatchCounters {
        self.template_counters
    }

    // ── Tunables ─────────────────────────────────────────────────────

    pub fn set_feature_detector(&mut self, kind: DetectorKind) {
        self.feature_detector.set_kind(kind);
    }

    pub fn feature_detector_kind(&self) -> DetectorKind {
        self.feature_detector.kind()
    }

    pub fn set_maximum_number_of_markers_to_track(&mut self, max: usize) {
        self.config.max_markers_to_track = max;
    }

    pub fn maximum_number_of_markers_to_track(&self) -> usize {
        self.config.max_markers_to_track
    }

    pub fn set_min_required_detected_features(&mut self, min: usize) {
        self.config.min_required_features = min;
    }

    pub fn min_required_detected_features(&self) -> usize {
        self.config.min_required_features
    }

    pub fn set_homography_estimation_ransac_threshold(&mut self, threshold: f64) {
        self.config.ransac_thresh = threshold;
    }

    pub fn homography_estimation_ransac_threshold(&self) -> f64 {
        self.config.ransac_thresh
    }

    // Test-facing introspection.

    /// Number of trackables currently holding a detection lock.
    pub fn currently_tracked(&self) -> usize {
        self.currently_tracked
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// `true` while a previous-frame pyramid is retained.
    pub fn has_previous_pyramid(&self) -> bool {
        self.prev_pyramid.is_some()
    }
}

/// Exact downsampling factor after `level` rounds of `(n + 1) / 2`
/// halving; not a plain power of two for odd sizes.
fn pyr_down_scale_factor(level: u32, size: [u32; 2]) -> [f64; 2] {
    let mut scaled = size;
    let mut factor = [1.0f64; 2];
    for _ in 0..level {
        scaled = [(scaled[0] + 1) / 2, (scaled[1] + 1) / 2];
        factor = [
            size[0] as f64 / scaled[0].max(1) as f64,
            size[1] as f64 / scaled[1].max(1) as f64,
        ];
    }
    factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(x: i32, y: i32) -> CameraParams {
        CameraParams {
            xsize: x,
            ysize: y,
            mat: [
                [600.0, 0.0, x as f64 / 2.0, 0.0],
                [0.0, 600.0, y as f64 / 2.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
            dist_function_version: 4,
            dist_factor: vec![0.0; 5],
        }
    }

    #[test]
    fn initialise_derives_detection_level_and_scale() {
        let mut tracker = Tracker::new();
        tracker.initialise(&params(640, 480));
        assert_eq!(tracker.feature_detect_pyr_level, 1);
        assert_eq!(tracker.feature_detect_scale, [2.0, 2.0]);

        tracker.initialise(&params(1280, 960));
        assert_eq!(tracker.feature_detect_pyr_level, 2);
        assert_eq!(tracker.feature_detect_scale, [4.0, 4.0]);

        // Frames already at the minimum size are not downsampled.
        tracker.initialise(&params(320, 240));
        assert_eq!(tracker.feature_detect_pyr_level, 0);
        assert_eq!(tracker.feature_detect_scale, [1.0, 1.0]);
    }

    #[test]
    fn odd_sizes_use_exact_halving_factors() {
        // 641 → 321: the factor is 641/321, not 2.
        let f = pyr_down_scale_factor(1, [641, 481]);
        assert!((f[0] - 641.0 / 321.0).abs() < 1e-12);
        assert!((f[1] - 481.0 / 241.0).abs() < 1e-12);
    }

    #[test]
    fn empty_tracker_only_does_pyramid_bookkeeping() {
        let mut tracker = Tracker::new();
        tracker.initialise(&params(320, 240));
        let frame = vec![127u8; 320 * 240];

        assert!(!tracker.has_previous_pyramid());
        tracker.process_frame(&frame);
        assert!(tracker.has_previous_pyramid());
        assert_eq!(tracker.frame_count(), 1);
        assert_eq!(tracker.currently_tracked(), 0);
    }

    #[test]
    fn wrong_buffer_size_is_ignored() {
        let mut tracker = Tracker::new();
        tracker.initialise(&params(320, 240));
        tracker.process_frame(&vec![0u8; 100]);
        assert_eq!(tracker.frame_count(), 0);
    }

    #[test]
    fn max_markers_setter_accepts_zero_and_recovers() {
        let mut tracker = Tracker::new();
        tracker.set_maximum_number_of_markers_to_track(0);
        assert_eq!(tracker.maximum_number_of_markers_to_track(), 0);
        // Raising from zero must work.
        tracker.set_maximum_number_of_markers_to_track(3);
        assert_eq!(tracker.maximum_number_of_markers_to_track(), 3);
    }

    #[test]
    fn pose_query_on_unknown_id_is_none() {
        let tracker = Tracker::new();
        assert!(tracker.trackable_pose(42).is_none());
        assert!(!tracker.is_trackable_visible(42));
    }

    #[test]
    fn change_image_id_renames_only_existing() {
        let mut tracker = Tracker::new();
        tracker.initialise(&params(320, 240));
        let img = GrayImage::from_fn(64, 64, |x, y| {
            image::Luma([((x * 7 + y * 13) % 256) as u8])
        });
        let buf: Arc<[u8]> = Arc::from(img.into_raw().into_boxed_slice());
        assert!(tracker.add_marker(buf, "a.png", 64, 64, 5, 1.0));
        assert!(tracker.change_image_id(5, 9));
        assert!(!tracker.change_image_id(5, 9));
        assert_eq!(tracker.image_ids(), vec![9]);
    }
}
