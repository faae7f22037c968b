//! Detection phase: locate not-yet-detected trackables by descriptor
//! matching on a downsampled frame.

use image::GrayImage;

use crate::features::{knn_match2, Descriptors, Keypoint};
use crate::homography::find_homography_ransac;
use crate::imgproc::{fill_polygon, pyr_down};

use super::Tracker;

impl Tracker {
    /// Run the feature-matching phase. Returns the index of a trackable
    /// promoted to detected this frame, if any.
    pub(crate) fn run_detection_phase(&mut self, frame: &GrayImage) -> Option<usize> {
        let detection_frame = self.detection_frame(frame);
        let mask = self.feature_mask(detection_frame.width(), detection_frame.height());
        let keypoints = self.feature_detector.detect(&detection_frame, mask.as_ref());
        if keypoints.len() <= self.config.min_required_features {
            return None;
        }
        let descriptors = self.feature_detector.describe(&detection_frame, &keypoints);
        self.match_features(&keypoints, &descriptors)
    }

    /// Downsample the frame to the feature-detection level.
    fn detection_frame(&self, frame: &GrayImage) -> GrayImage {
        let mut out = frame.clone();
        for _ in 0..self.feature_detect_pyr_level {
            out = pyr_down(&out);
        }
        out
    }

    /// A mask that is 1 everywhere except inside the current bounding
    /// boxes of already-detected trackables, scaled into detection
    /// coordinates. Allocated only when something is detected.
    fn feature_mask(&self, width: u32, height: u32) -> Option<GrayImage> {
        let mut mask: Option<GrayImage> = None;
        for t in &self.trackables {
            if !t.is_detected {
                continue;
            }
            let mask =
                mask.get_or_insert_with(|| GrayImage::from_pixel(width, height, image::Luma([1])));
            let poly: Vec<[f64; 2]> = t
                .bbox_transformed
                .iter()
                .map(|p| {
                    [
                        p[0] / self.feature_detect_scale[0],
                        p[1] / self.feature_detect_scale[1],
                    ]
                })
                .collect();
            fill_polygon(mask, &poly, 0);
        }
        mask
    }

    /// Match frame descriptors against every un-detected trackable and
    /// try to promote the best-supported one. At most one trackable is
    /// promoted per frame.
    fn match_features(
        &mut self,
        keypoints: &[Keypoint],
        descriptors: &Descriptors,
    ) -> Option<usize> {
        let ratio = self.config.nn_match_ratio;

        let mut best_index = None;
        let mut best_count = 0usize;
        let mut best_pairs: Vec<([f64; 2], [f64; 2])> = Vec::new();

        for (i, t) in self.trackables.iter().enumerate() {
            if t.is_detected {
                continue;
            }
            let mut pairs = Vec::new();
            for m in knn_match2(descriptors, &t.descriptors) {
                // Ratio test: drop ambiguous matches.
                if m.best.distance < ratio * m.second.distance {
                    let q = &keypoints[m.best.query_idx];
                    let r = &t.feature_points[m.best.train_idx];
                    pairs.push(([r.x as f64, r.y as f64], [q.x as f64, q.y as f64]));
                }
            }
            // Strict greater-than keeps the lower index on ties.
            if pairs.len() > best_count {
                best_count = pairs.len();
                best_pairs = pairs;
                best_index = Some(i);
            }
        }

        let index = best_index?;
        if best_count <= self.config.min_required_features {
            return None;
        }

        // Undo the detection downsample: matched frame points back to
        // native-resolution pixels.
        let src: Vec<[f64; 2]> = best_pairs.iter().map(|(r, _)| *r).collect();
        let dst: Vec<[f64; 2]> = best_pairs
            .iter()
            .map(|(_, q)| {
                [
                    q[0] * self.feature_detect_scale[0],
                    q[1] * self.feature_detect_scale[1],
                ]
            })
            .collect();

        let info = find_homography_ransac(&src, &dst, self.config.ransac_thresh);
        if !info.valid {
            return None;
        }

        let t = &mut self.trackables[index];
        t.is_detected = true;
        t.reset_tracks = true;
        // A fresh detection invalidates every level's anchor selection.
        t.reset_all_selections();
        t.set_homography(info.homography);
        self.currently_tracked += 1;
        tracing::debug!(id = t.id, matches = best_count, "new marker detected");
        Some(index)
    }
}
