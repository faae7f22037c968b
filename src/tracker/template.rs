//! Template-matching refinement of an optically-tracked homography.
//!
//! For every anchor in the current working set, a patch around its
//! reference position is warped through the trackable's homography into
//! an upright template, then searched for in a window around the
//! predicted frame position with normalized correlation. Refined
//! (reference, frame) pairs feed one more homography fit.

use image::GrayImage;

use crate::homography::estimate_homography_dlt;
use crate::imgproc::{
    match_template_sqdiff_normed, perspective_transform_all, polygon_contains, warp_perspective,
    Plane, Rect,
};

use super::Tracker;

/// Per-run rejection tally for the template matcher. Purely
/// observational; a visualization layer may display it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateMatchCounters {
    /// Anchors considered this run.
    pub candidates: usize,
    /// Warped anchor fell outside the transformed bounding box.
    pub failed_bounds_test: usize,
    /// Template-sized ROI around the anchor left the frame.
    pub failed_roi_in_frame: usize,
    /// Template warp homography could not be estimated.
    pub failed_template_homography: usize,
    /// Inflated search ROI left the frame.
    pub failed_search_roi_in_frame: usize,
    /// Template region degenerate or not smaller than the search area.
    pub failed_template_size: usize,
    /// Correlation surface could not be computed.
    pub failed_template_match: usize,
    /// Correlation minimum was above the acceptance threshold.
    pub failed_weak_correlation: usize,
    /// Anchors that produced a refined match.
    pub matched: usize,
    /// Whether the closing homography fit succeeded.
    pub ok: bool,
}

impl Tracker {
    /// Refine the trackable's homography by warped-template matching.
    /// On failure the trackable loses both flags.
    pub(crate) fn run_template_matching(&mut self, frame: &GrayImage, index: usize) -> bool {
        let mut counters = TemplateMatchCounters::default();
        let template_width = self.config.marker_template_width;
        let search_radius = self.config.search_radius;
        let accept = self.config.template_match_threshold;

        let level;
        let mut selection_mask;
        let mut src = Vec::new();
        let mut dst = Vec::new();
        {
            let t = &self.trackables[index];
            level = t.template_pyr_level;
            let level_img = &t.images[level];
            // Base ↔ level scale; not an exact power of two for odd sizes.
            let scale_x = t.width() as f64 / level_img.width() as f64;
            let scale_y = t.height() as f64 / level_img.height() as f64;

            let points = t.selectors[level].tracked_features();
            let warped = t.selectors[level].tracked_features_warped(&t.homography);
            let n = warped.len();
            counters.candidates = n;
            selection_mask = vec![false; n];

            let frame_roi = Rect::of_image(frame);
            let marker_roi = Rect::of_image(level_img);
            let h_inv = t.homography.try_inverse();

            for j in 0..n {
                let pt = warped[j];
                if !polygon_contains(&t.bbox_transformed, pt) {
                    counters.failed_bounds_test += 1;
                    continue;
                }
                let pt_orig = points[j];

                // Upright frame-space ROI centred on the predicted
                // position.
                let search_center = Rect::new(
                    (pt[0] - template_width as f64 / 2.0).floor() as i32,
                    (pt[1] - template_width as f64 / 2.0).floor() as i32,
                    template_width,
                    template_width,
                );
                if !frame_roi.contains_rect(&search_center) {
                    counters.failed_roi_in_frame += 1;
                    continue;
                }

                // A reference-space square at base resolution, warped to
                // the frame; its bounding rect is where the oriented
                // template lands.
                let half = (template_width << level) as f64 / 2.0;
                let square = [
                    [pt_orig[0] - half, pt_orig[1] - half],
                    [pt_orig[0] + half, pt_orig[1] - half],
                    [pt_orig[0] + half, pt_orig[1] + half],
                    [pt_orig[0] - half, pt_orig[1] + half],
                ];
                let square_in_frame =
                    perspective_transform_all(&t.homography, &square);
                let frame_bounds = Rect::bounding(&square_in_frame);

                // Project the bounding rect back into reference space,
                // then down to the template pyramid level.
                let Some(h_inv) = h_inv.as_ref() else {
                    counters.failed_template_homography += 1;
                    continue;
                };
                let back = perspective_transform_all(h_inv, &frame_bounds.corners());
                let back_level: Vec<[f64; 2]> = back
                    .iter()
                    .map(|p| [p[0] / scale_x, p[1] / scale_y])
                    .collect();

                // Shift so the quad's minimum lands at the origin, and
                // fit the homography that uprights it.
                let min_x = back_level.iter().map(|p| p[0]).fold(f64::MAX, f64::min);
                let min_y = back_level.iter().map(|p| p[1]).fold(f64::MAX, f64::min);
                let shifted: Vec<[f64; 2]> = back_level
                    .iter()
                    .map(|p| [p[0] - min_x, p[1] - min_y])
                    .collect();
                let upright =
                    Rect::new(0, 0, frame_bounds.width, frame_bounds.height).corners();
                let Ok(template_h) = estimate_homography_dlt(&shifted, &upright) else {
                    counters.failed_template_homography += 1;
                    continue;
                };

                let search_roi = search_center.inflate(search_radius);
                if !frame_roi.contains_rect(&search_roi) {
                    counters.failed_search_roi_in_frame += 1;
                    continue;
                }
                let template_bbox = Rect::bounding(&back_level).intersect(&marker_roi);
                if !(template_bbox.area() > 0 && search_roi.area() > template_bbox.area()) {
                    counters.failed_template_size += 1;
                    continue;
                }

                // Warp the reference patch into the upright template.
                let patch = image::imageops::crop_imm(
                    level_img,
                    template_bbox.x as u32,
                    template_bbox.y as u32,
                    template_bbox.width as u32,
                    template_bbox.height as u32,
                )
                .to_image();
                let warped_template = warp_perspective(
                    &patch,
                    &template_h,
                    frame_bounds.width as u32,
                    frame_bounds.height as u32,
                );

                // Correlate in a search window normalized to the
                // template's intensity range.
                let template_plane = Plane::from_gray(&warped_template);
                let (t_min, t_max) = template_plane.min_and_max();
                let search_plane =
                    Plane::from_gray_rect(frame, &search_roi).normalize_to_range(t_min, t_max);
                let Some((min_val, min_loc)) =
                    match_template_sqdiff_normed(&search_plane, &template_plane)
                else {
                    counters.failed_template_match += 1;
                    continue;
                };
                if min_val >= accept {
                    counters.failed_weak_correlation += 1;
                    continue;
                }

                let matched = [
                    (search_roi.x + min_loc.0 as i32 + warped_template.width() as i32 / 2) as f64,
                    (search_roi.y + min_loc.1 as i32 + warped_template.height() as i32 / 2) as f64,
                ];
                selection_mask[j] = true;
                src.push(pt_orig);
                dst.push(matched);
                counters.matched += 1;
            }
        }

        let ok = self.update_trackable_homography(index, level, &src, &dst, &selection_mask);
        if !ok {
            self.drop_trackable(index);
        }
        counters.ok = ok;
        self.template_counters = counters;
        ok
    }
}
