//! Tracker configuration.
//!
//! Every runtime tunable lives here as instance state on the tracker,
//! so two trackers in one process never interfere. The public setters
//! on [`crate::Tracker`] mutate this record.

use crate::harris::HarrisConfig;
use crate::pose::PnpRansacConfig;

/// All tracker tunables, with the stock defaults.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Cap on simultaneously tracked markers.
    pub max_markers_to_track: usize,
    /// Minimum feature/match count for the detection phase to proceed.
    pub min_required_features: usize,
    /// Nearest-neighbour ratio-test factor in (0, 1).
    pub nn_match_ratio: f32,
    /// RANSAC reprojection threshold for homography fits, in pixels.
    pub ransac_thresh: f64,
    /// Edge length of the patches used in template matching, in pixels.
    pub marker_template_width: i32,
    /// Template search window inflation on each side, in pixels.
    pub search_radius: i32,
    /// SQDIFF_NORMED acceptance bound; a match minimum must fall below
    /// this to refine a point.
    pub template_match_threshold: f32,
    /// Minimum effective image size for the feature-detection frame;
    /// controls how far incoming frames are downsampled.
    pub min_detection_size: [u32; 2],
    /// Harris corner extraction settings for template anchors.
    pub harris: HarrisConfig,
    /// PnP RANSAC settings for pose recovery.
    pub pnp: PnpRansacConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_markers_to_track: 1,
            min_required_features: 50,
            nn_match_ratio: 0.7,
            ransac_thresh: 2.5,
            marker_template_width: 15,
            search_radius: 15,
            template_match_threshold: 0.5,
            min_detection_size: [320, 240],
            harris: HarrisConfig::default(),
            pnp: PnpRansacConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_stable() {
        let cfg = TrackerConfig::default();
        assert_eq!(cfg.max_markers_to_track, 1);
        assert_eq!(cfg.min_required_features, 50);
        assert!((cfg.nn_match_ratio - 0.7).abs() < 1e-6);
        assert!((cfg.ransac_thresh - 2.5).abs() < 1e-9);
        assert_eq!(cfg.marker_template_width, 15);
        assert_eq!(cfg.search_radius, 15);
        assert_eq!(cfg.min_detection_size, [320, 240]);
    }
}
