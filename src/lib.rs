//! planartrack — planar natural-feature image tracker.
//!
//! Reference planar images ("trackables") are located in a monocular
//! grayscale stream and followed with a 6-DOF pose per frame. The
//! pipeline stages are:
//!
//! 1. **Detection** – multi-scale keypoints + descriptors on a
//!    downsampled frame, ratio-tested matching against the trackable
//!    library, RANSAC homography to establish the initial lock.
//! 2. **Tracking** – bidirectional pyramidal Lucas-Kanade flow on the
//!    selected template anchors, then warped-template correlation to
//!    refine the homography frame over frame.
//! 3. **Pose** – planar PnP with RANSAC from the anchors' 2D↔3D
//!    correspondences against the camera intrinsics.
//! 4. **Persistence** – the per-image database (descriptors, corners,
//!    base image) round-trips through a tagged key-value file.
//!
//! # Public API
//! [`Tracker`] is the primary entry point; [`TrackerConfig`] holds every
//! tunable. Camera calibration enters through [`CameraParams`]. The
//! remaining exports are the building blocks for callers that need
//! lower-level access (homography fitting, optical flow, pose solving).

mod camera;
mod config;
mod database;
mod features;
mod flow;
mod harris;
mod homography;
mod imgproc;
mod pose;
mod selector;
mod trackable;
mod tracker;

pub use camera::{CameraModel, CameraParams, Distortion};
pub use config::TrackerConfig;
pub use database::DatabaseError;
pub use features::{
    knn_match2, Descriptors, DetectorKind, DMatch, FeatureDetector, Keypoint, MatchPair,
};
pub use flow::{bidirectional_flow, calc_optical_flow_pyr_lk, FlowPyramid};
pub use harris::{HarrisConfig, HarrisCornerDetector};
pub use homography::{estimate_homography_dlt, find_homography_ransac, HomographyInfo};
pub use pose::{solve_planar_pnp_ransac, PnpRansacConfig};
pub use selector::TrackingPointSelector;
pub use trackable::{Trackable, TrackedImageInfo, TEMPLATE_MAX_PYR_LEVEL};
pub use tracker::{TemplateMatchCounters, Tracker};
