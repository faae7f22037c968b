//! Template-anchor selection state for one trackable pyramid level.
//!
//! The selector decouples the pool of Harris corners from the subset
//! actually tracked in a given frame. Every corner is in exactly one of
//! three partitions: *candidate* (available), *tracked* (the current
//! working set), or *dead* (retired after a failed track). A 10×10
//! spatial grid bounds how many points one textured region can
//! contribute, so the working set keeps spatial coverage.

use nalgebra::Matrix3;
use rand::prelude::*;

use crate::imgproc::perspective_transform;

const GRID: usize = 10;
/// Working-set quota per occupied grid cell.
const PER_BIN: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PointState {
    Candidate,
    Tracked,
    Dead,
}

/// Per-level anchor selection state. Point getters report base-level
/// (reference image) pixel coordinates regardless of which pyramid level
/// the corners came from.
#[derive(Debug, Clone)]
pub struct TrackingPointSelector {
    /// Corner positions in level coordinates; fixed at construction.
    points: Vec<[f32; 2]>,
    state: Vec<PointState>,
    /// Indices into `points`, in selection order.
    tracked: Vec<usize>,
    /// Bin → candidate point indices.
    bins: Vec<Vec<usize>>,
    /// Level → base coordinate scale.
    scale: [f32; 2],
    base_size: [f32; 2],
    stale: bool,
    rng: StdRng,
}

impl TrackingPointSelector {
    pub fn new(
        points: Vec<[f32; 2]>,
        level_width: u32,
        level_height: u32,
        base_width: u32,
        base_height: u32,
        seed: u64,
    ) -> Self {
        let mut bins = vec![Vec::new(); GRID * GRID];
        let bin_w = level_width.max(1) as f32 / GRID as f32;
        let bin_h = level_height.max(1) as f32 / GRID as f32;
        for (i, p) in points.iter().enumerate() {
            let bx = ((p[0] / bin_w) as usize).min(GRID - 1);
            let by = ((p[1] / bin_h) as usize).min(GRID - 1);
            bins[by * GRID + bx].push(i);
        }
        let state = vec![PointState::Candidate; points.len()];
        Self {
            points,
            state,
            tracked: Vec::new(),
            bins,
            scale: [
                base_width as f32 / level_width.max(1) as f32,
                base_height as f32 / level_height.max(1) as f32,
            ],
            base_size: [base_width as f32, base_height as f32],
            stale: false,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Discard the working set and reseed it by drawing a bounded number
    /// of live candidates from each occupied grid cell.
    pub fn reset_selection(&mut self) {
        for &i in &self.tracked {
            self.state[i] = PointState::Candidate;
        }
        self.tracked.clear();

        for bin in &self.bins {
            let live: Vec<usize> = bin
                .iter()
                .copied()
                .filter(|&i| self.state[i] == PointState::Candidate)
                .collect();
            for _ in 0..PER_BIN.min(live.len()) {
                loop {
                    let pick = live[self.rng.gen_range(0..live.len())];
                    if self.state[pick] == PointState::Candidate {
                        self.state[pick] = PointState::Tracked;
                        self.tracked.push(pick);
                        break;
                    }
                }
            }
        }
        self.stale = false;
    }

    /// Flag the working set for reseeding at the next
    /// [`initial_features`](Self::initial_features) call.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// The working set, reseeding it first when empty or stale.
    pub fn initial_features(&mut self) -> Vec<[f64; 2]> {
        if self.stale || self.tracked.is_empty() {
            self.reset_selection();
        }
        self.tracked_features()
    }

    /// The working set in base coordinates; never triggers a reseed.
    pub fn tracked_features(&self) -> Vec<[f64; 2]> {
        self.tracked.iter().map(|&i| self.to_base(i)).collect()
    }

    /// The working set projected through `h` into frame coordinates.
    pub fn tracked_features_warped(&self, h: &Matrix3<f64>) -> Vec<[f64; 2]> {
        self.tracked
            .iter()
            .map(|&i| perspective_transform(h, self.to_base(i)))
            .collect()
    }

    /// The working set lifted to the marker plane: z = 0, scaled to world
    /// units, origin at the reference image centre.
    pub fn tracked_features_3d(&self, scale: f32) -> Vec<[f64; 3]> {
        let cx = self.base_size[0] as f64 / 2.0;
        let cy = self.base_size[1] as f64 / 2.0;
        self.tracked
            .iter()
            .map(|&i| {
                let p = self.to_base(i);
                [(p[0] - cx) * scale as f64, (p[1] - cy) * scale as f64, 0.0]
            })
            .collect()
    }

    /// Apply a keep mask aligned with the working set: rejected points
    /// are retired to the dead partition. A short mask leaves trailing
    /// points tracked.
    pub fn update_point_status(&mut self, keep: &[bool]) {
        let mut retained = Vec::with_capacity(self.tracked.len());
        for (slot, &idx) in self.tracked.iter().enumerate() {
            match keep.get(slot) {
                Some(false) => self.state[idx] = PointState::Dead,
                _ => retained.push(idx),
            }
        }
        self.tracked = retained;
    }

    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    /// (candidate, tracked, dead) partition sizes.
    pub fn partition_sizes(&self) -> (usize, usize, usize) {
        let mut sizes = (0usize, 0usize, 0usize);
        for s in &self.state {
            match s {
                PointState::Candidate => sizes.0 += 1,
                PointState::Tracked => sizes.1 += 1,
                PointState::Dead => sizes.2 += 1,
            }
        }
        sizes
    }

    #[inline]
    fn to_base(&self, i: usize) -> [f64; 2] {
        [
            (self.points[i][0] * self.scale[0]) as f64,
            (self.points[i][1] * self.scale[1]) as f64,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_points(n_per_axis: usize, span: f32) -> Vec<[f32; 2]> {
        let step = span / n_per_axis as f32;
        let mut pts = Vec::new();
        for i in 0..n_per_axis {
            for j in 0..n_per_axis {
                pts.push([step * (i as f32 + 0.5), step * (j as f32 + 0.5)]);
            }
        }
        pts
    }

    fn selector() -> TrackingPointSelector {
        TrackingPointSelector::new(grid_points(20, 100.0), 100, 100, 100, 100, 7)
    }

    #[test]
    fn partitions_stay_disjoint_and_complete() {
        let mut sel = selector();
        let total = 400;
        sel.reset_selection();
        let keep: Vec<bool> = (0..sel.tracked_len()).map(|i| i % 2 == 0).collect();
        sel.update_point_status(&keep);
        sel.reset_selection();

        let (c, t, d) = sel.partition_sizes();
        assert_eq!(c + t + d, total);
        assert!(d > 0);
        assert_eq!(t, sel.tracked_len());
    }

    #[test]
    fn reset_draws_bounded_count_per_bin() {
        let mut sel = selector();
        sel.reset_selection();
        // 10×10 grid, one pick per occupied bin.
        assert_eq!(sel.tracked_len(), 100);
    }

    #[test]
    fn initial_features_reseeds_when_stale() {
        let mut sel = selector();
        assert!(!sel.initial_features().is_empty());
        let before = sel.tracked_features();
        sel.mark_stale();
        let after = sel.initial_features();
        assert_eq!(before.len(), after.len());
    }

    #[test]
    fn dead_points_are_never_reselected() {
        let mut sel = selector();
        sel.reset_selection();
        let first: Vec<[f64; 2]> = sel.tracked_features();
        // Kill the entire working set.
        sel.update_point_status(&vec![false; first.len()]);
        sel.reset_selection();
        for p in sel.tracked_features() {
            assert!(!first.contains(&p), "dead point {p:?} reselected");
        }
    }

    #[test]
    fn warped_features_follow_homography() {
        let mut sel = selector();
        sel.reset_selection();
        let h = Matrix3::new(2.0, 0.0, 10.0, 0.0, 2.0, -5.0, 0.0, 0.0, 1.0);
        let plain = sel.tracked_features();
        let warped = sel.tracked_features_warped(&h);
        for (p, w) in plain.iter().zip(&warped) {
            assert!((w[0] - (2.0 * p[0] + 10.0)).abs() < 1e-9);
            assert!((w[1] - (2.0 * p[1] - 5.0)).abs() < 1e-9);
        }
    }

    #[test]
    fn level_coordinates_scale_to_base() {
        // Corners live on a 50×50 level of a 100×100 reference.
        let mut sel = TrackingPointSelector::new(vec![[10.0, 20.0]], 50, 50, 100, 100, 1);
        let pts = sel.initial_features();
        assert_eq!(pts, vec![[20.0, 40.0]]);
    }

    #[test]
    fn lifted_points_are_centered_and_scaled() {
        let mut sel = TrackingPointSelector::new(vec![[75.0, 25.0]], 100, 100, 100, 100, 1);
        sel.reset_selection();
        let p3 = sel.tracked_features_3d(2.0);
        assert_eq!(p3, vec![[50.0, -50.0, 0.0]]);
    }
}
