//! Per-marker position and heading with last-known-good fallback.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};
use surface_track_core::MarkerDetection;

use crate::rectifier::PlaneTransform;

/// Wrap an angle in degrees into `[0, 360)`.
pub fn normalize_degrees(deg: f64) -> f64 {
    let a = deg.rem_euclid(360.0);
    // rem_euclid of a tiny negative value rounds up to exactly 360.0
    if a >= 360.0 {
        0.0
    } else {
        a + 0.0
    }
}

/// Heading of `v` in image convention (y down): `(1,0)` is 0°, `(0,1)` is 90°.
pub fn heading_degrees(v: Vector2<f64>) -> f64 {
    normalize_degrees(v.y.atan2(v.x).to_degrees())
}

/// Center and heading of a tracked marker.
///
/// Stored in image convention: y grows downwards, angles grow clockwise on
/// screen. Output conventions are applied later by
/// [`CoordinateConvention`](crate::CoordinateConvention).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedMarkerPose {
    pub center: Point2<f64>,
    pub angle_deg: f64,
}

impl TrackedMarkerPose {
    pub const ZERO: Self = Self {
        center: Point2::new(0.0, 0.0),
        angle_deg: 0.0,
    };

    /// Pose from raw detection corners: corner mean and the `corner[1] - corner[0]` edge.
    pub fn from_detection(det: &MarkerDetection) -> Self {
        Self {
            center: det.center(),
            angle_deg: heading_degrees(det.heading()),
        }
    }
}

/// Whether a pose was measured this cycle or carried over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseStatus {
    Fresh,
    Held,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoseEstimate {
    pub pose: TrackedMarkerPose,
    pub status: PoseStatus,
}

/// Tracks a fixed set of marker ids and remembers their last pose.
#[derive(Clone, Debug)]
pub struct MarkerPoseTracker {
    tracked: BTreeSet<u32>,
    last: BTreeMap<u32, TrackedMarkerPose>,
}

impl MarkerPoseTracker {
    pub fn new(tracked: impl IntoIterator<Item = u32>) -> Self {
        Self {
            tracked: tracked.into_iter().collect(),
            last: BTreeMap::new(),
        }
    }

    /// Pre-seed every tracked id with a zero pose so it is reported before
    /// its first detection.
    pub fn with_zero_seed(mut self) -> Self {
        for &id in &self.tracked {
            self.last.entry(id).or_insert(TrackedMarkerPose::ZERO);
        }
        self
    }

    pub fn tracked_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.tracked.iter().copied()
    }

    pub fn last_known(&self, id: u32) -> Option<&TrackedMarkerPose> {
        self.last.get(&id)
    }

    /// Merge one cycle of detections and return the pose of every tracked id
    /// that has data.
    ///
    /// When `transform` is given the center is mapped into the canonical
    /// plane before it is stored. Ids without a detection keep their previous
    /// pose; ids that were never seen are omitted. If an id appears more than
    /// once, the first detection wins.
    pub fn update_and_get(
        &mut self,
        detections: &[MarkerDetection],
        transform: Option<&PlaneTransform>,
    ) -> BTreeMap<u32, PoseEstimate> {
        let mut out = BTreeMap::new();

        for &id in &self.tracked {
            match detections.iter().find(|d| d.id == id) {
                Some(det) => {
                    let mut pose = TrackedMarkerPose::from_detection(det);
                    if let Some(t) = transform {
                        pose.center = t.warp_point(pose.center);
                    }
                    debug!(
                        "id={id} current center: ({:.1}, {:.1}), angle: {:.1}",
                        pose.center.x, pose.center.y, pose.angle_deg
                    );
                    self.last.insert(id, pose);
                    out.insert(
                        id,
                        PoseEstimate {
                            pose,
                            status: PoseStatus::Fresh,
                        },
                    );
                }
                None => match self.last.get(&id) {
                    Some(&pose) => {
                        debug!(
                            "id={id} not detected, using last center: ({:.1}, {:.1}), angle: {:.1}",
                            pose.center.x, pose.center.y, pose.angle_deg
                        );
                        out.insert(
                            id,
                            PoseEstimate {
                                pose,
                                status: PoseStatus::Held,
                            },
                        );
                    }
                    None => debug!("id={id} has no previous data yet"),
                },
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn det_with_edge(id: u32, dx: f32, dy: f32) -> MarkerDetection {
        MarkerDetection::new(
            id,
            [
                Point2::new(0.0, 0.0),
                Point2::new(dx, dy),
                Point2::new(dx - dy, dy + dx),
                Point2::new(-dy, dx),
            ],
        )
    }

    #[test]
    fn unit_square_points_right() {
        let det = MarkerDetection::new(
            1,
            [
                Point2::new(0.0, 0.0),
                Point2::new(1.0, 0.0),
                Point2::new(1.0, 1.0),
                Point2::new(0.0, 1.0),
            ],
        );
        let pose = TrackedMarkerPose::from_detection(&det);
        assert_eq!(pose.angle_deg, 0.0);
        assert_eq!(pose.center, Point2::new(0.5, 0.5));
    }

    #[test]
    fn downward_edge_is_ninety_degrees() {
        let pose = TrackedMarkerPose::from_detection(&det_with_edge(1, 0.0, 1.0));
        assert_abs_diff_eq!(pose.angle_deg, 90.0, epsilon = 1e-12);
    }

    #[test]
    fn angles_stay_in_range() {
        for k in 0..72 {
            let theta = (k as f32 * 5.0 - 180.0).to_radians();
            let pose =
                TrackedMarkerPose::from_detection(&det_with_edge(1, theta.cos(), theta.sin()));
            assert!((0.0..360.0).contains(&pose.angle_deg), "{}", pose.angle_deg);
        }
        assert_eq!(normalize_degrees(-1e-14), 0.0);
        assert_eq!(normalize_degrees(-0.0).to_bits(), 0.0_f64.to_bits());
        assert_abs_diff_eq!(normalize_degrees(-90.0), 270.0);
        assert_abs_diff_eq!(normalize_degrees(725.0), 5.0, epsilon = 1e-9);
    }

    #[test]
    fn missing_marker_keeps_last_pose() {
        let mut tracker = MarkerPoseTracker::new([1, 2]);
        let first = tracker.update_and_get(&[det_with_edge(1, 4.0, 0.0)], None);
        assert_eq!(first.len(), 1);
        assert_eq!(first[&1].status, PoseStatus::Fresh);

        for _ in 0..5 {
            let next = tracker.update_and_get(&[], None);
            assert_eq!(next[&1].pose, first[&1].pose);
            assert_eq!(next[&1].status, PoseStatus::Held);
            assert!(!next.contains_key(&2));
        }
    }

    #[test]
    fn untracked_ids_are_ignored() {
        let mut tracker = MarkerPoseTracker::new([1]);
        let out = tracker.update_and_get(&[det_with_edge(9, 1.0, 0.0)], None);
        assert!(out.is_empty());
        assert!(tracker.last_known(9).is_none());
    }

    #[test]
    fn zero_seed_reports_before_first_detection() {
        let mut tracker = MarkerPoseTracker::new([1, 2]).with_zero_seed();
        let out = tracker.update_and_get(&[], None);
        assert_eq!(out.len(), 2);
        assert_eq!(out[&2].pose, TrackedMarkerPose::ZERO);
        assert_eq!(out[&2].status, PoseStatus::Held);
    }

    #[test]
    fn first_duplicate_detection_wins() {
        let mut tracker = MarkerPoseTracker::new([1]);
        let out = tracker.update_and_get(
            &[det_with_edge(1, 1.0, 0.0), det_with_edge(1, 0.0, 1.0)],
            None,
        );
        assert_eq!(out[&1].pose.angle_deg, 0.0);
    }
}
