//! Anchor-marker bookkeeping and calibration source derivation.
//!
//! Four anchor markers sit on the corners of the tracked surface. Each anchor
//! id is bound to one [`CornerRole`], and the role selects which of the
//! marker's own corners is used as the surface corner.

use log::{debug, info};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use surface_track_core::MarkerDetection;

/// Corner of the tracked surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CornerRole {
    TopLeft,
    TopRight,
    BottomRight,
    BottomLeft,
}

impl CornerRole {
    /// All roles in calibration order.
    pub const ALL: [CornerRole; 4] = [
        CornerRole::TopLeft,
        CornerRole::TopRight,
        CornerRole::BottomRight,
        CornerRole::BottomLeft,
    ];

    /// Index of the marker corner that represents this surface corner.
    ///
    /// This is also the role's position in [`CornerRole::ALL`].
    #[inline]
    pub fn corner_index(self) -> usize {
        match self {
            CornerRole::TopLeft => 0,
            CornerRole::TopRight => 1,
            CornerRole::BottomRight => 2,
            CornerRole::BottomLeft => 3,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AnchorMapError {
    #[error("marker id {id} is bound to both {first:?} and {second:?}")]
    DuplicateId {
        id: u32,
        first: CornerRole,
        second: CornerRole,
    },
    #[error("corner role {0:?} is bound to more than one marker id")]
    DuplicateRole(CornerRole),
    #[error("corner role {0:?} has no anchor marker")]
    MissingRole(CornerRole),
}

/// One `id -> role` entry of the anchor map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorBinding {
    pub id: u32,
    pub role: CornerRole,
}

/// Validated, injective binding of the four corner roles to marker ids.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<AnchorBinding>", into = "Vec<AnchorBinding>")]
pub struct AnchorMap {
    /// Marker id per role, indexed by [`CornerRole::corner_index`].
    ids: [u32; 4],
}

impl AnchorMap {
    pub fn new(bindings: &[AnchorBinding]) -> Result<Self, AnchorMapError> {
        let mut ids: [Option<u32>; 4] = [None; 4];
        for b in bindings {
            let slot = &mut ids[b.role.corner_index()];
            if slot.is_some() {
                return Err(AnchorMapError::DuplicateRole(b.role));
            }
            if let Some(first) = CornerRole::ALL
                .into_iter()
                .find(|r| ids[r.corner_index()] == Some(b.id))
            {
                return Err(AnchorMapError::DuplicateId {
                    id: b.id,
                    first,
                    second: b.role,
                });
            }
            ids[b.role.corner_index()] = Some(b.id);
        }

        let mut out = [0u32; 4];
        for role in CornerRole::ALL {
            out[role.corner_index()] =
                ids[role.corner_index()].ok_or(AnchorMapError::MissingRole(role))?;
        }
        Ok(Self { ids: out })
    }

    #[inline]
    pub fn role_of(&self, id: u32) -> Option<CornerRole> {
        CornerRole::ALL
            .into_iter()
            .find(|r| self.ids[r.corner_index()] == id)
    }

    #[inline]
    pub fn id_of(&self, role: CornerRole) -> u32 {
        self.ids[role.corner_index()]
    }

    #[inline]
    pub fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }

    pub fn bindings(&self) -> [AnchorBinding; 4] {
        CornerRole::ALL.map(|role| AnchorBinding {
            id: self.id_of(role),
            role,
        })
    }
}

impl Default for AnchorMap {
    /// Layout of the printed reference surface: 0, 4, 19, 15 clockwise from top-left.
    fn default() -> Self {
        Self { ids: [0, 4, 19, 15] }
    }
}

impl TryFrom<Vec<AnchorBinding>> for AnchorMap {
    type Error = AnchorMapError;

    fn try_from(bindings: Vec<AnchorBinding>) -> Result<Self, Self::Error> {
        Self::new(&bindings)
    }
}

impl From<AnchorMap> for Vec<AnchorBinding> {
    fn from(map: AnchorMap) -> Self {
        map.bindings().to_vec()
    }
}

/// Last observed camera-space point per corner role.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnchorState {
    points: [Option<Point2<f32>>; 4],
}

impl AnchorState {
    #[inline]
    pub fn get(&self, role: CornerRole) -> Option<Point2<f32>> {
        self.points[role.corner_index()]
    }

    pub fn is_complete(&self) -> bool {
        self.points.iter().all(Option::is_some)
    }

    pub fn missing_roles(&self) -> Vec<CornerRole> {
        CornerRole::ALL
            .into_iter()
            .filter(|r| self.get(*r).is_none())
            .collect()
    }

    /// All four points in calibration order, if every role has been observed.
    pub fn snapshot(&self) -> Option<[Point2<f32>; 4]> {
        let [tl, tr, br, bl] = self.points;
        Some([tl?, tr?, br?, bl?])
    }
}

/// Camera-space surface corners (TL, TR, BR, BL) used to derive the plane transform.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationSource {
    points: [Point2<f32>; 4],
    revision: u64,
}

impl CalibrationSource {
    #[inline]
    pub fn points(&self) -> &[Point2<f32>; 4] {
        &self.points
    }

    /// Increases by one every time a new source supersedes the previous one.
    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    #[inline]
    pub fn point(&self, role: CornerRole) -> Point2<f32> {
        self.points[role.corner_index()]
    }
}

/// When the calibration source follows the anchor state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPolicy {
    /// Re-derive the source whenever the complete anchor state changes.
    #[default]
    Continuous,
    /// Lock the source on the first complete anchor state.
    Freeze,
    /// Only derive the source from cycles that see all four anchors at once.
    SameFrame,
}

/// Merges anchor detections across cycles and publishes calibration sources.
#[derive(Clone, Debug)]
pub struct CornerCalibrationTracker {
    anchors: AnchorMap,
    policy: CalibrationPolicy,
    state: AnchorState,
    source: Option<CalibrationSource>,
    revision: u64,
}

impl CornerCalibrationTracker {
    pub fn new(anchors: AnchorMap, policy: CalibrationPolicy) -> Self {
        Self {
            anchors,
            policy,
            state: AnchorState::default(),
            source: None,
            revision: 0,
        }
    }

    #[inline]
    pub fn anchors(&self) -> &AnchorMap {
        &self.anchors
    }

    #[inline]
    pub fn policy(&self) -> CalibrationPolicy {
        self.policy
    }

    #[inline]
    pub fn state(&self) -> &AnchorState {
        &self.state
    }

    /// Merge one cycle of detections into the anchor state.
    ///
    /// Detections of non-anchor ids are ignored. The returned state may still
    /// be incomplete.
    pub fn update(&mut self, detections: &[MarkerDetection]) -> &AnchorState {
        let mut seen: [Option<Point2<f32>>; 4] = [None; 4];
        for det in detections {
            if let Some(role) = self.anchors.role_of(det.id) {
                seen[role.corner_index()] = Some(det.corners[role.corner_index()]);
            }
        }

        let mut changed = false;
        for (slot, point) in self.state.points.iter_mut().zip(seen) {
            if let Some(p) = point {
                changed |= *slot != Some(p);
                *slot = Some(p);
            }
        }

        match self.policy {
            CalibrationPolicy::Continuous => {
                if changed {
                    if let Some(points) = self.state.snapshot() {
                        self.publish(points);
                    }
                }
            }
            CalibrationPolicy::Freeze => {
                if self.source.is_none() {
                    if let Some(points) = self.state.snapshot() {
                        self.publish(points);
                    }
                }
            }
            CalibrationPolicy::SameFrame => {
                let [tl, tr, br, bl] = seen;
                if let (Some(tl), Some(tr), Some(br), Some(bl)) = (tl, tr, br, bl) {
                    let points = [tl, tr, br, bl];
                    if self.source.map(|s| s.points) != Some(points) {
                        self.publish(points);
                    }
                }
            }
        }

        &self.state
    }

    /// True once every anchor role has been observed at least once.
    ///
    /// Never reverts: later non-detections leave the stored points in place.
    #[inline]
    pub fn has_complete_calibration(&self) -> bool {
        self.state.is_complete()
    }

    /// Current calibration source, if the policy has produced one.
    #[inline]
    pub fn calibration_source(&self) -> Option<CalibrationSource> {
        self.source
    }

    fn publish(&mut self, points: [Point2<f32>; 4]) {
        self.revision += 1;
        if self.revision == 1 {
            info!(
                "calibration locked: TL=({:.1},{:.1}) TR=({:.1},{:.1}) BR=({:.1},{:.1}) BL=({:.1},{:.1})",
                points[0].x, points[0].y, points[1].x, points[1].y,
                points[2].x, points[2].y, points[3].x, points[3].y
            );
        } else {
            debug!("calibration source updated (revision {})", self.revision);
        }
        self.source = Some(CalibrationSource {
            points,
            revision: self.revision,
        });
    }
}
