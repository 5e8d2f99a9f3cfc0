//! Output coordinate convention, resolved once and applied at emission.

use serde::{Deserialize, Serialize};

use crate::pose::{normalize_degrees, PoseEstimate, PoseStatus};

/// Direction of the output y axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YAxis {
    /// Image convention: y grows downwards, angles clockwise on screen.
    #[default]
    Down,
    /// Plot convention: y grows upwards, angles counter-clockwise.
    Up,
}

/// Units of the emitted position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseUnits {
    #[default]
    Pixels,
    /// Divided by the extent width and height.
    Normalized,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinateConvention {
    #[serde(default)]
    pub y_axis: YAxis,
    #[serde(default)]
    pub units: PoseUnits,
}

/// Width and height of the space a pose was measured in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Extent {
    pub width: f64,
    pub height: f64,
}

/// Pose as delivered to a sink.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoseSample {
    pub id: u32,
    pub x: f64,
    pub y: f64,
    pub angle_deg: f64,
    pub status: PoseStatus,
}

impl CoordinateConvention {
    /// Express an image-convention pose in this convention.
    ///
    /// The y flip maps the extent onto itself (`y' = (H-1) - y`) and
    /// normalization happens after the flip.
    pub fn express(&self, id: u32, estimate: &PoseEstimate, extent: Extent) -> PoseSample {
        let pose = &estimate.pose;
        let (mut x, mut y, mut angle_deg) = (pose.center.x, pose.center.y, pose.angle_deg);

        if self.y_axis == YAxis::Up {
            y = (extent.height - 1.0) - y;
            angle_deg = normalize_degrees(360.0 - angle_deg);
        }

        if self.units == PoseUnits::Normalized {
            x /= extent.width;
            y /= extent.height;
        }

        PoseSample {
            id,
            x,
            y,
            angle_deg,
            status: estimate.status,
        }
    }
}
