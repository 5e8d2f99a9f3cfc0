use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

/// One detected fiducial marker.
///
/// `corners` follow the marker's own local order (top-left, top-right,
/// bottom-right, bottom-left of the printed marker), independent of how the
/// marker is rotated in the image.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerDetection {
    pub id: u32,
    pub corners: [Point2<f32>; 4],
}

impl MarkerDetection {
    pub fn new(id: u32, corners: [Point2<f32>; 4]) -> Self {
        Self { id, corners }
    }

    /// Arithmetic mean of the four corners.
    pub fn center(&self) -> Point2<f64> {
        let (sx, sy) = self
            .corners
            .iter()
            .fold((0.0_f64, 0.0_f64), |(sx, sy), c| {
                (sx + c.x as f64, sy + c.y as f64)
            });
        Point2::new(sx / 4.0, sy / 4.0)
    }

    /// Edge vector `corner[1] - corner[0]` (the marker's top edge).
    pub fn heading(&self) -> Vector2<f64> {
        let [c0, c1, _, _] = self.corners;
        Vector2::new((c1.x - c0.x) as f64, (c1.y - c0.y) as f64)
    }
}
