//! Camera-to-plane rectification.
//!
//! The four calibration corners are mapped exactly onto the corners of the
//! canonical rectangle `(0,0), (W-1,0), (W-1,H-1), (0,H-1)`.

use log::debug;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use surface_track_core::{
    homography_from_4pt, warp_perspective_gray, GrayImage, GrayImageView, Homography,
};

use crate::calibration::CalibrationSource;

/// Size of the rectified plane in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalSize {
    pub width: u32,
    pub height: u32,
}

impl CanonicalSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Destination corners in calibration order (TL, TR, BR, BL).
    pub fn destination_corners(&self) -> [Point2<f64>; 4] {
        let w = self.width as f64 - 1.0;
        let h = self.height as f64 - 1.0;
        [
            Point2::new(0.0, 0.0),
            Point2::new(w, 0.0),
            Point2::new(w, h),
            Point2::new(0.0, h),
        ]
    }
}

impl Default for CanonicalSize {
    fn default() -> Self {
        Self::new(1600, 900)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RectifyError {
    #[error("canonical plane must be at least 2x2 pixels (got {width}x{height})")]
    InvalidSize { width: u32, height: u32 },
    #[error("degenerate anchor quadrilateral: {reason}")]
    Degenerate { reason: &'static str },
}

/// Projective mapping between camera space and the canonical plane.
#[derive(Clone, Debug, PartialEq)]
pub struct PlaneTransform {
    plane_from_img: Homography,
    img_from_plane: Homography,
    size: CanonicalSize,
    revision: u64,
}

impl PlaneTransform {
    #[inline]
    pub fn size(&self) -> CanonicalSize {
        self.size
    }

    /// Revision of the calibration source this transform was derived from.
    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Camera-to-plane homography.
    #[inline]
    pub fn homography(&self) -> &Homography {
        &self.plane_from_img
    }

    /// Map a camera-space point into the canonical plane.
    #[inline]
    pub fn warp_point(&self, p: Point2<f64>) -> Point2<f64> {
        self.plane_from_img.apply(p)
    }

    /// Map a canonical-plane point back into camera space.
    #[inline]
    pub fn unwarp_point(&self, p: Point2<f64>) -> Point2<f64> {
        self.img_from_plane.apply(p)
    }

    /// Resample `frame` into a `W x H` canonical raster.
    pub fn warp_frame(&self, frame: &GrayImageView<'_>) -> GrayImage {
        warp_perspective_gray(
            frame,
            self.img_from_plane,
            self.size.width as usize,
            self.size.height as usize,
        )
    }
}

/// Solve the exact 4-point transform from `source` onto the canonical rectangle.
///
/// Duplicate, collinear or non-convex anchor configurations are rejected
/// instead of producing a meaningless warp.
pub fn compute_transform(
    source: &CalibrationSource,
    size: CanonicalSize,
) -> Result<PlaneTransform, RectifyError> {
    if size.width < 2 || size.height < 2 {
        return Err(RectifyError::InvalidSize {
            width: size.width,
            height: size.height,
        });
    }

    let src = source.points().map(|p| Point2::new(p.x as f64, p.y as f64));
    check_quad(&src)?;

    let dst = size.destination_corners();
    let plane_from_img = homography_from_4pt(&src, &dst).ok_or(RectifyError::Degenerate {
        reason: "singular correspondence system",
    })?;
    let img_from_plane = plane_from_img.inverse().ok_or(RectifyError::Degenerate {
        reason: "transform is not invertible",
    })?;

    Ok(PlaneTransform {
        plane_from_img,
        img_from_plane,
        size,
        revision: source.revision(),
    })
}

fn cross(o: Point2<f64>, a: Point2<f64>, b: Point2<f64>) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

fn check_quad(pts: &[Point2<f64>; 4]) -> Result<(), RectifyError> {
    if pts.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return Err(RectifyError::Degenerate {
            reason: "non-finite anchor point",
        });
    }

    let (min_x, max_x, min_y, max_y) = pts.iter().fold(
        (f64::MAX, f64::MIN, f64::MAX, f64::MIN),
        |(a, b, c, d), p| (a.min(p.x), b.max(p.x), c.min(p.y), d.max(p.y)),
    );
    let extent = (max_x - min_x).max(max_y - min_y);
    let eps = 1e-6 * extent.max(1.0);

    for i in 0..4 {
        for j in (i + 1)..4 {
            if (pts[i] - pts[j]).norm() <= eps {
                return Err(RectifyError::Degenerate {
                    reason: "duplicate anchor points",
                });
            }
        }
    }

    let area_eps = eps * extent.max(1.0);
    for skip in 0..4 {
        let tri: Vec<Point2<f64>> = (0..4).filter(|&k| k != skip).map(|k| pts[k]).collect();
        if cross(tri[0], tri[1], tri[2]).abs() <= area_eps {
            return Err(RectifyError::Degenerate {
                reason: "three anchor points are collinear",
            });
        }
    }

    // Consecutive edge turns must share one sign; mirrored views are fine.
    let turns: Vec<f64> = (0..4)
        .map(|k| cross(pts[k], pts[(k + 1) % 4], pts[(k + 2) % 4]))
        .collect();
    if !(turns.iter().all(|&t| t > 0.0) || turns.iter().all(|&t| t < 0.0)) {
        return Err(RectifyError::Degenerate {
            reason: "anchor quadrilateral is not convex",
        });
    }

    Ok(())
}

/// Holds the transform for the latest accepted calibration source.
#[derive(Clone, Debug)]
pub struct PlaneRectifier {
    size: CanonicalSize,
    current: Option<PlaneTransform>,
    rejected_revision: Option<u64>,
}

impl PlaneRectifier {
    pub fn new(size: CanonicalSize) -> Self {
        Self {
            size,
            current: None,
            rejected_revision: None,
        }
    }

    #[inline]
    pub fn size(&self) -> CanonicalSize {
        self.size
    }

    /// Transform in effect, if any source has been accepted yet.
    #[inline]
    pub fn transform(&self) -> Option<&PlaneTransform> {
        self.current.as_ref()
    }

    /// Bring the transform up to date with `source`.
    ///
    /// A rejected source leaves the previous transform in place. The error is
    /// reported once per source revision; later calls with the same rejected
    /// revision return `Ok(())`.
    pub fn update(&mut self, source: &CalibrationSource) -> Result<(), RectifyError> {
        let revision = source.revision();
        if self.current.as_ref().map(PlaneTransform::revision) == Some(revision)
            || self.rejected_revision == Some(revision)
        {
            return Ok(());
        }

        match compute_transform(source, self.size) {
            Ok(transform) => {
                debug!("plane transform updated to revision {revision}");
                self.current = Some(transform);
                Ok(())
            }
            Err(err) => {
                self.rejected_revision = Some(revision);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{AnchorMap, CalibrationPolicy, CornerCalibrationTracker};
    use surface_track_core::MarkerDetection;

    fn anchor(id: u32, role_corner: usize, p: (f32, f32)) -> MarkerDetection {
        let mut corners = [Point2::new(0.0_f32, 0.0); 4];
        corners[role_corner] = Point2::new(p.0, p.1);
        for (k, c) in corners.iter_mut().enumerate() {
            if k != role_corner {
                *c = Point2::new(p.0 + k as f32, p.1 + 2.0 * k as f32);
            }
        }
        MarkerDetection::new(id, corners)
    }

    fn source_from(points: [(f32, f32); 4]) -> Option<CalibrationSource> {
        let mut tracker =
            CornerCalibrationTracker::new(AnchorMap::default(), CalibrationPolicy::Continuous);
        tracker.update(&[
            anchor(0, 0, points[0]),
            anchor(4, 1, points[1]),
            anchor(19, 2, points[2]),
            anchor(15, 3, points[3]),
        ]);
        tracker.calibration_source()
    }

    #[test]
    fn maps_anchor_corners_onto_canonical_corners() {
        let source = source_from([(120.0, 80.0), (900.0, 110.0), (950.0, 640.0), (90.0, 600.0)])
            .expect("source");
        let size = CanonicalSize::new(1600, 900);
        let t = compute_transform(&source, size).expect("transform");

        for (src, dst) in source.points().iter().zip(size.destination_corners()) {
            let q = t.warp_point(Point2::new(src.x as f64, src.y as f64));
            assert!((q - dst).norm() < 1e-6, "{q:?} vs {dst:?}");
        }
    }

    #[test]
    fn warp_and_unwarp_round_trip() {
        let source = source_from([(120.0, 80.0), (900.0, 110.0), (950.0, 640.0), (90.0, 600.0)])
            .expect("source");
        let t = compute_transform(&source, CanonicalSize::default()).expect("transform");

        for p in [
            Point2::new(0.0, 0.0),
            Point2::new(800.0, 450.0),
            Point2::new(1599.0, 899.0),
            Point2::new(1234.5, 17.25),
        ] {
            let back = t.warp_point(t.unwarp_point(p));
            assert!((back - p).norm() < 1e-3, "{back:?} vs {p:?}");
        }
    }

    #[test]
    fn rejects_collinear_and_duplicate_anchors() {
        let collinear =
            source_from([(0.0, 0.0), (100.0, 0.0), (200.0, 0.0), (0.0, 100.0)]).expect("source");
        assert!(matches!(
            compute_transform(&collinear, CanonicalSize::default()),
            Err(RectifyError::Degenerate { .. })
        ));

        let duplicate =
            source_from([(0.0, 0.0), (0.0, 0.0), (100.0, 100.0), (0.0, 100.0)]).expect("source");
        assert!(matches!(
            compute_transform(&duplicate, CanonicalSize::default()),
            Err(RectifyError::Degenerate { .. })
        ));

        let bowtie = source_from([(0.0, 0.0), (100.0, 100.0), (100.0, 0.0), (0.0, 100.0)])
            .expect("source");
        assert!(matches!(
            compute_transform(&bowtie, CanonicalSize::default()),
            Err(RectifyError::Degenerate { .. })
        ));
    }

    #[test]
    fn rejects_tiny_canonical_plane() {
        let source = source_from([(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)])
            .expect("source");
        assert_eq!(
            compute_transform(&source, CanonicalSize::new(1, 900)),
            Err(RectifyError::InvalidSize {
                width: 1,
                height: 900
            })
        );
    }

    #[test]
    fn rectifier_keeps_previous_transform_on_rejection() {
        let mut tracker =
            CornerCalibrationTracker::new(AnchorMap::default(), CalibrationPolicy::Continuous);
        tracker.update(&[
            anchor(0, 0, (0.0, 0.0)),
            anchor(4, 1, (100.0, 0.0)),
            anchor(19, 2, (100.0, 100.0)),
            anchor(15, 3, (0.0, 100.0)),
        ]);
        let mut rectifier = PlaneRectifier::new(CanonicalSize::new(200, 200));
        rectifier
            .update(&tracker.calibration_source().expect("source"))
            .expect("valid");
        let good = rectifier.transform().cloned().expect("transform");

        // Move the top-right anchor onto the top-left/bottom-left diagonal.
        tracker.update(&[anchor(4, 1, (50.0, 50.0))]);
        let bad = tracker.calibration_source().expect("source");
        assert!(rectifier.update(&bad).is_err());
        assert!(rectifier.update(&bad).is_ok());
        assert_eq!(rectifier.transform(), Some(&good));
    }

    #[test]
    fn warp_frame_samples_the_quad_interior() {
        let source = source_from([(2.0, 2.0), (7.0, 2.0), (7.0, 7.0), (2.0, 7.0)]).expect("source");
        let t = compute_transform(&source, CanonicalSize::new(6, 6)).expect("transform");

        let mut frame = GrayImage::filled(10, 10, 0);
        for y in 1..9 {
            for x in 1..9 {
                frame.data[y * 10 + x] = 200;
            }
        }
        let out = t.warp_frame(&frame.view());
        assert_eq!((out.width, out.height), (6, 6));
        assert!(out.data.iter().all(|&v| v == 200));
    }
}
