use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nalgebra::Point2;
use surface_track::{
    compute_transform, AnchorMap, CalibrationPolicy, CalibrationSource, CanonicalSize,
    CornerCalibrationTracker, GrayImage, MarkerDetection, MarkerPoseTracker,
};

fn anchor(id: u32, k: usize, p: (f32, f32)) -> MarkerDetection {
    let mut corners = [Point2::new(p.0, p.1); 4];
    for (i, c) in corners.iter_mut().enumerate() {
        if i != k {
            *c = Point2::new(p.0 + 8.0, p.1 + 8.0 * i as f32);
        }
    }
    MarkerDetection::new(id, corners)
}

fn calibration_source() -> CalibrationSource {
    let mut tracker =
        CornerCalibrationTracker::new(AnchorMap::default(), CalibrationPolicy::Continuous);
    tracker.update(&[
        anchor(0, 0, (210.0, 140.0)),
        anchor(4, 1, (1690.0, 170.0)),
        anchor(19, 2, (1760.0, 980.0)),
        anchor(15, 3, (160.0, 930.0)),
    ]);
    tracker.calibration_source().expect("all four anchors supplied")
}

fn textured_frame(width: usize, height: usize) -> GrayImage {
    let mut img = GrayImage::filled(width, height, 0);
    for y in 0..height {
        for x in 0..width {
            img.data[y * width + x] = ((x / 16 + y / 16) % 2 * 255) as u8;
        }
    }
    img
}

fn bench_transform(c: &mut Criterion) {
    let source = calibration_source();
    let size = CanonicalSize::default();
    c.bench_function("compute_transform", |b| {
        b.iter(|| compute_transform(black_box(&source), size))
    });

    let transform = compute_transform(&source, size).expect("valid anchors");
    c.bench_function("warp_point", |b| {
        b.iter(|| transform.warp_point(black_box(Point2::new(960.0, 540.0))))
    });

    let frame = textured_frame(1920, 1080);
    let mut group = c.benchmark_group("warp_frame");
    group.sample_size(20);
    group.bench_function("1920x1080_to_1600x900", |b| {
        b.iter(|| transform.warp_frame(black_box(&frame.view())))
    });
    group.finish();
}

fn bench_pose_update(c: &mut Criterion) {
    let detections: Vec<MarkerDetection> = (0..32)
        .map(|id| anchor(id, 0, (10.0 * id as f32, 20.0)))
        .collect();
    let mut tracker = MarkerPoseTracker::new(0..16);
    c.bench_function("pose_update_32_detections", |b| {
        b.iter(|| tracker.update_and_get(black_box(&detections), None))
    });
}

criterion_group!(benches, bench_transform, bench_pose_update);
criterion_main!(benches);
