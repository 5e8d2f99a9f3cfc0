//! Single-threaded tracking loop.
//!
//! One cycle is: acquire frame, gate detection, update calibration, refresh
//! the plane transform, measure poses, express them in the output
//! convention and hand them to the sink. [`Pipeline::run`] repeats cycles,
//! pacing them and polling a [`CancelToken`].

use std::time::Instant;

use log::{debug, info, warn};
use surface_track_core::{set_log_cycle, GrayImage};

use crate::calibration::{CornerCalibrationTracker, CornerRole};
use crate::config::{ConfigError, PoseSpace, TrackerConfig};
use crate::convention::{Extent, PoseSample};
use crate::pose::MarkerPoseTracker;
use crate::rectifier::{PlaneRectifier, PlaneTransform};
use crate::scheduler::{CancelToken, DetectionScheduler, DetectionSet, LoopPacer, Pace};
use crate::sink::PoseSink;
use crate::source::{
    FrameError, FrameSource, MarkerExtractor, Replay, ReplayExtractor, ReplayFrames, SourceError,
};

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("frame source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// What happened to the frame of a cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Processed,
    Dropped,
    Exhausted,
}

/// Outcome of one cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    pub frame: FrameStatus,
    /// A plane transform was in effect during this cycle.
    pub calibrated: bool,
    pub detection_ran: bool,
    /// Samples handed to the sink, in ascending id order.
    pub samples: Vec<PoseSample>,
}

/// Why [`Pipeline::run`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    Exhausted,
    CycleLimit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub stop: StopReason,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Waiting {
    Anchors(Vec<CornerRole>),
    Geometry,
}

/// Owns every piece of tracking state and the three collaborators.
pub struct Pipeline<S, E, K> {
    config: TrackerConfig,
    source: S,
    extractor: E,
    sink: K,
    calibration: CornerCalibrationTracker,
    rectifier: PlaneRectifier,
    poses: MarkerPoseTracker,
    scheduler: DetectionScheduler,
    pacer: LoopPacer,
    cycle: u64,
    waiting: Option<Waiting>,
    last_frame: Option<GrayImage>,
    last_warped: Option<GrayImage>,
}

impl<K: PoseSink> Pipeline<ReplayFrames, ReplayExtractor, K> {
    /// Pipeline fed by a recorded session.
    pub fn from_replay(
        config: TrackerConfig,
        replay: Replay,
        background: Option<GrayImage>,
        sink: K,
    ) -> Result<Self, PipelineError> {
        let frame_size = (
            config.frame_size.width as usize,
            config.frame_size.height as usize,
        );
        let (frames, extractor) = replay.into_parts(frame_size, background)?;
        Self::new(config, frames, extractor, sink)
    }
}

impl<S, E, K> Pipeline<S, E, K>
where
    S: FrameSource,
    E: MarkerExtractor,
    K: PoseSink,
{
    pub fn new(config: TrackerConfig, source: S, extractor: E, sink: K) -> Result<Self, PipelineError> {
        config.validate()?;
        let (width, height) = source.dimensions();
        if width == 0 || height == 0 {
            return Err(SourceError::EmptyFrame { width, height }.into());
        }

        let calibration =
            CornerCalibrationTracker::new(config.anchors.clone(), config.calibration_policy);
        let rectifier = PlaneRectifier::new(config.canonical);
        let mut poses = MarkerPoseTracker::new(config.tracked_ids.iter().copied());
        if config.seed_zero_pose {
            poses = poses.with_zero_seed();
        }
        let scheduler = DetectionScheduler::new(config.detection_interval());
        let pacer = LoopPacer::from_rate_hz(config.cycle_rate_hz);

        info!(
            "pipeline ready: {width}x{height} frames, pose space {:?}, canonical {}x{}, tracking {:?}",
            config.pose_space, config.canonical.width, config.canonical.height, config.tracked_ids
        );

        Ok(Self {
            config,
            source,
            extractor,
            sink,
            calibration,
            rectifier,
            poses,
            scheduler,
            pacer,
            cycle: 0,
            waiting: None,
            last_frame: None,
            last_warped: None,
        })
    }

    #[inline]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    #[inline]
    pub fn calibration(&self) -> &CornerCalibrationTracker {
        &self.calibration
    }

    /// Plane transform currently in effect.
    #[inline]
    pub fn transform(&self) -> Option<&PlaneTransform> {
        self.rectifier.transform()
    }

    #[inline]
    pub fn poses(&self) -> &MarkerPoseTracker {
        &self.poses
    }

    #[inline]
    pub fn sink(&self) -> &K {
        &self.sink
    }

    #[inline]
    pub fn sink_mut(&mut self) -> &mut K {
        &mut self.sink
    }

    pub fn into_sink(self) -> K {
        self.sink
    }

    /// Number of cycles stepped so far.
    #[inline]
    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    /// Canonical raster of the most recent processed frame, if calibrated.
    pub fn rectified_frame(&self) -> Option<GrayImage> {
        if let Some(warped) = &self.last_warped {
            return Some(warped.clone());
        }
        let frame = self.last_frame.as_ref()?;
        Some(self.transform()?.warp_frame(&frame.view()))
    }

    /// Run one cycle stamped with the current time.
    pub fn step(&mut self) -> CycleReport {
        self.step_at(Instant::now())
    }

    /// Run one cycle as if it started at `now`.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(cycle = self.cycle + 1)))]
    pub fn step_at(&mut self, now: Instant) -> CycleReport {
        self.cycle += 1;
        set_log_cycle(self.cycle);
        let mut report = CycleReport {
            cycle: self.cycle,
            frame: FrameStatus::Processed,
            calibrated: self.rectifier.transform().is_some(),
            detection_ran: false,
            samples: Vec::new(),
        };

        let frame = match self.source.next_frame() {
            Ok(frame) => frame,
            Err(FrameError::Dropped) => {
                warn!("no frame from source, skipping");
                report.frame = FrameStatus::Dropped;
                return report;
            }
            Err(FrameError::Exhausted) => {
                debug!("frame source exhausted");
                report.frame = FrameStatus::Exhausted;
                return report;
            }
        };

        report.detection_ran = self.scheduler.should_run(now);
        let camera = if report.detection_ran {
            self.extractor.detect(&frame.view())
        } else {
            self.scheduler.cached().camera.clone()
        };

        self.calibration.update(&camera);
        if let Some(source) = self.calibration.calibration_source() {
            if let Err(err) = self.rectifier.update(&source) {
                warn!("calibration revision {} rejected: {err}", source.revision());
            }
        }
        let transform = self.rectifier.transform().cloned();
        report.calibrated = transform.is_some();

        let mut rectified = Vec::new();
        self.last_warped = None;
        if report.detection_ran && self.config.pose_space == PoseSpace::Rectified {
            if let Some(t) = &transform {
                let warped = t.warp_frame(&frame.view());
                rectified = self.extractor.detect(&warped.view());
                self.last_warped = Some(warped);
            }
        }
        if report.detection_ran {
            self.scheduler.record(
                now,
                DetectionSet {
                    camera: camera.clone(),
                    rectified: rectified.clone(),
                },
            );
        }
        self.last_frame = Some(frame);

        if self.config.pose_space.needs_calibration() && transform.is_none() {
            self.prompt_for_calibration();
            self.flush_sink();
            return report;
        }
        if self.waiting.take().is_some() {
            info!("calibration in effect, tracking markers");
        }

        // Cached detections only keep calibration alive; poses on skipped cycles
        // are held, as if every marker had gone missing.
        let estimates = if report.detection_ran {
            let (detections, projection) = match self.config.pose_space {
                PoseSpace::Camera => (&camera, None),
                PoseSpace::Projected => (&camera, transform.as_ref()),
                PoseSpace::Rectified => (&rectified, None),
            };
            self.poses.update_and_get(detections, projection)
        } else {
            self.poses.update_and_get(&[], None)
        };

        let extent = self.extent();
        report.samples = estimates
            .iter()
            .map(|(&id, estimate)| self.config.convention.express(id, estimate, extent))
            .collect();

        for sample in &report.samples {
            if let Err(err) = self.sink.emit(sample) {
                warn!("sink rejected sample for id {}: {err}", sample.id);
            }
        }
        self.flush_sink();
        report
    }

    /// Step until cancelled, the source runs dry, or `max_cycles` is reached.
    pub fn run(&mut self, cancel: &CancelToken, max_cycles: Option<u64>) -> RunSummary {
        let mut cycles = 0;
        let stop = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if max_cycles.is_some_and(|max| cycles >= max) {
                break StopReason::CycleLimit;
            }

            let start = Instant::now();
            let report = self.step_at(start);
            if report.frame == FrameStatus::Exhausted {
                break StopReason::Exhausted;
            }
            cycles += 1;

            if self.pacer.pace(start, cancel) == Pace::Cancelled {
                break StopReason::Cancelled;
            }
        };

        info!("stopped after {cycles} cycles ({stop:?})");
        RunSummary { cycles, stop }
    }

    fn extent(&self) -> Extent {
        match self.config.pose_space {
            PoseSpace::Camera => {
                let (w, h) = self.source.dimensions();
                Extent {
                    width: w as f64,
                    height: h as f64,
                }
            }
            PoseSpace::Projected | PoseSpace::Rectified => Extent {
                width: self.config.canonical.width as f64,
                height: self.config.canonical.height as f64,
            },
        }
    }

    fn prompt_for_calibration(&mut self) {
        let state = if self.calibration.has_complete_calibration() {
            Waiting::Geometry
        } else {
            Waiting::Anchors(self.calibration.state().missing_roles())
        };
        if self.waiting.as_ref() == Some(&state) {
            return;
        }
        match &state {
            Waiting::Anchors(missing) => {
                info!("waiting for all four anchor markers (missing {missing:?})")
            }
            Waiting::Geometry => {
                info!("anchor markers found but their layout is unusable, waiting for a valid quadrilateral")
            }
        }
        self.waiting = Some(state);
    }

    fn flush_sink(&mut self) {
        if let Err(err) = self.sink.flush() {
            warn!("sink flush failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::PoseStatus;
    use crate::sink::RecordingSink;
    use std::time::Duration;
    use crate::source::ReplayRecord;
    use nalgebra::Point2;
    use surface_track_core::MarkerDetection;

    fn square(id: u32, x: f32, y: f32) -> MarkerDetection {
        MarkerDetection::new(
            id,
            [
                Point2::new(x, y),
                Point2::new(x + 10.0, y),
                Point2::new(x + 10.0, y + 10.0),
                Point2::new(x, y + 10.0),
            ],
        )
    }

    fn camera_config() -> TrackerConfig {
        TrackerConfig {
            pose_space: PoseSpace::Camera,
            frame_size: crate::config::FrameSize {
                width: 64,
                height: 48,
            },
            ..TrackerConfig::default()
        }
    }

    #[test]
    fn dropped_frames_emit_nothing() {
        let replay = Replay::from_records(vec![ReplayRecord {
            dropped: true,
            ..Default::default()
        }]);
        let mut pipeline =
            Pipeline::from_replay(camera_config(), replay, None, RecordingSink::new()).expect("pipeline");

        let report = pipeline.step();
        assert_eq!(report.frame, FrameStatus::Dropped);
        assert!(report.samples.is_empty());
        assert_eq!(pipeline.step().frame, FrameStatus::Exhausted);
    }

    #[test]
    fn camera_space_tracks_without_calibration() {
        let replay = Replay::from_records(vec![ReplayRecord {
            detections: vec![square(1, 10.0, 20.0)],
            ..Default::default()
        }]);
        let mut pipeline =
            Pipeline::from_replay(camera_config(), replay, None, RecordingSink::new()).expect("pipeline");

        let report = pipeline.step();
        assert!(!report.calibrated);
        assert_eq!(report.samples.len(), 1);
        assert_eq!((report.samples[0].x, report.samples[0].y), (15.0, 25.0));
    }

    #[test]
    fn skipped_detection_reports_held_poses() {
        let record = ReplayRecord {
            detections: vec![square(1, 10.0, 20.0)],
            ..Default::default()
        };
        let config = TrackerConfig {
            detection_interval_ms: Some(30.0),
            ..camera_config()
        };
        let replay = Replay::from_records(vec![record; 2]);
        let mut pipeline =
            Pipeline::from_replay(config, replay, None, RecordingSink::new()).expect("pipeline");

        let t0 = Instant::now();
        let first = pipeline.step_at(t0);
        assert!(first.detection_ran);
        assert_eq!(first.samples[0].status, PoseStatus::Fresh);

        let second = pipeline.step_at(t0 + Duration::from_millis(10));
        assert!(!second.detection_ran);
        assert_eq!(second.samples.len(), 1);
        assert_eq!(second.samples[0].status, PoseStatus::Held);
        assert_eq!((second.samples[0].x, second.samples[0].y), (15.0, 25.0));
    }

    #[test]
    fn rectified_space_waits_for_anchors() {
        let replay = Replay::from_records(vec![ReplayRecord {
            detections: vec![square(1, 10.0, 20.0), square(0, 0.0, 0.0)],
            rectified: vec![square(1, 10.0, 20.0)],
            ..Default::default()
        }]);
        let config = TrackerConfig {
            pose_space: PoseSpace::Rectified,
            ..camera_config()
        };
        let mut pipeline =
            Pipeline::from_replay(config, replay, None, RecordingSink::new()).expect("pipeline");

        let report = pipeline.step();
        assert!(!report.calibrated);
        assert!(report.samples.is_empty());
        assert!(pipeline.rectified_frame().is_none());
    }

    #[test]
    fn run_stops_when_replay_ends() {
        let replay = Replay::from_records(vec![ReplayRecord::default(); 3]);
        let mut pipeline =
            Pipeline::from_replay(camera_config(), replay, None, RecordingSink::new()).expect("pipeline");
        let summary = pipeline.run(&CancelToken::new(), None);
        assert_eq!(
            summary,
            RunSummary {
                cycles: 3,
                stop: StopReason::Exhausted
            }
        );
    }

    #[test]
    fn run_honours_cycle_limit_and_cancellation() {
        let replay = Replay::from_records(vec![ReplayRecord::default(); 10]);
        let mut pipeline =
            Pipeline::from_replay(camera_config(), replay, None, RecordingSink::new()).expect("pipeline");
        assert_eq!(pipeline.run(&CancelToken::new(), Some(4)).stop, StopReason::CycleLimit);

        let token = CancelToken::new();
        token.cancel();
        let summary = pipeline.run(&token, None);
        assert_eq!(summary.cycles, 0);
        assert_eq!(summary.stop, StopReason::Cancelled);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = TrackerConfig {
            cycle_rate_hz: Some(-1.0),
            ..camera_config()
        };
        let res = Pipeline::from_replay(config, Replay::default(), None, RecordingSink::new());
        assert!(matches!(res, Err(PipelineError::Config(_))));
    }
}
