//! Planar surface calibration and fiducial marker pose tracking.
//!
//! Four anchor markers at the corners of a surface define a mapping from the
//! camera image onto a canonical `W x H` plane. Tracked markers are then
//! reported as `(id, x, y, angle)` in that plane, with each marker's last
//! known pose standing in for cycles where it was not detected.
//!
//! The camera, the marker detector and the consumer of poses are
//! collaborators behind the [`FrameSource`], [`MarkerExtractor`] and
//! [`PoseSink`] traits. A JSON-lines [`Replay`] stands in for the first two.
//!
//! ```no_run
//! use surface_track::{CancelToken, LogSink, Pipeline, Replay, TrackerConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TrackerConfig::load_json("tracker.json")?;
//! let replay = Replay::open("session.jsonl")?;
//! let mut pipeline = Pipeline::from_replay(config, replay, None, LogSink)?;
//! pipeline.run(&CancelToken::new(), None);
//! # Ok(())
//! # }
//! ```

mod calibration;
mod config;
mod convention;
mod pipeline;
mod pose;
mod rectifier;
mod scheduler;
mod sink;
mod source;

pub use calibration::{
    AnchorBinding, AnchorMap, AnchorMapError, AnchorState, CalibrationPolicy, CalibrationSource,
    CornerCalibrationTracker, CornerRole,
};
pub use config::{ConfigError, FrameSize, PoseSpace, TrackerConfig};
pub use convention::{CoordinateConvention, Extent, PoseSample, PoseUnits, YAxis};
pub use pipeline::{CycleReport, FrameStatus, Pipeline, PipelineError, RunSummary, StopReason};
pub use pose::{
    heading_degrees, normalize_degrees, MarkerPoseTracker, PoseEstimate, PoseStatus,
    TrackedMarkerPose,
};
pub use rectifier::{compute_transform, CanonicalSize, PlaneRectifier, PlaneTransform, RectifyError};
pub use scheduler::{
    should_run_detection, CancelToken, DetectionScheduler, DetectionSet, LoopPacer, Pace,
};
pub use sink::{LogSink, OscSink, PoseSink, RecordingSink, SinkError, TextSink};
pub use source::{
    load_gray, save_gray, FrameError, FrameSource, MarkerExtractor, Replay, ReplayExtractor,
    ReplayFrames, ReplayRecord, SourceError,
};

pub use surface_track_core::{GrayImage, GrayImageView, Homography, MarkerDetection};
