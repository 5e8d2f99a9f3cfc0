//! JSON configuration for the tracking pipeline.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::calibration::{AnchorMap, CalibrationPolicy};
use crate::convention::CoordinateConvention;
use crate::rectifier::CanonicalSize;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("canonical size must be at least 2x2 (got {width}x{height})")]
    CanonicalSize { width: u32, height: u32 },
    #[error("frame size must be non-zero (got {width}x{height})")]
    FrameSize { width: u32, height: u32 },
    #[error("{field} must be a positive finite number (got {value})")]
    NonPositive { field: &'static str, value: f64 },
}

/// Where tracked marker poses are measured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseSpace {
    /// Camera pixels; no calibration needed.
    Camera,
    /// Camera detections mapped into the canonical plane.
    Projected,
    /// Detections found on the warped canonical raster.
    #[default]
    Rectified,
}

impl PoseSpace {
    pub fn needs_calibration(self) -> bool {
        !matches!(self, PoseSpace::Camera)
    }
}

/// Camera frame size in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl Default for FrameSize {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

fn default_tracked_ids() -> Vec<u32> {
    vec![1, 2]
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub anchors: AnchorMap,
    #[serde(default = "default_tracked_ids")]
    pub tracked_ids: Vec<u32>,
    #[serde(default)]
    pub canonical: CanonicalSize,
    #[serde(default)]
    pub frame_size: FrameSize,
    #[serde(default)]
    pub pose_space: PoseSpace,
    #[serde(default)]
    pub convention: CoordinateConvention,
    #[serde(default)]
    pub calibration_policy: CalibrationPolicy,
    /// Target loop rate; unpaced when absent.
    #[serde(default)]
    pub cycle_rate_hz: Option<f64>,
    /// Minimum time between detection runs; every cycle when absent.
    #[serde(default)]
    pub detection_interval_ms: Option<f64>,
    /// Report tracked ids at the origin until they are first seen.
    #[serde(default)]
    pub seed_zero_pose: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            anchors: AnchorMap::default(),
            tracked_ids: default_tracked_ids(),
            canonical: CanonicalSize::default(),
            frame_size: FrameSize::default(),
            pose_space: PoseSpace::default(),
            convention: CoordinateConvention::default(),
            calibration_policy: CalibrationPolicy::default(),
            cycle_rate_hz: None,
            detection_interval_ms: None,
            seed_zero_pose: false,
        }
    }
}

impl TrackerConfig {
    /// Load and validate a JSON config from disk.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write this config to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Check the invariants serde cannot express. The anchor map validates itself
    /// while it is deserialized.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let CanonicalSize { width, height } = self.canonical;
        if width < 2 || height < 2 {
            return Err(ConfigError::CanonicalSize { width, height });
        }
        let FrameSize { width, height } = self.frame_size;
        if width == 0 || height == 0 {
            return Err(ConfigError::FrameSize { width, height });
        }
        check_positive("cycle_rate_hz", self.cycle_rate_hz)?;
        check_positive("detection_interval_ms", self.detection_interval_ms)?;
        Ok(())
    }

    pub fn detection_interval(&self) -> Option<Duration> {
        self.detection_interval_ms
            .map(|ms| Duration::from_secs_f64(ms / 1000.0))
    }
}

fn check_positive(field: &'static str, value: Option<f64>) -> Result<(), ConfigError> {
    match value {
        Some(v) if !(v.is_finite() && v > 0.0) => Err(ConfigError::NonPositive { field, value: v }),
        _ => Ok(()),
    }
}
