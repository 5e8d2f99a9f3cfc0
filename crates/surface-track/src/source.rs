//! Frame source and marker extractor seams, plus a JSON-lines replay backend.
//!
//! A replay file holds one record per cycle:
//!
//! ```json
//! {"detections": [{"id": 0, "corners": [[10,10],[20,10],[20,20],[10,20]]}], "rectified": [], "dropped": false}
//! ```
//!
//! `detections` are camera-frame markers, `rectified` are markers as they
//! would be found on the warped canonical raster. All fields are optional.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use image::ImageReader;
use serde::{Deserialize, Serialize};
use surface_track_core::{GrayImage, GrayImageView, MarkerDetection};

/// Why no frame is available this cycle.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame dropped")]
    Dropped,
    #[error("frame source exhausted")]
    Exhausted,
}

/// Failure to open a frame source or one of its inputs.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: invalid replay record: {source}")]
    Record {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to load image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("frame source has zero size ({width}x{height})")]
    EmptyFrame { width: usize, height: usize },
}

/// Produces one grayscale frame per cycle.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<GrayImage, FrameError>;

    /// `(width, height)` of the frames this source produces.
    fn dimensions(&self) -> (usize, usize);
}

/// Detection primitive: finds markers and their four corners in a frame.
pub trait MarkerExtractor {
    fn detect(&mut self, frame: &GrayImageView<'_>) -> Vec<MarkerDetection>;
}

impl<F: FrameSource + ?Sized> FrameSource for Box<F> {
    fn next_frame(&mut self) -> Result<GrayImage, FrameError> {
        (**self).next_frame()
    }

    fn dimensions(&self) -> (usize, usize) {
        (**self).dimensions()
    }
}

impl<E: MarkerExtractor + ?Sized> MarkerExtractor for Box<E> {
    fn detect(&mut self, frame: &GrayImageView<'_>) -> Vec<MarkerDetection> {
        (**self).detect(frame)
    }
}

/// One recorded cycle.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayRecord {
    #[serde(default)]
    pub detections: Vec<MarkerDetection>,
    #[serde(default)]
    pub rectified: Vec<MarkerDetection>,
    #[serde(default)]
    pub dropped: bool,
}

/// Parsed replay file, not yet bound to a frame geometry.
#[derive(Clone, Debug, Default)]
pub struct Replay {
    records: Vec<ReplayRecord>,
}

impl Replay {
    pub fn from_records(records: Vec<ReplayRecord>) -> Self {
        Self { records }
    }

    /// Read a JSON-lines replay file. Blank lines and `#` comments are skipped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut records = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let record = serde_json::from_str(line).map_err(|source| SourceError::Record {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            })?;
            records.push(record);
        }
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Split into a frame source and an extractor that walk the records in step.
    ///
    /// Frames are copies of `background` when given, otherwise black rasters
    /// of `frame_size`.
    pub fn into_parts(
        self,
        frame_size: (usize, usize),
        background: Option<GrayImage>,
    ) -> Result<(ReplayFrames, ReplayExtractor), SourceError> {
        let frame = background.unwrap_or_else(|| GrayImage::filled(frame_size.0, frame_size.1, 0));
        if frame.width == 0 || frame.height == 0 {
            return Err(SourceError::EmptyFrame {
                width: frame.width,
                height: frame.height,
            });
        }

        let cursor = Rc::new(RefCell::new(ReplayCursor {
            records: self.records,
            next: 0,
            current: None,
            calls: 0,
        }));
        Ok((
            ReplayFrames {
                cursor: Rc::clone(&cursor),
                frame,
            },
            ReplayExtractor { cursor },
        ))
    }
}

#[derive(Debug)]
struct ReplayCursor {
    records: Vec<ReplayRecord>,
    next: usize,
    current: Option<usize>,
    calls: usize,
}

/// Frame half of a replay.
#[derive(Debug)]
pub struct ReplayFrames {
    cursor: Rc<RefCell<ReplayCursor>>,
    frame: GrayImage,
}

impl FrameSource for ReplayFrames {
    fn next_frame(&mut self) -> Result<GrayImage, FrameError> {
        let mut cursor = self.cursor.borrow_mut();
        let idx = cursor.next;
        if idx >= cursor.records.len() {
            cursor.current = None;
            return Err(FrameError::Exhausted);
        }
        cursor.next += 1;
        cursor.calls = 0;

        if cursor.records[idx].dropped {
            cursor.current = None;
            return Err(FrameError::Dropped);
        }
        cursor.current = Some(idx);
        Ok(self.frame.clone())
    }

    fn dimensions(&self) -> (usize, usize) {
        (self.frame.width, self.frame.height)
    }
}

/// Extractor half of a replay: the first call of a cycle yields the camera
/// detections, later calls yield the rectified ones.
#[derive(Debug)]
pub struct ReplayExtractor {
    cursor: Rc<RefCell<ReplayCursor>>,
}

impl MarkerExtractor for ReplayExtractor {
    fn detect(&mut self, _frame: &GrayImageView<'_>) -> Vec<MarkerDetection> {
        let mut cursor = self.cursor.borrow_mut();
        let Some(idx) = cursor.current else {
            return Vec::new();
        };
        let first = cursor.calls == 0;
        cursor.calls += 1;

        let record = &cursor.records[idx];
        if first {
            record.detections.clone()
        } else {
            record.rectified.clone()
        }
    }
}

/// Load an image file as an 8-bit grayscale raster.
pub fn load_gray(path: impl AsRef<Path>) -> Result<GrayImage, SourceError> {
    let path = path.as_ref();
    let image_err = |source| SourceError::Image {
        path: path.to_path_buf(),
        source,
    };
    let img = ImageReader::open(path)
        .map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .decode()
        .map_err(image_err)?
        .to_luma8();

    let (w, h) = (img.width() as usize, img.height() as usize);
    GrayImage::from_raw(w, h, img.into_raw()).ok_or(SourceError::EmptyFrame {
        width: w,
        height: h,
    })
}

/// Write a grayscale raster to disk; the format follows the file extension.
pub fn save_gray(img: &GrayImage, path: impl AsRef<Path>) -> Result<(), image::ImageError> {
    let out = image::GrayImage::from_raw(img.width as u32, img.height as u32, img.data.clone())
        .ok_or_else(|| {
            image::ImageError::Parameter(image::error::ParameterError::from_kind(
                image::error::ParameterErrorKind::DimensionMismatch,
            ))
        })?;
    out.save(path)
}
