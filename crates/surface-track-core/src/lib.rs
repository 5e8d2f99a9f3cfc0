//! Core types and utilities for planar surface tracking.
//!
//! This crate is intentionally small and purely geometric. It does *not*
//! depend on any concrete camera, marker detector or image crate.

mod homography;
mod image;
mod logger;
mod marker;

pub use homography::{homography_from_4pt, warp_perspective_gray, Homography};
pub use image::{sample_bilinear, sample_bilinear_u8, GrayImage, GrayImageView};
pub use marker::MarkerDetection;

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::{init_with_level, set_log_cycle};
