//! Core types and utilities for overhead sheet calibration.
//!
//! This crate is intentionally small and purely geometric. It does *not*
//! depend on any image codec or camera backend.

mod geometry;
mod homography;
mod image;
mod logger;
mod observation;
mod surface;

pub use geometry::{CropRect, MetricRect};
pub use homography::{
    estimate_homography, homography_from_4pt, normalize_points, warp_perspective, Homography,
};
pub use image::{resize_area, sample_bilinear, sample_bilinear_u8, Frame, FrameError, FrameView};
pub use observation::{FeatureRef, LandmarkObservation, LineGroup, Observations, PointObservation};
pub use surface::{
    circle_points, Landmark, LineAxis, ModelCircle, ModelLine, SurfaceModel, SurfaceModelError,
    BACK_LINE_FT, HOG_LINE_FT, HOUSE_RADII_FT, SHEET_LENGTH_FT, SHEET_WIDTH_FT, TEE_LINE_FT,
};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::init_with_level;
