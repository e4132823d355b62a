//! Feature detection: turn a still frame into raw-pixel observations of
//! surface model features.
//!
//! The calibration run only sees the [`FeatureDetector`] trait; which
//! implementation runs is decided by [`DetectorConfig`].

mod annotate;
mod auto;
mod circles;
mod hough;
mod manual;
mod outline;
mod threshold;

pub use annotate::{AnnotationError, AnnotationSession, AnnotationState};
pub use auto::{AutoDetectParams, AutoDetector, StripePolarity};
pub use manual::{ManualAnnotations, ManualDetector};
pub use outline::{OutlineParams, SheetOutlineDetector};

use crate::CalibError;
use serde::{Deserialize, Serialize};
use sheetcal_core::{FrameView, Observations, SurfaceModel};

/// How the features of a calibration were obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    Manual,
    Automatic,
}

/// Source of raw-pixel feature observations for one still frame.
pub trait FeatureDetector: Send + Sync {
    fn detect(
        &self,
        image: &FrameView<'_>,
        model: &SurfaceModel,
    ) -> Result<Observations, CalibError>;

    fn mode(&self) -> InputMode;
}

/// Detector selection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorConfig {
    /// Use operator annotations.
    #[default]
    Manual,
    /// Find painted lines and houses in the image.
    Automatic(AutoDetectParams),
    /// Take the four sheet corners from the outline of a bright sheet.
    SheetOutline(OutlineParams),
}

/// Build the detector named by `config`. Annotations are only used by the
/// manual detector.
pub fn build_detector(
    config: &DetectorConfig,
    annotations: Option<ManualAnnotations>,
) -> Box<dyn FeatureDetector> {
    match config {
        DetectorConfig::Manual => Box::new(ManualDetector::new(annotations.unwrap_or_default())),
        DetectorConfig::Automatic(params) => Box::new(AutoDetector::new(params.clone())),
        DetectorConfig::SheetOutline(params) => {
            Box::new(SheetOutlineDetector::new(params.clone()))
        }
    }
}
