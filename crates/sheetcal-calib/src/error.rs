use sheetcal_core::{CropRect, SurfaceModelError};

/// Reasons a calibration attempt fails. Every variant is terminal for the
/// attempt; no partial result is produced.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CalibError {
    #[error("`{feature}` has {found} points, at least {required} required")]
    InsufficientPoints {
        feature: String,
        found: usize,
        required: usize,
    },

    #[error("feature detection found {matched} confident {kind}, at least {required} required")]
    FeatureDetection {
        kind: &'static str,
        matched: usize,
        required: usize,
    },

    #[error("distortion fit needs {required} independent lines, got {lines}")]
    UnderdeterminedFit { lines: usize, required: usize },

    #[error("distortion fit did not converge after {iterations} iterations (best rms {best_residual:.4} px)")]
    FitDidNotConverge {
        best_residual: f64,
        iterations: usize,
    },

    #[error("degenerate homography: {reason}")]
    DegenerateHomography { reason: String },

    #[error(
        "crop out of bounds: region {unclamped:?} keeps {retained:.3} of its area inside a {frame_width}x{frame_height} frame"
    )]
    CropOutOfBounds {
        /// Unclamped `[x0, y0, x1, y1]` in rectified pixels.
        unclamped: [i64; 4],
        retained: f64,
        frame_width: usize,
        frame_height: usize,
    },

    #[error(transparent)]
    InvalidModel(#[from] SurfaceModelError),
}

impl CalibError {
    pub(crate) fn degenerate(reason: impl Into<String>) -> Self {
        CalibError::DegenerateHomography {
            reason: reason.into(),
        }
    }
}

/// Failures of [`crate::RectificationPipeline`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RectifyError {
    #[error("frame is {}x{}, pipeline was calibrated for {}x{}", got.0, got.1, expected.0, expected.1)]
    FrameSizeMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },

    #[error("rectified-to-image mapping is singular")]
    SingularMapping,

    #[error("crop {crop:?} does not fit a {width}x{height} rectified frame")]
    InvalidCrop {
        crop: CropRect,
        width: usize,
        height: usize,
    },
}
