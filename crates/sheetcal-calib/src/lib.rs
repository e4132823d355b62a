//! Calibration and rectification for fixed overhead sheet cameras.
//!
//! Current focus:
//! - feature detection from manual annotations or painted-line search,
//! - plumb-line lens distortion fit and robust surface homography,
//! - crop computation and a fused per-frame rectification map,
//! - two-phase promotion of reviewed results into a shared pipeline slot.
//!
//! Frame types and the surface model live in `sheetcal-core`.

mod calibrate;
mod correspond;
mod crop;
pub mod detect;
pub mod distortion;
mod error;
mod homography;
pub mod io;
mod lines;
mod params;
mod pipeline;
mod rectified;
mod session;

pub use calibrate::{CalibrationPreview, CalibrationResult, Calibrator, FitError};
pub use correspond::{build_correspondences, undistorted_lines, UndistortedLine};
pub use crop::{compute_crop, CropConfig};
pub use detect::{
    build_detector, AnnotationError, AnnotationSession, AnnotationState, AutoDetectParams,
    AutoDetector, DetectorConfig, FeatureDetector, InputMode, ManualAnnotations, ManualDetector,
    OutlineParams, SheetOutlineDetector, StripePolarity,
};
pub use distortion::{
    DistortionCoefficients, DistortionFit, DistortionFitConfig, DistortionMode, DistortionModel,
    DistortionSolver,
};
pub use error::{CalibError, RectifyError};
pub use homography::{solve_homography, Correspondence, HomographyFitConfig, SurfaceHomography};
pub use io::{load_calibration, save_calibration, CalibrationIoError};
pub use lines::{fit_line, FittedLine};
pub use params::{AcceptancePolicy, AcceptanceThresholds, CalibrationConfig};
pub use pipeline::{crop_frame, undistort_frame, warp_frame, RectificationPipeline};
pub use rectified::{bounding_rect, intersect_rects, RectifiedSpace, RectifiedSpaceConfig};
pub use session::{PendingCalibration, PipelineHandle};

pub use sheetcal_core::{Frame, FrameView, Observations, SurfaceModel};
