//! High-level facade for the `sheetcal-*` workspace.
//!
//! This crate provides:
//! - re-exports of the core, calibration and capture crates
//! - [`SheetcalConfig`], the single JSON document configuring calibration
//!   and capture
//! - (feature `image`) file-backed frames plus a directory frame source and
//!   sink for the capture loop
//! - (feature `cli`) the `sheetcal` binary
//!
//! ## Quickstart
//!
//! ```no_run
//! use sheetcal::calib::{build_detector, Calibrator, ManualAnnotations, PipelineHandle};
//! use sheetcal::core::SurfaceModel;
//! use sheetcal::files::load_frame;
//! use sheetcal::SheetcalConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SheetcalConfig::load_json("sheetcal.json")?;
//! let still = load_frame("sheet3_odd_still.png")?;
//! let annotations = ManualAnnotations::load_json("sheet3_odd_lines.json")?;
//!
//! let calibrator = Calibrator::new(config.calibration.clone(), SurfaceModel::curling_sheet())?;
//! let detector = build_detector(&config.calibration.detector, Some(annotations));
//! let pending = calibrator.calibrate(&still.view(), detector.as_ref())?;
//!
//! let handle = PipelineHandle::new();
//! let pipeline = pending.accept(&handle)?;
//! let top_down = pipeline.rectify(&still.view())?;
//! println!("rectified {}x{}", top_down.width, top_down.height);
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `sheetcal::core`: frames, homographies, the surface model, observations.
//! - `sheetcal::calib`: detectors, distortion and homography fits, crop,
//!   rectification pipeline, two-phase accept, JSON records.
//! - `sheetcal::capture`: change-triggered capture loop and task handle.
//! - `sheetcal::files` (feature `image`): image files and directories.

pub use sheetcal_calib as calib;
pub use sheetcal_capture as capture;
pub use sheetcal_core as core;

pub use sheetcal_calib::{
    CalibError, CalibrationConfig, CalibrationResult, Calibrator, PendingCalibration,
    PipelineHandle, RectificationPipeline,
};
pub use sheetcal_capture::{CameraId, CaptureConfig, CaptureLoop, CaptureTask, Side};
pub use sheetcal_core::{Frame, FrameView, SurfaceModel};

mod config;

pub use config::SheetcalConfig;

#[cfg(feature = "image")]
pub mod files;
