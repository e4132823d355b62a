//! One calibration attempt: features -> lens model -> surface homography ->
//! rectified frame -> crop.

use crate::correspond::build_correspondences;
use crate::crop::compute_crop;
use crate::detect::{FeatureDetector, InputMode};
use crate::distortion::{DistortionFit, DistortionMode, DistortionModel, DistortionSolver};
use crate::error::{CalibError, RectifyError};
use crate::homography::{solve_homography, Correspondence, SurfaceHomography};
use crate::params::{AcceptanceThresholds, CalibrationConfig};
use crate::pipeline::{crop_frame, undistort_frame, warp_frame};
use crate::rectified::{bounding_rect, intersect_rects, RectifiedSpace};
use crate::session::PendingCalibration;
use log::{info, warn};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use sheetcal_core::{CropRect, Frame, FrameView, MetricRect, Observations, SurfaceModel};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Raw frame border samples per side used to outline the camera footprint.
const FOOTPRINT_SAMPLES: usize = 32;

/// Self-contained outcome of a calibration attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub frame_width: usize,
    pub frame_height: usize,
    pub mode: InputMode,
    pub distortion: DistortionFit,
    pub homography: SurfaceHomography,
    pub correspondences: Vec<Correspondence>,
    pub rectified: RectifiedSpace,
    /// Surface region the crop was computed for.
    pub roi: MetricRect,
    pub crop: CropRect,
}

/// Residuals of a result, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitError {
    pub distortion_rms_px: f64,
    pub reprojection_rms_px: f64,
}

/// Intermediate images for operator review.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationPreview {
    pub undistorted: Frame,
    pub rectified: Frame,
    pub cropped: Frame,
}

impl CalibrationResult {
    pub fn fit_error(&self) -> FitError {
        FitError {
            distortion_rms_px: self.distortion.residual_rms,
            reprojection_rms_px: self.homography.rms_error_px,
        }
    }

    /// Thresholds the result exceeds, as readable messages. Empty when the
    /// result is within `limits`.
    pub fn review(&self, limits: &AcceptanceThresholds) -> Vec<String> {
        let err = self.fit_error();
        let mut out = Vec::new();
        if err.distortion_rms_px > limits.max_distortion_rms_px {
            out.push(format!(
                "distortion residual {:.3} px exceeds {:.3} px",
                err.distortion_rms_px, limits.max_distortion_rms_px
            ));
        }
        if err.reprojection_rms_px > limits.max_reprojection_rms_px {
            out.push(format!(
                "reprojection error {:.3} px exceeds {:.3} px",
                err.reprojection_rms_px, limits.max_reprojection_rms_px
            ));
        }
        out
    }

    /// Raw pixel -> position in the cropped output.
    pub fn output_from_raw(&self, raw: Point2<f64>) -> Option<Point2<f64>> {
        let undist = self.distortion.model.undistort_pixel(raw)?;
        let metric = self.homography.metric_from_image.try_apply(undist)?;
        let rect = self.rectified.rect_from_metric().apply(metric);
        Some(Point2::new(
            rect.x - self.crop.x as f64,
            rect.y - self.crop.y as f64,
        ))
    }

    /// Run the three stages separately on a still.
    pub fn preview(&self, frame: &FrameView<'_>) -> Result<CalibrationPreview, RectifyError> {
        if (frame.width, frame.height) != (self.frame_width, self.frame_height) {
            return Err(RectifyError::FrameSizeMismatch {
                expected: (self.frame_width, self.frame_height),
                got: (frame.width, frame.height),
            });
        }
        let undistorted = undistort_frame(frame, &self.distortion.model);
        let rectified = warp_frame(&undistorted.view(), &self.homography, &self.rectified)?;
        let cropped = crop_frame(&rectified.view(), &self.crop)?;
        Ok(CalibrationPreview {
            undistorted,
            rectified,
            cropped,
        })
    }
}

/// Runs calibration attempts against one surface model.
#[derive(Clone, Debug)]
pub struct Calibrator {
    config: CalibrationConfig,
    model: SurfaceModel,
}

impl Calibrator {
    pub fn new(config: CalibrationConfig, model: SurfaceModel) -> Result<Self, CalibError> {
        model.validate()?;
        Ok(Self { config, model })
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn model(&self) -> &SurfaceModel {
        &self.model
    }

    /// Detect features on `image` and fit a result awaiting review.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, image, detector), fields(w = image.width, h = image.height))
    )]
    pub fn calibrate(
        &self,
        image: &FrameView<'_>,
        detector: &dyn FeatureDetector,
    ) -> Result<PendingCalibration, CalibError> {
        let observations = detector.detect(image, &self.model)?;
        let result =
            self.calibrate_observations(image.width, image.height, &observations, detector.mode())?;
        Ok(PendingCalibration::new(result))
    }

    /// Fit a result from already detected observations of a
    /// `width x height` frame.
    pub fn calibrate_observations(
        &self,
        width: usize,
        height: usize,
        observations: &Observations,
        mode: InputMode,
    ) -> Result<CalibrationResult, CalibError> {
        let cfg = &self.config;
        let distortion = self.fit_distortion(width, height, observations)?;

        let correspondences = build_correspondences(observations, &self.model, &distortion.model);
        let homography = solve_homography(&correspondences, &cfg.homography)?;

        let roi = match cfg.rectified.roi {
            Some(roi) => roi,
            None => self.observed_extent(observations, &distortion.model, &homography)?,
        };

        let framed = roi.expanded(cfg.rectified.border_units);
        let canvas = footprint(width, height, &distortion.model, &homography)
            .and_then(|f| intersect_rects(&f, &framed))
            .unwrap_or(framed);
        let rectified = RectifiedSpace::covering(&canvas, cfg.rectified.pixels_per_unit)
            .ok_or_else(|| CalibError::degenerate("empty rectified area"))?;

        let crop = compute_crop(
            rectified.width,
            rectified.height,
            &rectified.rect_from_metric(),
            &roi,
            &cfg.crop,
        )?;

        let result = CalibrationResult {
            frame_width: width,
            frame_height: height,
            mode,
            distortion,
            homography,
            correspondences,
            rectified,
            roi,
            crop,
        };

        let concerns = result.review(cfg.acceptance.for_mode(mode));
        for c in &concerns {
            warn!("calibration review: {c}");
        }
        info!(
            "calibrated {width}x{height} ({mode:?}): distortion rms {:.3} px, reprojection rms {:.3} px, output {}x{}",
            result.distortion.residual_rms,
            result.homography.rms_error_px,
            crop.width,
            crop.height
        );
        Ok(result)
    }

    fn fit_distortion(
        &self,
        width: usize,
        height: usize,
        observations: &Observations,
    ) -> Result<DistortionFit, CalibError> {
        let solver = DistortionSolver::new(self.config.distortion.clone());
        let groups = observations.line_groups();
        if groups.is_empty() && self.config.distortion.mode == DistortionMode::Identity {
            return Ok(DistortionFit {
                model: DistortionModel::identity(width, height, solver.focal_length(width, height)),
                initial_rms: 0.0,
                residual_rms: 0.0,
                iterations: 0,
                lines: 0,
                points: 0,
            });
        }
        solver.fit(&groups, width, height)
    }

    /// Surface bounding box of every observed point, limited to the model
    /// extent when the two overlap.
    fn observed_extent(
        &self,
        observations: &Observations,
        lens: &DistortionModel,
        homography: &SurfaceHomography,
    ) -> Result<MetricRect, CalibError> {
        let on_surface = observations.points.iter().filter_map(|o| {
            let undist = lens.undistort_pixel(o.pixel)?;
            homography.metric_from_image.try_apply(undist)
        });
        let extent = bounding_rect(on_surface)
            .ok_or_else(|| CalibError::degenerate("observed points have no surface extent"))?;
        Ok(intersect_rects(&extent, &self.model.extent).unwrap_or(extent))
    }
}

/// Surface bounding box of the raw frame border.
fn footprint(
    width: usize,
    height: usize,
    lens: &DistortionModel,
    homography: &SurfaceHomography,
) -> Option<MetricRect> {
    let (w, h) = ((width.max(1) - 1) as f64, (height.max(1) - 1) as f64);
    let n = FOOTPRINT_SAMPLES;
    let border = (0..=n).flat_map(|i| {
        let t = i as f64 / n as f64;
        [
            Point2::new(t * w, 0.0),
            Point2::new(t * w, h),
            Point2::new(0.0, t * h),
            Point2::new(w, t * h),
        ]
    });
    bounding_rect(border.filter_map(|raw| {
        let undist = lens.undistort_pixel(raw)?;
        homography.metric_from_image.try_apply(undist)
    }))
}
