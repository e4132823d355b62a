//! Two-phase promotion of calibration results.
//!
//! A [`PendingCalibration`] is reviewed, then either accepted into a
//! [`PipelineHandle`] or rejected. Readers of the handle always see either
//! the old pipeline or the new one, never a mix.

use crate::calibrate::CalibrationResult;
use crate::error::RectifyError;
use crate::pipeline::RectificationPipeline;
use log::info;
use std::sync::{Arc, RwLock};

/// Shared slot holding the active pipeline of one camera.
#[derive(Clone, Debug, Default)]
pub struct PipelineHandle {
    slot: Arc<RwLock<Option<Arc<RectificationPipeline>>>>,
}

impl PipelineHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pipeline(pipeline: RectificationPipeline) -> Self {
        let handle = Self::new();
        handle.install(pipeline);
        handle
    }

    /// Snapshot of the active pipeline.
    pub fn current(&self) -> Option<Arc<RectificationPipeline>> {
        match self.slot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the active pipeline, returning the previous one.
    pub fn install(&self, pipeline: RectificationPipeline) -> Option<Arc<RectificationPipeline>> {
        self.swap(Some(Arc::new(pipeline)))
    }

    pub fn clear(&self) -> Option<Arc<RectificationPipeline>> {
        self.swap(None)
    }

    fn swap(&self, next: Option<Arc<RectificationPipeline>>) -> Option<Arc<RectificationPipeline>> {
        let mut guard = match self.slot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }
}

/// Calibration result awaiting operator review.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingCalibration {
    result: CalibrationResult,
}

impl PendingCalibration {
    pub fn new(result: CalibrationResult) -> Self {
        Self { result }
    }

    pub fn result(&self) -> &CalibrationResult {
        &self.result
    }

    /// Build the pipeline and make it active. On error nothing changes.
    pub fn accept(self, handle: &PipelineHandle) -> Result<Arc<RectificationPipeline>, RectifyError> {
        let pipeline = Arc::new(RectificationPipeline::new(self.result)?);
        let previous = handle.swap(Some(pipeline.clone()));
        info!(
            "calibration accepted ({}x{} output){}",
            pipeline.output_size().0,
            pipeline.output_size().1,
            if previous.is_some() { ", replacing previous" } else { "" }
        );
        Ok(pipeline)
    }

    /// Discard the result; the active pipeline is untouched.
    pub fn reject(self) -> CalibrationResult {
        info!("calibration rejected");
        self.result
    }

    pub fn into_result(self) -> CalibrationResult {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::InputMode;
    use crate::distortion::{DistortionFit, DistortionModel};
    use crate::homography::SurfaceHomography;
    use crate::rectified::RectifiedSpace;
    use sheetcal_core::{CropRect, Homography, MetricRect};

    fn result(crop_width: usize) -> CalibrationResult {
        let h = Homography::scale_translate(4.0, 4.0, 0.0, 0.0);
        CalibrationResult {
            frame_width: 64,
            frame_height: 64,
            mode: InputMode::Manual,
            distortion: DistortionFit {
                model: DistortionModel::identity(64, 64, 57.6),
                initial_rms: 0.0,
                residual_rms: 0.0,
                iterations: 0,
                lines: 3,
                points: 6,
            },
            homography: SurfaceHomography {
                metric_from_image: h.inverse().expect("invertible"),
                image_from_metric: h,
                condition_number: 1.0,
                rms_error_px: 0.0,
                inliers: 4,
                inlier_mask: vec![true; 4],
            },
            correspondences: Vec::new(),
            rectified: RectifiedSpace::covering(&MetricRect::new(0.0, 0.0, 16.0, 16.0), 2.0)
                .expect("space"),
            roi: MetricRect::new(1.0, 1.0, 15.0, 15.0),
            crop: CropRect {
                x: 1,
                y: 1,
                width: crop_width,
                height: 30,
            },
        }
    }

    #[test]
    fn accept_swaps_atomically() {
        let handle = PipelineHandle::new();
        assert!(handle.current().is_none());

        let first = PendingCalibration::new(result(30)).accept(&handle).expect("accept");
        let snapshot = handle.current().expect("active");
        assert!(Arc::ptr_eq(&first, &snapshot));

        let second = PendingCalibration::new(result(20)).accept(&handle).expect("accept");
        // the old snapshot stays usable and unchanged
        assert_eq!(snapshot.output_size(), (30, 30));
        assert_eq!(handle.current().expect("active").output_size(), (20, 30));
        assert!(Arc::ptr_eq(&second, &handle.current().expect("active")));
    }

    #[test]
    fn failed_accept_and_reject_keep_previous() {
        let handle = PipelineHandle::new();
        PendingCalibration::new(result(30)).accept(&handle).expect("accept");

        // crop wider than the 32 px rectified frame
        assert!(PendingCalibration::new(result(40)).accept(&handle).is_err());
        assert_eq!(handle.current().expect("active").output_size(), (30, 30));

        let rejected = PendingCalibration::new(result(10)).reject();
        assert_eq!(rejected.crop.width, 10);
        assert_eq!(handle.current().expect("active").output_size(), (30, 30));
    }
}
