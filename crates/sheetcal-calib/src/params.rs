use crate::crop::CropConfig;
use crate::detect::{DetectorConfig, InputMode};
use crate::distortion::DistortionFitConfig;
use crate::homography::HomographyFitConfig;
use crate::rectified::RectifiedSpaceConfig;
use serde::{Deserialize, Serialize};

/// Residual limits an operator should see before accepting a result.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptanceThresholds {
    /// Largest RMS line straightness residual after correction, pixels.
    pub max_distortion_rms_px: f64,
    /// Largest RMS homography reprojection error, pixels.
    pub max_reprojection_rms_px: f64,
}

impl Default for AcceptanceThresholds {
    fn default() -> Self {
        Self {
            max_distortion_rms_px: 2.0,
            max_reprojection_rms_px: 3.0,
        }
    }
}

/// Advisory thresholds per input mode. Nothing is rejected automatically;
/// see [`crate::CalibrationResult::review`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptancePolicy {
    pub manual: AcceptanceThresholds,
    pub automatic: AcceptanceThresholds,
}

impl Default for AcceptancePolicy {
    fn default() -> Self {
        Self {
            // clicked points are only good to a couple of pixels
            manual: AcceptanceThresholds::default(),
            automatic: AcceptanceThresholds {
                max_distortion_rms_px: 1.0,
                max_reprojection_rms_px: 1.5,
            },
        }
    }
}

impl AcceptancePolicy {
    pub fn for_mode(&self, mode: InputMode) -> &AcceptanceThresholds {
        match mode {
            InputMode::Manual => &self.manual,
            InputMode::Automatic => &self.automatic,
        }
    }
}

/// Everything a calibration run is configured with.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub detector: DetectorConfig,
    pub distortion: DistortionFitConfig,
    pub homography: HomographyFitConfig,
    pub rectified: RectifiedSpaceConfig,
    /// `margin_pixels` and `max_clamp_loss` sit at the top level.
    #[serde(flatten)]
    pub crop: CropConfig,
    pub acceptance: AcceptancePolicy,
}
