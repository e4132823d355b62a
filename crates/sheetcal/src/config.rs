use serde::{Deserialize, Serialize};
use sheetcal_calib::io::{load_json, write_json, CalibrationIoError};
use sheetcal_calib::CalibrationConfig;
use sheetcal_capture::CaptureConfig;
use std::path::Path;

/// Full configuration document: one section per stage.
///
/// ```json
/// {
///   "calibration": { "margin_pixels": 4, "distortion": { "max_iterations": 100 } },
///   "capture": { "change_threshold": 5.0, "poll_interval_ms": 1000 }
/// }
/// ```
///
/// Every field is optional and falls back to its default.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetcalConfig {
    pub calibration: CalibrationConfig,
    pub capture: CaptureConfig,
}

impl SheetcalConfig {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, CalibrationIoError> {
        load_json(path)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), CalibrationIoError> {
        write_json(self, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetcal_capture::ChangeMetric;

    #[test]
    fn nested_sections_take_defaults() {
        let cfg: SheetcalConfig = serde_json::from_str(
            r#"{
                "calibration": {
                    "margin_pixels": 10,
                    "distortion": { "max_iterations": 50, "convergence_epsilon": 1e-6 },
                    "homography": { "inlier_reprojection_multiple": 2.5 }
                },
                "capture": { "change_threshold": 7.5, "metric": { "kind": "block_max", "block": 32 } }
            }"#,
        )
        .expect("parse");

        assert_eq!(cfg.calibration.crop.margin_pixels, 10);
        assert_eq!(cfg.calibration.distortion.max_iterations, 50);
        assert_eq!(cfg.calibration.distortion.convergence_epsilon, 1e-6);
        assert_eq!(cfg.calibration.homography.inlier_reprojection_multiple, 2.5);
        assert_eq!(cfg.capture.change_threshold, 7.5);
        assert_eq!(cfg.capture.poll_interval_ms, 1000);
        assert_eq!(cfg.capture.metric, ChangeMetric::BlockMax { block: 32 });
    }

    #[test]
    fn empty_document_is_default() {
        let cfg: SheetcalConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(cfg, SheetcalConfig::default());
    }
}
