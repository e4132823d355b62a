use super::{FeatureDetector, InputMode};
use crate::CalibError;
use log::warn;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use sheetcal_core::{FrameView, Observations, SurfaceModel};

/// Operator-clicked raw pixels.
///
/// Besides the named form, the older `{"lines": [[[x, y], ...], ...]}`
/// layout is accepted; its lines are named `line_0`, `line_1`, ... and are
/// only useful for the distortion fit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "AnnotationsFile")]
pub struct ManualAnnotations {
    /// Points per model line id.
    pub lines: BTreeMap<String, Vec<[f64; 2]>>,
    /// Landmark name -> pixel.
    pub landmarks: BTreeMap<String, [f64; 2]>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AnnotationsFile {
    Named {
        #[serde(default)]
        lines: BTreeMap<String, Vec<[f64; 2]>>,
        #[serde(default)]
        landmarks: BTreeMap<String, [f64; 2]>,
    },
    Unnamed {
        lines: Vec<Vec<[f64; 2]>>,
    },
}

impl From<AnnotationsFile> for ManualAnnotations {
    fn from(file: AnnotationsFile) -> Self {
        match file {
            AnnotationsFile::Named { lines, landmarks } => Self { lines, landmarks },
            AnnotationsFile::Unnamed { lines } => Self {
                lines: lines
                    .into_iter()
                    .enumerate()
                    .map(|(i, pts)| (format!("line_{i}"), pts))
                    .collect(),
                landmarks: BTreeMap::new(),
            },
        }
    }
}

impl ManualAnnotations {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.landmarks.is_empty()
    }
}

/// Replays [`ManualAnnotations`] as observations.
#[derive(Clone, Debug, Default)]
pub struct ManualDetector {
    annotations: ManualAnnotations,
}

impl ManualDetector {
    pub fn new(annotations: ManualAnnotations) -> Self {
        Self { annotations }
    }

    pub fn annotations(&self) -> &ManualAnnotations {
        &self.annotations
    }
}

impl FeatureDetector for ManualDetector {
    fn detect(
        &self,
        image: &FrameView<'_>,
        _model: &SurfaceModel,
    ) -> Result<Observations, CalibError> {
        if self.annotations.is_empty() {
            return Err(CalibError::FeatureDetection {
                kind: "annotated features",
                matched: 0,
                required: 1,
            });
        }

        let inside = |p: &[f64; 2]| {
            p[0] >= 0.0 && p[1] >= 0.0 && p[0] < image.width as f64 && p[1] < image.height as f64
        };

        let mut obs = Observations::new();
        for (id, pts) in &self.annotations.lines {
            if pts.len() < 2 {
                return Err(CalibError::InsufficientPoints {
                    feature: id.clone(),
                    found: pts.len(),
                    required: 2,
                });
            }
            for p in pts {
                if !inside(p) {
                    warn!("line `{id}`: point ({:.1}, {:.1}) lies outside the frame", p[0], p[1]);
                }
                obs.push_line_point(id.as_str(), Point2::new(p[0], p[1]), 1.0);
            }
        }
        for (id, p) in &self.annotations.landmarks {
            if !inside(p) {
                warn!("landmark `{id}` lies outside the frame");
            }
            obs.push_landmark(id.as_str(), Point2::new(p[0], p[1]), 1.0);
        }
        Ok(obs)
    }

    fn mode(&self) -> InputMode {
        InputMode::Manual
    }
}
