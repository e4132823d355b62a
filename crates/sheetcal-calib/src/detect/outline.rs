//! Four-corner detection of a sheet that stands out brightly against a darker
//! surround.
//!
//! The frame is binarized, the largest 4-connected bright region is taken as
//! the sheet, and its corners are the region's extremes along the two image
//! diagonals. Only suited to views where the whole sheet outline is visible.

use super::threshold::otsu_threshold_from_samples;
use super::{FeatureDetector, InputMode};
use crate::CalibError;
use log::debug;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use sheetcal_core::{FrameView, Observations, SurfaceModel};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Parameters for [`SheetOutlineDetector`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlineParams {
    /// Luma level separating sheet from surround; Otsu's level when unset.
    pub threshold: Option<u8>,
    /// Smallest accepted region, as a fraction of the frame area.
    pub min_area_fraction: f64,
    /// Agreement between region area and corner quadrilateral area below
    /// which the region is not considered four-sided.
    pub min_confidence: f64,
    /// Model landmarks at the image top-left, top-right, bottom-right and
    /// bottom-left corners of the region.
    pub corners: [String; 4],
}

impl Default for OutlineParams {
    fn default() -> Self {
        Self {
            threshold: None,
            min_area_fraction: 0.05,
            min_confidence: 0.9,
            corners: [
                "corner_far_left".to_string(),
                "corner_far_right".to_string(),
                "corner_near_right".to_string(),
                "corner_near_left".to_string(),
            ],
        }
    }
}

/// Bright region statistics gathered during the flood fill.
#[derive(Clone, Copy, Debug)]
struct Region {
    area: usize,
    /// Pixels extreme in `x + y` (min, max) and `y - x` (min, max).
    min_sum: (i64, usize, usize),
    max_sum: (i64, usize, usize),
    min_diff: (i64, usize, usize),
    max_diff: (i64, usize, usize),
}

impl Region {
    fn seed(x: usize, y: usize) -> Self {
        let s = (x + y) as i64;
        let d = y as i64 - x as i64;
        Self {
            area: 0,
            min_sum: (s, x, y),
            max_sum: (s, x, y),
            min_diff: (d, x, y),
            max_diff: (d, x, y),
        }
    }

    fn add(&mut self, x: usize, y: usize) {
        self.area += 1;
        let s = (x + y) as i64;
        let d = y as i64 - x as i64;
        if s < self.min_sum.0 {
            self.min_sum = (s, x, y);
        }
        if s > self.max_sum.0 {
            self.max_sum = (s, x, y);
        }
        if d < self.min_diff.0 {
            self.min_diff = (d, x, y);
        }
        if d > self.max_diff.0 {
            self.max_diff = (d, x, y);
        }
    }

    /// Top-left, top-right, bottom-right, bottom-left.
    fn corners(&self) -> [Point2<f64>; 4] {
        let p = |(_, x, y): (i64, usize, usize)| Point2::new(x as f64, y as f64);
        [
            p(self.min_sum),
            p(self.min_diff),
            p(self.max_sum),
            p(self.max_diff),
        ]
    }
}

fn largest_bright_region(mask: &[bool], width: usize, height: usize) -> Option<Region> {
    let mut visited = vec![false; mask.len()];
    let mut stack = Vec::new();
    let mut best: Option<Region> = None;

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }
        let mut region = Region::seed(start % width, start / width);
        visited[start] = true;
        stack.push(start);
        while let Some(i) = stack.pop() {
            let (x, y) = (i % width, i / width);
            region.add(x, y);
            let mut visit = |j: usize| {
                if mask[j] && !visited[j] {
                    visited[j] = true;
                    stack.push(j);
                }
            };
            if x > 0 {
                visit(i - 1);
            }
            if x + 1 < width {
                visit(i + 1);
            }
            if y > 0 {
                visit(i - width);
            }
            if y + 1 < height {
                visit(i + width);
            }
        }
        if best.is_none_or(|b| region.area > b.area) {
            best = Some(region);
        }
    }
    best
}

fn polygon_area(pts: &[Point2<f64>; 4]) -> f64 {
    let twice: f64 = (0..4)
        .map(|i| {
            let (a, b) = (pts[i], pts[(i + 1) % 4]);
            a.x * b.y - b.x * a.y
        })
        .sum();
    0.5 * twice.abs()
}

/// Finds the four sheet corners as landmarks.
#[derive(Clone, Debug, Default)]
pub struct SheetOutlineDetector {
    params: OutlineParams,
}

impl SheetOutlineDetector {
    pub fn new(params: OutlineParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &OutlineParams {
        &self.params
    }
}

impl FeatureDetector for SheetOutlineDetector {
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, image, model), fields(w = image.width, h = image.height))
    )]
    fn detect(
        &self,
        image: &FrameView<'_>,
        model: &SurfaceModel,
    ) -> Result<Observations, CalibError> {
        let p = &self.params;
        let known = p
            .corners
            .iter()
            .filter(|id| model.landmark(id).is_some())
            .count();
        if known < 4 {
            return Err(CalibError::FeatureDetection {
                kind: "outline corners known to the model",
                matched: known,
                required: 4,
            });
        }

        let luma = image.to_luma();
        let threshold = p
            .threshold
            .unwrap_or_else(|| otsu_threshold_from_samples(&luma.data));
        let mask: Vec<bool> = luma.data.iter().map(|&v| v > threshold).collect();

        let outline_missing = CalibError::FeatureDetection {
            kind: "sheet outline",
            matched: 0,
            required: 1,
        };
        let region = largest_bright_region(&mask, luma.width, luma.height)
            .ok_or_else(|| outline_missing.clone())?;
        let frame_area = (luma.width * luma.height) as f64;
        if (region.area as f64) < p.min_area_fraction * frame_area {
            debug!(
                "outline: largest region {} px below {:.0} px",
                region.area,
                p.min_area_fraction * frame_area
            );
            return Err(outline_missing);
        }

        let corners = region.corners();
        let quad_area = polygon_area(&corners);
        let pixels = region.area as f64;
        let confidence = if quad_area > 0.0 {
            (quad_area / pixels).min(pixels / quad_area)
        } else {
            0.0
        };
        debug!(
            "outline: threshold {threshold}, region {} px, quad {quad_area:.0} px, confidence {confidence:.3}",
            region.area
        );
        if confidence < p.min_confidence {
            return Err(outline_missing);
        }

        let mut obs = Observations::new();
        for (id, pixel) in p.corners.iter().zip(corners) {
            obs.push_landmark(id.clone(), pixel, confidence as f32);
        }
        Ok(obs)
    }

    fn mode(&self) -> InputMode {
        InputMode::Automatic
    }
}
