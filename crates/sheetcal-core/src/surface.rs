//! Metric layout of the playing surface.
//!
//! Coordinates: `x` runs across the sheet width, `y` along its length, both
//! starting at the far-left corner. Units are whatever the model is built in
//! (feet for [`SurfaceModel::curling_sheet`]).

use crate::MetricRect;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Sheet width in feet.
pub const SHEET_WIDTH_FT: f64 = 14.5;
/// Sheet length in feet.
pub const SHEET_LENGTH_FT: f64 = 146.0;
/// Distance from each end to its back line.
pub const BACK_LINE_FT: f64 = 10.0;
/// Distance from each end to its tee line.
pub const TEE_LINE_FT: f64 = 16.0;
/// Distance from each end to its hog line.
pub const HOG_LINE_FT: f64 = 37.0;
/// House ring radii, outermost first (12 ft, 8 ft, 4 ft rings and the button).
pub const HOUSE_RADII_FT: [f64; 4] = [6.0, 4.0, 2.0, 0.5];

const GEOM_TOL: f64 = 1e-9;

/// Errors raised by [`SurfaceModel::validate`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SurfaceModelError {
    #[error("model extent must have positive width and height")]
    InvalidExtent,

    #[error("feature id `{0}` is used more than once")]
    DuplicateId(String),

    #[error("`{id}` has a non-positive length or radius")]
    NonPositiveDistance { id: String },

    #[error("line `{id}` lies outside the model extent")]
    LineOutsideExtent { id: String },

    #[error("circle `{id}` is not centered on the centerline x={centerline}")]
    CircleOffCenterline { id: String, centerline: f64 },

    #[error("circle `{id}` has no mirrored partner about mid-length")]
    UnpairedCircle { id: String },
}

/// Orientation of a model line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineAxis {
    /// Runs along the sheet length: constant `x`.
    AlongLength,
    /// Runs across the sheet width: constant `y`.
    AcrossWidth,
}

impl LineAxis {
    pub fn other(self) -> Self {
        match self {
            LineAxis::AlongLength => LineAxis::AcrossWidth,
            LineAxis::AcrossWidth => LineAxis::AlongLength,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelLine {
    pub id: String,
    pub axis: LineAxis,
    /// Constant coordinate (`x` for along-length lines, `y` otherwise).
    pub offset: f64,
    /// Extent along the varying coordinate.
    pub span: [f64; 2],
}

impl ModelLine {
    pub fn new(id: impl Into<String>, axis: LineAxis, offset: f64, span: [f64; 2]) -> Self {
        Self {
            id: id.into(),
            axis,
            offset,
            span,
        }
    }

    /// Point at parameter `t` along the varying coordinate.
    pub fn point_at(&self, t: f64) -> Point2<f64> {
        match self.axis {
            LineAxis::AlongLength => Point2::new(self.offset, t),
            LineAxis::AcrossWidth => Point2::new(t, self.offset),
        }
    }

    pub fn length(&self) -> f64 {
        self.span[1] - self.span[0]
    }

    pub fn endpoints(&self) -> [Point2<f64>; 2] {
        [self.point_at(self.span[0]), self.point_at(self.span[1])]
    }

    /// `n >= 2` evenly spaced points covering the whole span.
    pub fn sample(&self, n: usize) -> Vec<Point2<f64>> {
        let n = n.max(2);
        (0..n)
            .map(|i| {
                let t = i as f64 / (n - 1) as f64;
                self.point_at(self.span[0] + t * self.length())
            })
            .collect()
    }

    fn covers(&self, t: f64) -> bool {
        t >= self.span[0] - GEOM_TOL && t <= self.span[1] + GEOM_TOL
    }

    /// Crossing point with a perpendicular line, if it lies on both spans.
    pub fn intersect(&self, other: &ModelLine) -> Option<Point2<f64>> {
        if self.axis == other.axis {
            return None;
        }
        if !self.covers(other.offset) || !other.covers(self.offset) {
            return None;
        }
        Some(self.point_at(other.offset))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelCircle {
    pub id: String,
    pub center: Point2<f64>,
    /// Concentric ring radii, outermost first.
    pub radii: Vec<f64>,
}

impl ModelCircle {
    pub fn outer_radius(&self) -> f64 {
        self.radii.first().copied().unwrap_or(0.0)
    }

    /// `n` points on the ring of the given radius.
    pub fn ring_points(&self, radius: f64, n: usize) -> Vec<Point2<f64>> {
        circle_points(self.center, radius, n)
    }
}

/// Named point with a known metric position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub id: String,
    pub position: Point2<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurfaceModel {
    pub name: String,
    pub extent: MetricRect,
    pub lines: Vec<ModelLine>,
    #[serde(default)]
    pub circles: Vec<ModelCircle>,
    #[serde(default)]
    pub landmarks: Vec<Landmark>,
}

impl Default for SurfaceModel {
    fn default() -> Self {
        Self::curling_sheet()
    }
}

impl SurfaceModel {
    /// Standard curling sheet in feet, far end at `y = 0`.
    pub fn curling_sheet() -> Self {
        let w = SHEET_WIDTH_FT;
        let l = SHEET_LENGTH_FT;
        let cx = 0.5 * w;

        let along = |id: &str, x: f64| ModelLine::new(id, LineAxis::AlongLength, x, [0.0, l]);
        let across = |id: &str, y: f64| ModelLine::new(id, LineAxis::AcrossWidth, y, [0.0, w]);

        let lines = vec![
            along("side_left", 0.0),
            along("center_line", cx),
            along("side_right", w),
            across("back_far", BACK_LINE_FT),
            across("tee_far", TEE_LINE_FT),
            across("hog_far", HOG_LINE_FT),
            across("hog_near", l - HOG_LINE_FT),
            across("tee_near", l - TEE_LINE_FT),
            across("back_near", l - BACK_LINE_FT),
        ];

        let house = |id: &str, y: f64| ModelCircle {
            id: id.to_string(),
            center: Point2::new(cx, y),
            radii: HOUSE_RADII_FT.to_vec(),
        };
        let circles = vec![house("house_far", TEE_LINE_FT), house("house_near", l - TEE_LINE_FT)];

        let corner = |id: &str, x: f64, y: f64| Landmark {
            id: id.to_string(),
            position: Point2::new(x, y),
        };
        let landmarks = vec![
            corner("corner_far_left", 0.0, 0.0),
            corner("corner_far_right", w, 0.0),
            corner("corner_near_right", w, l),
            corner("corner_near_left", 0.0, l),
        ];

        Self {
            name: "curling_sheet".to_string(),
            extent: MetricRect::new(0.0, 0.0, w, l),
            lines,
            circles,
            landmarks,
        }
    }

    pub fn centerline_x(&self) -> f64 {
        0.5 * (self.extent.min_x + self.extent.max_x)
    }

    pub fn mid_length_y(&self) -> f64 {
        0.5 * (self.extent.min_y + self.extent.max_y)
    }

    pub fn line(&self, id: &str) -> Option<&ModelLine> {
        self.lines.iter().find(|l| l.id == id)
    }

    pub fn circle(&self, id: &str) -> Option<&ModelCircle> {
        self.circles.iter().find(|c| c.id == id)
    }

    /// Lines of one axis, sorted by offset.
    pub fn lines_on(&self, axis: LineAxis) -> Vec<&ModelLine> {
        let mut out: Vec<&ModelLine> = self.lines.iter().filter(|l| l.axis == axis).collect();
        out.sort_by(|a, b| a.offset.total_cmp(&b.offset));
        out
    }

    pub fn sample_line(&self, id: &str, n: usize) -> Option<Vec<Point2<f64>>> {
        self.line(id).map(|l| l.sample(n))
    }

    /// Resolve a landmark name to its metric position.
    ///
    /// Accepts explicit landmark ids, circle ids (their center) and `"a/b"`
    /// for the crossing of two perpendicular lines.
    pub fn landmark(&self, name: &str) -> Option<Point2<f64>> {
        if let Some(l) = self.landmarks.iter().find(|l| l.id == name) {
            return Some(l.position);
        }
        if let Some(c) = self.circle(name) {
            return Some(c.center);
        }
        let (a, b) = name.split_once('/')?;
        self.line(a.trim())?.intersect(self.line(b.trim())?)
    }

    /// Check the model invariants: positive extents and radii, unique ids,
    /// lines inside the extent, circles on the centerline and mirrored in
    /// pairs about mid-length.
    pub fn validate(&self) -> Result<(), SurfaceModelError> {
        if !self.extent.is_valid() {
            return Err(SurfaceModelError::InvalidExtent);
        }

        let mut seen = BTreeSet::new();
        let ids = self
            .lines
            .iter()
            .map(|l| &l.id)
            .chain(self.circles.iter().map(|c| &c.id))
            .chain(self.landmarks.iter().map(|l| &l.id));
        for id in ids {
            if !seen.insert(id.as_str()) {
                return Err(SurfaceModelError::DuplicateId(id.clone()));
            }
        }

        let tol = 1e-6 * self.extent.width().max(self.extent.height());
        for line in &self.lines {
            if line.length() <= 0.0 {
                return Err(SurfaceModelError::NonPositiveDistance {
                    id: line.id.clone(),
                });
            }
            let inside = line
                .endpoints()
                .iter()
                .all(|&p| self.extent.expanded(tol).contains(p));
            if !inside {
                return Err(SurfaceModelError::LineOutsideExtent {
                    id: line.id.clone(),
                });
            }
        }

        let cx = self.centerline_x();
        let mid = self.mid_length_y();
        for circle in &self.circles {
            if circle.radii.is_empty() || circle.radii.iter().any(|&r| r <= 0.0) {
                return Err(SurfaceModelError::NonPositiveDistance {
                    id: circle.id.clone(),
                });
            }
            if (circle.center.x - cx).abs() > tol {
                return Err(SurfaceModelError::CircleOffCenterline {
                    id: circle.id.clone(),
                    centerline: cx,
                });
            }
            let mirrored_y = 2.0 * mid - circle.center.y;
            let paired = self.circles.iter().any(|other| {
                (other.center.y - mirrored_y).abs() <= tol
                    && other.radii.len() == circle.radii.len()
                    && other
                        .radii
                        .iter()
                        .zip(&circle.radii)
                        .all(|(a, b)| (a - b).abs() <= tol)
            });
            if !paired {
                return Err(SurfaceModelError::UnpairedCircle {
                    id: circle.id.clone(),
                });
            }
        }

        Ok(())
    }
}

/// `n` points evenly spaced on a circle, starting at angle zero.
pub fn circle_points(center: Point2<f64>, radius: f64, n: usize) -> Vec<Point2<f64>> {
    (0..n)
        .map(|i| {
            let a = std::f64::consts::TAU * i as f64 / n as f64;
            Point2::new(center.x + radius * a.cos(), center.y + radius * a.sin())
        })
        .collect()
}
