use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use sheetcal_core::{Homography, MetricRect};

/// Parameters of the rectified (top-down) frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RectifiedSpaceConfig {
    /// Rectified pixels per surface unit.
    pub pixels_per_unit: f64,
    /// Surface border kept around the region of interest, in surface units.
    pub border_units: f64,
    /// Region of interest in surface coordinates. `None` uses the extent of
    /// the observed features.
    pub roi: Option<MetricRect>,
}

impl Default for RectifiedSpaceConfig {
    fn default() -> Self {
        Self {
            pixels_per_unit: 20.0,
            border_units: 1.0,
            roi: None,
        }
    }
}

/// Uniformly scaled, axis-aligned view of the surface.
///
/// Rectified pixel `(0, 0)` sits at surface position `origin`; `x` and `y`
/// follow the surface axes.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RectifiedSpace {
    pub width: usize,
    pub height: usize,
    pub pixels_per_unit: f64,
    pub origin: Point2<f64>,
}

impl RectifiedSpace {
    /// Frame covering `area` at the given resolution. `None` for an empty
    /// area or a non-positive resolution.
    pub fn covering(area: &MetricRect, pixels_per_unit: f64) -> Option<Self> {
        if !area.is_valid() || pixels_per_unit.is_nan() || pixels_per_unit <= 0.0 {
            return None;
        }
        let width = (area.width() * pixels_per_unit).ceil() as usize;
        let height = (area.height() * pixels_per_unit).ceil() as usize;
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self {
            width,
            height,
            pixels_per_unit,
            origin: Point2::new(area.min_x, area.min_y),
        })
    }

    pub fn rect_from_metric(&self) -> Homography {
        let s = self.pixels_per_unit;
        Homography::scale_translate(s, s, -s * self.origin.x, -s * self.origin.y)
    }

    pub fn metric_from_rect(&self) -> Homography {
        let s = 1.0 / self.pixels_per_unit;
        Homography::scale_translate(s, s, self.origin.x, self.origin.y)
    }
}

/// Overlap of two rectangles, if it has positive area.
pub fn intersect_rects(a: &MetricRect, b: &MetricRect) -> Option<MetricRect> {
    let r = MetricRect::new(
        a.min_x.max(b.min_x),
        a.min_y.max(b.min_y),
        a.max_x.min(b.max_x),
        a.max_y.min(b.max_y),
    );
    r.is_valid().then_some(r)
}

/// Bounding box of a point cloud.
pub fn bounding_rect(pts: impl IntoIterator<Item = Point2<f64>>) -> Option<MetricRect> {
    let mut r = MetricRect::new(f64::MAX, f64::MAX, f64::MIN, f64::MIN);
    let mut any = false;
    for p in pts {
        if !p.x.is_finite() || !p.y.is_finite() {
            continue;
        }
        any = true;
        r.min_x = r.min_x.min(p.x);
        r.min_y = r.min_y.min(p.y);
        r.max_x = r.max_x.max(p.x);
        r.max_y = r.max_y.max(p.y);
    }
    (any && r.is_valid()).then_some(r)
}
