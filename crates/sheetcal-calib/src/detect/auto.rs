//! Automatic detection of painted sheet lines and houses.
//!
//! Lines come in two families: along the sheet (constant surface `x`) and
//! across it (constant surface `y`). Each family is found with a Hough
//! transform restricted to its expected image direction, traced with a
//! perpendicular stripe search, and labelled by fitting a 1D scale/offset
//! between image positions and model offsets.

use super::circles::{locate_circle, CircleSearch};
use super::hough::{HoughAccumulator, HoughLine};
use super::threshold::otsu_threshold_from_samples;
use super::{FeatureDetector, InputMode};
use crate::lines::{fit_line, FittedLine};
use crate::CalibError;
use log::{debug, info};
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};
use sheetcal_core::{
    estimate_homography, sample_bilinear, FrameView, LineAxis, Observations, SurfaceModel,
};
use std::f64::consts::FRAC_PI_2;

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StripePolarity {
    /// Paint darker than the surrounding ice.
    Dark,
    Bright,
}

/// Parameters for [`AutoDetector`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoDetectParams {
    /// Image direction of the sheet's long axis, degrees from the image `x`
    /// axis (90 = the sheet runs top to bottom).
    pub long_axis_angle_deg: f64,
    /// Allowed deviation of each line family from its expected direction.
    pub angle_tolerance_deg: f64,
    pub angle_step_deg: f64,
    /// Distance from a stripe center to the flank samples on either side; a bit
    /// more than half the painted width.
    pub stripe_flank_px: f64,
    pub polarity: StripePolarity,
    /// Floor of the ridge response threshold (0..255 scale).
    pub min_contrast: f32,
    /// Hough votes (pixels) a line needs.
    pub min_votes: u32,
    pub max_lines_per_family: usize,
    /// Spacing of the samples traced along a line.
    pub sample_step_px: f64,
    /// Half width of the perpendicular stripe search.
    pub search_band_px: u32,
    /// Matching tolerance as a fraction of the smallest model line spacing.
    pub offset_tolerance_frac: f64,
    /// Fraction of traced samples that must hit the stripe.
    pub min_confidence: f32,
    pub min_lines: usize,
    pub min_circles: usize,
    /// Circle search half width as a fraction of the predicted radius.
    pub circle_search_frac: f64,
    pub circle_samples: usize,
}

impl Default for AutoDetectParams {
    fn default() -> Self {
        Self {
            long_axis_angle_deg: 90.0,
            angle_tolerance_deg: 20.0,
            angle_step_deg: 0.5,
            stripe_flank_px: 6.0,
            polarity: StripePolarity::Dark,
            min_contrast: 20.0,
            min_votes: 60,
            max_lines_per_family: 12,
            sample_step_px: 10.0,
            search_band_px: 8,
            offset_tolerance_frac: 0.3,
            min_confidence: 0.3,
            min_lines: 3,
            min_circles: 0,
            circle_search_frac: 0.25,
            circle_samples: 48,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct AutoDetector {
    params: AutoDetectParams,
}

struct Family {
    axis: LineAxis,
    /// Nominal image direction angle of the family's lines.
    phi: f64,
    /// Nominal line normal; flank samples are taken along it.
    normal: Vector2<f64>,
    /// Image direction in which the surface coordinate of this family's
    /// lines grows.
    position_axis: Vector2<f64>,
}

fn families(long_axis: f64) -> [Family; 2] {
    let (s, c) = long_axis.sin_cos();
    [
        Family {
            axis: LineAxis::AlongLength,
            phi: long_axis,
            normal: Vector2::new(-s, c),
            position_axis: Vector2::new(s, -c),
        },
        Family {
            axis: LineAxis::AcrossWidth,
            phi: long_axis - FRAC_PI_2,
            normal: Vector2::new(c, s),
            position_axis: Vector2::new(c, s),
        },
    ]
}

struct TracedLine {
    fitted: FittedLine,
    points: Vec<Point2<f64>>,
    confidence: f32,
    /// Coordinate along the family's `position_axis` at the image center.
    position: f64,
}

struct Ridge<'a> {
    img: &'a FrameView<'a>,
    flank: f64,
    polarity: StripePolarity,
}

impl Ridge<'_> {
    fn inside(&self, p: Point2<f64>) -> bool {
        p.x >= 0.0
            && p.y >= 0.0
            && p.x <= (self.img.width - 1) as f64
            && p.y <= (self.img.height - 1) as f64
    }

    /// Stripe response at `p` with flank samples along `normal`; `None` when a
    /// sample leaves the frame.
    fn at(&self, p: Point2<f64>, normal: Vector2<f64>) -> Option<f32> {
        let a = p + normal * self.flank;
        let b = p - normal * self.flank;
        if !(self.inside(p) && self.inside(a) && self.inside(b)) {
            return None;
        }
        let s = |q: Point2<f64>| sample_bilinear(self.img, q.x as f32, q.y as f32, 0);
        let (c, va, vb) = (s(p), s(a), s(b));
        Some(match self.polarity {
            StripePolarity::Dark => va.min(vb) - c,
            StripePolarity::Bright => c - va.max(vb),
        })
    }

    fn map(&self, normal: Vector2<f64>) -> Vec<f32> {
        let (w, h) = (self.img.width, self.img.height);
        let mut out = vec![0.0f32; w * h];
        for y in 0..h {
            for x in 0..w {
                if let Some(r) = self.at(Point2::new(x as f64, y as f64), normal) {
                    out[y * w + x] = r.max(0.0);
                }
            }
        }
        out
    }
}

impl AutoDetector {
    pub fn new(params: AutoDetectParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &AutoDetectParams {
        &self.params
    }

    fn center(img: &FrameView<'_>) -> Point2<f64> {
        Point2::new(img.width as f64 / 2.0, img.height as f64 / 2.0)
    }

    /// Follow a Hough line, locating the stripe center in a band around it
    /// every `sample_step_px`.
    fn trace(
        &self,
        ridge: &Ridge<'_>,
        line: &HoughLine,
        family: &Family,
        threshold: f32,
    ) -> Option<TracedLine> {
        let img = ridge.img;
        let center = Self::center(img);
        let (d, n) = (line.direction(), line.normal());
        let foot = line.foot(center);
        let half = 0.5 * ((img.width.pow(2) + img.height.pow(2)) as f64).sqrt();
        let step = self.params.sample_step_px.max(1.0);
        let band = self.params.search_band_px as i32;

        let mut samples = 0usize;
        let mut points = Vec::new();
        let mut t = -half;
        while t <= half {
            let p = foot + d * t;
            t += step;
            if !ridge.inside(p) {
                continue;
            }
            samples += 1;

            let responses: Vec<(f64, f32)> = (-band..=band)
                .filter_map(|o| {
                    let r = ridge.at(p + n * o as f64, family.normal)?;
                    Some((o as f64, r))
                })
                .collect();
            let peak = responses.iter().map(|r| r.1).fold(f32::MIN, f32::max);
            if peak < threshold {
                continue;
            }
            let (sw, swo) = responses
                .iter()
                .filter(|r| r.1 >= 0.5 * peak)
                .fold((0.0f64, 0.0f64), |(sw, swo), &(o, r)| {
                    (sw + r as f64, swo + r as f64 * o)
                });
            points.push(p + n * (swo / sw));
        }

        if samples == 0 {
            return None;
        }
        let fitted = fit_line(&points)?;
        let along = (center - fitted.centroid).dot(&fitted.direction);
        let at = fitted.centroid + fitted.direction * along;
        Some(TracedLine {
            position: family.position_axis.dot(&at.coords),
            confidence: points.len() as f32 / samples as f32,
            fitted,
            points,
        })
    }

    fn detect_family(
        &self,
        ridge: &Ridge<'_>,
        family: &Family,
        map: &[f32],
        threshold: f32,
    ) -> Vec<TracedLine> {
        let img = ridge.img;
        let p = &self.params;
        let mut acc = HoughAccumulator::new(
            img.width,
            img.height,
            family.phi,
            p.angle_tolerance_deg.to_radians(),
            p.angle_step_deg.max(0.05).to_radians(),
        );
        for y in 0..img.height {
            for x in 0..img.width {
                if map[y * img.width + x] >= threshold {
                    acc.vote(x as f64, y as f64);
                }
            }
        }

        let peaks = acc.peaks(
            p.min_votes,
            2.0 * p.stripe_flank_px,
            Self::center(img),
            p.max_lines_per_family,
        );
        debug!("{:?}: {} Hough peaks", family.axis, peaks.len());

        peaks
            .iter()
            .filter_map(|peak| self.trace(ridge, peak, family, threshold))
            .filter(|l| {
                let keep = l.confidence >= p.min_confidence;
                if !keep {
                    debug!(
                        "{:?}: dropping line at {:.1} (confidence {:.2})",
                        family.axis, l.position, l.confidence
                    );
                }
                keep
            })
            .collect()
    }
}

/// Assign image positions to model offsets under `position = a * offset + b`
/// with `a > 0`. Every pair of detected lines is tried against every pair of
/// model lines; the hypothesis labelling the most lines (then with the
/// smallest normalized error) wins.
fn match_family(positions: &[f64], offsets: &[f64], tol_frac: f64) -> Vec<Option<usize>> {
    let mut sorted = offsets.to_vec();
    sorted.sort_by(f64::total_cmp);
    let spacing = sorted
        .windows(2)
        .map(|w| w[1] - w[0])
        .fold(f64::INFINITY, f64::min);
    if positions.len() < 2 || !spacing.is_finite() || spacing <= 0.0 {
        return vec![None; positions.len()];
    }

    let mut best: Option<(usize, f64, Vec<Option<usize>>)> = None;
    for (i, &pi) in positions.iter().enumerate() {
        for (k, &pk) in positions.iter().enumerate() {
            if i == k || pk <= pi {
                continue;
            }
            for &oj in offsets {
                for &ol in offsets {
                    if ol <= oj {
                        continue;
                    }
                    let a = (pk - pi) / (ol - oj);
                    let b = pi - a * oj;
                    let tol = tol_frac * a * spacing;

                    let mut candidates: Vec<(f64, usize, usize)> = positions
                        .iter()
                        .enumerate()
                        .filter_map(|(d, &p)| {
                            offsets
                                .iter()
                                .enumerate()
                                .map(|(m, &o)| ((p - (a * o + b)).abs(), d, m))
                                .min_by(|x, y| x.0.total_cmp(&y.0))
                                .filter(|c| c.0 <= tol)
                        })
                        .collect();
                    candidates.sort_by(|x, y| x.0.total_cmp(&y.0));

                    let mut assignment = vec![None; positions.len()];
                    let mut used = vec![false; offsets.len()];
                    let mut cost = 0.0;
                    for (err, d, m) in candidates {
                        if !used[m] {
                            used[m] = true;
                            assignment[d] = Some(m);
                            cost += err / (a * spacing);
                        }
                    }
                    let count = assignment.iter().flatten().count();
                    let better = match &best {
                        None => true,
                        Some((c, e, _)) => count > *c || (count == *c && cost < *e),
                    };
                    if better {
                        best = Some((count, cost, assignment));
                    }
                }
            }
        }
    }
    best.map(|b| b.2).unwrap_or_else(|| vec![None; positions.len()])
}

struct LabelledLine<'a> {
    id: &'a str,
    offset: f64,
    line: TracedLine,
}

impl FeatureDetector for AutoDetector {
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
        let luma = image.to_luma();
        let view = luma.view();
        let ridge = Ridge {
            img: &view,
            flank: p.stripe_flank_px,
            polarity: p.polarity,
        };
        let fams = families(p.long_axis_angle_deg.to_radians());
        let maps: Vec<Vec<f32>> = fams.iter().map(|f| ridge.map(f.normal)).collect();

        let samples: Vec<u8> = maps
            .iter()
            .flatten()
            .filter(|&&r| r > 0.0)
            .map(|&r| r.min(255.0) as u8)
            .collect();
        let threshold = (otsu_threshold_from_samples(&samples) as f32).max(p.min_contrast);
        debug!("ridge threshold {threshold:.1} from {} positive samples", samples.len());

        let mut labelled: Vec<(LineAxis, Vec<LabelledLine<'_>>)> = Vec::new();
        for (family, map) in fams.iter().zip(&maps) {
            let traced = self.detect_family(&ridge, family, map, threshold);
            let model_lines = model.lines_on(family.axis);
            let offsets: Vec<f64> = model_lines.iter().map(|l| l.offset).collect();
            let positions: Vec<f64> = traced.iter().map(|l| l.position).collect();
            let assignment = match_family(&positions, &offsets, p.offset_tolerance_frac);

            let mut lines = Vec::new();
            for (line, slot) in traced.into_iter().zip(assignment) {
                match slot {
                    Some(m) => {
                        let ml = model_lines[m];
                        lines.push(LabelledLine {
                            id: ml.id.as_str(),
                            offset: ml.offset,
                            line,
                        });
                    }
                    None => debug!("{:?}: line at {:.1} matches no model line", family.axis, line.position),
                }
            }
            labelled.push((family.axis, lines));
        }

        let matched: usize = labelled.iter().map(|(_, l)| l.len()).sum();
        if matched < p.min_lines {
            return Err(CalibError::FeatureDetection {
                kind: "lines",
                matched,
                required: p.min_lines,
            });
        }

        let mut obs = Observations::new();
        for (_, lines) in &labelled {
            for l in lines {
                for &pt in &l.line.points {
                    obs.push_line_point(l.id, pt, l.line.confidence);
                }
            }
        }

        let circles = self.detect_circles(&view, model, &labelled, &mut obs);
        if circles < p.min_circles {
            return Err(CalibError::FeatureDetection {
                kind: "circles",
                matched: circles,
                required: p.min_circles,
            });
        }

        info!("automatic detection: {matched} lines, {circles} circles");
        Ok(obs)
    }

    fn mode(&self) -> InputMode {
        InputMode::Automatic
    }
}

impl AutoDetector {
    /// Predict each house from a provisional homography through the raw line
    /// intersections and refine it by contrast. Returns the number found.
    fn detect_circles(
        &self,
        img: &FrameView<'_>,
        model: &SurfaceModel,
        labelled: &[(LineAxis, Vec<LabelledLine<'_>>)],
        obs: &mut Observations,
    ) -> usize {
        if model.circles.is_empty() {
            return 0;
        }
        let family = |axis: LineAxis| {
            labelled
                .iter()
                .filter(move |(a, _)| *a == axis)
                .flat_map(|(_, l)| l.iter())
        };

        let mut metric = Vec::new();
        let mut pixels = Vec::new();
        for a in family(LineAxis::AlongLength) {
            for b in family(LineAxis::AcrossWidth) {
                if let Some(px) = a.line.fitted.intersect(&b.line.fitted) {
                    metric.push(Point2::new(a.offset, b.offset));
                    pixels.push(px);
                }
            }
        }
        if metric.len() < 4 {
            debug!("circles: {} line intersections, need 4", metric.len());
            return 0;
        }
        let Some(image_from_metric) = estimate_homography(&metric, &pixels) else {
            debug!("circles: provisional homography failed");
            return 0;
        };

        let mut found = 0;
        for circle in &model.circles {
            let r = circle.outer_radius();
            let c = circle.center;
            let (Some(ci), Some(cx), Some(cy)) = (
                image_from_metric.try_apply(c),
                image_from_metric.try_apply(c + Vector2::new(r, 0.0)),
                image_from_metric.try_apply(c + Vector2::new(0.0, r)),
            ) else {
                continue;
            };
            if ci.x < 0.0 || ci.y < 0.0 || ci.x >= img.width as f64 || ci.y >= img.height as f64 {
                continue;
            }
            let radius_px = 0.5 * ((cx - ci).norm() + (cy - ci).norm());
            let search = CircleSearch {
                radius_px,
                search_px: self.params.circle_search_frac * radius_px,
                min_contrast: self.params.min_contrast,
                samples: self.params.circle_samples,
            };
            match locate_circle(img, ci, &search) {
                Some(hit) if hit.confidence >= self.params.min_confidence => {
                    obs.push_landmark(circle.id.as_str(), hit.center, hit.confidence);
                    found += 1;
                }
                _ => debug!("circle `{}` not found near ({:.1}, {:.1})", circle.id, ci.x, ci.y),
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetcal_core::{Frame, MetricRect, ModelLine};

    #[test]
    fn matching_is_scale_and_offset_invariant() {
        let offsets = [10.0, 16.0, 37.0, 109.0, 130.0, 136.0];
        // near end only, 12 px per foot, plus one spurious line
        let positions = [120.0 + 12.0 * 109.0, 120.0 + 12.0 * 130.0, 77.0, 120.0 + 12.0 * 136.0];
        let m = match_family(&positions, &offsets, 0.3);
        assert_eq!(m, vec![Some(3), Some(4), None, Some(5)]);
    }

    #[test]
    fn matching_needs_two_lines() {
        assert_eq!(match_family(&[5.0], &[0.0, 1.0], 0.3), vec![None]);
    }

    fn three_line_model() -> SurfaceModel {
        SurfaceModel {
            name: "three lines".into(),
            extent: MetricRect::new(0.0, 0.0, 6.0, 6.0),
            lines: vec![
                ModelLine::new("left", LineAxis::AlongLength, 0.0, [0.0, 6.0]),
                ModelLine::new("middle", LineAxis::AlongLength, 3.0, [0.0, 6.0]),
                ModelLine::new("right", LineAxis::AlongLength, 6.0, [0.0, 6.0]),
            ],
            circles: Vec::new(),
            landmarks: Vec::new(),
        }
    }

    fn striped_frame() -> Frame {
        let mut f = Frame::filled(800, 600, 1, 200);
        for x in [100, 400, 700] {
            f.fill_rect(x - 2, 0, x + 3, 600, 40);
        }
        f
    }

    #[test]
    fn finds_and_labels_vertical_stripes() {
        let frame = striped_frame();
        let obs = AutoDetector::default()
            .detect(&frame.view(), &three_line_model())
            .expect("detect");
        let groups = obs.line_groups();
        assert_eq!(groups.len(), 3);
        for (id, x) in [("left", 100.0), ("middle", 400.0), ("right", 700.0)] {
            let g = groups.iter().find(|g| g.id == id).expect("group");
            assert!(g.points.len() >= 50);
            assert!(g.confidence > 0.9);
            for p in &g.points {
                assert!((p.x - x).abs() < 1e-6, "{id}: {p:?}");
            }
        }
    }

    #[test]
    fn blank_frame_fails_detection() {
        let frame = Frame::filled(320, 240, 1, 200);
        let err = AutoDetector::default()
            .detect(&frame.view(), &three_line_model())
            .unwrap_err();
        assert_eq!(
            err,
            CalibError::FeatureDetection {
                kind: "lines",
                matched: 0,
                required: 3
            }
        );
    }
}
