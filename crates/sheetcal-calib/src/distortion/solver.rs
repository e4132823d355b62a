//! Plumb-line distortion fit: find the radial coefficients and principal
//! point that make every observed line group straight again.

use super::model::{CameraMatrix, DistortionCoefficients, DistortionModel};
use crate::lines::{fit_line, FittedLine};
use crate::CalibError;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use log::{debug, info};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn, Point2};
use serde::{Deserialize, Serialize};
use sheetcal_core::LineGroup;

#[cfg(feature = "tracing")]
use tracing::instrument;

const JACOBIAN_STEP: f64 = 1e-6;
/// Residual assigned to points that cannot be undistorted, so the optimizer
/// backs away from such parameters.
const UNDISTORT_PENALTY_PX: f64 = 1e6;
/// Lines closer than this in angle and offset count as the same line.
const COINCIDENT_ANGLE_RAD: f64 = 1.0 * std::f64::consts::PI / 180.0;
const COINCIDENT_OFFSET_PX: f64 = 2.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistortionMode {
    /// Levenberg-Marquardt plumb-line fit.
    Fit,
    /// Assume a distortion-free lens (four-corner workflow).
    Identity,
}

/// Parameters for [`DistortionSolver`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistortionFitConfig {
    pub mode: DistortionMode,
    /// Optimizer patience: at most `max_iterations * (parameters + 1)`
    /// residual evaluations.
    pub max_iterations: usize,
    /// Relative tolerance on the parameter step and on the cost reduction.
    /// Coefficients are unitless; principal point offsets are measured in
    /// focal lengths.
    pub convergence_epsilon: f64,
    /// Fixed focal length as a fraction of `max(width, height)`.
    pub focal_length_factor: f64,
    /// Also estimate the principal point (starts at the frame center).
    pub fit_principal_point: bool,
    /// Weight (per pixel of offset) of the prior pulling the principal point
    /// toward the frame center.
    pub principal_point_weight: f64,
    /// Estimate `k2` in addition to `k1`.
    pub fit_k2: bool,
    /// Distinct lines required before fitting.
    pub min_independent_lines: usize,
    /// Output field of view: 0 keeps only valid pixels, 1 keeps all source pixels.
    pub alpha: f64,
}

impl Default for DistortionFitConfig {
    fn default() -> Self {
        Self {
            mode: DistortionMode::Fit,
            max_iterations: 100,
            convergence_epsilon: 1e-8,
            focal_length_factor: 0.9,
            fit_principal_point: true,
            principal_point_weight: 1e-3,
            fit_k2: true,
            min_independent_lines: 3,
            alpha: 1.0,
        }
    }
}

/// Outcome of a converged fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistortionFit {
    pub model: DistortionModel,
    /// RMS straightness residual in pixels before correction.
    pub initial_rms: f64,
    /// RMS straightness residual in pixels after correction.
    pub residual_rms: f64,
    /// Residual evaluations spent by the optimizer.
    pub iterations: usize,
    /// Number of line groups used.
    pub lines: usize,
    pub points: usize,
}

#[derive(Clone, Debug, Default)]
pub struct DistortionSolver {
    config: DistortionFitConfig,
}

/// Maps the optimizer's parameter vector onto a camera.
struct Layout {
    width: usize,
    height: usize,
    focal: f64,
    fit_k2: bool,
    fit_pp: bool,
    pp_weight: f64,
}

impl Layout {
    fn len(&self) -> usize {
        1 + usize::from(self.fit_k2) + if self.fit_pp { 2 } else { 0 }
    }

    fn center(&self) -> (f64, f64) {
        (self.width as f64 / 2.0, self.height as f64 / 2.0)
    }

    fn decode(&self, x: &DVector<f64>) -> (CameraMatrix, DistortionCoefficients) {
        let k1 = x[0];
        let k2 = if self.fit_k2 { x[1] } else { 0.0 };
        let (mut cx, mut cy) = self.center();
        if self.fit_pp {
            let base = 1 + usize::from(self.fit_k2);
            cx += self.focal * x[base];
            cy += self.focal * x[base + 1];
        }
        (
            CameraMatrix::from_focal(self.focal, cx, cy),
            DistortionCoefficients::radial(k1, k2),
        )
    }
}

struct Problem<'a> {
    layout: Layout,
    groups: &'a [LineGroup],
    raw_lines: Vec<FittedLine>,
    raw_extents: Vec<f64>,
    points: usize,
    params: DVector<f64>,
}

impl Problem<'_> {
    /// Residual vector: extent-normalized straightness errors of every point,
    /// followed by the principal point prior. `None` when some point cannot be
    /// undistorted with these parameters.
    fn residuals_at(&self, x: &DVector<f64>) -> Option<DVector<f64>> {
        let (camera, coeffs) = self.layout.decode(x);
        let prior = if self.layout.fit_pp { 2 } else { 0 };
        let mut r = Vec::with_capacity(self.points + prior);

        for ((group, raw_line), raw_extent) in self
            .groups
            .iter()
            .zip(&self.raw_lines)
            .zip(&self.raw_extents)
        {
            let corrected = group
                .points
                .iter()
                .map(|&p| {
                    coeffs
                        .undistort(camera.normalize(p))
                        .map(|n| camera.denormalize(n))
                })
                .collect::<Option<Vec<Point2<f64>>>>()?;
            let mut line = fit_line(&corrected)?;
            // keep residual signs continuous across parameter perturbations
            if line.direction.dot(&raw_line.direction) < 0.0 {
                line.direction = -line.direction;
            }
            let extent = line.extent(&corrected);
            if extent <= 1e-9 {
                return None;
            }
            // a uniformly shrinking correction must not look like an improvement
            let scale = raw_extent / extent;
            r.extend(corrected.iter().map(|&p| {
                let d = p - line.centroid;
                d.dot(&line.normal()) * scale
            }));
        }

        if self.layout.fit_pp {
            let (cx0, cy0) = self.layout.center();
            r.push(self.layout.pp_weight * (camera.cx - cx0));
            r.push(self.layout.pp_weight * (camera.cy - cy0));
        }
        Some(DVector::from_vec(r))
    }

    fn line_rms(&self, r: &DVector<f64>) -> f64 {
        let ss: f64 = r.iter().take(self.points).map(|v| v * v).sum();
        (ss / self.points.max(1) as f64).sqrt()
    }

    fn residual_count(&self) -> usize {
        self.points + if self.layout.fit_pp { 2 } else { 0 }
    }

    /// [`Problem::residuals_at`], with unusable parameters mapped to a large
    /// constant residual of the same length.
    fn residuals_or_penalty(&self, x: &DVector<f64>) -> DVector<f64> {
        self.residuals_at(x)
            .unwrap_or_else(|| DVector::from_element(self.residual_count(), UNDISTORT_PENALTY_PX))
    }

    /// Central-difference Jacobian of the residual vector.
    fn numeric_jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        let mut j = DMatrix::<f64>::zeros(self.residual_count(), x.len());
        for c in 0..x.len() {
            let mut xp = x.clone();
            let mut xm = x.clone();
            xp[c] += JACOBIAN_STEP;
            xm[c] -= JACOBIAN_STEP;
            let col = (self.residuals_or_penalty(&xp) - self.residuals_or_penalty(&xm))
                / (2.0 * JACOBIAN_STEP);
            j.set_column(c, &col);
        }
        j
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for Problem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals_or_penalty(&self.params))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        Some(self.numeric_jacobian(&self.params))
    }
}

impl DistortionSolver {
    pub fn new(config: DistortionFitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DistortionFitConfig {
        &self.config
    }

    /// Fixed focal length used for a `width x height` frame.
    pub fn focal_length(&self, width: usize, height: usize) -> f64 {
        self.config.focal_length_factor * width.max(height) as f64
    }

    /// Fit a distortion model to raw-pixel line groups.
    ///
    /// Every group needs at least two distinct points and at least
    /// `min_independent_lines` groups must describe different lines.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, groups), fields(groups = groups.len()))
    )]
    pub fn fit(
        &self,
        groups: &[LineGroup],
        width: usize,
        height: usize,
    ) -> Result<DistortionFit, CalibError> {
        let raw_lines = validate_groups(groups)?;
        let distinct = count_distinct_lines(&raw_lines);
        if distinct < self.config.min_independent_lines {
            return Err(CalibError::UnderdeterminedFit {
                lines: distinct,
                required: self.config.min_independent_lines,
            });
        }

        let focal = self.focal_length(width, height);
        let points = groups.iter().map(|g| g.points.len()).sum();

        if self.config.mode == DistortionMode::Identity {
            let model = DistortionModel::identity(width, height, focal);
            let rms = straightness_rms(groups, &raw_lines);
            return Ok(DistortionFit {
                model,
                initial_rms: rms,
                residual_rms: rms,
                iterations: 0,
                lines: groups.len(),
                points,
            });
        }

        let layout = Layout {
            width,
            height,
            focal,
            fit_k2: self.config.fit_k2,
            fit_pp: self.config.fit_principal_point,
            pp_weight: self.config.principal_point_weight,
        };
        let problem = Problem {
            params: DVector::zeros(layout.len()),
            layout,
            groups,
            raw_extents: raw_lines
                .iter()
                .zip(groups)
                .map(|(l, g)| l.extent(&g.points))
                .collect(),
            raw_lines,
            points,
        };

        let (problem, iterations, initial_rms, residual_rms) = self.minimize(problem)?;
        let (camera, coefficients) = problem.layout.decode(&problem.params);
        let model =
            DistortionModel::with_optimal(camera, coefficients, width, height, self.config.alpha);
        info!(
            "distortion fit: k1={:.6} k2={:.6} c=({:.1}, {:.1}) rms {:.4} -> {:.4} px after {} evaluations",
            coefficients.k1,
            coefficients.k2,
            camera.cx,
            camera.cy,
            initial_rms,
            residual_rms,
            iterations
        );

        Ok(DistortionFit {
            model,
            initial_rms,
            residual_rms,
            iterations,
            lines: groups.len(),
            points,
        })
    }

    /// Run Levenberg-Marquardt from the parameters stored in `problem`.
    /// Returns `(problem, evaluations, initial_rms, final_rms)`.
    fn minimize<'a>(
        &self,
        problem: Problem<'a>,
    ) -> Result<(Problem<'a>, usize, f64, f64), CalibError> {
        let r0 = problem
            .residuals_at(&problem.params)
            .ok_or(CalibError::FitDidNotConverge {
                best_residual: f64::INFINITY,
                iterations: 0,
            })?;
        let initial_rms = problem.line_rms(&r0);
        if r0.norm_squared() <= 1e-20 * r0.len() as f64 {
            return Ok((problem, 0, initial_rms, initial_rms));
        }

        let eps = self.config.convergence_epsilon;
        let lm = LevenbergMarquardt::new()
            .with_ftol(eps)
            .with_xtol(eps)
            .with_patience(self.config.max_iterations.max(1));
        let (problem, report) = lm.minimize(problem);

        let final_rms = problem
            .residuals_at(&problem.params)
            .map_or(f64::INFINITY, |r| problem.line_rms(&r));
        debug!(
            "distortion lm: {:?} after {} evaluations, rms {initial_rms:.4} -> {final_rms:.4} px",
            report.termination, report.number_of_evaluations
        );

        // a stationary point where no step reduces the cost also counts
        let stationary = matches!(
            report.termination,
            TerminationReason::NoImprovementPossible(_)
        );
        if report.termination.was_successful() || stationary {
            Ok((problem, report.number_of_evaluations, initial_rms, final_rms))
        } else {
            Err(CalibError::FitDidNotConverge {
                best_residual: final_rms,
                iterations: match report.termination {
                    TerminationReason::LostPatience => self.config.max_iterations,
                    _ => report.number_of_evaluations,
                },
            })
        }
    }
}

/// Check per-group point counts and fit each group's raw line.
fn validate_groups(groups: &[LineGroup]) -> Result<Vec<FittedLine>, CalibError> {
    groups
        .iter()
        .map(|g| {
            fit_line(&g.points).ok_or_else(|| CalibError::InsufficientPoints {
                feature: g.id.clone(),
                found: distinct_points(&g.points),
                required: 2,
            })
        })
        .collect()
}

fn distinct_points(pts: &[Point2<f64>]) -> usize {
    let mut out: Vec<Point2<f64>> = Vec::new();
    for p in pts {
        if !out.iter().any(|q| (q - p).norm() < 1e-9) {
            out.push(*p);
        }
    }
    out.len()
}

fn count_distinct_lines(lines: &[FittedLine]) -> usize {
    let mut distinct: Vec<FittedLine> = Vec::new();
    for line in lines {
        let duplicate = distinct.iter().any(|d| {
            d.angle_to(line) < COINCIDENT_ANGLE_RAD
                && d.distance(line.centroid) < COINCIDENT_OFFSET_PX
        });
        if !duplicate {
            distinct.push(*line);
        }
    }
    distinct.len()
}

fn straightness_rms(groups: &[LineGroup], lines: &[FittedLine]) -> f64 {
    let mut ss = 0.0;
    let mut n = 0usize;
    for (g, l) in groups.iter().zip(lines) {
        for &p in &g.points {
            ss += l.distance(p).powi(2);
            n += 1;
        }
    }
    (ss / n.max(1) as f64).sqrt()
}
