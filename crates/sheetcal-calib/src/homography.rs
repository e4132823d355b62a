//! Undistorted-pixel to surface homography with degeneracy checks, a
//! single median-based outlier pass and a reprojection-error refinement.

use crate::CalibError;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use log::{debug, warn};
use nalgebra::storage::Owned;
use nalgebra::{DVector, Dyn, Matrix2, Matrix3, Point2, U8};
use serde::{Deserialize, Serialize};
use sheetcal_core::{estimate_homography, normalize_points, Homography};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Parameters for [`solve_homography`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomographyFitConfig {
    /// Points whose reprojection error exceeds this multiple of the median
    /// are dropped before the single re-solve.
    pub inlier_reprojection_multiple: f64,
    /// Lower bound of the outlier cutoff, in pixels.
    pub min_inlier_threshold_px: f64,
    /// Largest accepted condition number of the normalized homography.
    pub max_condition_number: f64,
    /// Normalized area / spread below which points count as collinear.
    pub collinearity_tolerance: f64,
    /// Refine the linear solution by minimizing the pixel reprojection error
    /// of the inliers (more than four correspondences only).
    pub refine: bool,
    /// Optimizer patience of the refinement.
    pub refine_max_iterations: usize,
}

impl Default for HomographyFitConfig {
    fn default() -> Self {
        Self {
            inlier_reprojection_multiple: 3.0,
            min_inlier_threshold_px: 0.5,
            max_condition_number: 1e6,
            collinearity_tolerance: 1e-3,
            refine: true,
            refine_max_iterations: 50,
        }
    }
}

/// Named pair of an undistorted pixel and its surface position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    pub feature: String,
    pub image: Point2<f64>,
    pub metric: Point2<f64>,
}

/// Fitted camera-to-surface mapping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurfaceHomography {
    /// Undistorted pixel -> surface coordinates.
    pub metric_from_image: Homography,
    /// Surface coordinates -> undistorted pixel.
    pub image_from_metric: Homography,
    pub condition_number: f64,
    /// RMS reprojection error of the inliers, in pixels.
    pub rms_error_px: f64,
    pub inliers: usize,
    /// Inlier flag per input correspondence.
    pub inlier_mask: Vec<bool>,
}

/// Solve `metric ~ H * image` from at least four correspondences.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(correspondences, config), fields(n = correspondences.len()))
)]
pub fn solve_homography(
    correspondences: &[Correspondence],
    config: &HomographyFitConfig,
) -> Result<SurfaceHomography, CalibError> {
    let n = correspondences.len();
    if n < 4 {
        return Err(CalibError::InsufficientPoints {
            feature: "homography correspondences".to_string(),
            found: n,
            required: 4,
        });
    }

    let image: Vec<Point2<f64>> = correspondences.iter().map(|c| c.image).collect();
    let metric: Vec<Point2<f64>> = correspondences.iter().map(|c| c.metric).collect();

    let (h, cond) = fit_checked(&image, &metric, config)?;
    let mut errors = reprojection_errors(&h, &image, &metric)?;
    let mut mask = vec![true; n];
    let mut fit = (h, cond);

    if n > 4 {
        let cutoff = (config.inlier_reprojection_multiple * median(&errors))
            .max(config.min_inlier_threshold_px);
        let candidate: Vec<bool> = errors.iter().map(|&e| e <= cutoff).collect();
        let kept = candidate.iter().filter(|&&m| m).count();
        if kept < n && kept >= 4 {
            let (img_in, met_in) = select(&image, &metric, &candidate);
            match fit_checked(&img_in, &met_in, config) {
                Ok(refit) => {
                    debug!("homography: dropped {} of {n} correspondences (cutoff {cutoff:.2} px)", n - kept);
                    errors = reprojection_errors(&refit.0, &image, &metric)?;
                    mask = candidate;
                    fit = refit;
                }
                Err(e) => warn!("homography: inlier re-solve rejected ({e}), keeping all points"),
            }
        }
    }

    if n > 4 && config.refine {
        let (img_in, met_in) = select(&image, &metric, &mask);
        if let Some(refined) = refine_reprojection(&fit.0, &img_in, &met_in, config) {
            let refined_errors = reprojection_errors(&refined.0, &image, &metric)?;
            let before = inlier_rms(&errors, &mask);
            let after = inlier_rms(&refined_errors, &mask);
            debug!("homography: reprojection refinement {before:.4} -> {after:.4} px");
            if after <= before {
                errors = refined_errors;
                fit = refined;
            }
        }
    }

    let (metric_from_image, condition_number) = fit;
    let image_from_metric = metric_from_image
        .inverse()
        .ok_or_else(|| CalibError::degenerate("singular matrix"))?;

    let inliers = mask.iter().filter(|&&m| m).count();

    Ok(SurfaceHomography {
        metric_from_image,
        image_from_metric,
        condition_number,
        rms_error_px: inlier_rms(&errors, &mask),
        inliers,
        inlier_mask: mask,
    })
}

fn inlier_rms(errors: &[f64], mask: &[bool]) -> f64 {
    let (ss, n) = errors
        .iter()
        .zip(mask)
        .filter(|(_, &m)| m)
        .fold((0.0, 0usize), |(ss, n), (e, _)| (ss + e * e, n + 1));
    (ss / n.max(1) as f64).sqrt()
}

/// Pixel reprojection residuals of `image_from_metric`, parameterized by its
/// first eight row-major entries (`H[2][2] = 1`).
struct ReprojectionProblem<'a> {
    image: &'a [Point2<f64>],
    metric: &'a [Point2<f64>],
    params: DVector<f64>,
}

impl ReprojectionProblem<'_> {
    fn homography(&self) -> Matrix3<f64> {
        let mut entries = [1.0; 9];
        entries[..8].copy_from_slice(self.params.as_slice());
        Matrix3::from_row_slice(&entries)
    }

    /// Projection of every surface point as `(u, v, w)`.
    fn projections(&self) -> impl Iterator<Item = (f64, f64, f64)> + '_ {
        let h = self.homography();
        self.metric.iter().map(move |m| {
            let p = h * m.to_homogeneous();
            (p.x / p.z, p.y / p.z, p.z)
        })
    }
}

impl LeastSquaresProblem<f64, Dyn, U8> for ReprojectionProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U8>;
    type ParameterStorage = Owned<f64, U8>;

    fn set_params(&mut self, x: &nalgebra::SVector<f64, 8>) {
        self.params.copy_from(x);
    }

    fn params(&self) -> nalgebra::SVector<f64, 8> {
        nalgebra::SVector::<f64, 8>::from_column_slice(self.params.as_slice())
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut r = DVector::zeros(2 * self.image.len());
        for (k, ((u, v, w), i)) in self.projections().zip(self.image).enumerate() {
            if w.abs() < 1e-12 {
                return None;
            }
            r[2 * k] = u - i.x;
            r[2 * k + 1] = v - i.y;
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<nalgebra::OMatrix<f64, Dyn, U8>> {
        let mut j = nalgebra::OMatrix::<f64, Dyn, U8>::zeros(2 * self.image.len());
        for (k, ((u, v, w), m)) in self.projections().zip(self.metric).enumerate() {
            if w.abs() < 1e-12 {
                return None;
            }
            let (x, y) = (m.x / w, m.y / w);
            let inv_w = 1.0 / w;
            let du = [x, y, inv_w, 0.0, 0.0, 0.0, -u * x, -u * y];
            let dv = [0.0, 0.0, 0.0, x, y, inv_w, -v * x, -v * y];
            for c in 0..8 {
                j[(2 * k, c)] = du[c];
                j[(2 * k + 1, c)] = dv[c];
            }
        }
        Some(j)
    }
}

/// Minimize the pixel reprojection error of `metric_from_image` over the
/// given correspondences. `None` when the refined matrix is unusable.
fn refine_reprojection(
    metric_from_image: &Homography,
    image: &[Point2<f64>],
    metric: &[Point2<f64>],
    config: &HomographyFitConfig,
) -> Option<(Homography, f64)> {
    let start = metric_from_image.inverse()?.h;
    let scale = start[(2, 2)];
    if scale.abs() < 1e-12 {
        return None;
    }
    let start = start / scale;
    let params = DVector::from_iterator(8, (0..8).map(|k| start[(k / 3, k % 3)]));

    let lm = LevenbergMarquardt::new().with_patience(config.refine_max_iterations.max(1));
    let (problem, report) = lm.minimize(ReprojectionProblem {
        image,
        metric,
        params,
    });
    debug!(
        "homography refinement: {:?} after {} evaluations",
        report.termination, report.number_of_evaluations
    );

    let image_from_metric = Homography::new(problem.homography());
    if image_from_metric.h.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let refined = image_from_metric.inverse()?;
    let cond = normalized_condition_number(&refined, image, metric)?;
    (cond.is_finite() && cond <= config.max_condition_number).then_some((refined, cond))
}

fn select(
    image: &[Point2<f64>],
    metric: &[Point2<f64>],
    mask: &[bool],
) -> (Vec<Point2<f64>>, Vec<Point2<f64>>) {
    image
        .iter()
        .zip(metric)
        .zip(mask)
        .filter(|(_, &m)| m)
        .map(|((i, m), _)| (*i, *m))
        .unzip()
}

/// Solve and reject collinear, singular or badly conditioned results.
fn fit_checked(
    image: &[Point2<f64>],
    metric: &[Point2<f64>],
    config: &HomographyFitConfig,
) -> Result<(Homography, f64), CalibError> {
    check_spread(image, "image", config.collinearity_tolerance)?;
    check_spread(metric, "surface", config.collinearity_tolerance)?;

    let h = estimate_homography(image, metric)
        .ok_or_else(|| CalibError::degenerate("linear solve failed"))?;
    let cond = normalized_condition_number(&h, image, metric)
        .ok_or_else(|| CalibError::degenerate("singular matrix"))?;
    if !cond.is_finite() || cond > config.max_condition_number {
        return Err(CalibError::degenerate(format!(
            "condition number {cond:.3e} exceeds {:.3e}",
            config.max_condition_number
        )));
    }
    Ok((h, cond))
}

/// For four points no three may be collinear; for more, not all of them.
fn check_spread(pts: &[Point2<f64>], space: &str, tol: f64) -> Result<(), CalibError> {
    let (norm, _) = normalize_points(pts);
    if norm.len() == 4 {
        for skip in 0..4 {
            let tri: Vec<&Point2<f64>> = norm
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, p)| p)
                .collect();
            let area = 0.5 * (tri[1] - tri[0]).perp(&(tri[2] - tri[0])).abs();
            if area < tol {
                return Err(CalibError::degenerate(format!(
                    "three of the four {space} points are collinear"
                )));
            }
        }
        return Ok(());
    }

    // spread along the minor axis of the normalized cloud
    let mut cov = Matrix2::zeros();
    for p in &norm {
        cov += p.coords * p.coords.transpose();
    }
    cov /= norm.len() as f64;
    let eig = cov.symmetric_eigenvalues();
    let (lo, hi) = (eig.min(), eig.max());
    if hi <= 0.0 || lo / hi < tol * tol {
        return Err(CalibError::degenerate(format!("all {space} points are collinear")));
    }
    Ok(())
}

/// Condition number of `T_metric * H * T_image^-1`, i.e. of the homography
/// between Hartley-normalized point sets.
fn normalized_condition_number(
    h: &Homography,
    image: &[Point2<f64>],
    metric: &[Point2<f64>],
) -> Option<f64> {
    let (_, t_img) = normalize_points(image);
    let (_, t_met) = normalize_points(metric);
    let hn = t_met * h.h * t_img.try_inverse()?;
    let sv = hn.singular_values();
    let (lo, hi) = (sv.min(), sv.max());
    if lo <= hi * 1e-15 {
        return None;
    }
    Some(hi / lo)
}

/// Pixel distance between each observed image point and the projection of
/// its surface position.
fn reprojection_errors(
    metric_from_image: &Homography,
    image: &[Point2<f64>],
    metric: &[Point2<f64>],
) -> Result<Vec<f64>, CalibError> {
    let image_from_metric = metric_from_image
        .inverse()
        .ok_or_else(|| CalibError::degenerate("singular matrix"))?;
    Ok(image
        .iter()
        .zip(metric)
        .map(|(i, m)| {
            image_from_metric
                .try_apply(*m)
                .map(|p| (p - i).norm())
                .unwrap_or(f64::INFINITY)
        })
        .collect())
}

fn median(values: &[f64]) -> f64 {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    if v.is_empty() {
        return f64::INFINITY;
    }
    v.sort_by(f64::total_cmp);
    let mid = v.len() / 2;
    if v.len() % 2 == 0 {
        0.5 * (v[mid - 1] + v[mid])
    } else {
        v[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn truth() -> Homography {
        // surface (feet) -> pixels, a slightly tilted overhead view
        Homography::new(Matrix3::new(
            30.0, 1.5, 200.0, //
            -0.8, 28.0, 40.0, //
            0.0004, 0.0009, 1.0,
        ))
    }

    fn correspondences(metric: &[Point2<f64>]) -> Vec<Correspondence> {
        let h = truth();
        metric
            .iter()
            .enumerate()
            .map(|(i, &m)| Correspondence {
                feature: format!("p{i}"),
                image: h.apply(m),
                metric: m,
            })
            .collect()
    }

    fn grid() -> Vec<Point2<f64>> {
        let mut out = Vec::new();
        for y in [0.0, 6.0, 12.0, 16.0, 22.0] {
            for x in [0.0, 3.5, 7.25, 11.0] {
                out.push(Point2::new(x, y));
            }
        }
        out
    }

    #[test]
    fn recovers_exact_homography() {
        let corr = correspondences(&grid());
        let fit = solve_homography(&corr, &HomographyFitConfig::default()).expect("fit");
        assert_eq!(fit.inliers, corr.len());
        assert!(fit.rms_error_px < 1e-6);
        for c in &corr {
            let back = fit.metric_from_image.apply(c.image);
            assert_abs_diff_eq!(back, c.metric, epsilon = 1e-8);
        }
    }

    #[test]
    fn four_points_with_three_collinear_are_degenerate() {
        let metric = [
            Point2::new(0.0, 0.0),
            Point2::new(7.0, 0.0),
            Point2::new(14.0, 0.0),
            Point2::new(7.0, 20.0),
        ];
        let err = solve_homography(&correspondences(&metric), &HomographyFitConfig::default())
            .unwrap_err();
        assert!(matches!(err, CalibError::DegenerateHomography { .. }), "{err:?}");
    }

    #[test]
    fn all_collinear_points_are_degenerate() {
        let metric: Vec<_> = (0..6).map(|i| Point2::new(7.25, i as f64 * 5.0)).collect();
        let err = solve_homography(&correspondences(&metric), &HomographyFitConfig::default())
            .unwrap_err();
        assert!(matches!(err, CalibError::DegenerateHomography { .. }));
    }

    #[test]
    fn too_few_points() {
        let metric = [
            Point2::new(0.0, 0.0),
            Point2::new(7.0, 0.0),
            Point2::new(7.0, 20.0),
        ];
        assert_eq!(
            solve_homography(&correspondences(&metric), &HomographyFitConfig::default()),
            Err(CalibError::InsufficientPoints {
                feature: "homography correspondences".to_string(),
                found: 3,
                required: 4
            })
        );
    }

    #[test]
    fn rejects_a_mismatched_correspondence() {
        let mut corr = correspondences(&grid());
        let bad = 7;
        corr[bad].image.x += 60.0;
        corr[bad].image.y -= 45.0;

        let fit = solve_homography(&corr, &HomographyFitConfig::default()).expect("fit");
        assert!(!fit.inlier_mask[bad]);
        assert!(fit.inliers >= 4 && fit.inliers < corr.len());
        assert!(fit.rms_error_px < 1e-6, "rms {}", fit.rms_error_px);

        let h = truth();
        let spot = Point2::new(5.0, 9.0);
        let back = fit.metric_from_image.apply(h.apply(spot));
        assert_abs_diff_eq!(back, spot, epsilon = 1e-6);
    }

    fn jittered(corr: &mut [Correspondence]) {
        for (k, c) in corr.iter_mut().enumerate() {
            let k = k as f64;
            c.image.x += 0.3 * (1.7 * k).sin();
            c.image.y += 0.3 * (2.3 * k + 0.5).cos();
        }
    }

    #[test]
    fn refinement_lowers_pixel_error_on_noisy_points() {
        let mut corr = correspondences(&grid());
        jittered(&mut corr);

        let linear = HomographyFitConfig {
            refine: false,
            ..HomographyFitConfig::default()
        };
        let dlt = solve_homography(&corr, &linear).expect("linear fit");
        let refined = solve_homography(&corr, &HomographyFitConfig::default()).expect("refined fit");

        assert_eq!(refined.inlier_mask, dlt.inlier_mask);
        assert!(
            refined.rms_error_px <= dlt.rms_error_px + 1e-12,
            "refined {} vs linear {}",
            refined.rms_error_px,
            dlt.rms_error_px
        );
        assert!(refined.rms_error_px < 0.5);

        let h = truth();
        let spot = Point2::new(7.25, 12.0);
        let back = refined.metric_from_image.apply(h.apply(spot));
        assert_abs_diff_eq!(back, spot, epsilon = 0.05);
    }

    #[test]
    fn refinement_keeps_exact_fits_exact() {
        let corr = correspondences(&grid());
        let fit = solve_homography(&corr, &HomographyFitConfig::default()).expect("fit");
        assert_abs_diff_eq!(fit.rms_error_px, 0.0, epsilon = 1e-6);
        let config: HomographyFitConfig = serde_json::from_str(r#"{"refine": false}"#).unwrap();
        assert_eq!(config.refine_max_iterations, 50);
    }
}
