use crate::distortion::DistortionModel;
use crate::homography::Correspondence;
use crate::lines::{fit_line, FittedLine};
use log::{debug, warn};
use nalgebra::Point2;
use sheetcal_core::{LineAxis, Observations, SurfaceModel};

/// Observed model line, refit in undistorted pixel space.
#[derive(Clone, Debug)]
pub struct UndistortedLine {
    pub id: String,
    pub axis: LineAxis,
    pub line: FittedLine,
    pub points: Vec<Point2<f64>>,
}

/// Undistort every observed point that belongs to a model line and refit
/// the lines. Unknown ids and points outside the lens model are skipped.
pub fn undistorted_lines(
    observations: &Observations,
    model: &SurfaceModel,
    distortion: &DistortionModel,
) -> Vec<UndistortedLine> {
    let mut out = Vec::new();
    for group in observations.line_groups() {
        let Some(model_line) = model.line(&group.id) else {
            debug!("line `{}` is not part of the surface model", group.id);
            continue;
        };
        let points: Vec<Point2<f64>> = group
            .points
            .iter()
            .filter_map(|&p| distortion.undistort_pixel(p))
            .collect();
        let Some(line) = fit_line(&points) else {
            warn!("line `{}` has fewer than two usable points", group.id);
            continue;
        };
        out.push(UndistortedLine {
            id: group.id,
            axis: model_line.axis,
            line,
            points,
        });
    }
    out
}

/// Pair undistorted image points with surface positions.
///
/// Landmarks map directly; every pair of observed perpendicular model lines
/// whose spans cross contributes its intersection, named `"a/b"`. Explicit
/// landmarks win over an intersection of the same name.
pub fn build_correspondences(
    observations: &Observations,
    model: &SurfaceModel,
    distortion: &DistortionModel,
) -> Vec<Correspondence> {
    let mut out: Vec<Correspondence> = Vec::new();

    for lm in observations.landmarks() {
        let Some(metric) = model.landmark(&lm.id) else {
            warn!("ignoring unknown landmark `{}`", lm.id);
            continue;
        };
        let Some(image) = distortion.undistort_pixel(lm.pixel) else {
            warn!("landmark `{}` lies outside the lens model", lm.id);
            continue;
        };
        out.push(Correspondence {
            feature: lm.id,
            image,
            metric,
        });
    }

    let lines = undistorted_lines(observations, model, distortion);
    for a in lines.iter().filter(|l| l.axis == LineAxis::AlongLength) {
        for b in lines.iter().filter(|l| l.axis == LineAxis::AcrossWidth) {
            let name = format!("{}/{}", a.id, b.id);
            if out.iter().any(|c| c.feature == name) {
                continue;
            }
            let (Some(la), Some(lb)) = (model.line(&a.id), model.line(&b.id)) else {
                continue;
            };
            let (Some(metric), Some(image)) = (la.intersect(lb), a.line.intersect(&b.line)) else {
                continue;
            };
            out.push(Correspondence {
                feature: name,
                image,
                metric,
            });
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetcal_core::Homography;

    #[test]
    fn intersections_and_landmarks() {
        let model = SurfaceModel::curling_sheet();
        let distortion = crate::distortion::DistortionModel::identity(800, 1000, 900.0);
        let img_from_metric = Homography::scale_translate(20.0, 6.0, 100.0, 20.0);

        let mut obs = Observations::new();
        for id in ["side_left", "center_line", "tee_far", "hog_far"] {
            for p in model.sample_line(id, 4).expect("line") {
                obs.push_line_point(id, img_from_metric.apply(p), 1.0);
            }
        }
        obs.push_landmark("house_far", img_from_metric.apply(Point2::new(7.25, 16.0)), 1.0);
        obs.push_landmark("center_line/tee_far", Point2::new(245.0, 116.0), 1.0);
        obs.push_landmark("mystery", Point2::new(1.0, 1.0), 1.0);

        let corr = build_correspondences(&obs, &model, &distortion);
        let names: Vec<&str> = corr.iter().map(|c| c.feature.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "house_far",
                "center_line/tee_far",
                "side_left/tee_far",
                "side_left/hog_far",
                "center_line/hog_far"
            ]
        );
        let c = &corr[3];
        assert_eq!(c.metric, Point2::new(0.0, 37.0));
        assert!((c.image - img_from_metric.apply(c.metric)).norm() < 1e-9);
    }
}
