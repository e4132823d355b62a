use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Which model feature an observed pixel belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum FeatureRef {
    /// A point somewhere on the model line with this id.
    Line(String),
    /// A named landmark (see `SurfaceModel::landmark`).
    Landmark(String),
}

/// Raw-pixel measurement of a model feature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointObservation {
    pub pixel: Point2<f64>,
    pub feature: FeatureRef,
    /// Detector confidence in `[0, 1]`; manual input uses `1.0`.
    pub confidence: f32,
}

/// All observed points of one model line, in raw-pixel space.
#[derive(Clone, Debug, PartialEq)]
pub struct LineGroup {
    pub id: String,
    pub points: Vec<Point2<f64>>,
    /// Lowest confidence among the group's points.
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LandmarkObservation {
    pub id: String,
    pub pixel: Point2<f64>,
    pub confidence: f32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Observations {
    pub points: Vec<PointObservation>,
}

impl Observations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn push_line_point(&mut self, id: impl Into<String>, pixel: Point2<f64>, confidence: f32) {
        self.points.push(PointObservation {
            pixel,
            feature: FeatureRef::Line(id.into()),
            confidence,
        });
    }

    pub fn push_landmark(&mut self, id: impl Into<String>, pixel: Point2<f64>, confidence: f32) {
        self.points.push(PointObservation {
            pixel,
            feature: FeatureRef::Landmark(id.into()),
            confidence,
        });
    }

    /// Line observations grouped by line id, in order of first appearance.
    pub fn line_groups(&self) -> Vec<LineGroup> {
        let mut groups: Vec<LineGroup> = Vec::new();
        for obs in &self.points {
            let FeatureRef::Line(id) = &obs.feature else {
                continue;
            };
            match groups.iter_mut().find(|g| &g.id == id) {
                Some(g) => {
                    g.points.push(obs.pixel);
                    g.confidence = g.confidence.min(obs.confidence);
                }
                None => groups.push(LineGroup {
                    id: id.clone(),
                    points: vec![obs.pixel],
                    confidence: obs.confidence,
                }),
            }
        }
        groups
    }

    /// Landmark observations; repeated ids are averaged.
    pub fn landmarks(&self) -> Vec<LandmarkObservation> {
        let mut acc: Vec<(LandmarkObservation, usize)> = Vec::new();
        for obs in &self.points {
            let FeatureRef::Landmark(id) = &obs.feature else {
                continue;
            };
            match acc.iter_mut().find(|(l, _)| &l.id == id) {
                Some((l, n)) => {
                    l.pixel.coords += obs.pixel.coords;
                    l.confidence = l.confidence.min(obs.confidence);
                    *n += 1;
                }
                None => acc.push((
                    LandmarkObservation {
                        id: id.clone(),
                        pixel: obs.pixel,
                        confidence: obs.confidence,
                    },
                    1,
                )),
            }
        }
        acc.into_iter()
            .map(|(mut l, n)| {
                l.pixel.coords /= n as f64;
                l
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_by_feature() {
        let mut obs = Observations::new();
        obs.push_line_point("a", Point2::new(0.0, 0.0), 1.0);
        obs.push_landmark("house_far", Point2::new(5.0, 5.0), 0.9);
        obs.push_line_point("b", Point2::new(1.0, 0.0), 0.5);
        obs.push_line_point("a", Point2::new(0.0, 1.0), 0.7);
        obs.push_landmark("house_far", Point2::new(7.0, 5.0), 1.0);

        let groups = obs.line_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].id, "a");
        assert_eq!(groups[0].points.len(), 2);
        assert_eq!(groups[0].confidence, 0.7);

        let landmarks = obs.landmarks();
        assert_eq!(landmarks.len(), 1);
        assert_eq!(landmarks[0].pixel, Point2::new(6.0, 5.0));
        assert_eq!(landmarks[0].confidence, 0.9);
    }
}
