//! Total-least-squares line fitting in pixel space.

use nalgebra::{Point2, Vector2};

/// Infinite line through `centroid` with unit `direction`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FittedLine {
    pub centroid: Point2<f64>,
    pub direction: Vector2<f64>,
}

impl FittedLine {
    /// Unit normal (direction rotated by +90 degrees).
    pub fn normal(&self) -> Vector2<f64> {
        Vector2::new(-self.direction.y, self.direction.x)
    }

    /// Unsigned perpendicular distance.
    pub fn distance(&self, p: Point2<f64>) -> f64 {
        (p - self.centroid).dot(&self.normal()).abs()
    }

    /// Length of the span covered by `pts` when projected onto the line.
    pub fn extent(&self, pts: &[Point2<f64>]) -> f64 {
        let (mut lo, mut hi) = (f64::MAX, f64::MIN);
        for p in pts {
            let t = (p - self.centroid).dot(&self.direction);
            lo = lo.min(t);
            hi = hi.max(t);
        }
        if hi >= lo {
            hi - lo
        } else {
            0.0
        }
    }

    /// Smallest angle between the two lines, in radians (`0..=pi/2`).
    pub fn angle_to(&self, other: &FittedLine) -> f64 {
        self.direction.dot(&other.direction).abs().clamp(0.0, 1.0).acos()
    }

    pub fn intersect(&self, other: &FittedLine) -> Option<Point2<f64>> {
        let d1 = self.direction;
        let d2 = other.direction;
        let denom = d1.x * d2.y - d1.y * d2.x;
        if denom.abs() < 1e-9 {
            return None;
        }
        let w = other.centroid - self.centroid;
        let t = (w.x * d2.y - w.y * d2.x) / denom;
        Some(self.centroid + d1 * t)
    }
}

/// Orthogonal regression through `pts`. Needs at least two distinct points.
pub fn fit_line(pts: &[Point2<f64>]) -> Option<FittedLine> {
    if pts.len() < 2 {
        return None;
    }
    let n = pts.len() as f64;
    let centroid = Point2::from(pts.iter().fold(Vector2::zeros(), |acc, p| acc + p.coords) / n);

    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    for p in pts {
        let d = p - centroid;
        sxx += d.x * d.x;
        sxy += d.x * d.y;
        syy += d.y * d.y;
    }
    if sxx + syy < 1e-18 {
        return None;
    }

    // principal axis of the scatter matrix
    let theta = 0.5 * (2.0 * sxy).atan2(sxx - syy);
    Some(FittedLine {
        centroid,
        direction: Vector2::new(theta.cos(), theta.sin()),
    })
}
