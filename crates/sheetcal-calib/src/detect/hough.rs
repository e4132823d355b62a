//! Line Hough transform over a restricted range of directions.
//!
//! A line with direction angle `phi` is stored by its signed distance
//! `rho = n . p` along the normal `n = (-sin phi, cos phi)`.

use nalgebra::{Point2, Vector2};

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct HoughLine {
    /// Direction angle of the line, radians.
    pub phi: f64,
    pub rho: f64,
    pub votes: u32,
}

impl HoughLine {
    pub fn normal(&self) -> Vector2<f64> {
        Vector2::new(-self.phi.sin(), self.phi.cos())
    }

    pub fn direction(&self) -> Vector2<f64> {
        Vector2::new(self.phi.cos(), self.phi.sin())
    }

    /// Point of the line closest to `p`.
    pub fn foot(&self, p: Point2<f64>) -> Point2<f64> {
        let n = self.normal();
        p - n * (n.dot(&p.coords) - self.rho)
    }
}

pub(crate) struct HoughAccumulator {
    /// `(phi, cos phi, sin phi)` per angle bin.
    angles: Vec<(f64, f64, f64)>,
    rho_offset: f64,
    n_rho: usize,
    votes: Vec<u32>,
}

impl HoughAccumulator {
    /// Angle bins cover `center +- half_range` in `step` increments.
    pub fn new(width: usize, height: usize, center: f64, half_range: f64, step: f64) -> Self {
        let n_theta = (2.0 * half_range / step + 1e-9).floor() as usize + 1;
        let angles = (0..n_theta)
            .map(|i| {
                let phi = center - half_range + i as f64 * step;
                (phi, phi.cos(), phi.sin())
            })
            .collect::<Vec<_>>();
        let diag = ((width * width + height * height) as f64).sqrt().ceil();
        let n_rho = 2 * diag as usize + 1;
        Self {
            votes: vec![0; angles.len() * n_rho],
            angles,
            rho_offset: diag,
            n_rho,
        }
    }

    pub fn vote(&mut self, x: f64, y: f64) {
        for (ti, &(_, c, s)) in self.angles.iter().enumerate() {
            let rho = -s * x + c * y;
            let ri = (rho + self.rho_offset).round();
            if ri >= 0.0 && (ri as usize) < self.n_rho {
                self.votes[ti * self.n_rho + ri as usize] += 1;
            }
        }
    }

    fn line(&self, ti: usize, ri: usize) -> HoughLine {
        HoughLine {
            phi: self.angles[ti].0,
            rho: ri as f64 - self.rho_offset,
            votes: self.votes[ti * self.n_rho + ri],
        }
    }

    /// Strongest lines with at least `min_votes`, suppressing any line that
    /// passes within `min_separation` pixels of a stronger one at `anchor`.
    pub fn peaks(
        &self,
        min_votes: u32,
        min_separation: f64,
        anchor: Point2<f64>,
        max_lines: usize,
    ) -> Vec<HoughLine> {
        let mut candidates: Vec<(usize, usize)> = Vec::new();
        for ti in 0..self.angles.len() {
            for ri in 0..self.n_rho {
                if self.votes[ti * self.n_rho + ri] >= min_votes {
                    candidates.push((ti, ri));
                }
            }
        }
        candidates.sort_by(|a, b| {
            let va = self.votes[a.0 * self.n_rho + a.1];
            let vb = self.votes[b.0 * self.n_rho + b.1];
            vb.cmp(&va).then(a.cmp(b))
        });

        let mut out: Vec<HoughLine> = Vec::new();
        for (ti, ri) in candidates {
            if out.len() >= max_lines {
                break;
            }
            let line = self.line(ti, ri);
            let at = line.foot(anchor);
            let crowded = out
                .iter()
                .any(|kept| (kept.foot(at) - at).norm() <= min_separation);
            if !crowded {
                out.push(line);
            }
        }
        out
    }
}
