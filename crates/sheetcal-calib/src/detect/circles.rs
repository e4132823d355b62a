//! House localization by disk/ring contrast around a predicted center.

use nalgebra::{Point2, Vector2};
use sheetcal_core::{sample_bilinear, FrameView};

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct CircleHit {
    pub center: Point2<f64>,
    pub contrast: f32,
    /// Fraction of directions whose inner and outer samples differ by at
    /// least the minimum contrast.
    pub confidence: f32,
}

pub(crate) struct CircleSearch {
    pub radius_px: f64,
    /// Half width of the square searched around the prediction.
    pub search_px: f64,
    pub min_contrast: f32,
    pub samples: usize,
}

fn build_unit_circle_lut(samples: usize) -> Vec<(f64, f64)> {
    let step = std::f64::consts::TAU / samples.max(1) as f64;
    (0..samples.max(1))
        .map(|k| {
            let (s, c) = (k as f64 * step).sin_cos();
            (c, s)
        })
        .collect()
}

/// Samples just inside and just outside the circle boundary.
fn score_at(
    img: &FrameView<'_>,
    center: Point2<f64>,
    params: &CircleSearch,
    dirs: &[(f64, f64)],
) -> (f32, f32) {
    let r_in = 0.9 * params.radius_px;
    let r_out = 1.1 * params.radius_px;
    let mut sum_in = 0.0f32;
    let mut sum_out = 0.0f32;
    let mut consistent = 0usize;
    for &(ux, uy) in dirs {
        let a = sample_bilinear(
            img,
            (center.x + r_in * ux) as f32,
            (center.y + r_in * uy) as f32,
            0,
        );
        let b = sample_bilinear(
            img,
            (center.x + r_out * ux) as f32,
            (center.y + r_out * uy) as f32,
            0,
        );
        sum_in += a;
        sum_out += b;
        if (a - b).abs() >= params.min_contrast {
            consistent += 1;
        }
    }
    let n = dirs.len() as f32;
    ((sum_in - sum_out).abs() / n, consistent as f32 / n)
}

/// Best-contrast center within the search window of `predicted`, or `None`
/// when no position reaches the minimum contrast. Positions within 2% of the
/// best contrast are averaged.
pub(crate) fn locate_circle(
    img: &FrameView<'_>,
    predicted: Point2<f64>,
    params: &CircleSearch,
) -> Option<CircleHit> {
    if params.radius_px < 2.0 {
        return None;
    }
    let dirs = build_unit_circle_lut(params.samples);
    let step = (params.radius_px / 20.0).max(1.0);
    let n = (params.search_px / step).floor() as i32;

    let mut scored = Vec::new();
    for dy in -n..=n {
        for dx in -n..=n {
            let c = Point2::new(predicted.x + dx as f64 * step, predicted.y + dy as f64 * step);
            let (contrast, confidence) = score_at(img, c, params, &dirs);
            scored.push(CircleHit {
                center: c,
                contrast,
                confidence,
            });
        }
    }

    let best = scored
        .iter()
        .copied()
        .max_by(|a, b| a.contrast.total_cmp(&b.contrast))?;
    if best.contrast < params.min_contrast {
        return None;
    }
    let near: Vec<&CircleHit> = scored
        .iter()
        .filter(|h| h.contrast >= 0.98 * best.contrast)
        .collect();
    let sum = near
        .iter()
        .fold(Vector2::zeros(), |acc, h| acc + h.center.coords);
    Some(CircleHit {
        center: Point2::from(sum / near.len() as f64),
        ..best
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetcal_core::Frame;

    #[test]
    fn finds_offset_disk() {
        let mut f = Frame::filled(200, 200, 1, 220);
        let (cx, cy, r) = (104.0, 97.0, 30.0);
        for y in 0..200 {
            for x in 0..200 {
                let d = ((x as f64 - cx).powi(2) + (y as f64 - cy).powi(2)).sqrt();
                if d <= r {
                    f.pixel_mut(x, y)[0] = 60;
                }
            }
        }
        let params = CircleSearch {
            radius_px: r,
            search_px: 10.0,
            min_contrast: 20.0,
            samples: 48,
        };
        let hit = locate_circle(&f.view(), Point2::new(100.0, 100.0), &params).expect("hit");
        assert!((hit.center - Point2::new(cx, cy)).norm() <= 2.0, "{hit:?}");
        assert!(hit.confidence > 0.9);
    }

    #[test]
    fn flat_image_has_no_circle() {
        let f = Frame::filled(100, 100, 1, 128);
        let params = CircleSearch {
            radius_px: 20.0,
            search_px: 5.0,
            min_contrast: 10.0,
            samples: 32,
        };
        assert!(locate_circle(&f.view(), Point2::new(50.0, 50.0), &params).is_none());
    }
}
