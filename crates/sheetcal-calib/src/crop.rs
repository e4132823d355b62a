use crate::CalibError;
use serde::{Deserialize, Serialize};
use sheetcal_core::{CropRect, Homography, MetricRect};

/// Parameters for [`compute_crop`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropConfig {
    /// Pixels added on every side before clamping (negative shrinks).
    pub margin_pixels: i32,
    /// Largest fraction of the unclamped box that clamping may cut away.
    pub max_clamp_loss: f64,
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            margin_pixels: 4,
            max_clamp_loss: 0.1,
        }
    }
}

/// Bound the region of interest inside a `frame_width x frame_height`
/// rectified frame.
///
/// The ROI corners are projected with `rect_from_metric`, boxed, grown by
/// the margin and clamped. Clamping that removes more than
/// `max_clamp_loss` of the area, or leaves nothing, is an error.
pub fn compute_crop(
    frame_width: usize,
    frame_height: usize,
    rect_from_metric: &Homography,
    roi: &MetricRect,
    config: &CropConfig,
) -> Result<CropRect, CalibError> {
    let out_of_bounds = |unclamped: [i64; 4], retained: f64| CalibError::CropOutOfBounds {
        unclamped,
        retained,
        frame_width,
        frame_height,
    };

    let mut x0 = f64::MAX;
    let mut y0 = f64::MAX;
    let mut x1 = f64::MIN;
    let mut y1 = f64::MIN;
    for corner in roi.corners() {
        let p = rect_from_metric
            .try_apply(corner)
            .ok_or_else(|| out_of_bounds([0; 4], 0.0))?;
        x0 = x0.min(p.x);
        y0 = y0.min(p.y);
        x1 = x1.max(p.x);
        y1 = y1.max(p.y);
    }

    let m = config.margin_pixels as i64;
    let unclamped = [
        x0.floor() as i64 - m,
        y0.floor() as i64 - m,
        x1.ceil() as i64 + m,
        y1.ceil() as i64 + m,
    ];
    let area = |r: [i64; 4]| ((r[2] - r[0]).max(0) * (r[3] - r[1]).max(0)) as f64;

    let full = area(unclamped);
    if full <= 0.0 {
        return Err(out_of_bounds(unclamped, 0.0));
    }

    let (w, h) = (frame_width as i64, frame_height as i64);
    let clamped = [
        unclamped[0].clamp(0, w),
        unclamped[1].clamp(0, h),
        unclamped[2].clamp(0, w),
        unclamped[3].clamp(0, h),
    ];
    let retained = area(clamped) / full;
    if area(clamped) <= 0.0 || 1.0 - retained > config.max_clamp_loss {
        return Err(out_of_bounds(unclamped, retained));
    }

    Ok(CropRect {
        x: clamped[0] as usize,
        y: clamped[1] as usize,
        width: (clamped[2] - clamped[0]) as usize,
        height: (clamped[3] - clamped[1]) as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect_from_metric() -> Homography {
        // 20 px per unit, surface origin at (-1, -1)
        Homography::scale_translate(20.0, 20.0, 20.0, 20.0)
    }

    #[test]
    fn crop_contains_roi_plus_margin() {
        let roi = MetricRect::new(0.0, 0.0, 14.5, 22.0);
        let crop = compute_crop(330, 480, &rect_from_metric(), &roi, &CropConfig::default())
            .expect("crop");
        assert_eq!(
            crop,
            CropRect {
                x: 16,
                y: 16,
                width: 298,
                height: 448
            }
        );
        assert!(crop.fits_within(330, 480));
    }

    #[test]
    fn small_overhang_is_clamped() {
        let roi = MetricRect::new(-1.0, -1.0, 15.5, 23.0);
        let cfg = CropConfig {
            margin_pixels: 2,
            max_clamp_loss: 0.1,
        };
        let crop = compute_crop(330, 480, &rect_from_metric(), &roi, &cfg).expect("crop");
        assert_eq!(crop, CropRect::full(330, 480));
    }

    #[test]
    fn large_overhang_is_an_error() {
        let roi = MetricRect::new(0.0, 0.0, 14.5, 40.0);
        let err = compute_crop(330, 480, &rect_from_metric(), &roi, &CropConfig::default())
            .unwrap_err();
        match err {
            CalibError::CropOutOfBounds { retained, .. } => assert!(retained < 0.9),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn negative_margin_can_empty_the_crop() {
        let roi = MetricRect::new(0.0, 0.0, 0.1, 0.1);
        let cfg = CropConfig {
            margin_pixels: -5,
            max_clamp_loss: 0.1,
        };
        assert!(matches!(
            compute_crop(330, 480, &rect_from_metric(), &roi, &cfg),
            Err(CalibError::CropOutOfBounds { .. })
        ));
    }

    #[test]
    fn crops_stay_inside_the_frame() {
        let h = rect_from_metric();
        for i in 0..40 {
            let t = i as f64 * 0.37;
            let roi = MetricRect::new(t % 5.0, (t * 1.7) % 9.0, 9.0 + t % 5.5, 14.0 + t % 9.0);
            let cfg = CropConfig {
                margin_pixels: (i % 7) as i32 - 2,
                max_clamp_loss: 0.5,
            };
            if let Ok(crop) = compute_crop(330, 480, &h, &roi, &cfg) {
                assert!(crop.fits_within(330, 480), "{crop:?} escapes the frame");
            }
        }
    }
}
