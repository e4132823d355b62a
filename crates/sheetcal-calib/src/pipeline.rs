//! Per-frame rectification: undistort, warp to the surface plane and crop,
//! fused into a single inverse-map lookup table.

use crate::calibrate::CalibrationResult;
use crate::distortion::DistortionModel;
use crate::error::RectifyError;
use crate::homography::SurfaceHomography;
use crate::rectified::RectifiedSpace;
use log::debug;
use nalgebra::Point2;
use sheetcal_core::{sample_bilinear_u8, warp_perspective, CropRect, Frame, FrameView, Homography};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Round-trip tolerance, in pixels, for accepting a distorted sample
/// position; rejects positions where the lens polynomial folds back.
const FOLD_TOLERANCE_PX: f64 = 1e-2;

/// Immutable rectifier built from an accepted [`CalibrationResult`].
///
/// Every output pixel stores the raw source position it samples from, so
/// `rectify` is a single bilinear lookup per pixel and channel.
#[derive(Clone, Debug)]
pub struct RectificationPipeline {
    result: CalibrationResult,
    /// Raw-pixel sample position per output pixel; NaN marks unmapped pixels.
    map: Vec<[f32; 2]>,
}

impl RectificationPipeline {
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(result), fields(w = result.crop.width, h = result.crop.height))
    )]
    pub fn new(result: CalibrationResult) -> Result<Self, RectifyError> {
        let crop = result.crop;
        let space = result.rectified;
        if crop.width == 0 || crop.height == 0 || !crop.fits_within(space.width, space.height) {
            return Err(RectifyError::InvalidCrop {
                crop,
                width: space.width,
                height: space.height,
            });
        }

        let image_from_rect = image_from_rect(&result.homography, &space)?;
        let lens = &result.distortion.model;
        let mut map = Vec::with_capacity(crop.area());
        for v in 0..crop.height {
            for u in 0..crop.width {
                let rect = Point2::new((crop.x + u) as f64, (crop.y + v) as f64);
                let raw = image_from_rect
                    .try_apply(rect)
                    .and_then(|undist| raw_position(lens, undist));
                map.push(match raw {
                    Some(p) => [p.x as f32, p.y as f32],
                    None => [f32::NAN; 2],
                });
            }
        }

        debug!(
            "rectification map {}x{} built, {} unmapped",
            crop.width,
            crop.height,
            map.iter().filter(|p| p[0].is_nan()).count()
        );
        Ok(Self { result, map })
    }

    pub fn result(&self) -> &CalibrationResult {
        &self.result
    }

    /// Size of the rectified, cropped output.
    pub fn output_size(&self) -> (usize, usize) {
        (self.result.crop.width, self.result.crop.height)
    }

    /// Size of the raw frames this pipeline accepts.
    pub fn input_size(&self) -> (usize, usize) {
        (self.result.frame_width, self.result.frame_height)
    }

    /// Rectify one raw frame. Pure: equal inputs give equal outputs.
    pub fn rectify(&self, frame: &FrameView<'_>) -> Result<Frame, RectifyError> {
        let expected = self.input_size();
        if (frame.width, frame.height) != expected {
            return Err(RectifyError::FrameSizeMismatch {
                expected,
                got: (frame.width, frame.height),
            });
        }

        let (w, h) = self.output_size();
        let mut out = Frame::filled(w, h, frame.channels, 0);
        for (i, pos) in self.map.iter().enumerate() {
            if pos[0].is_nan() {
                continue;
            }
            let px = &mut out.data[i * frame.channels..(i + 1) * frame.channels];
            for (c, v) in px.iter_mut().enumerate() {
                *v = sample_bilinear_u8(frame, pos[0], pos[1], c);
            }
        }
        Ok(out)
    }
}

/// Undistorted pixel -> raw pixel, or `None` outside the source frame or
/// where the distortion polynomial is not invertible.
fn raw_position(lens: &DistortionModel, undist: Point2<f64>) -> Option<Point2<f64>> {
    let raw = lens.distort_pixel(undist);
    let (w, h) = (lens.image_width as f64, lens.image_height as f64);
    if !(raw.x > -1.0 && raw.y > -1.0 && raw.x < w && raw.y < h) {
        return None;
    }
    if !lens.coefficients.is_zero() {
        let back = lens.undistort_pixel(raw)?;
        if (back - undist).norm() > FOLD_TOLERANCE_PX {
            return None;
        }
    }
    Some(raw)
}

/// Rectified pixel -> undistorted pixel.
fn image_from_rect(
    homography: &SurfaceHomography,
    space: &RectifiedSpace,
) -> Result<Homography, RectifyError> {
    let h = homography.image_from_metric * space.metric_from_rect();
    if h.inverse().is_none() {
        return Err(RectifyError::SingularMapping);
    }
    Ok(h)
}

/// Remove lens distortion; the output keeps the source size.
pub fn undistort_frame(frame: &FrameView<'_>, lens: &DistortionModel) -> Frame {
    let mut out = Frame::filled(frame.width, frame.height, frame.channels, 0);
    for y in 0..frame.height {
        for x in 0..frame.width {
            let Some(raw) = raw_position(lens, Point2::new(x as f64, y as f64)) else {
                continue;
            };
            let px = out.pixel_mut(x, y);
            for (c, v) in px.iter_mut().enumerate() {
                *v = sample_bilinear_u8(frame, raw.x as f32, raw.y as f32, c);
            }
        }
    }
    out
}

/// Warp an undistorted frame onto the full rectified canvas.
pub fn warp_frame(
    undistorted: &FrameView<'_>,
    homography: &SurfaceHomography,
    space: &RectifiedSpace,
) -> Result<Frame, RectifyError> {
    let h = image_from_rect(homography, space)?;
    Ok(warp_perspective(undistorted, &h, space.width, space.height))
}

/// Copy the crop rectangle out of a rectified frame.
pub fn crop_frame(frame: &FrameView<'_>, crop: &CropRect) -> Result<Frame, RectifyError> {
    if !crop.fits_within(frame.width, frame.height) {
        return Err(RectifyError::InvalidCrop {
            crop: *crop,
            width: frame.width,
            height: frame.height,
        });
    }
    let ch = frame.channels;
    let mut data = Vec::with_capacity(crop.area() * ch);
    for y in crop.y..crop.bottom() {
        let start = (y * frame.width + crop.x) * ch;
        data.extend_from_slice(&frame.data[start..start + crop.width * ch]);
    }
    Ok(Frame {
        width: crop.width,
        height: crop.height,
        channels: ch,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::InputMode;
    use crate::distortion::{DistortionCoefficients, DistortionFit};
    use sheetcal_core::MetricRect;

    fn textured(width: usize, height: usize) -> Frame {
        let mut f = Frame::filled(width, height, 1, 0);
        for y in 0..height {
            for x in 0..width {
                f.pixel_mut(x, y)[0] = ((x * 7 + y * 13) % 251) as u8;
            }
        }
        f
    }

    fn fit(model: DistortionModel) -> DistortionFit {
        DistortionFit {
            model,
            initial_rms: 0.0,
            residual_rms: 0.0,
            iterations: 0,
            lines: 0,
            points: 0,
        }
    }

    /// Identity lens, image = 10 px per unit + (5, 8) offset.
    fn translated_result() -> CalibrationResult {
        let image_from_metric = Homography::scale_translate(10.0, 10.0, 5.0, 8.0);
        let metric_from_image = image_from_metric.inverse().expect("invertible");
        let area = MetricRect::new(0.0, 0.0, 12.0, 9.0);
        let rectified = RectifiedSpace::covering(&area, 10.0).expect("space");
        CalibrationResult {
            frame_width: 160,
            frame_height: 120,
            mode: InputMode::Manual,
            distortion: fit(DistortionModel::identity(160, 120, 144.0)),
            homography: SurfaceHomography {
                metric_from_image,
                image_from_metric,
                condition_number: 1.0,
                rms_error_px: 0.0,
                inliers: 4,
                inlier_mask: vec![true; 4],
            },
            correspondences: Vec::new(),
            rectified,
            roi: MetricRect::new(1.0, 1.0, 10.0, 8.0),
            crop: CropRect {
                x: 6,
                y: 6,
                width: 98,
                height: 78,
            },
        }
    }

    #[test]
    fn fused_map_matches_staged_preview() {
        let result = translated_result();
        let frame = textured(160, 120);
        let pipeline = RectificationPipeline::new(result.clone()).expect("pipeline");

        let fused = pipeline.rectify(&frame.view()).expect("rectify");
        let undist = undistort_frame(&frame.view(), &result.distortion.model);
        let warped = warp_frame(&undist.view(), &result.homography, &result.rectified).expect("warp");
        let staged = crop_frame(&warped.view(), &result.crop).expect("crop");

        assert_eq!(fused, staged);
        // output (0, 0) = rect (6, 6) = image (11, 14)
        assert_eq!(fused.pixel(0, 0), frame.pixel(11, 14));
        assert_eq!(fused.pixel(97, 77), frame.pixel(108, 91));
    }

    #[test]
    fn rectify_is_idempotent() {
        let pipeline = RectificationPipeline::new(translated_result()).expect("pipeline");
        let frame = textured(160, 120);
        let a = pipeline.rectify(&frame.view()).expect("first");
        let b = pipeline.rectify(&frame.view()).expect("second");
        assert_eq!(a, b);
        assert_eq!((a.width, a.height), pipeline.output_size());
    }

    #[test]
    fn wrong_frame_size_is_rejected() {
        let pipeline = RectificationPipeline::new(translated_result()).expect("pipeline");
        let frame = textured(100, 120);
        assert_eq!(
            pipeline.rectify(&frame.view()),
            Err(RectifyError::FrameSizeMismatch {
                expected: (160, 120),
                got: (100, 120)
            })
        );
    }

    #[test]
    fn crop_outside_canvas_is_rejected() {
        let mut result = translated_result();
        result.crop.x = 100;
        assert!(matches!(
            RectificationPipeline::new(result),
            Err(RectifyError::InvalidCrop { .. })
        ));
    }

    #[test]
    fn distorted_lens_still_maps_the_center() {
        let mut result = translated_result();
        let camera = result.distortion.model.camera;
        result.distortion = fit(DistortionModel::with_optimal(
            camera,
            DistortionCoefficients::radial(-0.2, 0.03),
            160,
            120,
            1.0,
        ));
        let pipeline = RectificationPipeline::new(result).expect("pipeline");
        let out = pipeline.rectify(&Frame::filled(160, 120, 3, 90).view()).expect("rectify");
        assert_eq!(out.channels, 3);
        let (w, h) = pipeline.output_size();
        assert_eq!(out.pixel(w / 2, h / 2), &[90, 90, 90]);
    }
}
