//! Owned and borrowed 8-bit rasters.
//!
//! Pixels are stored row-major and interleaved (`channels` bytes per pixel).
//! Sampling uses the pixel-center convention: integer coordinates address the
//! center of a pixel, so `(0.0, 0.0)` is the center of the top-left pixel.

use serde::{Deserialize, Serialize};

/// Errors produced when wrapping raw pixel buffers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid frame buffer length (expected {expected} bytes, got {got})")]
    InvalidBuffer { expected: usize, got: usize },

    #[error("unsupported channel count {0} (expected 1 or 3)")]
    UnsupportedChannels(usize),

    #[error("invalid frame dimensions (width={width}, height={height})")]
    InvalidDimensions { width: usize, height: usize },
}

#[derive(Clone, Copy, Debug)]
pub struct FrameView<'a> {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub data: &'a [u8], // row-major, len = w*h*channels
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub data: Vec<u8>,
}

fn check_layout(width: usize, height: usize, channels: usize, len: usize) -> Result<(), FrameError> {
    if channels != 1 && channels != 3 {
        return Err(FrameError::UnsupportedChannels(channels));
    }
    if width == 0 || height == 0 {
        return Err(FrameError::InvalidDimensions { width, height });
    }
    let expected = width * height * channels;
    if len != expected {
        return Err(FrameError::InvalidBuffer { expected, got: len });
    }
    Ok(())
}

impl<'a> FrameView<'a> {
    /// Wrap a borrowed buffer, validating its length.
    pub fn new(
        width: usize,
        height: usize,
        channels: usize,
        data: &'a [u8],
    ) -> Result<Self, FrameError> {
        check_layout(width, height, channels, data.len())?;
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    #[inline]
    pub fn get(&self, x: i32, y: i32, c: usize) -> u8 {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return 0;
        }
        self.data[(y as usize * self.width + x as usize) * self.channels + c]
    }

    /// Luma value of a pixel (ITU-R BT.601 weights for RGB).
    #[inline]
    pub fn luma_at(&self, x: usize, y: usize) -> f32 {
        let idx = (y * self.width + x) * self.channels;
        if self.channels == 1 {
            self.data[idx] as f32
        } else {
            0.299 * self.data[idx] as f32
                + 0.587 * self.data[idx + 1] as f32
                + 0.114 * self.data[idx + 2] as f32
        }
    }

    /// Single-channel copy of this view.
    pub fn to_luma(&self) -> Frame {
        if self.channels == 1 {
            return self.to_owned_frame();
        }
        let mut data = Vec::with_capacity(self.width * self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push(self.luma_at(x, y).round().clamp(0.0, 255.0) as u8);
            }
        }
        Frame {
            width: self.width,
            height: self.height,
            channels: 1,
            data,
        }
    }

    pub fn to_owned_frame(&self) -> Frame {
        Frame {
            width: self.width,
            height: self.height,
            channels: self.channels,
            data: self.data.to_vec(),
        }
    }

    pub fn same_shape(&self, other: &FrameView<'_>) -> bool {
        self.width == other.width && self.height == other.height && self.channels == other.channels
    }
}

impl Frame {
    /// Take ownership of a raw buffer, validating its length.
    pub fn new(
        width: usize,
        height: usize,
        channels: usize,
        data: Vec<u8>,
    ) -> Result<Self, FrameError> {
        check_layout(width, height, channels, data.len())?;
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// A frame with every byte set to `value`.
    pub fn filled(width: usize, height: usize, channels: usize, value: u8) -> Self {
        Self {
            width,
            height,
            channels,
            data: vec![value; width * height * channels],
        }
    }

    pub fn view(&self) -> FrameView<'_> {
        FrameView {
            width: self.width,
            height: self.height,
            channels: self.channels,
            data: &self.data,
        }
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> &[u8] {
        let idx = (y * self.width + x) * self.channels;
        &self.data[idx..idx + self.channels]
    }

    #[inline]
    pub fn pixel_mut(&mut self, x: usize, y: usize) -> &mut [u8] {
        let idx = (y * self.width + x) * self.channels;
        &mut self.data[idx..idx + self.channels]
    }

    /// Set every channel of the pixels in `[x0, x1) x [y0, y1)` to `value`.
    pub fn fill_rect(&mut self, x0: usize, y0: usize, x1: usize, y1: usize, value: u8) {
        for y in y0..y1.min(self.height) {
            for x in x0..x1.min(self.width) {
                self.pixel_mut(x, y).fill(value);
            }
        }
    }
}

#[inline]
pub fn sample_bilinear(src: &FrameView<'_>, x: f32, y: f32, c: usize) -> f32 {
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = src.get(x0, y0, c) as f32;
    let p10 = src.get(x0 + 1, y0, c) as f32;
    let p01 = src.get(x0, y0 + 1, c) as f32;
    let p11 = src.get(x0 + 1, y0 + 1, c) as f32;

    let a = p00 + fx * (p10 - p00);
    let b = p01 + fx * (p11 - p01);
    a + fy * (b - a)
}

#[inline]
pub fn sample_bilinear_u8(src: &FrameView<'_>, x: f32, y: f32, c: usize) -> u8 {
    (sample_bilinear(src, x, y, c) + 0.5).clamp(0.0, 255.0) as u8
}

/// Downscale to `out_w x out_h` by averaging the source area covered by each
/// output pixel. Upscaling falls back to nearest-pixel replication.
pub fn resize_area(src: &FrameView<'_>, out_w: usize, out_h: usize) -> Frame {
    let mut out = Frame::filled(out_w.max(1), out_h.max(1), src.channels, 0);
    let sx = src.width as f64 / out.width as f64;
    let sy = src.height as f64 / out.height as f64;

    for oy in 0..out.height {
        let y0 = (oy as f64 * sy).floor() as usize;
        let y1 = (((oy + 1) as f64 * sy).ceil() as usize).clamp(y0 + 1, src.height);
        for ox in 0..out.width {
            let x0 = (ox as f64 * sx).floor() as usize;
            let x1 = (((ox + 1) as f64 * sx).ceil() as usize).clamp(x0 + 1, src.width);
            let count = ((y1 - y0) * (x1 - x0)) as u32;
            for c in 0..src.channels {
                let mut acc = 0u32;
                for y in y0..y1 {
                    for x in x0..x1 {
                        acc += src.data[(y * src.width + x) * src.channels + c] as u32;
                    }
                }
                out.pixel_mut(ox, oy)[c] = ((acc + count / 2) / count) as u8;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffer() {
        let err = Frame::new(4, 4, 1, vec![0; 15]).unwrap_err();
        assert_eq!(
            err,
            FrameError::InvalidBuffer {
                expected: 16,
                got: 15
            }
        );
        assert_eq!(
            Frame::new(2, 2, 2, vec![0; 8]).unwrap_err(),
            FrameError::UnsupportedChannels(2)
        );
    }

    #[test]
    fn bilinear_interpolates_between_centers() {
        let frame = Frame::new(2, 1, 1, vec![0, 100]).expect("frame");
        let view = frame.view();
        assert_eq!(sample_bilinear(&view, 0.0, 0.0, 0), 0.0);
        assert_eq!(sample_bilinear(&view, 1.0, 0.0, 0), 100.0);
        assert!((sample_bilinear(&view, 0.25, 0.0, 0) - 25.0).abs() < 1e-4);
        // outside the raster reads as black
        assert_eq!(sample_bilinear(&view, -3.0, 0.0, 0), 0.0);
    }

    #[test]
    fn luma_uses_rgb_weights() {
        let frame = Frame::new(1, 1, 3, vec![255, 0, 0]).expect("frame");
        let luma = frame.view().to_luma();
        assert_eq!(luma.channels, 1);
        assert_eq!(luma.data, vec![76]);
    }

    #[test]
    fn area_resize_averages_blocks() {
        let mut frame = Frame::filled(4, 4, 1, 0);
        frame.fill_rect(0, 0, 2, 2, 200);
        let small = resize_area(&frame.view(), 2, 2);
        assert_eq!(small.data, vec![200, 0, 0, 0]);
    }
}
