//! Scene change detection on downscaled luma frames.

use serde::{Deserialize, Serialize};
use sheetcal_core::{resize_area, Frame, FrameView};

/// How two comparison frames are reduced to one change score.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeMetric {
    /// Mean absolute difference over the whole frame.
    GlobalMean,
    /// Largest mean absolute difference over any `block x block` window
    /// (stride one, clamped to the comparison size). A stone entering the
    /// view scores its own contrast instead of its share of the frame.
    BlockMax { block: usize },
}

impl Default for ChangeMetric {
    fn default() -> Self {
        Self::BlockMax { block: 8 }
    }
}

/// Compares frames against a rolling reference.
#[derive(Clone, Debug)]
pub struct ChangeDetector {
    width: usize,
    height: usize,
    metric: ChangeMetric,
    reference: Option<Frame>,
}

impl ChangeDetector {
    pub fn new(width: usize, height: usize, metric: ChangeMetric) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            metric,
            reference: None,
        }
    }

    pub fn metric(&self) -> ChangeMetric {
        self.metric
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// Gray comparison copy of `frame`.
    pub fn prepare(&self, frame: &FrameView<'_>) -> Frame {
        let luma = frame.to_luma();
        resize_area(&luma.view(), self.width, self.height)
    }

    /// Change score of a prepared frame, or `None` before the first reference.
    pub fn score(&self, prepared: &Frame) -> Option<f64> {
        let reference = self.reference.as_ref()?;
        Some(match self.metric {
            ChangeMetric::GlobalMean => mean_abs_diff(reference, prepared),
            ChangeMetric::BlockMax { block } => window_max_abs_diff(reference, prepared, block),
        })
    }

    pub fn set_reference(&mut self, prepared: Frame) {
        self.reference = Some(prepared);
    }

    pub fn clear(&mut self) {
        self.reference = None;
    }
}

fn mean_abs_diff(a: &Frame, b: &Frame) -> f64 {
    let acc: u64 = a
        .data
        .iter()
        .zip(&b.data)
        .map(|(&p, &q)| p.abs_diff(q) as u64)
        .sum();
    acc as f64 / a.data.len().max(1) as f64
}

/// Summed-area table of `|a - b|` with a zero first row and column.
fn abs_diff_integral(a: &Frame, b: &Frame) -> Vec<u64> {
    let (w, h) = (a.width, a.height);
    let stride = w + 1;
    let mut sat = vec![0u64; stride * (h + 1)];
    for y in 0..h {
        let mut row_sum = 0u64;
        for x in 0..w {
            let i = y * w + x;
            row_sum += a.data[i].abs_diff(b.data[i]) as u64;
            sat[(y + 1) * stride + x + 1] = sat[y * stride + x + 1] + row_sum;
        }
    }
    sat
}

fn window_max_abs_diff(a: &Frame, b: &Frame, block: usize) -> f64 {
    let (w, h) = (a.width, a.height);
    let block = block.clamp(1, w.min(h).max(1));
    let sat = abs_diff_integral(a, b);
    let stride = w + 1;
    let mut worst = 0u64;
    for y0 in 0..=h - block {
        let y1 = y0 + block;
        for x0 in 0..=w - block {
            let x1 = x0 + block;
            let sum = sat[y1 * stride + x1] + sat[y0 * stride + x0]
                - sat[y0 * stride + x1]
                - sat[y1 * stride + x0];
            worst = worst.max(sum);
        }
    }
    worst as f64 / (block * block) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector_with(metric: ChangeMetric, reference: &Frame) -> ChangeDetector {
        let mut det = ChangeDetector::new(40, 40, metric);
        let prepared = det.prepare(&reference.view());
        det.set_reference(prepared);
        det
    }

    #[test]
    fn first_frame_has_no_score() {
        let det = ChangeDetector::new(32, 18, ChangeMetric::GlobalMean);
        let frame = Frame::filled(64, 36, 3, 10);
        assert!(det.score(&det.prepare(&frame.view())).is_none());
        assert!(!det.has_reference());
    }

    #[test]
    fn global_mean_of_uniform_shift() {
        let base = Frame::filled(80, 80, 1, 100);
        let det = detector_with(ChangeMetric::GlobalMean, &base);
        let brighter = Frame::filled(80, 80, 1, 112);
        let score = det.score(&det.prepare(&brighter.view())).expect("score");
        assert!((score - 12.0).abs() < 1e-9);
        assert_eq!(det.score(&det.prepare(&base.view())), Some(0.0));
    }

    #[test]
    fn block_max_sees_local_change() {
        let base = Frame::filled(80, 80, 1, 0);
        let mut spot = base.clone();
        spot.fill_rect(0, 0, 8, 8, 255);

        let global = detector_with(ChangeMetric::GlobalMean, &base);
        let block = detector_with(ChangeMetric::BlockMax { block: 4 }, &base);
        let g = global.score(&global.prepare(&spot.view())).expect("score");
        let b = block.score(&block.prepare(&spot.view())).expect("score");
        // 4x4 of 40x40 comparison pixels changed
        assert!((g - 255.0 * 16.0 / 1600.0).abs() < 1e-9);
        assert!((b - 255.0).abs() < 1e-9);
    }

    #[test]
    fn windows_are_not_tile_aligned() {
        let base = Frame::filled(80, 80, 1, 0);
        let mut spot = base.clone();
        // 4x4 comparison pixels straddling the corner of four 4x4 tiles
        spot.fill_rect(4, 4, 12, 12, 200);

        let det = detector_with(ChangeMetric::BlockMax { block: 4 }, &base);
        let score = det.score(&det.prepare(&spot.view())).expect("score");
        assert!((score - 200.0).abs() < 1e-9, "score {score}");
    }

    #[test]
    fn block_larger_than_the_frame_is_clamped() {
        let base = Frame::filled(80, 80, 1, 50);
        let det = detector_with(ChangeMetric::BlockMax { block: 500 }, &base);
        let brighter = Frame::filled(80, 80, 1, 60);
        assert_eq!(det.score(&det.prepare(&brighter.view())), Some(10.0));
    }

    #[test]
    fn default_metric_catches_a_small_moderate_patch() {
        // 50x50 px at +20 in a 640x480 view, compared at 320x180
        let base = Frame::filled(640, 480, 3, 100);
        let mut stone = base.clone();
        stone.fill_rect(300, 200, 350, 250, 120);

        let score_with = |metric| {
            let mut det = ChangeDetector::new(320, 180, metric);
            let prepared = det.prepare(&base.view());
            det.set_reference(prepared);
            det.score(&det.prepare(&stone.view())).expect("score")
        };
        assert!(score_with(ChangeMetric::GlobalMean) < 1.0);
        let local = score_with(ChangeMetric::default());
        assert!((local - 20.0).abs() < 1e-9, "score {local}");
    }

    #[test]
    fn metric_config_is_tagged() {
        let m: ChangeMetric =
            serde_json::from_str(r#"{"kind":"block_max","block":16}"#).expect("parse");
        assert_eq!(m, ChangeMetric::BlockMax { block: 16 });
    }
}
