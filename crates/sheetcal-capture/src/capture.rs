//! The polling capture state machine.

use crate::camera::CameraId;
use crate::change::{ChangeDetector, ChangeMetric};
use crate::error::{CaptureError, SinkError, SourceError};
use crate::io::{FrameSink, FrameSource, FrameStamp};
use crate::stop::StopSignal;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sheetcal_calib::{PipelineHandle, RectificationPipeline};
use sheetcal_core::Frame;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Parameters of one capture loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Change score at or above which a frame is persisted (0..255 gray levels).
    pub change_threshold: f64,
    /// Pause between polls.
    pub poll_interval_ms: u64,
    /// Consecutive fetch failures tolerated before the loop gives up.
    pub max_source_retries: u32,
    /// Size of the gray copy used for change detection.
    pub compare_width: usize,
    pub compare_height: usize,
    pub metric: ChangeMetric,
    /// Persist the frame that seeds the reference.
    pub save_initial_frame: bool,
    /// Stop after this many persisted frames.
    pub max_saved_frames: Option<usize>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            change_threshold: 5.0,
            poll_interval_ms: 1000,
            max_source_retries: 3,
            compare_width: 320,
            compare_height: 180,
            metric: ChangeMetric::default(),
            save_initial_frame: false,
            max_saved_frames: None,
        }
    }
}

impl CaptureConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    /// Waiting for the scene to change.
    Idle,
    /// A change was detected and the frame is being persisted.
    Triggered,
}

/// What a single poll did.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PollOutcome {
    /// First frame; it became the reference.
    Seeded { saved: bool },
    /// Below the change threshold.
    Unchanged { score: f64 },
    /// Change detected and persisted. `rectified` tells whether a
    /// rectified copy was written as well.
    Persisted { score: f64, rectified: bool },
    /// Change detected but the sink failed; the reference is kept.
    SinkFailed { score: f64 },
    /// Fetch failed; `attempt` consecutive failures so far.
    SourceRetry { attempt: u32 },
    /// The source has no more frames.
    Exhausted,
}

/// Counters accumulated over the life of a loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStats {
    pub polls: u64,
    pub triggers: u64,
    pub saved: u64,
    pub rectified: u64,
    pub sink_failures: u64,
    pub source_failures: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Signal,
    SourceExhausted,
    SavedLimit,
}

/// Summary returned when a loop ends without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureReport {
    pub camera: CameraId,
    pub stats: CaptureStats,
    pub reason: StopReason,
}

/// Change-triggered capture for one camera.
pub struct CaptureLoop<S, K> {
    camera: CameraId,
    config: CaptureConfig,
    source: S,
    sink: K,
    pipeline: PipelineHandle,
    detector: ChangeDetector,
    state: CaptureState,
    failures: u32,
    sequence: u64,
    stats: CaptureStats,
    target: String,
}

impl<S: FrameSource, K: FrameSink> CaptureLoop<S, K> {
    pub fn new(
        camera: CameraId,
        config: CaptureConfig,
        source: S,
        sink: K,
        pipeline: PipelineHandle,
    ) -> Self {
        let detector =
            ChangeDetector::new(config.compare_width, config.compare_height, config.metric);
        Self {
            camera,
            config,
            source,
            sink,
            pipeline,
            detector,
            state: CaptureState::Idle,
            failures: 0,
            sequence: 0,
            stats: CaptureStats::default(),
            target: format!("sheetcal_capture::{camera}"),
        }
    }

    pub fn camera(&self) -> CameraId {
        self.camera
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn pipeline(&self) -> &PipelineHandle {
        &self.pipeline
    }

    /// Fetch one frame and act on it.
    ///
    /// Fails only once more than `max_source_retries` consecutive fetches
    /// have failed.
    pub fn poll_once(&mut self) -> Result<PollOutcome, CaptureError> {
        self.stats.polls += 1;
        // one snapshot per iteration
        let pipeline = self.pipeline.current();

        let frame = match self.source.next_frame() {
            Ok(frame) => {
                self.failures = 0;
                frame
            }
            Err(SourceError::Exhausted) => {
                info!(target: self.target.as_str(), "source exhausted");
                return Ok(PollOutcome::Exhausted);
            }
            Err(err) => {
                self.failures += 1;
                self.stats.source_failures += 1;
                if self.failures > self.config.max_source_retries {
                    warn!(target: self.target.as_str(), "giving up on source: {err}");
                    return Err(CaptureError::SourceUnavailable {
                        attempts: self.failures,
                        last: err,
                    });
                }
                warn!(
                    target: self.target.as_str(),
                    "frame fetch failed ({}/{}): {err}",
                    self.failures,
                    self.config.max_source_retries
                );
                return Ok(PollOutcome::SourceRetry {
                    attempt: self.failures,
                });
            }
        };

        let prepared = self.detector.prepare(&frame.view());
        let Some(score) = self.detector.score(&prepared) else {
            let saved = self.config.save_initial_frame
                && self.persist_logged(&frame, pipeline.as_deref()).is_some();
            self.detector.set_reference(prepared);
            debug!(target: self.target.as_str(), "reference seeded (saved: {saved})");
            return Ok(PollOutcome::Seeded { saved });
        };

        if score < self.config.change_threshold {
            debug!(target: self.target.as_str(), "change {score:.2} below threshold");
            return Ok(PollOutcome::Unchanged { score });
        }

        self.state = CaptureState::Triggered;
        self.stats.triggers += 1;
        info!(
            target: self.target.as_str(),
            "change {score:.2} >= {:.2}, persisting frame",
            self.config.change_threshold
        );
        let outcome = match self.persist_logged(&frame, pipeline.as_deref()) {
            Some(rectified) => {
                self.detector.set_reference(prepared);
                PollOutcome::Persisted { score, rectified }
            }
            None => PollOutcome::SinkFailed { score },
        };
        self.state = CaptureState::Idle;
        Ok(outcome)
    }

    /// Poll until stopped, exhausted, or the saved-frame limit is reached.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, stop), fields(camera = %self.camera))
    )]
    pub fn run(&mut self, stop: &StopSignal) -> Result<CaptureReport, CaptureError> {
        info!(
            target: self.target.as_str(),
            "capture started (threshold {:.2}, every {} ms)",
            self.config.change_threshold,
            self.config.poll_interval_ms
        );
        let reason = loop {
            if stop.is_stopped() {
                break StopReason::Signal;
            }
            if self.poll_once()? == PollOutcome::Exhausted {
                break StopReason::SourceExhausted;
            }
            if self.reached_limit() {
                break StopReason::SavedLimit;
            }
            if stop.wait_timeout(self.config.poll_interval()) {
                break StopReason::Signal;
            }
        };
        info!(
            target: self.target.as_str(),
            "capture stopped ({reason:?}): {} polls, {} saved, {} rectified",
            self.stats.polls,
            self.stats.saved,
            self.stats.rectified
        );
        Ok(CaptureReport {
            camera: self.camera,
            stats: self.stats,
            reason,
        })
    }

    fn reached_limit(&self) -> bool {
        self.config
            .max_saved_frames
            .is_some_and(|max| self.stats.saved >= max as u64)
    }

    fn persist_logged(
        &mut self,
        frame: &Frame,
        pipeline: Option<&RectificationPipeline>,
    ) -> Option<bool> {
        match self.persist(frame, pipeline) {
            Ok(rectified) => Some(rectified),
            Err(err) => {
                warn!(target: self.target.as_str(), "saving frame {} failed: {err}", self.sequence);
                self.stats.sink_failures += 1;
                None
            }
        }
    }

    /// Write the raw frame and, with an active pipeline, its rectified copy.
    /// Returns whether a rectified copy was written; only a failed raw write
    /// is an error.
    fn persist(
        &mut self,
        frame: &Frame,
        pipeline: Option<&RectificationPipeline>,
    ) -> Result<bool, SinkError> {
        let stamp = FrameStamp {
            sequence: self.sequence,
            unix_ms: unix_ms(),
        };
        self.sink.save_raw(&stamp, frame)?;
        self.sequence += 1;
        self.stats.saved += 1;

        let Some(pipeline) = pipeline else {
            return Ok(false);
        };
        let rectified = match pipeline.rectify(&frame.view()) {
            Ok(out) => out,
            Err(err) => {
                warn!(target: self.target.as_str(), "rectification skipped: {err}");
                return Ok(false);
            }
        };
        if let Err(err) = self.sink.save_rectified(&stamp, &rectified) {
            warn!(
                target: self.target.as_str(),
                "saving rectified frame {} failed: {err}",
                stamp.sequence
            );
            self.stats.sink_failures += 1;
            return Ok(false);
        }
        self.stats.rectified += 1;
        Ok(true)
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_and_partial_json() {
        let cfg = CaptureConfig::default();
        assert_eq!(cfg.change_threshold, 5.0);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(1));
        assert_eq!((cfg.compare_width, cfg.compare_height), (320, 180));

        let cfg: CaptureConfig = serde_json::from_str(
            r#"{"change_threshold": 8.5, "metric": {"kind": "block_max", "block": 20}}"#,
        )
        .expect("parse");
        assert_eq!(cfg.change_threshold, 8.5);
        assert_eq!(cfg.metric, ChangeMetric::BlockMax { block: 20 });
        assert_eq!(cfg.max_source_retries, 3);
        assert_eq!(cfg.max_saved_frames, None);
    }
}
