//! Change-triggered frame capture for fixed overhead sheet cameras.
//!
//! A [`CaptureLoop`] polls a [`FrameSource`], detects scene changes with a
//! [`ChangeDetector`] and persists raw plus rectified frames through a
//! [`FrameSink`]. [`CaptureTask`] runs one loop per camera on its own thread.

mod camera;
mod capture;
mod change;
mod error;
mod io;
mod stop;
mod task;

pub use camera::{CameraId, Side};
pub use capture::{
    CaptureConfig, CaptureLoop, CaptureReport, CaptureState, CaptureStats, PollOutcome, StopReason,
};
pub use change::{ChangeDetector, ChangeMetric};
pub use error::{CaptureError, SinkError, SourceError};
pub use io::{FrameSink, FrameSource, FrameStamp};
pub use stop::StopSignal;
pub use task::CaptureTask;
