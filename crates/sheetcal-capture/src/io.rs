//! Collaborator traits of the capture loop.

use crate::error::{SinkError, SourceError};
use sheetcal_core::Frame;

/// Identifies one persisted capture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameStamp {
    /// Monotonic per-loop counter, starting at 0.
    pub sequence: u64,
    /// Wall-clock time of the fetch, milliseconds since the Unix epoch.
    pub unix_ms: u64,
}

/// Blocking supplier of frames (camera, video file, directory of stills).
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Frame, SourceError>;
}

/// Destination of triggered frames.
pub trait FrameSink: Send {
    fn save_raw(&mut self, stamp: &FrameStamp, frame: &Frame) -> Result<(), SinkError>;
    fn save_rectified(&mut self, stamp: &FrameStamp, frame: &Frame) -> Result<(), SinkError>;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        (**self).next_frame()
    }
}

impl<T: FrameSink + ?Sized> FrameSink for Box<T> {
    fn save_raw(&mut self, stamp: &FrameStamp, frame: &Frame) -> Result<(), SinkError> {
        (**self).save_raw(stamp, frame)
    }

    fn save_rectified(&mut self, stamp: &FrameStamp, frame: &Frame) -> Result<(), SinkError> {
        (**self).save_rectified(stamp, frame)
    }
}
