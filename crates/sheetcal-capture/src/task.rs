use crate::camera::CameraId;
use crate::capture::{CaptureLoop, CaptureReport};
use crate::error::CaptureError;
use crate::io::{FrameSink, FrameSource};
use crate::stop::StopSignal;
use log::{info, warn};
use std::thread::{self, JoinHandle};

type TaskResult = Result<CaptureReport, CaptureError>;

/// Owned handle to a capture loop running on its own thread.
///
/// Dropping the handle stops the loop and waits for it to finish.
pub struct CaptureTask {
    camera: CameraId,
    stop: StopSignal,
    handle: Option<JoinHandle<TaskResult>>,
}

impl CaptureTask {
    /// Start `capture` on a thread named after its camera.
    pub fn spawn<S, K>(mut capture: CaptureLoop<S, K>) -> std::io::Result<Self>
    where
        S: FrameSource + 'static,
        K: FrameSink + 'static,
    {
        let camera = capture.camera();
        let stop = StopSignal::new();
        let signal = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("capture-{camera}"))
            .spawn(move || capture.run(&signal))?;
        info!("capture task for {camera} started");
        Ok(Self {
            camera,
            stop,
            handle: Some(handle),
        })
    }

    pub fn camera(&self) -> CameraId {
        self.camera
    }

    /// Signal handle shared with the loop.
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Ask the loop to stop after its current iteration.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Wait for the loop to end on its own or after [`CaptureTask::stop`].
    pub fn join(mut self) -> TaskResult {
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or(Err(CaptureError::Panicked)),
            None => Err(CaptureError::Panicked),
        }
    }
}

impl Drop for CaptureTask {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.stop();
        match handle.join() {
            Ok(Ok(report)) => info!("capture task for {} ended: {:?}", self.camera, report.reason),
            Ok(Err(err)) => warn!("capture task for {} failed: {err}", self.camera),
            Err(_) => warn!("capture task for {} panicked", self.camera),
        }
    }
}
