use sheetcal_calib::distortion::DistortionModel;
use sheetcal_calib::{
    CalibrationResult, DistortionFit, InputMode, PipelineHandle, RectificationPipeline,
    RectifiedSpace, SurfaceHomography,
};
use sheetcal_capture::{
    CameraId, CaptureConfig, CaptureError, CaptureLoop, CaptureState, CaptureTask, FrameSink,
    FrameSource, FrameStamp, PollOutcome, Side, SinkError, SourceError, StopReason,
};
use sheetcal_core::{CropRect, Frame, Homography, MetricRect};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SIZE: usize = 300;

fn camera() -> CameraId {
    CameraId::new(2, Side::Even)
}

fn quiet() -> Frame {
    Frame::filled(SIZE, SIZE, 3, 0)
}

fn with_patch() -> Frame {
    let mut f = quiet();
    f.fill_rect(200, 200, 250, 250, 255);
    f
}

fn fast_config() -> CaptureConfig {
    CaptureConfig {
        poll_interval_ms: 0,
        ..CaptureConfig::default()
    }
}

/// Calibration mapping 10 raw pixels to one surface unit, cropped to 100x100.
fn pipeline() -> RectificationPipeline {
    let image_from_metric = Homography::scale_translate(10.0, 10.0, 0.0, 0.0);
    let result = CalibrationResult {
        frame_width: SIZE,
        frame_height: SIZE,
        mode: InputMode::Manual,
        distortion: DistortionFit {
            model: DistortionModel::identity(SIZE, SIZE, 270.0),
            initial_rms: 0.0,
            residual_rms: 0.0,
            iterations: 0,
            lines: 3,
            points: 30,
        },
        homography: SurfaceHomography {
            metric_from_image: image_from_metric.inverse().expect("invertible"),
            image_from_metric,
            condition_number: 1.0,
            rms_error_px: 0.0,
            inliers: 4,
            inlier_mask: vec![true; 4],
        },
        correspondences: Vec::new(),
        rectified: RectifiedSpace::covering(&MetricRect::new(0.0, 0.0, 30.0, 30.0), 5.0)
            .expect("space"),
        roi: MetricRect::new(0.0, 0.0, 20.0, 20.0),
        crop: CropRect {
            x: 0,
            y: 0,
            width: 100,
            height: 100,
        },
    };
    RectificationPipeline::new(result).expect("pipeline")
}

struct ScriptedSource {
    frames: VecDeque<Result<Frame, SourceError>>,
}

impl ScriptedSource {
    fn new(frames: impl IntoIterator<Item = Result<Frame, SourceError>>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        self.frames.pop_front().unwrap_or(Err(SourceError::Exhausted))
    }
}

struct EndlessSource(Frame);

impl FrameSource for EndlessSource {
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        Ok(self.0.clone())
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Saved {
    Raw { sequence: u64, width: usize },
    Rectified { sequence: u64, width: usize },
}

#[derive(Clone, Default)]
struct MemorySink {
    saved: Arc<Mutex<Vec<Saved>>>,
    fail_next_raw: Arc<Mutex<usize>>,
}

impl MemorySink {
    fn saved(&self) -> Vec<Saved> {
        self.saved.lock().expect("lock").clone()
    }
}

impl FrameSink for MemorySink {
    fn save_raw(&mut self, stamp: &FrameStamp, frame: &Frame) -> Result<(), SinkError> {
        let mut failures = self.fail_next_raw.lock().expect("lock");
        if *failures > 0 {
            *failures -= 1;
            return Err(SinkError::Io(io::Error::other("disk full")));
        }
        self.saved.lock().expect("lock").push(Saved::Raw {
            sequence: stamp.sequence,
            width: frame.width,
        });
        Ok(())
    }

    fn save_rectified(&mut self, stamp: &FrameStamp, frame: &Frame) -> Result<(), SinkError> {
        self.saved.lock().expect("lock").push(Saved::Rectified {
            sequence: stamp.sequence,
            width: frame.width,
        });
        Ok(())
    }
}

#[test]
fn one_change_in_six_frames_persists_one_pair() {
    let frames = (0..5).map(|_| Ok(quiet())).chain([Ok(with_patch())]);
    let sink = MemorySink::default();
    let mut capture = CaptureLoop::new(
        camera(),
        fast_config(),
        ScriptedSource::new(frames),
        sink.clone(),
        PipelineHandle::with_pipeline(pipeline()),
    );

    let report = capture.run(&Default::default()).expect("run");
    assert_eq!(report.reason, StopReason::SourceExhausted);
    assert_eq!(report.stats.triggers, 1);
    assert_eq!(report.stats.saved, 1);
    assert_eq!(report.stats.rectified, 1);
    assert_eq!(
        sink.saved(),
        vec![
            Saved::Raw {
                sequence: 0,
                width: SIZE
            },
            Saved::Rectified {
                sequence: 0,
                width: 100
            },
        ]
    );
    assert_eq!(capture.state(), CaptureState::Idle);
}

#[test]
fn moderate_local_change_in_a_vga_frame_triggers_once() {
    let ice = Frame::filled(640, 480, 3, 100);
    let mut stone = ice.clone();
    stone.fill_rect(300, 200, 350, 250, 120);
    let frames = (0..5).map(|_| Ok(ice.clone())).chain([Ok(stone)]);
    let sink = MemorySink::default();
    let mut capture = CaptureLoop::new(
        camera(),
        fast_config(),
        ScriptedSource::new(frames),
        sink.clone(),
        PipelineHandle::new(),
    );

    let report = capture.run(&Default::default()).expect("run");
    assert_eq!(report.reason, StopReason::SourceExhausted);
    assert_eq!(report.stats.triggers, 1);
    assert_eq!(report.stats.saved, 1);
    assert_eq!(
        sink.saved(),
        vec![Saved::Raw {
            sequence: 0,
            width: 640
        }]
    );
}

#[test]
fn poll_outcomes_follow_the_scene() {
    let frames = [quiet(), quiet(), with_patch(), with_patch(), quiet()].map(Ok);
    let sink = MemorySink::default();
    let handle = PipelineHandle::new();
    let mut capture = CaptureLoop::new(
        camera(),
        fast_config(),
        ScriptedSource::new(frames),
        sink.clone(),
        handle.clone(),
    );

    assert_eq!(
        capture.poll_once().expect("poll"),
        PollOutcome::Seeded { saved: false }
    );
    assert_eq!(
        capture.poll_once().expect("poll"),
        PollOutcome::Unchanged { score: 0.0 }
    );

    // no calibration yet: raw only
    let PollOutcome::Persisted { score, rectified } = capture.poll_once().expect("poll") else {
        panic!("expected a trigger");
    };
    assert!(score >= 5.0);
    assert!(!rectified);

    // the patch is now the reference
    assert!(matches!(
        capture.poll_once().expect("poll"),
        PollOutcome::Unchanged { .. }
    ));

    // a calibration accepted mid-run applies to the next trigger
    handle.install(pipeline());
    assert!(matches!(
        capture.poll_once().expect("poll"),
        PollOutcome::Persisted {
            rectified: true,
            ..
        }
    ));
    assert_eq!(capture.poll_once().expect("poll"), PollOutcome::Exhausted);
    assert_eq!(sink.saved().len(), 3);
}

#[test]
fn failed_save_keeps_the_old_reference() {
    let frames = [quiet(), with_patch(), with_patch()].map(Ok);
    let sink = MemorySink::default();
    *sink.fail_next_raw.lock().expect("lock") = 1;
    let mut capture = CaptureLoop::new(
        camera(),
        fast_config(),
        ScriptedSource::new(frames),
        sink.clone(),
        PipelineHandle::new(),
    );

    capture.poll_once().expect("seed");
    assert!(matches!(
        capture.poll_once().expect("poll"),
        PollOutcome::SinkFailed { .. }
    ));
    // same frame again still counts as a change
    assert!(matches!(
        capture.poll_once().expect("poll"),
        PollOutcome::Persisted { .. }
    ));
    assert_eq!(capture.stats().sink_failures, 1);
    assert_eq!(
        sink.saved(),
        vec![Saved::Raw {
            sequence: 0,
            width: SIZE
        }]
    );
}

#[test]
fn persistent_source_failure_is_fatal() {
    let failures = (0..10).map(|_| Err(SourceError::Io(io::Error::other("camera offline"))));
    let mut capture = CaptureLoop::new(
        camera(),
        fast_config(),
        ScriptedSource::new(failures),
        MemorySink::default(),
        PipelineHandle::new(),
    );

    let err = capture.run(&Default::default()).unwrap_err();
    match err {
        CaptureError::SourceUnavailable { attempts, last } => {
            assert_eq!(attempts, 4);
            assert!(matches!(last, SourceError::Io(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(capture.stats().source_failures, 4);
}

#[test]
fn transient_source_failure_recovers() {
    let frames = vec![
        Ok(quiet()),
        Err(SourceError::Decode {
            detail: "truncated".into(),
        }),
        Ok(with_patch()),
    ];
    let sink = MemorySink::default();
    let mut capture = CaptureLoop::new(
        camera(),
        fast_config(),
        ScriptedSource::new(frames),
        sink.clone(),
        PipelineHandle::new(),
    );
    let report = capture.run(&Default::default()).expect("run");
    assert_eq!(report.stats.source_failures, 1);
    assert_eq!(report.stats.saved, 1);
}

#[test]
fn saved_limit_ends_the_loop() {
    let frames = [quiet(), with_patch(), quiet(), with_patch()].map(Ok);
    let config = CaptureConfig {
        max_saved_frames: Some(2),
        save_initial_frame: true,
        ..fast_config()
    };
    let sink = MemorySink::default();
    let mut capture = CaptureLoop::new(
        camera(),
        config,
        ScriptedSource::new(frames),
        sink.clone(),
        PipelineHandle::new(),
    );
    let report = capture.run(&Default::default()).expect("run");
    assert_eq!(report.reason, StopReason::SavedLimit);
    assert_eq!(report.stats.saved, 2);
    assert_eq!(report.stats.polls, 2);
}

#[test]
fn task_stops_on_request() {
    let sink = MemorySink::default();
    let capture = CaptureLoop::new(
        camera(),
        CaptureConfig {
            poll_interval_ms: 5,
            ..CaptureConfig::default()
        },
        EndlessSource(quiet()),
        sink.clone(),
        PipelineHandle::new(),
    );
    let task = CaptureTask::spawn(capture).expect("spawn");
    assert_eq!(task.camera(), camera());
    std::thread::sleep(Duration::from_millis(30));
    assert!(task.is_running());

    task.stop();
    let report = task.join().expect("report");
    assert_eq!(report.reason, StopReason::Signal);
    assert!(report.stats.polls >= 1);
    assert!(sink.saved().is_empty());
}

#[test]
fn dropping_the_task_stops_it() {
    let sink = MemorySink::default();
    let capture = CaptureLoop::new(
        camera(),
        CaptureConfig {
            poll_interval_ms: 60_000,
            ..CaptureConfig::default()
        },
        EndlessSource(quiet()),
        sink,
        PipelineHandle::new(),
    );
    let task = CaptureTask::spawn(capture).expect("spawn");
    let signal = task.stop_signal().clone();
    drop(task);
    assert!(signal.is_stopped());
}
