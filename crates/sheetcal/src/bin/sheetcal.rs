//! sheetcal CLI: calibrate overhead sheet cameras, rectify stills and run
//! change-triggered capture over a directory of frames.

use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{info, warn};
use sheetcal::calib::{
    build_detector, load_calibration, save_calibration, AutoDetectParams, DetectorConfig,
    DistortionMode, ManualAnnotations, OutlineParams,
};
use sheetcal::capture::StopSignal;
use sheetcal::files::{load_frame, save_frame, DirectorySink, DirectorySource};
use sheetcal::{
    CameraId, CaptureLoop, Calibrator, PipelineHandle, RectificationPipeline, SheetcalConfig,
    Side, SurfaceModel,
};
use std::path::{Path, PathBuf};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "sheetcal")]
#[command(about = "Calibrate and rectify overhead curling sheet cameras")]
#[command(version)]
struct Cli {
    /// JSON configuration (calibration and capture sections, all optional).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `warn,sheetcal_capture=debug`.
    #[arg(long, global = true, env = "RUST_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a calibration from one still and write the record.
    Calibrate(CalibrateArgs),

    /// Rectify a still with a saved calibration record.
    Rectify(RectifyArgs),

    /// Persist changed frames from a directory of stills.
    Capture(CaptureArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    /// Use the detector configured in --config (manual by default).
    Config,
    /// Manual annotations from --annotations.
    Manual,
    /// Painted-line search with default parameters.
    Auto,
    /// Four corners of a bright sheet outline; assumes a distortion-free lens.
    Outline,
}

#[derive(Debug, Clone, Args)]
struct CalibrateArgs {
    /// Still image of the sheet.
    #[arg(long)]
    image: PathBuf,

    /// Traced lines and landmarks (JSON), required for manual mode.
    #[arg(long)]
    annotations: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ModeArg::Config)]
    mode: ModeArg,

    /// Where to write the calibration record (JSON).
    #[arg(long)]
    out: PathBuf,

    /// Directory for undistorted, rectified and cropped previews.
    #[arg(long)]
    preview: Option<PathBuf>,

    /// Refuse to write the record when the fit exceeds the acceptance thresholds.
    #[arg(long)]
    strict: bool,
}

#[derive(Debug, Clone, Args)]
struct RectifyArgs {
    /// Calibration record written by `calibrate`.
    #[arg(long)]
    calibration: PathBuf,

    #[arg(long)]
    image: PathBuf,

    /// Output image; format follows the extension.
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SideArg {
    Odd,
    Even,
}

#[derive(Debug, Clone, Args)]
struct CaptureArgs {
    /// Directory of stills replayed in name order.
    #[arg(long)]
    input: PathBuf,

    /// Output directory for raw frames (rectified frames go to `rectified/`).
    #[arg(long)]
    out: PathBuf,

    #[arg(long, default_value_t = 1)]
    sheet: u32,

    #[arg(long, value_enum, default_value_t = SideArg::Odd)]
    side: SideArg,

    /// Calibration record; without it only raw frames are saved.
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Override the configured poll interval.
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Override the configured change threshold.
    #[arg(long)]
    threshold: Option<f64>,
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let config = match &cli.config {
        Some(path) => SheetcalConfig::load_json(path)?,
        None => SheetcalConfig::default(),
    };

    match cli.command {
        Commands::Calibrate(args) => run_calibrate(&config, &args),
        Commands::Rectify(args) => run_rectify(&args),
        Commands::Capture(args) => run_capture(&config, &args),
    }
}

#[cfg(feature = "tracing")]
fn init_logging(spec: &str) -> CliResult<()> {
    let _ = tracing_log::LogTracer::init();
    let filter = tracing_subscriber::EnvFilter::try_new(spec)?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    Ok(())
}

#[cfg(not(feature = "tracing"))]
fn init_logging(spec: &str) -> CliResult<()> {
    env_logger::Builder::new()
        .parse_filters(spec)
        .format_timestamp_millis()
        .try_init()?;
    Ok(())
}

fn run_calibrate(config: &SheetcalConfig, args: &CalibrateArgs) -> CliResult<()> {
    let still = load_frame(&args.image)?;
    let annotations = args
        .annotations
        .as_ref()
        .map(|p| ManualAnnotations::load_json(p))
        .transpose()?;

    let detector_config = match args.mode {
        ModeArg::Config => config.calibration.detector.clone(),
        ModeArg::Manual => DetectorConfig::Manual,
        ModeArg::Auto => DetectorConfig::Automatic(AutoDetectParams::default()),
        ModeArg::Outline => DetectorConfig::SheetOutline(OutlineParams::default()),
    };
    if matches!(detector_config, DetectorConfig::Manual) && annotations.is_none() {
        return Err("manual mode needs --annotations".into());
    }

    let mut calibration = config.calibration.clone();
    if args.mode == ModeArg::Outline {
        calibration.distortion.mode = DistortionMode::Identity;
    }
    let calibrator = Calibrator::new(calibration, SurfaceModel::curling_sheet())?;
    let detector = build_detector(&detector_config, annotations);
    let pending = calibrator.calibrate(&still.view(), detector.as_ref())?;
    let result = pending.result();

    let fit = result.fit_error();
    println!(
        "distortion rms: {:.3} px (k1={:.6}, k2={:.6})",
        fit.distortion_rms_px,
        result.distortion.model.coefficients.k1,
        result.distortion.model.coefficients.k2
    );
    println!(
        "reprojection rms: {:.3} px ({} of {} correspondences)",
        fit.reprojection_rms_px,
        result.homography.inliers,
        result.correspondences.len()
    );
    println!(
        "crop: {}x{} at ({}, {})",
        result.crop.width, result.crop.height, result.crop.x, result.crop.y
    );

    if let Some(dir) = &args.preview {
        write_previews(&pending, &still, dir)?;
    }

    let limits = config.calibration.acceptance.for_mode(result.mode);
    let concerns = result.review(limits);
    for c in &concerns {
        warn!("{c}");
    }
    if args.strict && !concerns.is_empty() {
        pending.reject();
        return Err(format!("calibration rejected: {}", concerns.join("; ")).into());
    }

    save_calibration(result, &args.out)?;
    info!("calibration written to {}", args.out.display());
    Ok(())
}

fn write_previews(
    pending: &sheetcal::PendingCalibration,
    still: &sheetcal::Frame,
    dir: &Path,
) -> CliResult<()> {
    std::fs::create_dir_all(dir)?;
    let preview = pending.result().preview(&still.view())?;
    save_frame(&preview.undistorted, dir.join("undistorted.png"))?;
    save_frame(&preview.rectified, dir.join("rectified.png"))?;
    save_frame(&preview.cropped, dir.join("cropped.png"))?;
    info!("previews written to {}", dir.display());
    Ok(())
}

fn run_rectify(args: &RectifyArgs) -> CliResult<()> {
    let result = load_calibration(&args.calibration)?;
    let pipeline = RectificationPipeline::new(result)?;
    let still = load_frame(&args.image)?;
    let out = pipeline.rectify(&still.view())?;
    save_frame(&out, &args.out)?;
    println!("rectified {}x{} -> {}", out.width, out.height, args.out.display());
    Ok(())
}

fn run_capture(config: &SheetcalConfig, args: &CaptureArgs) -> CliResult<()> {
    let mut capture_config = config.capture.clone();
    if let Some(ms) = args.poll_ms {
        capture_config.poll_interval_ms = ms;
    }
    if let Some(t) = args.threshold {
        capture_config.change_threshold = t;
    }

    let side = match args.side {
        SideArg::Odd => Side::Odd,
        SideArg::Even => Side::Even,
    };
    let camera = CameraId::new(args.sheet, side);

    let handle = PipelineHandle::new();
    if let Some(path) = &args.calibration {
        handle.install(RectificationPipeline::new(load_calibration(path)?)?);
    }

    let source = DirectorySource::open(&args.input)?;
    let sink = DirectorySink::create(&args.out, camera)?;
    let mut capture = CaptureLoop::new(camera, capture_config, source, sink, handle);
    let report = capture.run(&StopSignal::new())?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
