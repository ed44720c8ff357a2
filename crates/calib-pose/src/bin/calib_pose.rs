//! calib-pose CLI: camera calibration and marker pose from detector output.

use std::path::PathBuf;

use calib_pose::input::{load_json, write_json, FrameFile, ViewsFile};
use calib_pose_core::{load_camera_model, ImageSize};
use calib_pose_intrinsics::{CalibrationParams, CalibrationSolver};
use calib_pose_marker::{MarkerOutcome, MarkerPoseParams, PoseEstimator};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "calib-pose")]
#[command(about = "Calibrate a camera from chessboard detections and estimate square-marker poses")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit JSON log lines (requires the `tracing` feature).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve intrinsics and distortion from chessboard corner detections.
    Calibrate(CalibrateArgs),

    /// Estimate the pose of every marker in a frame.
    Pose(PoseArgs),

    /// Print the undistorted camera matrix and valid-pixel region.
    UndistortRoi(UndistortRoiArgs),
}

#[derive(Debug, Clone, Args)]
struct CalibrateArgs {
    /// Detections: `{ board, image_size?, views: [[[u, v], ...] | null, ...] }`.
    #[arg(long)]
    input: PathBuf,

    /// Path to write the camera model (JSON).
    #[arg(long)]
    out: PathBuf,

    /// Solver parameters (JSON, partial allowed).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to write the per-view reprojection report (JSON).
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct PoseArgs {
    /// Camera model written by `calibrate`.
    #[arg(long)]
    camera: PathBuf,

    /// Marker detections: `{ image_size?, markers: [{ id, corners }] }`.
    #[arg(long)]
    input: PathBuf,

    /// Printed marker side length; translations come out in the same unit.
    #[arg(long, default_value = "0.2")]
    marker_length: f64,

    /// Estimator gates (JSON, partial allowed).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to write per-marker outcomes (JSON).
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct UndistortRoiArgs {
    /// Camera model written by `calibrate`.
    #[arg(long)]
    camera: PathBuf,

    #[arg(long)]
    width: u32,

    #[arg(long)]
    height: u32,

    /// 0 keeps only valid pixels, 1 keeps every source pixel.
    #[arg(long, default_value = "1.0")]
    alpha: f64,
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    match cli.command {
        Commands::Calibrate(args) => run_calibrate(&args),
        Commands::Pose(args) => run_pose(&args),
        Commands::UndistortRoi(args) => run_undistort_roi(&args),
    }
}

#[cfg(feature = "tracing")]
fn init_logging(cli: &Cli) -> CliResult<()> {
    let level = calib_pose_core::level_from_flags(cli.verbose, cli.quiet);
    calib_pose_core::init_tracing(level, cli.log_json);
    Ok(())
}

#[cfg(not(feature = "tracing"))]
fn init_logging(cli: &Cli) -> CliResult<()> {
    if cli.log_json {
        return Err("--log-json needs a build with the `tracing` feature".into());
    }
    calib_pose_core::init_with_level(calib_pose_core::level_from_flags(cli.verbose, cli.quiet))?;
    Ok(())
}

// ── calibrate ──────────────────────────────────────────────────────────

fn run_calibrate(args: &CalibrateArgs) -> CliResult<()> {
    let params: CalibrationParams = match &args.config {
        Some(path) => load_json(path)?,
        None => CalibrationParams::default(),
    };
    let views: ViewsFile = load_json(&args.input)?;
    let dataset = views.into_dataset()?;
    println!("{}", dataset.summary());

    let calib = dataset.calibrate(&CalibrationSolver::new(params))?;
    let report = calib.reprojection_report(dataset.views())?;

    let k = calib.model.matrix;
    println!(
        "fx {:.3} fy {:.3} cx {:.3} cy {:.3}",
        k.fx(),
        k.fy(),
        k.cx(),
        k.cy()
    );
    println!("distortion {:?}", calib.model.distortion.to_array());
    println!(
        "reprojection: rms {:.4} px, mean {:.4} px (std {:.4}) over {} views",
        calib.rms,
        report.mean,
        report.std_dev,
        report.views.len()
    );
    println!(
        "average reprojection error: {:.6} +/- {:.6}",
        report.l2_mean, report.l2_std_dev
    );
    for rejected in &calib.rejected {
        println!("view {} excluded: {}", rejected.index, rejected.reason);
    }

    calib.to_record(dataset.image_size()).write_json(&args.out)?;
    log::info!("camera model written to {}", args.out.display());

    if let Some(path) = &args.report {
        write_json(path, &report)?;
        log::info!("reprojection report written to {}", path.display());
    }
    Ok(())
}

// ── pose ───────────────────────────────────────────────────────────────

fn run_pose(args: &PoseArgs) -> CliResult<()> {
    let model = load_camera_model(&args.camera)?;
    let params: MarkerPoseParams = match &args.config {
        Some(path) => load_json(path)?,
        None => MarkerPoseParams::default(),
    };
    let frame: FrameFile = load_json(&args.input)?;

    let outcomes = PoseEstimator::new(params).estimate_frame(
        &frame.markers,
        args.marker_length,
        &model,
        frame.image_size,
    );

    for outcome in &outcomes {
        match outcome {
            MarkerOutcome::Pose(r) => {
                let moves: Vec<String> = r.moves.iter().map(ToString::to_string).collect();
                println!(
                    "marker {}: yaw {:.1} pitch {:.1} roll {:.1} distance {:.3}{}",
                    r.id,
                    r.euler.yaw,
                    r.euler.pitch,
                    r.euler.roll,
                    r.distance,
                    if moves.is_empty() {
                        String::new()
                    } else {
                        format!(" ({})", moves.join(", "))
                    }
                );
            }
            MarkerOutcome::Rejected { id, reason } => {
                println!("marker {id}: rejected ({reason})");
            }
        }
    }

    if let Some(path) = &args.out {
        write_json(path, &outcomes)?;
        log::info!("marker outcomes written to {}", path.display());
    }
    Ok(())
}

// ── undistort-roi ──────────────────────────────────────────────────────

#[derive(Serialize)]
struct UndistortRoiOutput {
    camera_matrix: [f64; 9],
    roi: calib_pose_core::PixelRect,
}

fn run_undistort_roi(args: &UndistortRoiArgs) -> CliResult<()> {
    let model = load_camera_model(&args.camera)?;
    let size = ImageSize::new(args.width, args.height);
    let (matrix, roi) = model
        .optimal_new_camera_matrix(size, args.alpha)
        .ok_or_else(|| -> CliError {
            format!("no undistorted view for a {}x{} image", args.width, args.height).into()
        })?;

    let output = UndistortRoiOutput {
        camera_matrix: matrix.to_row_major(),
        roi,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
