//! High-level facade crate for the `calib-pose-*` workspace.
//!
//! This crate provides:
//! - re-exports of the core, intrinsics and marker crates
//! - JSON input formats for detector output ([`input`])
//! - (feature `cli`) the `calib-pose` command-line tool
//!
//! ## Quickstart
//!
//! ```no_run
//! use calib_pose::input::{load_json, ViewsFile};
//! use calib_pose::intrinsics::CalibrationSolver;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let views: ViewsFile = load_json("views.json")?;
//! let dataset = views.into_dataset()?;
//! let calib = dataset.calibrate(&CalibrationSolver::default())?;
//! calib.to_record(dataset.image_size()).write_json("camera.json")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `calib_pose::core`: camera model, poses, Euler angles, LM solver, persistence.
//! - `calib_pose::intrinsics`: planar-target calibration and reprojection reports.
//! - `calib_pose::marker`: square-marker pose and per-frame batches.

pub use calib_pose_core as core;
pub use calib_pose_intrinsics as intrinsics;
pub use calib_pose_marker as marker;

pub use calib_pose_core::{
    CalibrationRecord, CameraMatrix, CameraModel, ChessboardSpec, CorrespondenceSet,
    DistortionCoeffs, EulerAngles, ExtrinsicPose, ImageSize,
};
pub use calib_pose_intrinsics::{Calibration, CalibrationError, CalibrationSolver};
pub use calib_pose_marker::{MarkerOutcome, PoseError, PoseEstimator};

pub mod input;
