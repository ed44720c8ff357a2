//! Planar-target intrinsic calibration.
//!
//! Feed [`CorrespondenceSet`](calib_pose_core::CorrespondenceSet)s (one per
//! image of a flat board) to [`CalibrationSolver`] to recover the camera
//! matrix, Brown-Conrady distortion and one pose per view; check the result
//! with [`ReprojectionEvaluator`].
//!
//! ```no_run
//! use calib_pose_core::{ChessboardSpec, CorrespondenceSet};
//! use calib_pose_intrinsics::{CalibrationParams, CalibrationSolver};
//! # fn detections() -> Vec<Vec<nalgebra::Point2<f64>>> { Vec::new() }
//!
//! let board = ChessboardSpec::new(9, 6, 0.025).unwrap();
//! let views: Vec<CorrespondenceSet> = detections()
//!     .into_iter()
//!     .map(|corners| CorrespondenceSet::from_grid(&board, corners).unwrap())
//!     .collect();
//! let calib = CalibrationSolver::new(CalibrationParams::default())
//!     .solve(&views)
//!     .unwrap();
//! println!("rms = {:.3} px", calib.rms);
//! ```

mod dataset;
mod evaluate;
mod init;
mod solver;

pub use dataset::CalibrationDataset;
pub use evaluate::{EvaluateError, ReprojectionEvaluator, ReprojectionReport, ViewError};
pub use init::{view_homography, ViewRejection};
pub use solver::{
    Calibration, CalibrationError, CalibrationParams, CalibrationSolver, RejectedView,
};
