//! Core geometry for planar camera calibration and square-marker pose.
//!
//! Value types (correspondences, camera model, extrinsic pose, Euler
//! angles), projective helpers, a small dense Levenberg-Marquardt solver and
//! the persisted camera-model format. No image processing lives here.

mod board;
mod camera;
mod correspondence;
mod homography;
mod io;
mod logger;
mod pose;
mod rotation;

pub mod optim;
pub mod synthetic;

pub use board::{BoardSpecError, ChessboardSpec};
pub use camera::{
    CameraMatrix, CameraModel, CameraModelError, DistortionCoeffs, ImageSize, PixelRect,
    UndistortConfig,
};
pub use correspondence::{CorrespondenceError, CorrespondenceSet};
pub use homography::{collinearity_score, estimate_homography, homography_from_4pt, Homography};
pub use io::{load_camera_model, CalibrationRecord, LoadError};
pub use pose::ExtrinsicPose;
pub use rotation::{EulerAngles, GIMBAL_LOCK_EPS};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::{init_with_level, level_from_flags};
