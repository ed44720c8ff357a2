//! Square fiducial marker pose.
//!
//! Given the four detected corners of a square marker of known side length
//! and a calibrated [`CameraModel`](calib_pose_core::CameraModel),
//! [`PoseEstimator`] returns the marker-to-camera transform or a
//! [`DegenerateReason`] saying why the corners cannot support one.
//!
//! Corners come in detector order: top-left, top-right, bottom-right,
//! bottom-left, as seen on the printed marker. The marker frame has its
//! origin at the square center, +x to the right, +y up and +z out of the
//! printed face.

mod estimator;
mod frame;
mod types;

pub use estimator::{marker_object_points, signed_area, PoseEstimator};
pub use frame::{centering_moves, marker_center, DEAD_ZONE_PX};
pub use types::{
    DegenerateReason, MarkerObservation, MarkerOutcome, MarkerPoseEstimate, MarkerPoseParams,
    MarkerPoseReport, Move, PoseError,
};
