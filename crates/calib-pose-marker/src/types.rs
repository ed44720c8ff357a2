use calib_pose_core::{EulerAngles, ExtrinsicPose};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Pose-estimation gates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerPoseParams {
    /// Largest accepted angle between the marker normal and the line of
    /// sight, in degrees.
    pub max_view_angle_deg: f64,
    /// Largest accepted refined corner reprojection RMS, in pixels.
    pub max_reprojection_px: f64,
    /// Smallest accepted quad area, in square pixels.
    pub min_area_px: f64,
    pub max_iterations: usize,
}

impl Default for MarkerPoseParams {
    fn default() -> Self {
        Self {
            max_view_angle_deg: 80.0,
            max_reprojection_px: 4.0,
            min_area_px: 16.0,
            max_iterations: 20,
        }
    }
}

/// Why a marker pose was not produced.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DegenerateReason {
    #[error("expected 4 corners, got {count}")]
    CornerCount { count: usize },
    #[error("corner {index} is not finite")]
    NonFiniteCorner { index: usize },
    #[error("side length must be finite and > 0 (got {length})")]
    InvalidSideLength { length: f64 },
    #[error("corners do not form a convex quadrilateral")]
    NonConvex,
    #[error("corners wind the wrong way (expected top-left, top-right, bottom-right, bottom-left)")]
    ReversedWinding,
    #[error("quad area {area:.1} px^2 below minimum {min:.1}")]
    TooSmall { area: f64, min: f64 },
    #[error("corner {index} could not be undistorted")]
    Undistort { index: usize },
    #[error("square-to-image homography is degenerate")]
    Homography,
    #[error("pose places the marker behind the camera")]
    BehindCamera,
    #[error("marker seen edge-on ({angle_deg:.1} deg > {max_deg:.1} deg)")]
    EdgeOn { angle_deg: f64, max_deg: f64 },
    #[error("corners are not consistent with a square (rms {rms:.2} px > {max:.2} px)")]
    Inconsistent { rms: f64, max: f64 },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PoseError {
    #[error("degenerate marker: {0}")]
    DegenerateMarker(DegenerateReason),
}

impl From<DegenerateReason> for PoseError {
    fn from(reason: DegenerateReason) -> Self {
        Self::DegenerateMarker(reason)
    }
}

/// Pose plus the diagnostics gathered while estimating it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct MarkerPoseEstimate {
    pub pose: ExtrinsicPose,
    /// Refined corner reprojection RMS, in pixels.
    pub reprojection_rms: f64,
    /// Angle between the marker normal and the line of sight, in degrees.
    pub view_angle_deg: f64,
    pub iterations: usize,
}

/// One detected marker: identifier plus corners in detector order
/// (top-left, top-right, bottom-right, bottom-left).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerObservation {
    pub id: u32,
    pub corners: Vec<Point2<f64>>,
}

/// Direction to move the camera so the marker drifts toward the frame
/// center.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Move {
    Left,
    Right,
    Up,
    Down,
}

impl std::fmt::Display for Move {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Move::Left => "move left",
            Move::Right => "move right",
            Move::Up => "move up",
            Move::Down => "move down",
        };
        f.write_str(s)
    }
}

/// Per-marker output handed to presentation or telemetry.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MarkerPoseReport {
    pub id: u32,
    pub pose: ExtrinsicPose,
    /// Degrees, recomputed from `pose`.
    pub euler: EulerAngles,
    /// Camera-to-marker distance `|t|`, in the unit of the side length
    /// passed to the estimator (metres in practice).
    pub distance: f64,
    /// Mean of the corner pixels.
    pub center: Point2<f64>,
    pub reprojection_rms: f64,
    /// Empty when the marker is centered or the frame size is unknown.
    pub moves: Vec<Move>,
}

/// Outcome for one marker of a frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MarkerOutcome {
    Pose(MarkerPoseReport),
    Rejected { id: u32, reason: DegenerateReason },
}

impl MarkerOutcome {
    pub fn id(&self) -> u32 {
        match self {
            Self::Pose(r) => r.id,
            Self::Rejected { id, .. } => *id,
        }
    }

    pub fn report(&self) -> Option<&MarkerPoseReport> {
        match self {
            Self::Pose(r) => Some(r),
            Self::Rejected { .. } => None,
        }
    }
}
