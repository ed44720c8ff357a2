//! Rotation <-> Euler angle conversion.
//!
//! Convention: `R = Rz(roll) * Ry(pitch) * Rx(yaw)`, angles in degrees.
//! `yaw` is the rotation about the camera x-axis, `pitch` about y and
//! `roll` about z, matching the labelling used by the marker trackers that
//! consume these angles.

use nalgebra::{Matrix3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

/// Threshold on `sqrt(R00^2 + R10^2)` below which the decomposition is
/// treated as gimbal-locked.
pub const GIMBAL_LOCK_EPS: f64 = 1e-6;

/// Ordered `(yaw, pitch, roll)` triple in degrees.
///
/// Derived data: always recomputed from a rotation, never stored as the
/// source of truth.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EulerAngles {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

impl EulerAngles {
    pub fn new(yaw: f64, pitch: f64, roll: f64) -> Self {
        Self { yaw, pitch, roll }
    }

    /// Decompose a rotation matrix.
    ///
    /// Near `pitch = ±90°` the yaw and roll axes coincide; roll is then fixed
    /// to `0` and yaw absorbs the remaining degree of freedom.
    pub fn from_rotation(rotation: &Rotation3<f64>) -> Self {
        Self::from_matrix(rotation.matrix())
    }

    /// Decompose a (nearly) orthonormal 3x3 matrix.
    pub fn from_matrix(r: &Matrix3<f64>) -> Self {
        let sy = (r[(0, 0)] * r[(0, 0)] + r[(1, 0)] * r[(1, 0)]).sqrt();

        let (x, y, z) = if sy >= GIMBAL_LOCK_EPS {
            (
                r[(2, 1)].atan2(r[(2, 2)]),
                (-r[(2, 0)]).atan2(sy),
                r[(1, 0)].atan2(r[(0, 0)]),
            )
        } else {
            ((-r[(1, 2)]).atan2(r[(1, 1)]), (-r[(2, 0)]).atan2(sy), 0.0)
        };

        Self {
            yaw: x.to_degrees(),
            pitch: y.to_degrees(),
            roll: z.to_degrees(),
        }
    }

    /// Decompose a Rodrigues (axis-angle) vector.
    pub fn from_rvec(rvec: &Vector3<f64>) -> Self {
        Self::from_rotation(&Rotation3::from_scaled_axis(*rvec))
    }

    /// Inverse construction `Rz(roll) * Ry(pitch) * Rx(yaw)`.
    pub fn to_rotation(&self) -> Rotation3<f64> {
        let rx = Rotation3::from_axis_angle(&Vector3::x_axis(), self.yaw.to_radians());
        let ry = Rotation3::from_axis_angle(&Vector3::y_axis(), self.pitch.to_radians());
        let rz = Rotation3::from_axis_angle(&Vector3::z_axis(), self.roll.to_radians());
        rz * ry * rx
    }

    /// True if the angles sit on the gimbal-lock boundary.
    pub fn is_gimbal_locked(&self) -> bool {
        let sy = self.pitch.to_radians().cos().abs();
        sy < GIMBAL_LOCK_EPS
    }
}
