use nalgebra::{Matrix3, Point3, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::EulerAngles;

/// Rigid transform from object (board / marker) space into camera space.
///
/// `p_cam = rotation * p_obj + translation`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtrinsicPose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl ExtrinsicPose {
    pub fn new(rotation: Rotation3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Rotation3::identity(), Vector3::zeros())
    }

    /// Build from a Rodrigues rotation vector and a translation.
    pub fn from_rvec_tvec(rvec: Vector3<f64>, tvec: Vector3<f64>) -> Self {
        Self::new(Rotation3::from_scaled_axis(rvec), tvec)
    }

    /// Rodrigues (axis-angle) vector of the rotation, in radians. The angle
    /// lies in `[0, pi]`; half turns keep their axis.
    #[inline]
    pub fn rvec(&self) -> Vector3<f64> {
        UnitQuaternion::from_rotation_matrix(&self.rotation).scaled_axis()
    }

    /// Map an object-space point into camera space.
    #[inline]
    pub fn transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        self.rotation * p + self.translation
    }

    /// Euclidean distance from the camera center to the object origin.
    #[inline]
    pub fn distance(&self) -> f64 {
        self.translation.norm()
    }

    pub fn euler(&self) -> EulerAngles {
        EulerAngles::from_rotation(&self.rotation)
    }

    /// Pack as `[rx, ry, rz, tx, ty, tz]`.
    pub fn to_params(&self) -> [f64; 6] {
        let r = self.rvec();
        let t = self.translation;
        [r.x, r.y, r.z, t.x, t.y, t.z]
    }

    pub fn from_params(p: &[f64]) -> Option<Self> {
        if p.len() < 6 || p[..6].iter().any(|v| !v.is_finite()) {
            return None;
        }
        Some(Self::from_rvec_tvec(
            Vector3::new(p[0], p[1], p[2]),
            Vector3::new(p[3], p[4], p[5]),
        ))
    }

    /// Decompose a plane-to-image homography into the pose of the `z = 0`
    /// plane, given intrinsics `k`. Pass the identity for a homography onto
    /// normalized image coordinates.
    ///
    /// The rotation is projected onto SO(3) and the sign chosen so the plane
    /// lies in front of the camera. `None` for a degenerate `h`.
    pub fn from_planar_homography(k: &Matrix3<f64>, h: &Matrix3<f64>) -> Option<Self> {
        let k_inv = k.try_inverse()?;
        let b1 = k_inv * h.column(0);
        let b2 = k_inv * h.column(1);
        let b3 = k_inv * h.column(2);

        let (n1, n2) = (b1.norm(), b2.norm());
        if n1 <= 1e-12 || n2 <= 1e-12 {
            return None;
        }
        // average the two column scales
        let mut lambda = 2.0 / (n1 + n2);
        if b3.z < 0.0 {
            lambda = -lambda;
        }

        let r1 = b1 * lambda;
        let r2 = b2 * lambda;
        let r3 = r1.cross(&r2);
        if r3.norm() <= 1e-12 {
            return None;
        }
        let t = b3 * lambda;

        let svd = Matrix3::from_columns(&[r1, r2, r3]).svd(true, true);
        let (u, v_t) = (svd.u?, svd.v_t?);
        let mut r = u * v_t;
        if r.determinant() < 0.0 {
            let mut u_flipped = u;
            u_flipped.column_mut(2).neg_mut();
            r = u_flipped * v_t;
        }

        let pose = Self::new(Rotation3::from_matrix_unchecked(r), t);
        pose.to_params()
            .iter()
            .all(|v| v.is_finite())
            .then_some(pose)
    }

    /// Angle in radians of the relative rotation `self^-1 * other`.
    pub fn rotation_angle_to(&self, other: &ExtrinsicPose) -> f64 {
        UnitQuaternion::from_rotation_matrix(&self.rotation.rotation_to(&other.rotation)).angle()
    }
}
