//! Synthetic scenes for tests, benchmarks and demos.
//!
//! Everything here is deterministic: noise comes from a seeded hash, not
//! from a random number generator.

use nalgebra::{Matrix3, Point2, Point3, Rotation3, Vector3};

use crate::{CameraModel, CorrespondenceSet, ExtrinsicPose};

/// Pose of a camera at `eye` (object frame) looking at `target`.
///
/// The camera y-axis stays as close as possible to the object +y axis, so a
/// camera straight in front of a `z = 0` board (`eye.z < 0`) gets the
/// identity rotation.
pub fn look_at(eye: Point3<f64>, target: Point3<f64>) -> Option<ExtrinsicPose> {
    let z = (target - eye).try_normalize(1e-12)?;
    let x = Vector3::y().cross(&z).try_normalize(1e-12)?;
    let y = z.cross(&x);
    let r = Matrix3::from_rows(&[x.transpose(), y.transpose(), z.transpose()]);
    let rotation = Rotation3::from_matrix_unchecked(r);
    let translation = -(rotation * eye.coords);
    Some(ExtrinsicPose::new(rotation, translation))
}

/// `count` cameras on a cone around `target`, each `distance` away and
/// tilted by `tilt_deg` from the board normal, with a small per-view roll.
pub fn orbit_poses(
    count: usize,
    target: Point3<f64>,
    distance: f64,
    tilt_deg: f64,
) -> Vec<ExtrinsicPose> {
    let tilt = tilt_deg.to_radians();
    (0..count)
        .filter_map(|k| {
            let theta = std::f64::consts::TAU * k as f64 / count.max(1) as f64;
            let eye = target
                + distance
                    * Vector3::new(
                        tilt.sin() * theta.cos(),
                        tilt.sin() * theta.sin(),
                        -tilt.cos(),
                    );
            let pose = look_at(eye, target)?;
            let roll = Rotation3::from_axis_angle(&Vector3::z_axis(), 0.08 * (k as f64 - 2.0));
            Some(ExtrinsicPose::new(
                roll * pose.rotation,
                roll * pose.translation,
            ))
        })
        .collect()
}

/// Project `object` under each pose. `None` if any point is not visible.
pub fn project_views(
    model: &CameraModel,
    object: &[Point3<f64>],
    poses: &[ExtrinsicPose],
) -> Option<Vec<CorrespondenceSet>> {
    poses
        .iter()
        .map(|pose| {
            let image: Option<Vec<Point2<f64>>> =
                object.iter().map(|p| model.project(p, pose)).collect();
            CorrespondenceSet::new(object.to_vec(), image?).ok()
        })
        .collect()
}

/// Deterministic pseudo-random offset in `[-amplitude, amplitude]^2`.
pub fn jitter(seed: u64, index: usize, amplitude: f64) -> Point2<f64> {
    let a = unit(splitmix(seed ^ (2 * index as u64)));
    let b = unit(splitmix(seed ^ (2 * index as u64 + 1)));
    Point2::new((2.0 * a - 1.0) * amplitude, (2.0 * b - 1.0) * amplitude)
}

/// Add [`jitter`] to every image point of `set`.
pub fn perturb(set: &CorrespondenceSet, seed: u64, amplitude: f64) -> CorrespondenceSet {
    let image = set
        .image_points()
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let d = jitter(seed, i, amplitude);
            Point2::new(p.x + d.x, p.y + d.y)
        })
        .collect();
    CorrespondenceSet::new(set.object_points().to_vec(), image).unwrap_or_else(|_| set.clone())
}

fn splitmix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn unit(bits: u64) -> f64 {
    (bits >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CameraMatrix;
    use approx::assert_abs_diff_eq;

    #[test]
    fn frontal_look_at_is_identity() {
        let pose = look_at(Point3::new(0.0, 0.0, -2.0), Point3::origin()).unwrap();
        assert_abs_diff_eq!(pose.rotation.matrix(), &Matrix3::identity(), epsilon = 1e-12);
        assert_abs_diff_eq!(pose.translation, Vector3::new(0.0, 0.0, 2.0), epsilon = 1e-12);
    }

    #[test]
    fn orbit_keeps_target_on_axis_at_distance() {
        let target = Point3::new(0.1, 0.06, 0.0);
        for pose in orbit_poses(6, target, 0.6, 25.0) {
            let pc = pose.transform_point(&target);
            assert_abs_diff_eq!(pc.x, 0.0, epsilon = 1e-9);
            assert_abs_diff_eq!(pc.y, 0.0, epsilon = 1e-9);
            assert_abs_diff_eq!(pc.z, 0.6, epsilon = 1e-9);
        }
    }

    #[test]
    fn jitter_is_bounded_and_repeatable() {
        for i in 0..100 {
            let d = jitter(7, i, 0.5);
            assert!(d.x.abs() <= 0.5 && d.y.abs() <= 0.5);
            assert_eq!(d, jitter(7, i, 0.5));
        }
        assert_ne!(jitter(7, 0, 0.5), jitter(8, 0, 0.5));
    }

    #[test]
    fn projected_views_match_model() {
        let model = CameraModel::pinhole(CameraMatrix::new(800.0, 800.0, 400.0, 300.0).unwrap());
        let object = vec![Point3::new(0.0, 0.0, 0.0), Point3::new(0.1, 0.0, 0.0)];
        let pose = look_at(Point3::new(0.0, 0.0, -1.0), Point3::origin()).unwrap();
        let views = project_views(&model, &object, &[pose]).unwrap();
        assert_abs_diff_eq!(views[0].image_points()[1], Point2::new(480.0, 300.0), epsilon = 1e-9);
    }
}
