//! Square-marker pose from four corners.

use calib_pose_core::optim::{self, LmParams, NllsProblem};
use calib_pose_core::{homography_from_4pt, CameraModel, ExtrinsicPose};
use nalgebra::{DVector, Matrix3, Point2, Point3};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{DegenerateReason, MarkerPoseEstimate, MarkerPoseParams, PoseError};

/// Object-space corners of a square of side `length`, centered on its own
/// origin, in detector order (top-left, top-right, bottom-right,
/// bottom-left) with marker +y pointing up.
pub fn marker_object_points(length: f64) -> [Point3<f64>; 4] {
    let h = 0.5 * length;
    [
        Point3::new(-h, h, 0.0),
        Point3::new(h, h, 0.0),
        Point3::new(h, -h, 0.0),
        Point3::new(-h, -h, 0.0),
    ]
}

/// Signed shoelace area in pixel coordinates (y down). Positive for the
/// detector's clockwise-on-screen order.
pub fn signed_area(q: &[Point2<f64>; 4]) -> f64 {
    0.5 * (0..4)
        .map(|i| {
            let (a, b) = (q[i], q[(i + 1) % 4]);
            a.x * b.y - b.x * a.y
        })
        .sum::<f64>()
}

fn check_quad(q: &[Point2<f64>; 4], min_area: f64) -> Result<(), DegenerateReason> {
    let mut positive = 0;
    let mut negative = 0;
    for i in 0..4 {
        let (a, b, c) = (q[i], q[(i + 1) % 4], q[(i + 2) % 4]);
        let cross = (b - a).perp(&(c - b));
        if cross > 0.0 {
            positive += 1;
        } else if cross < 0.0 {
            negative += 1;
        }
    }
    match (positive, negative) {
        (4, 0) => {}
        (0, 4) => return Err(DegenerateReason::ReversedWinding),
        _ => return Err(DegenerateReason::NonConvex),
    }

    let area = signed_area(q);
    if area < min_area {
        return Err(DegenerateReason::TooSmall {
            area,
            min: min_area,
        });
    }
    Ok(())
}

/// Corner pixel residuals of one marker pose.
struct MarkerProblem<'a> {
    object: [Point3<f64>; 4],
    image: &'a [Point2<f64>; 4],
    model: &'a CameraModel,
}

impl NllsProblem for MarkerProblem<'_> {
    fn num_params(&self) -> usize {
        6
    }

    fn num_residuals(&self) -> usize {
        8
    }

    fn residuals(&self, params: &DVector<f64>) -> Option<DVector<f64>> {
        let pose = ExtrinsicPose::from_params(params.as_slice())?;
        let mut r = DVector::zeros(8);
        for (k, (p, obs)) in self.object.iter().zip(self.image).enumerate() {
            let px = self.model.project(p, &pose)?;
            r[2 * k] = px.x - obs.x;
            r[2 * k + 1] = px.y - obs.y;
        }
        Some(r)
    }
}

/// Estimates marker poses against one camera model.
#[derive(Clone, Debug, Default)]
pub struct PoseEstimator {
    params: MarkerPoseParams,
}

impl PoseEstimator {
    pub fn new(params: MarkerPoseParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &MarkerPoseParams {
        &self.params
    }

    /// Pose of a square marker of side `length` from its four corners.
    pub fn estimate_pose(
        &self,
        corners: &[Point2<f64>],
        length: f64,
        model: &CameraModel,
    ) -> Result<ExtrinsicPose, PoseError> {
        self.estimate(corners, length, model).map(|e| e.pose)
    }

    /// Like [`Self::estimate_pose`], keeping the fit diagnostics.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, corners, model), fields(length = length))
    )]
    pub fn estimate(
        &self,
        corners: &[Point2<f64>],
        length: f64,
        model: &CameraModel,
    ) -> Result<MarkerPoseEstimate, PoseError> {
        let quad: &[Point2<f64>; 4] = corners
            .try_into()
            .map_err(|_| DegenerateReason::CornerCount {
                count: corners.len(),
            })?;
        if let Some(index) = quad.iter().position(|p| !(p.x.is_finite() && p.y.is_finite())) {
            return Err(DegenerateReason::NonFiniteCorner { index }.into());
        }
        if !length.is_finite() || length <= 0.0 {
            return Err(DegenerateReason::InvalidSideLength { length }.into());
        }
        check_quad(quad, self.params.min_area_px)?;

        let mut normalized = [Point2::origin(); 4];
        for (index, (dst, px)) in normalized.iter_mut().zip(quad).enumerate() {
            *dst = model
                .undistort(*px)
                .ok_or(DegenerateReason::Undistort { index })?;
        }

        let object = marker_object_points(length);
        let plane = object.map(|p| Point2::new(p.x, p.y));
        let h = homography_from_4pt(&plane, &normalized).ok_or(DegenerateReason::Homography)?;
        let initial = ExtrinsicPose::from_planar_homography(&Matrix3::identity(), &h.h)
            .ok_or(DegenerateReason::Homography)?;
        if initial.translation.z <= 0.0 {
            return Err(DegenerateReason::BehindCamera.into());
        }

        let problem = MarkerProblem {
            object,
            image: quad,
            model,
        };
        let lm = LmParams::default().with_max_iterations(self.params.max_iterations);
        let report = optim::minimize(&problem, DVector::from_row_slice(&initial.to_params()), &lm);
        let pose = ExtrinsicPose::from_params(report.params.as_slice())
            .ok_or(DegenerateReason::Homography)?;
        if object
            .iter()
            .any(|p| pose.transform_point(p).z <= 0.0)
        {
            return Err(DegenerateReason::BehindCamera.into());
        }

        let rms = (report.final_cost / 4.0).sqrt();
        log::trace!(
            "marker pose: {:?} after {} iterations, rms {:.4} px",
            report.termination,
            report.iterations,
            rms
        );
        if !rms.is_finite() || rms > self.params.max_reprojection_px {
            return Err(DegenerateReason::Inconsistent {
                rms,
                max: self.params.max_reprojection_px,
            }
            .into());
        }

        let view_angle_deg = view_angle(&pose).to_degrees();
        if view_angle_deg > self.params.max_view_angle_deg {
            return Err(DegenerateReason::EdgeOn {
                angle_deg: view_angle_deg,
                max_deg: self.params.max_view_angle_deg,
            }
            .into());
        }

        Ok(MarkerPoseEstimate {
            pose,
            reprojection_rms: rms,
            view_angle_deg,
            iterations: report.iterations,
        })
    }
}

/// Angle between the marker normal and the ray to its center, in radians.
fn view_angle(pose: &ExtrinsicPose) -> f64 {
    let normal = pose.rotation * nalgebra::Vector3::z();
    let t = pose.translation;
    let cos = (normal.dot(&t).abs() / t.norm()).clamp(0.0, 1.0);
    cos.acos()
}
