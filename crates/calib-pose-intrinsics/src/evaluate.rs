//! Reprojection-error diagnostics.

use calib_pose_core::{CameraModel, CorrespondenceSet, ExtrinsicPose};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EvaluateError {
    #[error("{poses} poses for {views} views")]
    LengthMismatch { poses: usize, views: usize },
    #[error("nothing to evaluate")]
    Empty,
    #[error("view {view}, point {point} does not project (behind the camera)")]
    NotProjectable { view: usize, point: usize },
}

/// Errors of one view, in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewError {
    /// Mean per-point Euclidean error.
    pub mean: f64,
    pub rms: f64,
    /// L2 norm of the stacked point errors divided by the point count,
    /// `sqrt(sum |e|^2) / N`.
    pub l2_per_point: f64,
    pub max: f64,
    pub points: usize,
}

/// Per-view and aggregate reprojection error.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReprojectionReport {
    pub views: Vec<ViewError>,
    /// Mean of the per-view means.
    pub mean: f64,
    /// Population standard deviation of the per-view means.
    pub std_dev: f64,
    /// RMS over every point of every view.
    pub rms: f64,
    /// Mean of the per-view `l2_per_point` values.
    pub l2_mean: f64,
    /// Population standard deviation of the per-view `l2_per_point` values.
    pub l2_std_dev: f64,
}

impl ReprojectionReport {
    /// Index and error of the worst view by mean error.
    pub fn worst_view(&self) -> Option<(usize, &ViewError)> {
        self.views
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.mean.total_cmp(&b.1.mean))
    }
}

/// Reprojects calibration views through a model and their poses.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReprojectionEvaluator;

impl ReprojectionEvaluator {
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(model, poses, views), fields(views = views.len()))
    )]
    pub fn evaluate(
        model: &CameraModel,
        poses: &[ExtrinsicPose],
        views: &[CorrespondenceSet],
    ) -> Result<ReprojectionReport, EvaluateError> {
        if poses.len() != views.len() {
            return Err(EvaluateError::LengthMismatch {
                poses: poses.len(),
                views: views.len(),
            });
        }
        if views.is_empty() {
            return Err(EvaluateError::Empty);
        }

        let mut per_view = Vec::with_capacity(views.len());
        let mut total_sq = 0.0;
        let mut total_points = 0usize;

        for (v, (pose, view)) in poses.iter().zip(views).enumerate() {
            let mut sum = 0.0;
            let mut sum_sq = 0.0;
            let mut max: f64 = 0.0;
            for (point, (p, obs)) in view.iter().enumerate() {
                let px = model
                    .project(p, pose)
                    .ok_or(EvaluateError::NotProjectable { view: v, point })?;
                let e = (px - obs).norm();
                sum += e;
                sum_sq += e * e;
                max = max.max(e);
            }
            let n = view.len() as f64;
            per_view.push(ViewError {
                mean: sum / n,
                rms: (sum_sq / n).sqrt(),
                l2_per_point: sum_sq.sqrt() / n,
                max,
                points: view.len(),
            });
            total_sq += sum_sq;
            total_points += view.len();
        }

        let (mean, std_dev) = mean_and_std(per_view.iter().map(|e| e.mean));
        let (l2_mean, l2_std_dev) = mean_and_std(per_view.iter().map(|e| e.l2_per_point));

        let report = ReprojectionReport {
            views: per_view,
            mean,
            std_dev,
            rms: (total_sq / total_points as f64).sqrt(),
            l2_mean,
            l2_std_dev,
        };
        log::debug!(
            "reprojection: mean {:.4} px, std {:.4} px, rms {:.4} px, l2/point {:.6} +/- {:.6} over {} view(s)",
            report.mean,
            report.std_dev,
            report.rms,
            report.l2_mean,
            report.l2_std_dev,
            report.views.len()
        );
        Ok(report)
    }
}

/// Mean and population standard deviation.
fn mean_and_std(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let k = values.clone().count().max(1) as f64;
    let mean = values.clone().sum::<f64>() / k;
    let var = values.map(|v| (v - mean).powi(2)).sum::<f64>() / k;
    (mean, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use calib_pose_core::CameraMatrix;
    use nalgebra::{Point2, Point3, Vector3};

    fn model() -> CameraModel {
        CameraModel::pinhole(CameraMatrix::new(100.0, 100.0, 0.0, 0.0).unwrap())
    }

    fn pose() -> ExtrinsicPose {
        ExtrinsicPose::from_rvec_tvec(Vector3::zeros(), Vector3::new(0.0, 0.0, 1.0))
    }

    /// Two points projecting to (0, 0) and (10, 0), observed with offsets.
    fn view(offsets: [(f64, f64); 2]) -> CorrespondenceSet {
        CorrespondenceSet::new(
            vec![Point3::new(0.0, 0.0, 0.0), Point3::new(0.1, 0.0, 0.0)],
            vec![
                Point2::new(offsets[0].0, offsets[0].1),
                Point2::new(10.0 + offsets[1].0, offsets[1].1),
            ],
        )
        .unwrap()
    }

    #[test]
    fn per_view_and_aggregate_statistics() {
        let views = [view([(3.0, 4.0), (0.0, 0.0)]), view([(1.0, 0.0), (0.0, 1.0)])];
        let report = ReprojectionEvaluator::evaluate(&model(), &[pose(), pose()], &views).unwrap();

        assert!((report.views[0].mean - 2.5).abs() < 1e-12);
        assert!((report.views[0].max - 5.0).abs() < 1e-12);
        assert!((report.views[0].rms - (12.5f64).sqrt()).abs() < 1e-12);
        assert!((report.views[1].mean - 1.0).abs() < 1e-12);

        assert!((report.mean - 1.75).abs() < 1e-12);
        assert!((report.std_dev - 0.75).abs() < 1e-12);
        assert!((report.rms - (27.0f64 / 4.0).sqrt()).abs() < 1e-12);
        assert_eq!(report.worst_view().map(|(i, _)| i), Some(0));
    }

    #[test]
    fn l2_per_point_matches_norm_over_count() {
        // view 0 errors: 5, 0; view 1 errors: 1, 1
        let views = [view([(3.0, 4.0), (0.0, 0.0)]), view([(1.0, 0.0), (0.0, 1.0)])];
        let report = ReprojectionEvaluator::evaluate(&model(), &[pose(), pose()], &views).unwrap();

        let v0 = 25.0f64.sqrt() / 2.0;
        let v1 = 2.0f64.sqrt() / 2.0;
        assert!((report.views[0].l2_per_point - v0).abs() < 1e-12);
        assert!((report.views[1].l2_per_point - v1).abs() < 1e-12);
        assert!((report.l2_mean - (v0 + v1) / 2.0).abs() < 1e-12);
        assert!((report.l2_std_dev - (v0 - v1) / 2.0).abs() < 1e-12);

        // differs from the mean Euclidean error whenever errors vary within a view
        assert!((report.views[1].l2_per_point - report.views[1].mean).abs() > 0.1);
    }

    #[test]
    fn exact_observations_give_zero_error() {
        let views = [view([(0.0, 0.0); 2])];
        let report = ReprojectionEvaluator::evaluate(&model(), &[pose()], &views).unwrap();
        assert!(report.mean.abs() < 1e-12 && report.std_dev == 0.0);
    }

    #[test]
    fn mismatched_inputs_fail() {
        let views = [view([(0.0, 0.0); 2])];
        assert_eq!(
            ReprojectionEvaluator::evaluate(&model(), &[], &views).unwrap_err(),
            EvaluateError::LengthMismatch { poses: 0, views: 1 }
        );
        assert_eq!(
            ReprojectionEvaluator::evaluate(&model(), &[], &[]).unwrap_err(),
            EvaluateError::Empty
        );
    }
}
