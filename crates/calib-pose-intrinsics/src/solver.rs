//! Joint intrinsic + extrinsic calibration from planar views.
//!
//! Pipeline: per-view homographies, zero-skew closed-form intrinsics, pose
//! from each homography with distortion at zero, then Levenberg-Marquardt
//! over `[fx, fy, cx, cy, k1, k2, p1, p2, k3]` plus one Rodrigues rotation
//! and translation per view.

use std::sync::atomic::{AtomicBool, Ordering};

use calib_pose_core::optim::{self, LmParams, NllsProblem, Termination};
use calib_pose_core::{
    CalibrationRecord, CameraMatrix, CameraModel, CorrespondenceSet, DistortionCoeffs,
    ExtrinsicPose, ImageSize,
};
use nalgebra::{DMatrix, DVector, Matrix3, Point2};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::init::{centered_principal_point, view_homography, zhang_zero_skew, PixelConditioner};
use crate::{EvaluateError, ReprojectionEvaluator, ReprojectionReport, ViewRejection};

const INTRINSIC_PARAMS: usize = 9;
const POSE_PARAMS: usize = 6;

/// Solver configuration. Every field has a default, so JSON configs may be
/// partial.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationParams {
    pub max_iterations: usize,
    /// Relative cost decrease that ends the refinement.
    pub cost_tolerance: f64,
    /// Initial trust-region radius, as a factor of the scaled parameter norm.
    pub step_bound: f64,
    /// Keep `k3` at zero.
    pub fix_k3: bool,
    /// Keep `p1`, `p2` at zero.
    pub fix_tangential: bool,
    /// Pure pinhole: keep every distortion coefficient at zero.
    pub zero_distortion: bool,
    /// Enables the centered-principal-point initialization fallback.
    pub image_size: Option<ImageSize>,
    /// Fewer valid views than this only produce a warning.
    pub recommended_min_views: usize,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            cost_tolerance: 1e-8,
            step_bound: 100.0,
            fix_k3: false,
            fix_tangential: false,
            zero_distortion: false,
            image_size: None,
            recommended_min_views: 8,
        }
    }
}

impl CalibrationParams {
    fn lm(&self) -> LmParams {
        LmParams {
            max_iterations: self.max_iterations,
            step_bound: self.step_bound,
            cost_tolerance: self.cost_tolerance,
            ..LmParams::default()
        }
    }

    fn is_fixed(&self, index: usize) -> bool {
        match index {
            4 | 5 => self.zero_distortion,
            6 | 7 => self.zero_distortion || self.fix_tangential,
            8 => self.zero_distortion || self.fix_k3,
            _ => false,
        }
    }
}

/// A view left out of the solve, by input index.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RejectedView {
    pub index: usize,
    pub reason: ViewRejection,
}

/// Solve output.
#[derive(Clone, Debug, Serialize)]
pub struct Calibration {
    pub model: CameraModel,
    /// One pose per entry of `view_indices`.
    pub poses: Vec<ExtrinsicPose>,
    /// Input indices of the views that took part in the solve.
    pub view_indices: Vec<usize>,
    pub rejected: Vec<RejectedView>,
    /// `sqrt(sum |e|^2 / N)` over all points, in pixels.
    pub rms: f64,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub termination: Termination,
    pub converged: bool,
}

impl Calibration {
    /// Pose of input view `index`, if that view was used.
    pub fn pose_of(&self, index: usize) -> Option<&ExtrinsicPose> {
        let k = self.view_indices.iter().position(|&i| i == index)?;
        self.poses.get(k)
    }

    /// Reprojection statistics over the views used by the solve. `views` is
    /// the same slice passed to the solver.
    pub fn reprojection_report(
        &self,
        views: &[CorrespondenceSet],
    ) -> Result<ReprojectionReport, EvaluateError> {
        let used: Vec<CorrespondenceSet> = self
            .view_indices
            .iter()
            .filter_map(|&i| views.get(i).cloned())
            .collect();
        ReprojectionEvaluator::evaluate(&self.model, &self.poses, &used)
    }

    pub fn to_record(&self, image_size: Option<ImageSize>) -> CalibrationRecord {
        let record = CalibrationRecord::from_model(&self.model)
            .with_rms(self.rms)
            .with_poses(&self.poses);
        match image_size {
            Some(size) => record.with_image_size(size),
            None => record,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("insufficient data: {valid} usable view(s); {reason}")]
    InsufficientData { valid: usize, reason: String },
    #[error(
        "optimizer stopped without converging ({:?}); best rms {:.4} px",
        .best.termination,
        .best.rms
    )]
    ConvergenceFailure { best: Box<Calibration> },
    #[error("calibration cancelled")]
    Cancelled,
}

/// Planar-target camera calibration.
#[derive(Clone, Debug, Default)]
pub struct CalibrationSolver {
    params: CalibrationParams,
}

impl CalibrationSolver {
    pub fn new(params: CalibrationParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &CalibrationParams {
        &self.params
    }

    /// Estimate the camera model and one pose per usable view.
    pub fn solve(&self, views: &[CorrespondenceSet]) -> Result<Calibration, CalibrationError> {
        self.solve_with(views, || false)
    }

    /// Like [`Self::solve`], checking `cancel` between optimizer iterations.
    pub fn solve_with_cancel(
        &self,
        views: &[CorrespondenceSet],
        cancel: &AtomicBool,
    ) -> Result<Calibration, CalibrationError> {
        self.solve_with(views, || cancel.load(Ordering::Relaxed))
    }

    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, views, should_stop), fields(views = views.len()))
    )]
    fn solve_with<F: Fn() -> bool>(
        &self,
        views: &[CorrespondenceSet],
        should_stop: F,
    ) -> Result<Calibration, CalibrationError> {
        let mut used = Vec::new();
        let mut homographies = Vec::new();
        let mut rejected = Vec::new();
        for (index, view) in views.iter().enumerate() {
            match view_homography(view) {
                Ok(h) => {
                    used.push(index);
                    homographies.push(h.h);
                }
                Err(reason) => {
                    log::warn!("view {index} excluded: {reason}");
                    rejected.push(RejectedView { index, reason });
                }
            }
        }

        if used.is_empty() {
            return Err(CalibrationError::InsufficientData {
                valid: 0,
                reason: "need at least one view with >= 4 non-collinear planar points".into(),
            });
        }
        if used.len() < self.params.recommended_min_views {
            log::warn!(
                "calibrating from {} view(s); at least {} are recommended",
                used.len(),
                self.params.recommended_min_views
            );
        }

        let used_views: Vec<&CorrespondenceSet> = used.iter().map(|&i| &views[i]).collect();
        let matrix = self.initial_matrix(&used_views, &homographies)?;

        let mut x0 = Vec::with_capacity(INTRINSIC_PARAMS + POSE_PARAMS * used.len());
        x0.extend_from_slice(&[matrix.fx(), matrix.fy(), matrix.cx(), matrix.cy()]);
        x0.extend_from_slice(&DistortionCoeffs::zero().to_array());
        for (h, &index) in homographies.iter().zip(&used) {
            let pose = ExtrinsicPose::from_planar_homography(&matrix.matrix(), h).ok_or_else(
                || CalibrationError::InsufficientData {
                    valid: used.len(),
                    reason: format!("view {index}: homography does not decompose to a pose"),
                },
            )?;
            x0.extend_from_slice(&pose.to_params());
        }

        self.refine(&used_views, used, rejected, DVector::from_vec(x0), should_stop)
    }

    /// Joint refinement from the packed start `x0`; `used` holds the input
    /// index of each entry of `views`.
    fn refine<F: Fn() -> bool>(
        &self,
        views: &[&CorrespondenceSet],
        used: Vec<usize>,
        rejected: Vec<RejectedView>,
        x0: DVector<f64>,
        should_stop: F,
    ) -> Result<Calibration, CalibrationError> {
        let problem = CalibrationProblem::new(views, &self.params);
        let report = optim::minimize_with(&problem, x0, &self.params.lm(), should_stop);
        if report.termination == Termination::Cancelled {
            log::info!("calibration cancelled after {} iteration(s)", report.iterations);
            return Err(CalibrationError::Cancelled);
        }

        let (model, poses) = unpack(report.params.as_slice()).ok_or_else(|| {
            CalibrationError::InsufficientData {
                valid: used.len(),
                reason: "refinement left the valid parameter domain".into(),
            }
        })?;
        let rms = (report.final_cost / problem.num_points as f64).sqrt();
        let calibration = Calibration {
            model,
            poses,
            view_indices: used,
            rejected,
            rms,
            iterations: report.iterations,
            initial_cost: report.initial_cost,
            final_cost: report.final_cost,
            termination: report.termination,
            converged: report.converged(),
        };

        if !calibration.converged {
            log::warn!(
                "calibration did not converge ({:?}) after {} iteration(s), rms {:.4} px",
                calibration.termination,
                calibration.iterations,
                calibration.rms
            );
            return Err(CalibrationError::ConvergenceFailure {
                best: Box::new(calibration),
            });
        }

        log::info!(
            "calibrated from {} view(s) in {} iteration(s): fx={:.3} fy={:.3} cx={:.3} cy={:.3} rms={:.4} px",
            calibration.view_indices.len(),
            calibration.iterations,
            calibration.model.matrix.fx(),
            calibration.model.matrix.fy(),
            calibration.model.matrix.cx(),
            calibration.model.matrix.cy(),
            calibration.rms
        );
        Ok(calibration)
    }

    fn initial_matrix(
        &self,
        views: &[&CorrespondenceSet],
        homographies: &[Matrix3<f64>],
    ) -> Result<CameraMatrix, CalibrationError> {
        let cond = PixelConditioner::from_views(views.iter().copied());
        if let Some(k) = zhang_zero_skew(homographies, &cond) {
            return Ok(k);
        }
        log::debug!("closed-form intrinsics unavailable, trying centered principal point");

        let Some(size) = self.params.image_size else {
            return Err(CalibrationError::InsufficientData {
                valid: views.len(),
                reason: "closed-form initialization needs >= 2 non-degenerate views \
                         (or set image_size for the single-view fallback)"
                    .into(),
            });
        };
        centered_principal_point(homographies, size).ok_or_else(|| {
            CalibrationError::InsufficientData {
                valid: views.len(),
                reason: "views do not constrain the focal length".into(),
            }
        })
    }
}

fn unpack(x: &[f64]) -> Option<(CameraModel, Vec<ExtrinsicPose>)> {
    let model = model_from_params(x)?;
    let poses = x[INTRINSIC_PARAMS..]
        .chunks_exact(POSE_PARAMS)
        .map(ExtrinsicPose::from_params)
        .collect::<Option<Vec<_>>>()?;
    Some((model, poses))
}

fn model_from_params(x: &[f64]) -> Option<CameraModel> {
    let matrix = CameraMatrix::new(x[0], x[1], x[2], x[3]).ok()?;
    let distortion = DistortionCoeffs::from_array([x[4], x[5], x[6], x[7], x[8]]).ok()?;
    Some(CameraModel::new(matrix, distortion))
}

/// Stacked pixel residuals `projected - observed` for every point of every
/// view, two rows per point.
struct CalibrationProblem<'a> {
    views: &'a [&'a CorrespondenceSet],
    params: &'a CalibrationParams,
    /// First residual row of each view.
    offsets: Vec<usize>,
    num_points: usize,
}

impl<'a> CalibrationProblem<'a> {
    fn new(views: &'a [&'a CorrespondenceSet], params: &'a CalibrationParams) -> Self {
        let mut offsets = Vec::with_capacity(views.len());
        let mut num_points = 0;
        for v in views {
            offsets.push(2 * num_points);
            num_points += v.len();
        }
        Self {
            views,
            params,
            offsets,
            num_points,
        }
    }

    fn pose_range(view: usize) -> std::ops::Range<usize> {
        let start = INTRINSIC_PARAMS + POSE_PARAMS * view;
        start..start + POSE_PARAMS
    }

    fn view_residuals(
        model: &CameraModel,
        pose: &ExtrinsicPose,
        view: &CorrespondenceSet,
        out: &mut [f64],
    ) -> Option<()> {
        for (k, (p, obs)) in view.iter().enumerate() {
            let px = model.project(p, pose)?;
            out[2 * k] = px.x - obs.x;
            out[2 * k + 1] = px.y - obs.y;
        }
        Some(())
    }
}

impl NllsProblem for CalibrationProblem<'_> {
    fn num_params(&self) -> usize {
        INTRINSIC_PARAMS + POSE_PARAMS * self.views.len()
    }

    fn num_residuals(&self) -> usize {
        2 * self.num_points
    }

    fn residuals(&self, x: &DVector<f64>) -> Option<DVector<f64>> {
        let x = x.as_slice();
        let model = model_from_params(x)?;
        let mut r = DVector::<f64>::zeros(self.num_residuals());
        for (v, view) in self.views.iter().enumerate() {
            let pose = ExtrinsicPose::from_params(&x[Self::pose_range(v)])?;
            let start = self.offsets[v];
            let out = &mut r.as_mut_slice()[start..start + 2 * view.len()];
            Self::view_residuals(&model, &pose, view, out)?;
        }
        Some(r)
    }

    /// Intrinsic columns in closed form; pose columns by central
    /// differences, one view block at a time.
    fn jacobian(&self, x: &DVector<f64>) -> Option<DMatrix<f64>> {
        let xs = x.as_slice();
        let model = model_from_params(xs)?;
        let k = model.distortion;
        let (fx, fy) = (model.matrix.fx(), model.matrix.fy());
        let mut jac = DMatrix::<f64>::zeros(self.num_residuals(), self.num_params());

        for (v, view) in self.views.iter().enumerate() {
            let range = Self::pose_range(v);
            let pose = ExtrinsicPose::from_params(&xs[range.clone()])?;
            let start = self.offsets[v];

            for (i, p) in view.object_points().iter().enumerate() {
                let pc = pose.transform_point(p);
                if pc.z <= 1e-12 {
                    return None;
                }
                let n = Point2::new(pc.x / pc.z, pc.y / pc.z);
                let d = k.distort(n);
                let (x, y) = (n.x, n.y);
                let r2 = x * x + y * y;
                let (r4, r6) = (r2 * r2, r2 * r2 * r2);
                let (ru, rv) = (start + 2 * i, start + 2 * i + 1);

                jac[(ru, 0)] = d.x;
                jac[(ru, 2)] = 1.0;
                jac[(rv, 1)] = d.y;
                jac[(rv, 3)] = 1.0;

                jac[(ru, 4)] = fx * x * r2;
                jac[(rv, 4)] = fy * y * r2;
                jac[(ru, 5)] = fx * x * r4;
                jac[(rv, 5)] = fy * y * r4;
                jac[(ru, 6)] = fx * 2.0 * x * y;
                jac[(rv, 6)] = fy * (r2 + 2.0 * y * y);
                jac[(ru, 7)] = fx * (r2 + 2.0 * x * x);
                jac[(rv, 7)] = fy * 2.0 * x * y;
                jac[(ru, 8)] = fx * x * r6;
                jac[(rv, 8)] = fy * y * r6;
            }

            let rows = 2 * view.len();
            let mut plus = vec![0.0; rows];
            let mut minus = vec![0.0; rows];
            let base: [f64; POSE_PARAMS] = xs[range.clone()].try_into().ok()?;
            let mut shifted = base;
            for (c, col) in range.enumerate() {
                let h = 1e-6 * base[c].abs().max(1.0);
                shifted[c] = base[c] + h;
                let pose_p = ExtrinsicPose::from_params(&shifted)?;
                Self::view_residuals(&model, &pose_p, view, &mut plus)?;
                shifted[c] = base[c] - h;
                let pose_m = ExtrinsicPose::from_params(&shifted)?;
                Self::view_residuals(&model, &pose_m, view, &mut minus)?;
                shifted[c] = base[c];
                for row in 0..rows {
                    jac[(start + row, col)] = (plus[row] - minus[row]) / (2.0 * h);
                }
            }
        }
        Some(jac)
    }

    fn is_fixed(&self, index: usize) -> bool {
        self.params.is_fixed(index)
    }
}
