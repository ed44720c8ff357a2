//! Levenberg-Marquardt refinement for small nonlinear least-squares problems.
//!
//! Problems implement [`NllsProblem`] on the workspace's nalgebra types and
//! are driven by the `levenberg-marquardt` crate (a MINPACK port). The
//! Jacobian defaults to central finite differences. Parameters flagged as
//! fixed keep their initial value: their Jacobian columns are zeroed and the
//! driver pins them on every update.

use std::cell::{Cell, RefCell};

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use lm_nalgebra::{storage::Owned, Dyn};
use nalgebra::{DMatrix, DVector};
use serde::Serialize;

/// Residual value substituted outside the model domain, so the trial step
/// is rejected instead of aborting the solve.
const DOMAIN_PENALTY: f64 = 1e6;

/// Function evaluations allowed per iteration, in units of `n + 1`.
const PATIENCE_PER_ITERATION: usize = 10;

/// Residual model `r(x)` minimized in the sum-of-squares sense.
pub trait NllsProblem {
    fn num_params(&self) -> usize;

    fn num_residuals(&self) -> usize;

    /// Residual vector, or `None` when `params` is outside the model domain
    /// (e.g. a point behind the camera).
    fn residuals(&self, params: &DVector<f64>) -> Option<DVector<f64>>;

    /// Jacobian `dr/dx` with shape `num_residuals x num_params`.
    fn jacobian(&self, params: &DVector<f64>) -> Option<DMatrix<f64>> {
        numeric_jacobian(self, params)
    }

    /// Parameters held constant during the solve.
    fn is_fixed(&self, _index: usize) -> bool {
        false
    }
}

/// Central-difference Jacobian of `problem` at `params`.
pub fn numeric_jacobian<P: NllsProblem + ?Sized>(
    problem: &P,
    params: &DVector<f64>,
) -> Option<DMatrix<f64>> {
    let n = problem.num_params();
    let mut jac = DMatrix::<f64>::zeros(problem.num_residuals(), n);
    let mut shifted = params.clone();
    for col in 0..n {
        if problem.is_fixed(col) {
            continue;
        }
        let x0 = params[col];
        let h = 1e-6 * x0.abs().max(1.0);
        shifted[col] = x0 + h;
        let plus = problem.residuals(&shifted)?;
        shifted[col] = x0 - h;
        let minus = problem.residuals(&shifted)?;
        shifted[col] = x0;
        jac.set_column(col, &((plus - minus) / (2.0 * h)));
    }
    Some(jac)
}

/// Solver controls.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LmParams {
    /// Jacobian evaluations (outer iterations) allowed.
    pub max_iterations: usize,
    /// Initial trust-region radius, as a factor of the scaled parameter norm.
    pub step_bound: f64,
    /// Relative cost decrease under which the solve counts as converged.
    pub cost_tolerance: f64,
    /// Relative trust-region size under which the solve counts as converged.
    pub step_tolerance: f64,
    /// Gradient cosine under which the solver stops on orthogonality.
    pub gradient_tolerance: f64,
    /// RMS residual under which the solve counts as converged.
    pub residual_tolerance: f64,
    /// Largest gradient cosine `|J_j . r| / (|J_j| |r|)` accepted when the
    /// solver stops on a small cost change or step. Above it the solve
    /// stalled short of a minimum.
    pub stationarity_tolerance: f64,
    /// RMS residual at or below which a stop is never treated as a stall.
    pub stall_residual_floor: f64,
}

impl Default for LmParams {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            step_bound: 100.0,
            cost_tolerance: 1e-8,
            step_tolerance: 1e-10,
            gradient_tolerance: 1e-12,
            residual_tolerance: 1e-6,
            stationarity_tolerance: 1e-2,
            stall_residual_floor: 1e-4,
        }
    }
}

impl LmParams {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_cost_tolerance(mut self, tol: f64) -> Self {
        self.cost_tolerance = tol;
        self
    }

    pub fn with_step_bound(mut self, step_bound: f64) -> Self {
        self.step_bound = step_bound;
        self
    }
}

/// Why the solver stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    CostChangeSmall,
    ResidualSmall,
    StepSmall,
    GradientSmall,
    /// No step lowers the cost, yet the gradient is not negligible.
    DampingExhausted,
    MaxIterations,
    NonFinite,
    Cancelled,
}

impl Termination {
    pub fn is_converged(self) -> bool {
        matches!(
            self,
            Self::CostChangeSmall | Self::ResidualSmall | Self::StepSmall | Self::GradientSmall
        )
    }
}

/// Result of a solve. `params` always holds the best iterate seen.
#[derive(Clone, Debug)]
pub struct LmReport {
    pub params: DVector<f64>,
    /// Sum of squared residuals at the start.
    pub initial_cost: f64,
    /// Sum of squared residuals at `params`.
    pub final_cost: f64,
    pub iterations: usize,
    pub termination: Termination,
}

impl LmReport {
    pub fn converged(&self) -> bool {
        self.termination.is_converged()
    }
}

fn to_lm_vector(v: &DVector<f64>) -> lm_nalgebra::DVector<f64> {
    lm_nalgebra::DVector::from_column_slice(v.as_slice())
}

fn from_lm_vector(v: &lm_nalgebra::DVector<f64>) -> DVector<f64> {
    DVector::from_column_slice(v.as_slice())
}

fn cost_at<P: NllsProblem + ?Sized>(problem: &P, x: &DVector<f64>) -> Option<f64> {
    problem
        .residuals(x)
        .map(|r| r.norm_squared())
        .filter(|c| c.is_finite())
}

/// Jacobian with the fixed columns zeroed.
fn masked_jacobian<P: NllsProblem + ?Sized>(problem: &P, x: &DVector<f64>) -> Option<DMatrix<f64>> {
    let mut jac = problem.jacobian(x)?;
    for col in 0..jac.ncols() {
        if problem.is_fixed(col) {
            jac.column_mut(col).fill(0.0);
        }
    }
    jac.iter().all(|v| v.is_finite()).then_some(jac)
}

/// Largest cosine between a free Jacobian column and the residual vector.
/// Zero at a stationary point.
pub fn gradient_cosine<P: NllsProblem + ?Sized>(problem: &P, x: &DVector<f64>) -> Option<f64> {
    let r = problem.residuals(x)?;
    let jac = masked_jacobian(problem, x)?;
    let r_norm = r.norm();
    if r_norm == 0.0 {
        return Some(0.0);
    }
    let worst = jac
        .column_iter()
        .filter_map(|col| {
            let n = col.norm();
            (n > 0.0).then(|| col.dot(&r).abs() / (n * r_norm))
        })
        .fold(0.0, f64::max);
    Some(worst)
}

/// Adapter between [`NllsProblem`] and the crate's problem trait. Tracks the
/// best point evaluated, the iteration budget and cancellation.
struct LmAdapter<'a, P: ?Sized, F> {
    problem: &'a P,
    initial: DVector<f64>,
    params: lm_nalgebra::DVector<f64>,
    best: RefCell<(f64, DVector<f64>)>,
    max_iterations: usize,
    iterations: Cell<usize>,
    budget_spent: Cell<bool>,
    cancelled: Cell<bool>,
    should_stop: F,
}

impl<P, F> LeastSquaresProblem<f64, Dyn, Dyn> for LmAdapter<'_, P, F>
where
    P: NllsProblem + ?Sized,
    F: Fn() -> bool,
{
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &lm_nalgebra::DVector<f64>) {
        self.params.clone_from(x);
        for i in 0..self.params.len() {
            if self.problem.is_fixed(i) {
                self.params[i] = self.initial[i];
            }
        }
    }

    fn params(&self) -> lm_nalgebra::DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<lm_nalgebra::DVector<f64>> {
        let x = from_lm_vector(&self.params);
        let r = self
            .problem
            .residuals(&x)
            .filter(|r| r.iter().all(|v| v.is_finite()));
        let Some(r) = r else {
            let m = self.problem.num_residuals();
            return Some(lm_nalgebra::DVector::from_element(m, DOMAIN_PENALTY));
        };

        let cost = r.norm_squared();
        let mut best = self.best.borrow_mut();
        if cost < best.0 {
            *best = (cost, x);
        }
        Some(to_lm_vector(&r))
    }

    fn jacobian(&self) -> Option<lm_nalgebra::DMatrix<f64>> {
        if (self.should_stop)() {
            self.cancelled.set(true);
            return None;
        }
        if self.iterations.get() >= self.max_iterations {
            self.budget_spent.set(true);
            return None;
        }
        self.iterations.set(self.iterations.get() + 1);

        let jac = masked_jacobian(self.problem, &from_lm_vector(&self.params))?;
        Some(lm_nalgebra::DMatrix::from_column_slice(
            jac.nrows(),
            jac.ncols(),
            jac.as_slice(),
        ))
    }
}

fn map_termination(reason: &TerminationReason) -> Termination {
    match reason {
        TerminationReason::ResidualsZero => Termination::ResidualSmall,
        TerminationReason::Orthogonal => Termination::GradientSmall,
        TerminationReason::Converged { ftol: true, .. } => Termination::CostChangeSmall,
        TerminationReason::Converged { .. } => Termination::StepSmall,
        TerminationReason::NoImprovementPossible(_) => Termination::DampingExhausted,
        TerminationReason::LostPatience => Termination::MaxIterations,
        _ => Termination::NonFinite,
    }
}

pub fn minimize<P: NllsProblem + ?Sized>(
    problem: &P,
    initial: DVector<f64>,
    params: &LmParams,
) -> LmReport {
    minimize_with(problem, initial, params, || false)
}

/// Like [`minimize`], polling `should_stop` before every iteration.
pub fn minimize_with<P, F>(
    problem: &P,
    initial: DVector<f64>,
    params: &LmParams,
    should_stop: F,
) -> LmReport
where
    P: NllsProblem + ?Sized,
    F: Fn() -> bool,
{
    let m = problem.num_residuals().max(1) as f64;
    let residual_floor = params.residual_tolerance * params.residual_tolerance * m;

    let Some(initial_cost) = cost_at(problem, &initial) else {
        return LmReport {
            params: initial,
            initial_cost: f64::INFINITY,
            final_cost: f64::INFINITY,
            iterations: 0,
            termination: Termination::NonFinite,
        };
    };
    let early = if should_stop() {
        Some(Termination::Cancelled)
    } else if initial_cost <= residual_floor {
        Some(Termination::ResidualSmall)
    } else {
        None
    };
    if let Some(termination) = early {
        return LmReport {
            params: initial,
            initial_cost,
            final_cost: initial_cost,
            iterations: 0,
            termination,
        };
    }

    let solver = LevenbergMarquardt::new()
        .with_ftol(params.cost_tolerance)
        .with_xtol(params.step_tolerance)
        .with_gtol(params.gradient_tolerance)
        .with_stepbound(params.step_bound)
        .with_patience(params.max_iterations.max(1) * PATIENCE_PER_ITERATION);

    let adapter = LmAdapter {
        problem,
        params: to_lm_vector(&initial),
        best: RefCell::new((initial_cost, initial.clone())),
        initial,
        max_iterations: params.max_iterations,
        iterations: Cell::new(0),
        budget_spent: Cell::new(false),
        cancelled: Cell::new(false),
        should_stop,
    };
    let (adapter, report) = solver.minimize(adapter);

    let iterations = adapter.iterations.get();
    let (final_cost, x) = adapter.best.into_inner();
    let mut termination = if adapter.cancelled.get() {
        Termination::Cancelled
    } else if adapter.budget_spent.get() {
        Termination::MaxIterations
    } else {
        map_termination(&report.termination)
    };

    if termination != Termination::Cancelled && final_cost <= residual_floor {
        termination = Termination::ResidualSmall;
    } else if termination.is_converged() || termination == Termination::DampingExhausted {
        let cosine = gradient_cosine(problem, &x);
        let settled = (final_cost / m).sqrt() <= params.stall_residual_floor
            || cosine.is_some_and(|c| c <= params.stationarity_tolerance);
        termination = match (settled, termination) {
            (true, Termination::DampingExhausted) => Termination::GradientSmall,
            (true, other) => other,
            (false, _) => Termination::DampingExhausted,
        };
        log::trace!("lm: gradient cosine {:?} at stop", cosine);
    }

    log::debug!(
        "lm: {:?} ({:?}) after {} iterations, cost {:.3e} -> {:.3e}",
        termination,
        report.termination,
        iterations,
        initial_cost,
        final_cost
    );
    LmReport {
        params: x,
        initial_cost,
        final_cost,
        iterations,
        termination,
    }
}
