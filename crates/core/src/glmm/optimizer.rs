//! Outer minimization over the component standard deviations, run on argmin.
//!
//! L-BFGS with a Moré–Thuente line search does the work. When it fails
//! (infeasible trial point, unusable gradient, line-search breakdown)
//! Nelder–Mead restarts from the best point seen and spends what is left of
//! the iteration and time budget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use argmin::core::observers::{Observe, ObserverMode};
use argmin::core::{
    CostFunction, Error, Executor, Gradient, IterState, State, TerminationReason,
    TerminationStatus, KV,
};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::neldermead::NelderMead;
use argmin::solver::quasinewton::LBFGS;
use argmin_math::ArgminL2Norm;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::diagnostics::{ConvergenceMonitor, ConvergenceRecord};
use crate::error::{GlmmError, Result};

/// Optimizer parameters (and gradients).
pub type Params = Vec<f64>;
type MoreThuente = MoreThuenteLineSearch<Params, Params, f64>;
type Lbfgs = LBFGS<MoreThuente, Params, Params, f64>;

/// Correction pairs kept by L-BFGS.
const LBFGS_MEMORY: usize = 7;
/// Edge of the initial Nelder–Mead simplex, relative to each coordinate.
const SIMPLEX_EDGE: f64 = 0.5;

/// Outer optimization algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptimizerMethod {
    /// L-BFGS on finite-difference gradients; falls back to Nelder–Mead
    /// when it cannot make progress.
    #[default]
    Bfgs,
    /// Derivative-free simplex search.
    NelderMead,
}

impl std::fmt::Display for OptimizerMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizerMethod::Bfgs => write!(f, "L-BFGS"),
            OptimizerMethod::NelderMead => write!(f, "Nelder-Mead"),
        }
    }
}

/// Cooperative cancellation flag shared between a caller and a running fit
/// or simulation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once [`CancellationToken::cancel`] has been called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(GlmmError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimizerSettings {
    /// L-BFGS gradient-norm tolerance, relative to the starting objective;
    /// also the objective spread at which the Nelder–Mead simplex stops.
    pub tolerance: f64,
    pub max_iterations: usize,
    pub time_budget: Option<Duration>,
}

/// Why the optimizer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Converged,
    IterationLimit,
    TimeBudget,
}

#[derive(Debug, Clone)]
pub struct OptimizerOutcome {
    /// Lowest-objective point evaluated.
    pub x: Vec<f64>,
    pub value: f64,
    pub iterations: usize,
    pub termination: Termination,
    /// L-BFGS handed over to Nelder–Mead.
    pub fell_back: bool,
    pub history: Vec<ConvergenceRecord>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The objective as argmin sees it: cancellation is checked before every
/// evaluation and the lowest finite cost is remembered. A strict problem
/// reports a non-finite cost as an error, which keeps infinities out of the
/// line search.
struct Guarded<'o, O> {
    objective: &'o O,
    token: &'o CancellationToken,
    best: &'o Mutex<Option<(Params, f64)>>,
    strict: bool,
}

impl<O> CostFunction for Guarded<'_, O>
where
    O: CostFunction<Param = Params, Output = f64>,
{
    type Param = Params;
    type Output = f64;

    fn cost(&self, x: &Params) -> std::result::Result<f64, Error> {
        self.token.check()?;
        let value = self.objective.cost(x)?;
        if value.is_finite() {
            let mut best = lock(self.best);
            if best.as_ref().map_or(true, |(_, f)| value < *f) {
                *best = Some((x.clone(), value));
            }
            Ok(value)
        } else if self.strict {
            Err(GlmmError::NumericalFailure(format!("objective is not finite at {:?}", x)).into())
        } else {
            Ok(f64::INFINITY)
        }
    }
}

impl<O> Gradient for Guarded<'_, O>
where
    O: Gradient<Param = Params, Gradient = Params>,
{
    type Param = Params;
    type Gradient = Params;

    fn gradient(&self, x: &Params) -> std::result::Result<Params, Error> {
        self.token.check()?;
        self.objective.gradient(x)
    }
}

trait GradientNorm {
    fn norm(&self) -> f64;
}

impl GradientNorm for Params {
    fn norm(&self) -> f64 {
        self.l2_norm()
    }
}

impl GradientNorm for () {
    fn norm(&self) -> f64 {
        f64::INFINITY
    }
}

/// Appends one record per iteration to the shared history; a cancelled
/// token aborts the run.
struct HistoryObserver {
    monitor: Arc<Mutex<ConvergenceMonitor>>,
    token: CancellationToken,
    solver: &'static str,
    previous: Option<Params>,
}

impl<G: GradientNorm> Observe<IterState<Params, G, (), (), (), f64>> for HistoryObserver {
    fn observe_iter(
        &mut self,
        state: &IterState<Params, G, (), (), (), f64>,
        _kv: &KV,
    ) -> std::result::Result<(), Error> {
        self.token.check()?;
        let Some(x) = state.get_param() else {
            return Ok(());
        };
        let cost = state.get_cost();
        let gradient_norm = state
            .get_gradient()
            .map_or(f64::INFINITY, GradientNorm::norm);
        let param_change = self.previous.as_ref().map_or(f64::INFINITY, |p| {
            x.iter()
                .zip(p)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max)
        });

        let mut monitor = lock(&self.monitor);
        let iteration = monitor.n_iterations() + 1;
        monitor.record(iteration, cost, gradient_norm, param_change);
        debug!(
            "{} iteration {}: deviance = {:.8}, |grad| = {:.3e}, x = {:?}",
            self.solver, iteration, cost, gradient_norm, x
        );
        self.previous = Some(x.clone());
        Ok(())
    }
}

fn termination<G>(state: &IterState<Params, G, (), (), (), f64>) -> Termination {
    match state.get_termination_status() {
        TerminationStatus::Terminated(TerminationReason::MaxItersReached) => {
            Termination::IterationLimit
        }
        TerminationStatus::Terminated(TerminationReason::Timeout) => Termination::TimeBudget,
        _ => Termination::Converged,
    }
}

fn run_lbfgs<O>(
    problem: Guarded<'_, O>,
    start: &[f64],
    scale: f64,
    settings: &OptimizerSettings,
    observer: HistoryObserver,
) -> std::result::Result<Termination, Error>
where
    O: CostFunction<Param = Params, Output = f64> + Gradient<Param = Params, Gradient = Params>,
{
    let solver: Lbfgs = LBFGS::new(MoreThuente::new(), LBFGS_MEMORY)
        .with_tolerance_grad(settings.tolerance * scale)?
        .with_tolerance_cost(settings.tolerance * settings.tolerance * scale)?;
    let mut executor = Executor::new(problem, solver)
        .configure(|state| {
            state
                .param(start.to_vec())
                .max_iters(settings.max_iterations as u64)
        })
        .add_observer(observer, ObserverMode::Always);
    if let Some(budget) = settings.time_budget {
        executor = executor.timeout(budget);
    }
    let result = executor.run()?;
    Ok(termination(result.state()))
}

fn initial_simplex(start: &[f64]) -> Vec<Params> {
    let mut simplex = vec![start.to_vec()];
    for i in 0..start.len() {
        let mut vertex = start.to_vec();
        vertex[i] += SIMPLEX_EDGE * start[i].abs().max(SIMPLEX_EDGE);
        simplex.push(vertex);
    }
    simplex
}

fn run_nelder_mead<O>(
    problem: Guarded<'_, O>,
    start: &[f64],
    tolerance: f64,
    max_iterations: usize,
    time_budget: Option<Duration>,
    observer: HistoryObserver,
) -> std::result::Result<Termination, Error>
where
    O: CostFunction<Param = Params, Output = f64>,
{
    let solver = NelderMead::new(initial_simplex(start)).with_sd_tolerance(tolerance)?;
    let mut executor = Executor::new(problem, solver)
        .configure(|state| state.max_iters(max_iterations as u64))
        .add_observer(observer, ObserverMode::Always);
    if let Some(budget) = time_budget {
        executor = executor.timeout(budget);
    }
    let result = executor.run()?;
    Ok(termination(result.state()))
}

/// Minimize `objective` from `start`.
///
/// The returned point is the lowest-cost point any solver evaluated.
///
/// # Errors
/// [`GlmmError::Cancelled`] if `token` is cancelled, and a numerical failure
/// if the objective is not finite at the starting point or Nelder–Mead
/// itself fails.
pub fn minimize<O>(
    objective: &O,
    start: &[f64],
    method: OptimizerMethod,
    settings: &OptimizerSettings,
    token: &CancellationToken,
) -> Result<OptimizerOutcome>
where
    O: CostFunction<Param = Params, Output = f64> + Gradient<Param = Params, Gradient = Params>,
{
    token.check()?;
    let started = Instant::now();
    let best = Mutex::new(None);
    let guarded = |strict: bool| Guarded {
        objective,
        token,
        best: &best,
        strict,
    };

    let f0 = guarded(false).cost(&start.to_vec())?;
    if !f0.is_finite() {
        return Err(GlmmError::NumericalFailure(
            "objective is not finite at the starting point".into(),
        ));
    }

    let monitor = Arc::new(Mutex::new(ConvergenceMonitor::new()));
    let observer = |solver: &'static str| HistoryObserver {
        monitor: Arc::clone(&monitor),
        token: token.clone(),
        solver,
        previous: None,
    };

    let (termination, fell_back) = match method {
        OptimizerMethod::NelderMead => {
            let termination = run_nelder_mead(
                guarded(false),
                start,
                settings.tolerance,
                settings.max_iterations,
                settings.time_budget,
                observer("Nelder-Mead"),
            )?;
            (termination, false)
        }
        OptimizerMethod::Bfgs => {
            match run_lbfgs(guarded(true), start, 1.0 + f0.abs(), settings, observer("L-BFGS")) {
                Ok(termination) => (termination, false),
                Err(err) => {
                    let err = GlmmError::from(err);
                    if matches!(err, GlmmError::Cancelled) {
                        return Err(err);
                    }
                    let from = lock(&best)
                        .as_ref()
                        .map_or_else(|| start.to_vec(), |(x, _)| x.clone());
                    let used = lock(&monitor).n_iterations();
                    let remaining = settings.max_iterations.saturating_sub(used);
                    let time_left = settings
                        .time_budget
                        .map(|budget| budget.saturating_sub(started.elapsed()));
                    warn!(
                        "L-BFGS stopped after {} iterations ({}); continuing with Nelder-Mead",
                        used, err
                    );
                    let termination = if remaining == 0 {
                        Termination::IterationLimit
                    } else if time_left == Some(Duration::ZERO) {
                        Termination::TimeBudget
                    } else {
                        run_nelder_mead(
                            guarded(false),
                            &from,
                            settings.tolerance,
                            remaining,
                            time_left,
                            observer("Nelder-Mead"),
                        )?
                    };
                    (termination, true)
                }
            }
        }
    };

    let (x, value) = lock(&best)
        .clone()
        .unwrap_or_else(|| (start.to_vec(), f0));
    let history = lock(&monitor).history().to_vec();
    debug!(
        "{} stopped ({:?}) after {} iterations at {:?}, objective {:.8}",
        method,
        termination,
        history.len(),
        x,
        value
    );
    Ok(OptimizerOutcome {
        x,
        value,
        iterations: history.len(),
        termination,
        fell_back,
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::atomic::AtomicUsize;

    /// Rosenbrock with an analytic gradient.
    struct Rosenbrock;

    impl CostFunction for Rosenbrock {
        type Param = Params;
        type Output = f64;

        fn cost(&self, x: &Params) -> std::result::Result<f64, Error> {
            Ok((1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2))
        }
    }

    impl Gradient for Rosenbrock {
        type Param = Params;
        type Gradient = Params;

        fn gradient(&self, x: &Params) -> std::result::Result<Params, Error> {
            Ok(vec![
                -2.0 * (1.0 - x[0]) - 400.0 * x[0] * (x[1] - x[0] * x[0]),
                200.0 * (x[1] - x[0] * x[0]),
            ])
        }
    }

    /// Quadratic bowl that is infeasible for x[0] > 3.
    struct Fenced;

    impl CostFunction for Fenced {
        type Param = Params;
        type Output = f64;

        fn cost(&self, x: &Params) -> std::result::Result<f64, Error> {
            if x[0] > 3.0 {
                Ok(f64::INFINITY)
            } else {
                Ok((x[0] - 2.0).powi(2) + 0.5 * (x[1] + 1.0).powi(2))
            }
        }
    }

    impl Gradient for Fenced {
        type Param = Params;
        type Gradient = Params;

        fn gradient(&self, x: &Params) -> std::result::Result<Params, Error> {
            Ok(vec![2.0 * (x[0] - 2.0), x[1] + 1.0])
        }
    }

    /// Quadratic bowl whose gradient is never available.
    struct NoGradient;

    impl CostFunction for NoGradient {
        type Param = Params;
        type Output = f64;

        fn cost(&self, x: &Params) -> std::result::Result<f64, Error> {
            Ok((x[0] - 1.0).powi(2) + (x[1] - 0.5).powi(2))
        }
    }

    impl Gradient for NoGradient {
        type Param = Params;
        type Gradient = Params;

        fn gradient(&self, _x: &Params) -> std::result::Result<Params, Error> {
            Err(GlmmError::NumericalFailure("no gradient".into()).into())
        }
    }

    /// Rosenbrock that cancels its token on the fifth evaluation.
    struct CancelAfter {
        token: CancellationToken,
        calls: AtomicUsize,
    }

    impl CostFunction for CancelAfter {
        type Param = Params;
        type Output = f64;

        fn cost(&self, x: &Params) -> std::result::Result<f64, Error> {
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= 5 {
                self.token.cancel();
            }
            Rosenbrock.cost(x)
        }
    }

    impl Gradient for CancelAfter {
        type Param = Params;
        type Gradient = Params;

        fn gradient(&self, x: &Params) -> std::result::Result<Params, Error> {
            Rosenbrock.gradient(x)
        }
    }

    fn settings(max_iterations: usize) -> OptimizerSettings {
        OptimizerSettings {
            tolerance: 1e-8,
            max_iterations,
            time_budget: None,
        }
    }

    #[test]
    fn test_lbfgs_rosenbrock() {
        let out = minimize(
            &Rosenbrock,
            &[-1.2, 1.0],
            OptimizerMethod::Bfgs,
            &settings(500),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_ne!(out.termination, Termination::IterationLimit);
        assert_relative_eq!(out.x[0], 1.0, epsilon = 1e-3);
        assert_relative_eq!(out.x[1], 1.0, epsilon = 1e-3);
        assert_eq!(out.iterations, out.history.len());
        for (i, record) in out.history.iter().enumerate() {
            assert_eq!(record.iteration, i + 1);
        }
    }

    #[test]
    fn test_nelder_mead_quadratic() {
        let out = minimize(
            &Fenced,
            &[0.0, 0.0],
            OptimizerMethod::NelderMead,
            &settings(1000),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(out.termination, Termination::Converged);
        assert_relative_eq!(out.x[0], 2.0, epsilon = 1e-3);
        assert_relative_eq!(out.x[1], -1.0, epsilon = 1e-3);
        assert!(!out.fell_back);
        assert!(out.history.iter().all(|r| r.gradient_norm.is_infinite()));
    }

    #[test]
    fn test_lbfgs_handles_infeasible_region() {
        let out = minimize(
            &Fenced,
            &[2.9, 4.0],
            OptimizerMethod::Bfgs,
            &settings(200),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_relative_eq!(out.x[0], 2.0, epsilon = 1e-3);
        assert_relative_eq!(out.x[1], -1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_gradient_failure_falls_back_to_nelder_mead() {
        let out = minimize(
            &NoGradient,
            &[0.0, 0.0],
            OptimizerMethod::Bfgs,
            &settings(500),
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(out.fell_back);
        assert_eq!(out.termination, Termination::Converged);
        assert_relative_eq!(out.x[0], 1.0, epsilon = 1e-3);
        assert_relative_eq!(out.x[1], 0.5, epsilon = 1e-3);
    }

    #[test]
    fn test_iteration_limit() {
        let out = minimize(
            &Rosenbrock,
            &[-1.2, 1.0],
            OptimizerMethod::Bfgs,
            &settings(3),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(out.termination, Termination::IterationLimit);
        assert_eq!(out.iterations, 3);
        assert_eq!(out.history.len(), 3);
    }

    #[test]
    fn test_zero_time_budget() {
        let s = OptimizerSettings {
            tolerance: 1e-10,
            max_iterations: 1000,
            time_budget: Some(Duration::ZERO),
        };
        let out = minimize(
            &Rosenbrock,
            &[-1.2, 1.0],
            OptimizerMethod::NelderMead,
            &s,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(out.termination, Termination::TimeBudget);
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let err = minimize(&Rosenbrock, &[0.0, 0.0], OptimizerMethod::Bfgs, &settings(10), &token)
            .unwrap_err();
        assert!(matches!(err, GlmmError::Cancelled));
    }

    #[test]
    fn test_cancelled_while_running() {
        for method in [OptimizerMethod::Bfgs, OptimizerMethod::NelderMead] {
            let token = CancellationToken::new();
            let objective = CancelAfter {
                token: token.clone(),
                calls: AtomicUsize::new(0),
            };
            let err = minimize(&objective, &[-1.2, 1.0], method, &settings(1000), &token)
                .unwrap_err();
            assert!(matches!(err, GlmmError::Cancelled), "{}: {:?}", method, err);
        }
    }

    #[test]
    fn test_infeasible_start() {
        let err = minimize(
            &Fenced,
            &[4.0, 0.0],
            OptimizerMethod::Bfgs,
            &settings(10),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, GlmmError::NumericalFailure(_)));
    }

    #[test]
    fn test_token_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(clone.check().is_ok());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
