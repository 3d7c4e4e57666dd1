use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::diagnostics::z_test;
use crate::error::{GlmmError, Result};
use crate::model::{FixedEffectLabel, GlmmProblem};
use crate::types::{DenseMatrix, DenseVector};
use crate::predict::UnseenLevelPolicy;

use super::laplace::{theta_from_phi, LaplaceObjective};
use super::optimizer::{
    minimize, CancellationToken, OptimizerMethod, OptimizerSettings, Termination,
};
use super::pirls::{PirlsOptions, PirlsSolution};
use super::result::{
    FitStatus, FitWarning, FittedModel, FixedEffect, RandomEffectBlock, VarianceComponent,
    MODEL_FORMAT, MODEL_VERSION,
};

/// Standard deviations below this are reported as a singular fit.
pub const SINGULAR_THRESHOLD: f64 = 1e-4;
/// Largest deviance increase accepted when snapping a component to zero.
const BOUNDARY_SLACK: f64 = 1e-8;

/// Settings of the outer and inner loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    pub optimizer_tolerance: f64,
    pub max_outer_iterations: usize,
    pub max_inner_iterations: usize,
    pub pirls_tolerance: f64,
    pub method: OptimizerMethod,
    /// Wall-clock limit for the outer loop.
    pub time_budget: Option<Duration>,
    /// Starting variances, one per grouping factor. Defaults to 1.
    pub start_variances: Option<Vec<f64>>,
    pub unseen_level_policy: UnseenLevelPolicy,
    /// Components with σ below this are tried at exactly zero after the
    /// optimizer stops.
    pub boundary_tolerance: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            optimizer_tolerance: 1e-6,
            max_outer_iterations: 200,
            max_inner_iterations: 50,
            pirls_tolerance: 1e-10,
            method: OptimizerMethod::default(),
            time_budget: None,
            start_variances: None,
            unseen_level_policy: UnseenLevelPolicy::default(),
            boundary_tolerance: 1e-2,
        }
    }
}

impl FitConfig {
    /// Check the settings against a model with `n_factors` grouping factors.
    pub fn validate(&self, n_factors: usize) -> Result<()> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.optimizer_tolerance) || !positive(self.pirls_tolerance) {
            return Err(GlmmError::ModelSpec(
                "convergence tolerances must be positive and finite".into(),
            ));
        }
        if self.max_outer_iterations == 0 || self.max_inner_iterations == 0 {
            return Err(GlmmError::ModelSpec(
                "iteration limits must be at least 1".into(),
            ));
        }
        if !(self.boundary_tolerance.is_finite() && self.boundary_tolerance >= 0.0) {
            return Err(GlmmError::ModelSpec(
                "boundary tolerance must be non-negative".into(),
            ));
        }
        if let Some(ref start) = self.start_variances {
            if start.len() != n_factors {
                return Err(GlmmError::DimensionMismatch {
                    expected: n_factors,
                    got: start.len(),
                    context: "start variances".into(),
                });
            }
            if let Some(bad) = start.iter().find(|v| !positive(**v)) {
                return Err(GlmmError::ModelSpec(format!(
                    "start variances must be positive, got {}",
                    bad
                )));
            }
        }
        Ok(())
    }

    fn pirls_options(&self) -> PirlsOptions {
        PirlsOptions {
            max_iterations: self.max_inner_iterations,
            tolerance: self.pirls_tolerance,
        }
    }
}

/// Fit a binary GLMM by maximizing the Laplace-approximated likelihood.
///
/// 1. Minimize the Laplace deviance over φ (σ = |φ|) with the configured
///    optimizer, each evaluation running PIRLS to convergence.
/// 2. Try every near-zero component at exactly zero.
/// 3. Solve PIRLS once more at the final σ and collect estimates, standard
///    errors, conditional modes and warnings.
///
/// # Errors
/// [`GlmmError::Cancelled`] if `token` is cancelled before the fit finishes;
/// configuration errors from [`FitConfig::validate`]; a numerical failure if
/// the deviance is not finite at the start, or if the final PIRLS solve fails
/// and the search never reached a feasible point. Missing standard errors
/// are reported as warnings, not errors.
pub fn fit(problem: &GlmmProblem, token: &CancellationToken) -> Result<FittedModel> {
    let config = &problem.config;
    let n_factors = problem.n_factors();
    config.validate(n_factors)?;
    token.check()?;

    log::info!(
        "Fitting binary GLMM ({}): {} observations, {} fixed effects, {} grouping factors",
        config.method,
        problem.n_obs,
        problem.n_fixed(),
        n_factors
    );

    let objective = LaplaceObjective::new(problem, config.pirls_options());
    let start: Vec<f64> = match config.start_variances {
        Some(ref v) => v.iter().map(|s| s.sqrt()).collect(),
        None => vec![1.0; n_factors],
    };
    let settings = OptimizerSettings {
        tolerance: config.optimizer_tolerance,
        max_iterations: config.max_outer_iterations,
        time_budget: config.time_budget,
    };
    let outcome = minimize(&objective, &start, config.method, &settings, token)?;

    let mut phi = outcome.x.clone();
    let mut deviance = outcome.value;
    for k in 0..n_factors {
        if phi[k] != 0.0 && phi[k].abs() < config.boundary_tolerance {
            let mut trial = phi.clone();
            trial[k] = 0.0;
            let dev0 = objective.deviance(&trial, None);
            if dev0 <= deviance + BOUNDARY_SLACK {
                log::debug!("component {} snapped to zero (deviance {:.8})", k, dev0);
                phi = trial;
                deviance = dev0;
            }
        }
    }
    token.check()?;

    let mut warnings = Vec::new();
    let mut status = FitStatus::Converged;
    let (phi, solution) = final_solution(&objective, phi, &mut warnings)?;
    if !warnings.is_empty() {
        status = FitStatus::MaxIterationsExceeded;
    }
    let theta = theta_from_phi(&phi);
    let log_likelihood = solution.laplace_log_lik();

    match outcome.termination {
        Termination::Converged => {}
        Termination::IterationLimit => {
            status = FitStatus::MaxIterationsExceeded;
            warnings.push(FitWarning::IterationLimit {
                iterations: outcome.iterations,
            });
        }
        Termination::TimeBudget => {
            status = FitStatus::MaxIterationsExceeded;
            warnings.push(FitWarning::TimeBudgetExhausted);
        }
    }
    if outcome.fell_back {
        warnings.push(FitWarning::OptimizerFallback);
    }
    if !solution.converged {
        status = FitStatus::MaxIterationsExceeded;
        warnings.push(FitWarning::InnerNotConverged {
            iterations: solution.iterations,
        });
    }

    // Fixed effects
    let cov = uncertainty(
        solution.fixed_covariance(),
        "fixed-effect covariance",
        &mut warnings,
    );
    let fixed_effects = fixed_effect_table(&problem.schema.labels, &solution.beta, cov.as_ref());
    let fixed_covariance = cov.map(|cov| {
        (0..cov.nrows())
            .map(|i| cov.row(i).iter().copied().collect())
            .collect()
    });

    // Variance components
    let free: Vec<usize> = (0..n_factors)
        .filter(|&k| theta[k] >= SINGULAR_THRESHOLD)
        .collect();
    let sd_se = std_dev_standard_errors(&objective, &theta, &free);
    let variance_components: Vec<VarianceComponent> = problem
        .factors
        .iter()
        .enumerate()
        .map(|(k, factor)| VarianceComponent {
            factor: factor.name().to_string(),
            parent: factor
                .parent
                .map(|p| problem.factors[p].name().to_string()),
            variance: theta[k] * theta[k],
            std_dev: theta[k],
            std_dev_se: sd_se[k],
        })
        .collect();
    for (k, factor) in problem.factors.iter().enumerate() {
        if theta[k] < SINGULAR_THRESHOLD {
            log::warn!(
                "Singular fit: variance of '{}' is zero",
                factor.name()
            );
            warnings.push(FitWarning::SingularFit {
                factor: factor.name().to_string(),
            });
        }
    }

    // Random effects
    let cond_var = uncertainty(
        solution.conditional_variances(),
        "conditional variances",
        &mut warnings,
    );
    let mut random_effects = Vec::with_capacity(n_factors);
    let mut offset = 0;
    for (factor, z_k) in problem.factors.iter().zip(&problem.z_blocks) {
        let q = factor.n_levels();
        let mut counts = vec![0usize; q];
        for (_, (_, col)) in z_k.iter() {
            counts[col] += 1;
        }
        random_effects.push(RandomEffectBlock {
            factor: factor.name().to_string(),
            modes: solution.b.rows(offset, q).iter().copied().collect(),
            conditional_variances: cond_var
                .as_ref()
                .map(|cv| cv.rows(offset, q).iter().copied().collect()),
            counts,
        });
        offset += q;
    }

    if status == FitStatus::Converged {
        log::info!(
            "Converged after {} outer iterations: logL = {:.6}, deviance = {:.6}",
            outcome.iterations,
            log_likelihood,
            deviance
        );
    } else {
        log::warn!(
            "Binary GLMM did not converge ({} outer iterations); returning best estimates",
            outcome.iterations
        );
    }

    Ok(FittedModel {
        format: MODEL_FORMAT.to_string(),
        version: MODEL_VERSION,
        spec: problem.spec.clone(),
        schema: problem.schema.clone(),
        fixed_effects,
        fixed_covariance,
        variance_components,
        factors: problem.factors.clone(),
        random_effects,
        log_likelihood,
        deviance: -2.0 * log_likelihood,
        status,
        warnings,
        method: config.method,
        outer_iterations: outcome.iterations,
        inner_iterations: solution.iterations,
        function_evaluations: objective.evaluations(),
        n_obs: problem.n_obs,
        unseen_level_policy: config.unseen_level_policy,
        history: outcome.history,
    })
}

/// PIRLS from the default start at the final φ. If that solve fails
/// the best point the search evaluated is returned with a
/// [`FitWarning::FinalSolveFailed`]; without one the error propagates.
fn final_solution(
    objective: &LaplaceObjective<'_>,
    phi: Vec<f64>,
    warnings: &mut Vec<FitWarning>,
) -> Result<(Vec<f64>, PirlsSolution)> {
    let err = match objective.solve(&phi, None) {
        Ok(solution) => return Ok((phi, solution)),
        Err(err) => err,
    };
    let Some(best) = objective.best() else {
        return Err(err);
    };
    log::warn!(
        "Final PIRLS solve failed ({}); using the best solution from the search",
        err
    );
    warnings.push(FitWarning::FinalSolveFailed {
        detail: err.to_string(),
    });
    Ok((best.phi, best.solution))
}

/// `Some` on success; a failure becomes a warning and `None`.
fn uncertainty<T>(result: Result<T>, quantity: &str, warnings: &mut Vec<FitWarning>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!("{} unavailable: {}", quantity, err);
            warnings.push(FitWarning::UncertaintyUnavailable {
                quantity: quantity.to_string(),
            });
            None
        }
    }
}

/// Estimates with Wald statistics; without a covariance only the estimates
/// are filled in.
fn fixed_effect_table(
    labels: &[FixedEffectLabel],
    beta: &DenseVector,
    cov: Option<&DenseMatrix>,
) -> Vec<FixedEffect> {
    labels
        .iter()
        .enumerate()
        .map(|(i, label)| {
            let estimate = beta[i];
            let se = cov.map(|cov| cov[(i, i)].max(0.0).sqrt());
            let test = se.and_then(|se| z_test(estimate, se));
            FixedEffect {
                term: label.term.clone(),
                level: label.level.clone(),
                estimate,
                se,
                z: test.map(|(z, _)| z),
                p_value: test.map(|(_, p)| p),
            }
        })
        .collect()
}

/// Standard errors of σ for the components in `free`.
///
/// Var(φ̂) ≈ 2 H⁻¹ where H is the deviance Hessian; components at zero and
/// every component of a non-positive-definite H get `None`.
fn std_dev_standard_errors(
    objective: &LaplaceObjective<'_>,
    theta: &[f64],
    free: &[usize],
) -> Vec<Option<f64>> {
    let mut se = vec![None; theta.len()];
    if free.is_empty() {
        return se;
    }
    let h = objective.hessian(theta, free);
    if h.iter().any(|v| !v.is_finite()) {
        return se;
    }
    match h.cholesky() {
        Some(chol) => {
            let inv = chol.inverse();
            for (a, &k) in free.iter().enumerate() {
                let var = 2.0 * inv[(a, a)];
                if var.is_finite() && var > 0.0 {
                    se[k] = Some(var.sqrt());
                }
            }
        }
        None => {
            log::warn!("Deviance curvature is not positive definite; no variance-component SEs");
        }
    }
    se
}
