use serde::{Deserialize, Serialize};

use crate::diagnostics::{format_wald_tests, icc_report, wald_tests, ConvergenceRecord, IccReport, ModelFit};
use crate::grouping::GroupingFactor;
use crate::model::{DesignSchema, ModelSpec};
use crate::predict::UnseenLevelPolicy;
use crate::types::DenseVector;

use super::optimizer::OptimizerMethod;

/// Format tag written into persisted models.
pub const MODEL_FORMAT: &str = "binary-glmm";
/// Version of the persisted layout.
pub const MODEL_VERSION: u32 = 1;

/// Terminal state of the outer optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    Converged,
    /// Iteration or wall-clock budget exhausted; estimates are the best found.
    MaxIterationsExceeded,
}

/// Non-fatal conditions met during a fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FitWarning {
    /// The variance of this factor is (numerically) zero.
    SingularFit { factor: String },
    /// The final PIRLS solve hit its iteration limit.
    InnerNotConverged { iterations: usize },
    /// L-BFGS could not make progress and Nelder–Mead finished the search.
    OptimizerFallback,
    IterationLimit { iterations: usize },
    TimeBudgetExhausted,
    /// PIRLS failed at the optimum; the estimates come from the best
    /// solution found during the search.
    FinalSolveFailed { detail: String },
    /// A standard-error quantity could not be computed and is reported as
    /// missing.
    UncertaintyUnavailable { quantity: String },
}

impl std::fmt::Display for FitWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitWarning::SingularFit { factor } => {
                write!(f, "singular fit: variance of '{}' is zero", factor)
            }
            FitWarning::InnerNotConverged { iterations } => {
                write!(f, "PIRLS did not converge in {} iterations", iterations)
            }
            FitWarning::OptimizerFallback => {
                write!(f, "L-BFGS could not make progress; finished with Nelder-Mead")
            }
            FitWarning::IterationLimit { iterations } => {
                write!(f, "outer iteration limit reached after {} iterations", iterations)
            }
            FitWarning::TimeBudgetExhausted => write!(f, "time budget exhausted"),
            FitWarning::FinalSolveFailed { detail } => write!(
                f,
                "final PIRLS solve failed ({}); using the best solution from the search",
                detail
            ),
            FitWarning::UncertaintyUnavailable { quantity } => {
                write!(f, "{} unavailable", quantity)
            }
        }
    }
}

/// A fixed-effect coefficient with its Wald z-test.
///
/// The standard error is `None` when the fixed-effect covariance could not be
/// computed; `z` and `p_value` are also `None` when the standard error is zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedEffect {
    pub term: String,
    pub level: String,
    pub estimate: f64,
    pub se: Option<f64>,
    pub z: Option<f64>,
    pub p_value: Option<f64>,
}

impl FixedEffect {
    pub fn name(&self) -> String {
        if self.level.is_empty() {
            self.term.clone()
        } else {
            format!("{}[{}]", self.term, self.level)
        }
    }
}

/// Random-intercept variance of one grouping factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceComponent {
    pub factor: String,
    /// Parent factor for nested factors; the variance is then within-parent.
    pub parent: Option<String>,
    pub variance: f64,
    pub std_dev: f64,
    /// Approximate standard error of `std_dev` from the curvature of the
    /// Laplace deviance; `None` at the boundary or when the curvature is not
    /// positive definite.
    pub std_dev_se: Option<f64>,
}

/// Conditional modes of one grouping factor, aligned with its levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomEffectBlock {
    pub factor: String,
    pub modes: Vec<f64>,
    /// `None` when the penalized Hessian could not be inverted.
    pub conditional_variances: Option<Vec<f64>>,
    /// Observations per level in the fit data.
    pub counts: Vec<usize>,
}

/// An immutable fitted binary GLMM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub format: String,
    pub version: u32,
    pub spec: ModelSpec,
    pub schema: DesignSchema,
    pub fixed_effects: Vec<FixedEffect>,
    /// Covariance of the fixed effects, row-major; `None` when the penalized
    /// Hessian could not be inverted.
    pub fixed_covariance: Option<Vec<Vec<f64>>>,
    pub variance_components: Vec<VarianceComponent>,
    /// Resolved grouping factors with canonical level keys.
    pub factors: Vec<GroupingFactor>,
    pub random_effects: Vec<RandomEffectBlock>,
    /// Laplace log marginal likelihood.
    pub log_likelihood: f64,
    pub deviance: f64,
    pub status: FitStatus,
    pub warnings: Vec<FitWarning>,
    pub method: OptimizerMethod,
    pub outer_iterations: usize,
    /// PIRLS iterations of the final solve.
    pub inner_iterations: usize,
    pub function_evaluations: usize,
    pub n_obs: usize,
    /// Default policy for levels absent from the fit data.
    pub unseen_level_policy: UnseenLevelPolicy,
    pub history: Vec<ConvergenceRecord>,
}

impl FittedModel {
    pub fn is_converged(&self) -> bool {
        self.status == FitStatus::Converged
    }

    /// True when at least one variance component is zero.
    pub fn is_singular(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, FitWarning::SingularFit { .. }))
    }

    /// Variance of each grouping factor, in declaration order.
    pub fn variances(&self) -> Vec<f64> {
        self.variance_components.iter().map(|v| v.variance).collect()
    }

    pub fn variance_of(&self, factor: &str) -> Option<f64> {
        self.variance_components
            .iter()
            .find(|v| v.factor == factor)
            .map(|v| v.variance)
    }

    /// Fixed-effect estimates in design-column order.
    pub fn coefficients(&self) -> DenseVector {
        DenseVector::from_iterator(
            self.fixed_effects.len(),
            self.fixed_effects.iter().map(|e| e.estimate),
        )
    }

    /// Estimate of a coefficient by display name (`"age"`, `"ward[icu]"`).
    pub fn coefficient(&self, name: &str) -> Option<f64> {
        self.fixed_effects
            .iter()
            .find(|e| e.name() == name)
            .map(|e| e.estimate)
    }

    /// Conditional mode of a level, looked up by canonical key.
    pub fn random_effect(&self, factor: &str, key: &str) -> Option<f64> {
        let k = self.factors.iter().position(|f| f.name() == factor)?;
        let level = self.factors[k].level_index(key)?;
        self.random_effects[k].modes.get(level).copied()
    }

    pub fn model_fit(&self) -> ModelFit {
        ModelFit {
            log_likelihood: self.log_likelihood,
            n_obs: self.n_obs,
            n_fixed: self.fixed_effects.len(),
            n_variance_params: self.variance_components.len(),
        }
    }

    pub fn aic(&self) -> f64 {
        self.model_fit().aic()
    }

    pub fn bic(&self) -> f64 {
        self.model_fit().bic()
    }

    /// Variance decomposition on the latent logistic scale.
    pub fn icc(&self) -> IccReport {
        icc_report(&self.variance_components)
    }

    /// Print a formatted summary of the model fit.
    pub fn summary(&self) -> String {
        let mut s = String::new();

        s.push_str("=== Binary GLMM Fit (Laplace, logit link) ===\n\n");
        s.push_str(&format!(
            "Observations: {}   Fixed params: {}   Grouping factors: {}\n",
            self.n_obs,
            self.fixed_effects.len(),
            self.variance_components.len()
        ));
        s.push_str(&format!(
            "Status: {:?}   Optimizer: {}   Outer iterations: {}   PIRLS iterations: {}   Evaluations: {}\n\n",
            self.status,
            self.method,
            self.outer_iterations,
            self.inner_iterations,
            self.function_evaluations
        ));

        s.push_str(&format!("Log-likelihood: {:.4}\n", self.log_likelihood));
        s.push_str(&format!("Deviance: {:.4}\n", self.deviance));
        s.push_str(&format!("AIC: {:.4}\n", self.aic()));
        s.push_str(&format!("BIC: {:.4}\n\n", self.bic()));

        s.push_str("--- Variance Components ---\n");
        s.push_str(&format!(
            "  {:<20} {:>12} {:>12} {:>12}\n",
            "Factor", "Variance", "Std.Dev", "SE(SD)"
        ));
        for vc in &self.variance_components {
            let name = match &vc.parent {
                Some(p) => format!("{} (in {})", vc.factor, p),
                None => vc.factor.clone(),
            };
            let se = vc
                .std_dev_se
                .map(|v| format!("{:.6}", v))
                .unwrap_or_else(|| "-".to_string());
            s.push_str(&format!(
                "  {:<20} {:>12.6} {:>12.6} {:>12}\n",
                name, vc.variance, vc.std_dev, se
            ));
        }

        s.push_str("\n--- Fixed Effects ---\n");
        s.push_str(&format!(
            "  {:<24} {:>12} {:>12} {:>9} {:>12}\n",
            "Term", "Estimate", "Std.Error", "z", "Pr(>|z|)"
        ));
        let cell = |value: Option<f64>, precision: usize, scientific: bool| match value {
            Some(v) if scientific => format!("{:.*e}", precision, v),
            Some(v) => format!("{:.*}", precision, v),
            None => "-".to_string(),
        };
        for ef in &self.fixed_effects {
            s.push_str(&format!(
                "  {:<24} {:>12.6} {:>12} {:>9} {:>12}\n",
                ef.name(),
                ef.estimate,
                cell(ef.se, 6, false),
                cell(ef.z, 3, false),
                cell(ef.p_value, 4, true)
            ));
        }

        s.push('\n');
        s.push_str(&format_wald_tests(&wald_tests(self)));

        s.push('\n');
        s.push_str(&self.icc().format());

        for (factor, block) in self.factors.iter().zip(&self.random_effects) {
            s.push_str(&format!("\n--- Random Effects: {} ---\n", block.factor));
            let mut order: Vec<usize> = (0..block.modes.len()).collect();
            order.sort_by(|&a, &b| block.modes[b].total_cmp(&block.modes[a]));
            for &j in order.iter().take(10) {
                let cond_sd = block
                    .conditional_variances
                    .as_ref()
                    .map_or_else(|| "-".to_string(), |cv| format!("{:.6}", cv[j].sqrt()));
                s.push_str(&format!(
                    "  {}: {:.6} (cond. SD: {}, n = {})\n",
                    factor.level_key(j).unwrap_or_default(),
                    block.modes[j],
                    cond_sd,
                    block.counts[j]
                ));
            }
            if order.len() > 10 {
                s.push_str(&format!("  ... and {} more\n", order.len() - 10));
            }
        }

        if !self.warnings.is_empty() {
            s.push_str("\n--- Warnings ---\n");
            for w in &self.warnings {
                s.push_str(&format!("  {}\n", w));
            }
        }

        s
    }
}
