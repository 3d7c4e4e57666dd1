use std::time::Duration;

use crate::data::DataFrame;
use crate::error::{GlmmError, Result};
use crate::glmm::{CancellationToken, FitConfig, FittedModel, OptimizerMethod};
use crate::grouping::{GroupingFactor, GroupingIndex, GroupingSpec};
use crate::predict::UnseenLevelPolicy;
use crate::types::{DenseMatrix, DenseVector, SparseMat};

use super::design::{
    build_combined_random_design, build_fixed_design, build_random_design, build_response,
    check_full_rank, DesignSchema,
};
use super::spec::{parse_fixed_formula, FixedTerm, ModelSpec};

/// A fully specified binary GLMM, ready for fitting.
#[derive(Debug, Clone)]
pub struct GlmmProblem {
    /// Number of observations.
    pub n_obs: usize,
    pub spec: ModelSpec,
    /// Response vector (y), 0.0 / 1.0.
    pub y: DenseVector,
    /// Fixed effects design matrix (X).
    pub x: DenseMatrix,
    /// Coding of the fixed-effect columns.
    pub schema: DesignSchema,
    /// Resolved grouping factors, in declaration order.
    pub factors: Vec<GroupingFactor>,
    /// Incidence matrices, one per grouping factor.
    pub z_blocks: Vec<SparseMat>,
    /// Combined incidence matrix [Z1 | Z2 | ...].
    pub z: SparseMat,
    pub config: FitConfig,
}

impl GlmmProblem {
    pub fn n_fixed(&self) -> usize {
        self.x.ncols()
    }

    pub fn n_factors(&self) -> usize {
        self.factors.len()
    }

    /// Total number of random-effect levels (columns of Z).
    pub fn n_random(&self) -> usize {
        self.z.cols()
    }

    /// Grouping factor of every column of Z.
    pub fn level_factor(&self) -> Vec<usize> {
        self.z_blocks
            .iter()
            .enumerate()
            .flat_map(|(k, z)| std::iter::repeat(k).take(z.cols()))
            .collect()
    }

    /// Fit the model by Laplace approximation.
    pub fn fit(&self) -> Result<FittedModel> {
        crate::glmm::fit(self, &CancellationToken::new())
    }

    /// Fit the model, stopping with [`GlmmError::Cancelled`] once `token`
    /// is cancelled.
    pub fn fit_with_cancellation(&self, token: &CancellationToken) -> Result<FittedModel> {
        crate::glmm::fit(self, token)
    }
}

/// Builder for constructing a [`GlmmProblem`].
pub struct GlmmBuilder<'a> {
    data: Option<&'a DataFrame>,
    response: Option<String>,
    fixed_formula: Option<String>,
    fixed_terms: Vec<FixedTerm>,
    intercept: bool,
    groups: Vec<GroupingSpec>,
    config: FitConfig,
}

impl<'a> GlmmBuilder<'a> {
    /// Create a new builder with sensible defaults.
    pub fn new() -> Self {
        Self {
            data: None,
            response: None,
            fixed_formula: None,
            fixed_terms: Vec::new(),
            intercept: true,
            groups: Vec::new(),
            config: FitConfig::default(),
        }
    }

    /// Set the data source.
    pub fn data(mut self, df: &'a DataFrame) -> Self {
        self.data = Some(df);
        self
    }

    /// Set the binary response variable (column name).
    pub fn response(mut self, col: &str) -> Self {
        self.response = Some(col.to_string());
        self
    }

    /// Set the fixed effects from a term list (e.g. `"age + female + ward"`).
    ///
    /// Takes precedence over terms added with [`GlmmBuilder::term`].
    pub fn fixed(mut self, formula: &str) -> Self {
        self.fixed_formula = Some(formula.to_string());
        self
    }

    /// Add a typed fixed-effect term.
    pub fn term(mut self, term: FixedTerm) -> Self {
        self.fixed_terms.push(term);
        self
    }

    /// Drop the intercept added by default.
    pub fn no_intercept(mut self) -> Self {
        self.intercept = false;
        self
    }

    /// Add a random-intercept grouping factor.
    pub fn group(mut self, spec: GroupingSpec) -> Self {
        self.groups.push(spec);
        self
    }

    /// Replace the whole fit configuration.
    pub fn config(mut self, config: FitConfig) -> Self {
        self.config = config;
        self
    }

    /// Set maximum outer (variance-component) iterations (default: 200).
    pub fn max_iterations(mut self, n: usize) -> Self {
        self.config.max_outer_iterations = n;
        self
    }

    /// Set maximum PIRLS iterations per evaluation (default: 50).
    pub fn max_inner_iterations(mut self, n: usize) -> Self {
        self.config.max_inner_iterations = n;
        self
    }

    /// Set the optimizer convergence tolerance (default: 1e-6).
    pub fn convergence(mut self, tol: f64) -> Self {
        self.config.optimizer_tolerance = tol;
        self
    }

    /// Set the PIRLS convergence tolerance (default: 1e-10).
    pub fn pirls_tolerance(mut self, tol: f64) -> Self {
        self.config.pirls_tolerance = tol;
        self
    }

    pub fn method(mut self, method: OptimizerMethod) -> Self {
        self.config.method = method;
        self
    }

    /// Stop the outer loop after this much wall-clock time.
    pub fn time_budget(mut self, budget: Duration) -> Self {
        self.config.time_budget = Some(budget);
        self
    }

    /// Starting variances, one per grouping factor in declaration order.
    pub fn start_variances(mut self, variances: Vec<f64>) -> Self {
        self.config.start_variances = Some(variances);
        self
    }

    /// Default policy stored on the fitted model for unseen levels.
    pub fn unseen_level_policy(mut self, policy: UnseenLevelPolicy) -> Self {
        self.config.unseen_level_policy = policy;
        self
    }

    /// Build the model. Validates all inputs and constructs design matrices.
    pub fn build(self) -> Result<GlmmProblem> {
        let df = self
            .data
            .ok_or_else(|| GlmmError::ModelSpec("No data provided".into()))?;

        let response = self
            .response
            .ok_or_else(|| GlmmError::ModelSpec("No response variable specified".into()))?;

        let n = df.nrows();
        if n == 0 {
            return Err(GlmmError::ModelSpec("DataFrame is empty".into()));
        }

        let mut fixed = if let Some(ref formula) = self.fixed_formula {
            parse_fixed_formula(formula, df)?
        } else {
            self.fixed_terms
        };
        if self.fixed_formula.is_none() && self.intercept && !fixed.contains(&FixedTerm::Intercept) {
            fixed.insert(0, FixedTerm::Intercept);
        }
        if !self.intercept {
            fixed.retain(|t| *t != FixedTerm::Intercept);
        }

        let spec = ModelSpec {
            response,
            fixed,
            groups: self.groups,
        };
        spec.validate()?;
        self.config.validate(spec.groups.len())?;

        let y = build_response(df, &spec.response)?;
        let (x, schema) = build_fixed_design(df, &spec.fixed)?;
        check_full_rank(&x, &schema.labels)?;

        let index = GroupingIndex::resolve(df, &spec.groups)?;
        let z_blocks: Vec<SparseMat> = index
            .factors()
            .iter()
            .enumerate()
            .map(|(k, f)| build_random_design(index.codes(k), f.n_levels()))
            .collect();
        let z = build_combined_random_design(&z_blocks, n);

        log::info!(
            "Built binary GLMM: {} observations, {} fixed effects, {} grouping factors, {} levels",
            n,
            x.ncols(),
            z_blocks.len(),
            z.cols()
        );

        Ok(GlmmProblem {
            n_obs: n,
            spec,
            y,
            x,
            schema,
            factors: index.into_factors(),
            z_blocks,
            z,
            config: self.config,
        })
    }
}

impl<'a> Default for GlmmBuilder<'a> {
    fn default() -> Self {
        Self::new()
    }
}
