use log::{debug, warn};

use crate::error::{GlmmError, Result};
use crate::model::GlmmProblem;
use crate::types::{DenseMatrix, DenseVector, SparseMat};

use super::link::{bernoulli_log_lik, inv_logit, working_weight};

/// Step halvings tried before an iteration gives up improving.
const MAX_STEP_HALVINGS: usize = 10;
/// Restarts from a perturbed point after a numerical failure.
const MAX_RETRIES: u32 = 3;
/// Relative size below which a Newton step that cannot be improved on counts as zero.
const NEGLIGIBLE_STEP: f64 = 1e-6;

/// Inner-loop settings.
#[derive(Debug, Clone, Copy)]
pub struct PirlsOptions {
    pub max_iterations: usize,
    /// Relative change of the penalized log-likelihood at convergence.
    pub tolerance: f64,
}

impl Default for PirlsOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-10,
        }
    }
}

/// Coefficients used to start (or warm-start) PIRLS.
#[derive(Debug, Clone, PartialEq)]
pub struct PirlsState {
    pub beta: DenseVector,
    /// Spherical random effects, b = Λv.
    pub v: DenseVector,
}

/// Conditional modes at fixed variance components.
#[derive(Debug, Clone)]
pub struct PirlsSolution {
    /// Fixed effects.
    pub beta: DenseVector,
    /// Spherical random effects.
    pub v: DenseVector,
    /// Random intercepts on the logit scale, b = Λv.
    pub b: DenseVector,
    /// Linear predictor.
    pub eta: DenseVector,
    /// Fitted probabilities.
    pub mu: DenseVector,
    /// Bernoulli log-likelihood at the modes.
    pub log_lik: f64,
    /// ‖v‖².
    pub penalty: f64,
    /// log|ΛZ'WZΛ + I| at the final weights.
    pub log_det: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Penalized Hessian of (β, v) at the final weights.
    pub hessian: DenseMatrix,
    /// Diagonal of Λ (standard deviation of each level's factor).
    pub lambda: Vec<f64>,
    n_fixed: usize,
}

impl PirlsSolution {
    /// Bernoulli log-likelihood minus ½‖v‖².
    pub fn penalized_log_lik(&self) -> f64 {
        self.log_lik - 0.5 * self.penalty
    }

    /// Laplace approximation to the marginal log-likelihood.
    pub fn laplace_log_lik(&self) -> f64 {
        self.log_lik - 0.5 * self.penalty - 0.5 * self.log_det
    }

    pub fn state(&self) -> PirlsState {
        PirlsState {
            beta: self.beta.clone(),
            v: self.v.clone(),
        }
    }

    /// Approximate covariance of β̂: the fixed block of the inverse Hessian.
    pub fn fixed_covariance(&self) -> Result<DenseMatrix> {
        let p = self.n_fixed;
        let inv = self
            .hessian
            .clone()
            .cholesky()
            .ok_or(GlmmError::NotPositiveDefinite)?
            .inverse();
        Ok(inv.view((0, 0), (p, p)).into_owned())
    }

    /// Conditional variance of every random intercept given β̂.
    pub fn conditional_variances(&self) -> Result<DenseVector> {
        let p = self.n_fixed;
        let q = self.lambda.len();
        if q == 0 {
            return Ok(DenseVector::zeros(0));
        }
        let inv = self
            .hessian
            .view((p, p), (q, q))
            .into_owned()
            .cholesky()
            .ok_or(GlmmError::NotPositiveDefinite)?
            .inverse();
        Ok(DenseVector::from_fn(q, |j, _| {
            self.lambda[j] * self.lambda[j] * inv[(j, j)]
        }))
    }
}

/// Penalized iteratively reweighted least squares for the logit GLMM.
///
/// ```text
/// [ X'WX      X'WZΛ        ] [β]   [ X'Wz  ]
/// [ ΛZ'WX     ΛZ'WZΛ + I   ] [v] = [ ΛZ'Wz ]
/// ```
///
/// With every θ = 0 this is ordinary logistic-regression IRLS.
pub struct Pirls<'a> {
    x: &'a DenseMatrix,
    y: &'a DenseVector,
    /// Non-zeros of each row of Z as (column, value).
    rows: Vec<Vec<(usize, f64)>>,
    /// Grouping factor of each column of Z.
    level_factor: Vec<usize>,
    n_factors: usize,
    options: PirlsOptions,
}

impl<'a> Pirls<'a> {
    pub fn new(problem: &'a GlmmProblem, options: PirlsOptions) -> Self {
        Self::with_random(
            &problem.x,
            &problem.y,
            &problem.z,
            problem.level_factor(),
            problem.n_factors(),
            options,
        )
    }

    /// Solver over an explicit incidence matrix.
    pub fn with_random(
        x: &'a DenseMatrix,
        y: &'a DenseVector,
        z: &SparseMat,
        level_factor: Vec<usize>,
        n_factors: usize,
        options: PirlsOptions,
    ) -> Self {
        let z_rows = z.to_csr();
        let rows = z_rows
            .outer_iterator()
            .map(|row| row.iter().map(|(j, &val)| (j, val)).collect())
            .collect();
        Self {
            x,
            y,
            rows,
            level_factor,
            n_factors,
            options,
        }
    }

    /// Solver without random effects (plain logistic regression).
    pub fn fixed_only(x: &'a DenseMatrix, y: &'a DenseVector, options: PirlsOptions) -> Self {
        Self {
            x,
            y,
            rows: vec![Vec::new(); y.len()],
            level_factor: Vec::new(),
            n_factors: 0,
            options,
        }
    }

    pub fn n_fixed(&self) -> usize {
        self.x.ncols()
    }

    pub fn n_random(&self) -> usize {
        self.level_factor.len()
    }

    /// β = 0, v = 0.
    pub fn initial_state(&self) -> PirlsState {
        PirlsState {
            beta: DenseVector::zeros(self.n_fixed()),
            v: DenseVector::zeros(self.n_random()),
        }
    }

    /// Solve at standard deviations `theta` (one per grouping factor).
    ///
    /// A numerical failure restarts from a perturbed point (β reset, v shrunk
    /// toward zero) up to three times before the error is returned.
    pub fn solve(&self, theta: &[f64], start: Option<&PirlsState>) -> Result<PirlsSolution> {
        if theta.len() != self.n_factors {
            return Err(GlmmError::DimensionMismatch {
                expected: self.n_factors,
                got: theta.len(),
                context: "PIRLS standard deviations".into(),
            });
        }
        if theta.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(GlmmError::NumericalFailure(format!(
                "invalid standard deviations {:?}",
                theta
            )));
        }

        let lambda: Vec<f64> = self.level_factor.iter().map(|&k| theta[k]).collect();
        let origin = start.cloned().unwrap_or_else(|| self.initial_state());
        if origin.beta.len() != self.n_fixed() || origin.v.len() != self.n_random() {
            return Err(GlmmError::DimensionMismatch {
                expected: self.n_fixed() + self.n_random(),
                got: origin.beta.len() + origin.v.len(),
                context: "PIRLS starting point".into(),
            });
        }

        let mut state = origin.clone();
        let mut attempt = 0;
        loop {
            match self.run(&lambda, &state) {
                Ok(solution) => return Ok(solution),
                Err(err) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    warn!(
                        "PIRLS failed at theta = {:?} ({}); retry {} of {}",
                        theta, err, attempt, MAX_RETRIES
                    );
                    let shrink = if attempt == MAX_RETRIES {
                        0.0
                    } else {
                        0.5f64.powi(attempt as i32)
                    };
                    state = PirlsState {
                        beta: DenseVector::zeros(self.n_fixed()),
                        v: &origin.v * shrink,
                    };
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn run(&self, lambda: &[f64], start: &PirlsState) -> Result<PirlsSolution> {
        let n = self.y.len();
        let p = self.n_fixed();
        let q = self.n_random();

        let mut beta = start.beta.clone();
        let mut v = start.v.clone();
        // A vanished column of ZΛ decouples v_j; its mode is 0.
        for (j, &l) in lambda.iter().enumerate() {
            if l == 0.0 {
                v[j] = 0.0;
            }
        }

        let mut eta = self.linear_predictor(&beta, &v, lambda);
        let mut pll = self.penalized(&eta, &v);
        if !pll.is_finite() {
            return Err(GlmmError::NumericalFailure(
                "non-finite penalized log-likelihood at the starting point".into(),
            ));
        }

        let mut converged = false;
        let mut iterations = 0;

        for iter in 1..=self.options.max_iterations {
            iterations = iter;

            let mu = eta.map(inv_logit);
            let w = mu.map(working_weight);
            let z_work = DenseVector::from_fn(n, |i, _| eta[i] + (self.y[i] - mu[i]) / w[i]);
            let (h, rhs) = self.assemble(&w, &z_work, lambda);

            let target = h
                .cholesky()
                .ok_or(GlmmError::NotPositiveDefinite)?
                .solve(&rhs);
            if target.iter().any(|t| !t.is_finite()) {
                return Err(GlmmError::NumericalFailure(
                    "non-finite PIRLS update".into(),
                ));
            }

            let step_beta = target.rows(0, p) - &beta;
            let step_v = target.rows(p, q) - &v;

            let mut scale = 1.0;
            let mut accepted = None;
            for _ in 0..=MAX_STEP_HALVINGS {
                let cand_beta = &beta + &step_beta * scale;
                let cand_v = &v + &step_v * scale;
                let cand_eta = self.linear_predictor(&cand_beta, &cand_v, lambda);
                let cand_pll = self.penalized(&cand_eta, &cand_v);
                if cand_pll.is_finite() && cand_pll >= pll {
                    accepted = Some((cand_beta, cand_v, cand_eta, cand_pll));
                    break;
                }
                scale *= 0.5;
            }

            // No halving improves. That is the mode only if the Newton step itself vanished.
            let Some((new_beta, new_v, new_eta, new_pll)) = accepted else {
                converged = negligible_step(&step_beta, &step_v, &beta, &v);
                if converged {
                    // Differences are below rounding; the Newton target is the mode.
                    beta += &step_beta;
                    v += &step_v;
                    eta = self.linear_predictor(&beta, &v, lambda);
                } else {
                    debug!(
                        "PIRLS step halving stalled at iteration {} (|step| = {:.3e})",
                        iter,
                        step_beta.amax().max(step_v.amax())
                    );
                }
                break;
            };

            let change = (new_pll - pll).abs() / (new_pll.abs() + 0.1);
            beta = new_beta;
            v = new_v;
            eta = new_eta;
            pll = new_pll;

            if change < self.options.tolerance {
                converged = true;
                break;
            }
        }

        if !converged {
            debug!(
                "PIRLS did not converge in {} iterations (penalized logL = {:.6})",
                iterations, pll
            );
        }

        let mu = eta.map(inv_logit);
        let w = mu.map(working_weight);
        let (hessian, _) = self.assemble(&w, &eta, lambda);

        let log_det = if q == 0 {
            0.0
        } else {
            let block = hessian.view((p, p), (q, q)).into_owned();
            let chol = block.cholesky().ok_or(GlmmError::NotPositiveDefinite)?;
            2.0 * chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>()
        };

        let b = DenseVector::from_fn(q, |j, _| lambda[j] * v[j]);
        let log_lik = bernoulli_log_lik(self.y, &eta);
        let penalty = v.norm_squared();

        Ok(PirlsSolution {
            beta,
            v,
            b,
            eta,
            mu,
            log_lik,
            penalty,
            log_det,
            iterations,
            converged,
            hessian,
            lambda: lambda.to_vec(),
            n_fixed: p,
        })
    }

    /// η = Xβ + ZΛv.
    fn linear_predictor(&self, beta: &DenseVector, v: &DenseVector, lambda: &[f64]) -> DenseVector {
        let mut eta = self.x * beta;
        for (i, row) in self.rows.iter().enumerate() {
            for &(j, z) in row {
                eta[i] += z * lambda[j] * v[j];
            }
        }
        eta
    }

    fn penalized(&self, eta: &DenseVector, v: &DenseVector) -> f64 {
        bernoulli_log_lik(self.y, eta) - 0.5 * v.norm_squared()
    }

    /// Assemble the penalized normal equations at weights `w` and working
    /// response `z_work`.
    fn assemble(
        &self,
        w: &DenseVector,
        z_work: &DenseVector,
        lambda: &[f64],
    ) -> (DenseMatrix, DenseVector) {
        let p = self.n_fixed();
        let q = self.n_random();
        let dim = p + q;

        let mut h = DenseMatrix::zeros(dim, dim);
        let mut rhs = DenseVector::zeros(dim);

        // --- X'WX block and X'Wz ---
        let mut xw = self.x.clone();
        for (i, &wi) in w.iter().enumerate() {
            xw.row_mut(i).scale_mut(wi);
        }
        h.view_mut((0, 0), (p, p)).copy_from(&self.x.tr_mul(&xw));
        rhs.rows_mut(0, p).copy_from(&xw.tr_mul(z_work));

        // --- ΛZ'WX, ΛZ'WZΛ and ΛZ'Wz, one observation at a time ---
        for (i, row) in self.rows.iter().enumerate() {
            let wi = w[i];
            for &(j, zij) in row {
                let a = zij * lambda[j];
                if a == 0.0 {
                    continue;
                }
                let r = p + j;
                for c in 0..p {
                    let val = wi * a * self.x[(i, c)];
                    h[(r, c)] += val;
                    h[(c, r)] += val;
                }
                for &(j2, zij2) in row {
                    h[(r, p + j2)] += wi * a * zij2 * lambda[j2];
                }
                rhs[r] += wi * a * z_work[i];
            }
        }

        for j in 0..q {
            h[(p + j, p + j)] += 1.0;
        }

        (h, rhs)
    }
}

fn negligible_step(
    step_beta: &DenseVector,
    step_v: &DenseVector,
    beta: &DenseVector,
    v: &DenseVector,
) -> bool {
    let step = step_beta.amax().max(step_v.amax());
    let size = beta.amax().max(v.amax());
    step <= NEGLIGIBLE_STEP * (1.0 + size)
}

/// Ordinary logistic regression of `y` on `x` by IRLS.
pub fn fit_logistic(
    x: &DenseMatrix,
    y: &DenseVector,
    options: PirlsOptions,
) -> Result<PirlsSolution> {
    Pirls::fixed_only(x, y, options).solve(&[], None)
}
