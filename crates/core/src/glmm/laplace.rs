//! Laplace approximation to the marginal log-likelihood.
//!
//! ```text
//! ℓ_L(θ) = Σ [y η̂ − log(1 + e^η̂)] − ½‖v̂‖² − ½ log|ΛZ'ŴZΛ + I|
//! ```
//!
//! The optimizer works on φ with σ = |φ|, minimizing the deviance −2ℓ_L.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use argmin::core::{CostFunction, Error, Gradient};
use finitediff::FiniteDiff;
use rayon::prelude::*;

use crate::error::{GlmmError, Result};
use crate::model::GlmmProblem;
use crate::types::DenseMatrix;

use super::pirls::{Pirls, PirlsOptions, PirlsSolution, PirlsState};

/// Relative step of the finite-difference Hessian.
const HESSIAN_STEP: f64 = 1e-3;

/// Standard deviations from optimizer parameters.
pub fn theta_from_phi(phi: &[f64]) -> Vec<f64> {
    phi.iter().map(|p| p.abs()).collect()
}

fn step_size(x: f64, relative: f64) -> f64 {
    relative * x.abs().max(1.0)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Modes at the last finite cost evaluation.
#[derive(Clone)]
struct Anchor {
    phi: Vec<f64>,
    state: PirlsState,
}

/// Lowest-deviance PIRLS solution seen so far.
#[derive(Clone)]
pub struct BestPoint {
    pub phi: Vec<f64>,
    pub deviance: f64,
    pub solution: PirlsSolution,
}

/// Deviance objective over φ, backed by warm-started PIRLS.
pub struct LaplaceObjective<'a> {
    pirls: Pirls<'a>,
    anchor: Mutex<Option<Anchor>>,
    best: Mutex<Option<BestPoint>>,
    evaluations: AtomicUsize,
}

impl<'a> LaplaceObjective<'a> {
    pub fn new(problem: &'a GlmmProblem, options: PirlsOptions) -> Self {
        Self::from_pirls(Pirls::new(problem, options))
    }

    pub fn from_pirls(pirls: Pirls<'a>) -> Self {
        Self {
            pirls,
            anchor: Mutex::new(None),
            best: Mutex::new(None),
            evaluations: AtomicUsize::new(0),
        }
    }

    /// Number of PIRLS solves so far.
    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::Relaxed)
    }

    /// Run PIRLS at φ.
    pub fn solve(&self, phi: &[f64], start: Option<&PirlsState>) -> Result<PirlsSolution> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        self.pirls.solve(&theta_from_phi(phi), start)
    }

    /// Deviance at φ; infeasible points (PIRLS failure) give +∞.
    pub fn deviance(&self, phi: &[f64], start: Option<&PirlsState>) -> f64 {
        match self.solve(phi, start) {
            Ok(sol) => {
                let dev = -2.0 * sol.laplace_log_lik();
                if dev.is_nan() {
                    f64::INFINITY
                } else {
                    dev
                }
            }
            Err(_) => f64::INFINITY,
        }
    }

    /// Laplace log-likelihood at φ; infeasible points give −∞.
    pub fn log_likelihood(&self, phi: &[f64]) -> f64 {
        -0.5 * self.deviance(phi, self.warm_start().as_ref())
    }

    /// Deviance at φ, warm-started from the previous evaluation. A finite
    /// value moves the anchor to φ and may replace the best point.
    pub fn evaluate(&self, phi: &[f64]) -> f64 {
        match self.solve(phi, self.warm_start().as_ref()) {
            Ok(sol) => {
                let dev = -2.0 * sol.laplace_log_lik();
                if !dev.is_finite() {
                    return f64::INFINITY;
                }
                *lock(&self.anchor) = Some(Anchor {
                    phi: phi.to_vec(),
                    state: sol.state(),
                });
                let mut best = lock(&self.best);
                if best.as_ref().map_or(true, |b| dev < b.deviance) {
                    *best = Some(BestPoint {
                        phi: phi.to_vec(),
                        deviance: dev,
                        solution: sol,
                    });
                }
                dev
            }
            Err(err) => {
                log::debug!("infeasible point phi = {:?}: {}", phi, err);
                f64::INFINITY
            }
        }
    }

    /// Best point over every [`LaplaceObjective::evaluate`] call.
    pub fn best(&self) -> Option<BestPoint> {
        lock(&self.best).clone()
    }

    /// Modes of the most recent finite evaluation, at any φ.
    pub fn warm_start(&self) -> Option<PirlsState> {
        lock(&self.anchor).as_ref().map(|a| a.state.clone())
    }

    fn anchor_at(&self, phi: &[f64]) -> Option<PirlsState> {
        lock(&self.anchor)
            .as_ref()
            .filter(|a| a.phi == phi)
            .map(|a| a.state.clone())
    }

    /// Modes at φ itself, solving there if the anchor sits elsewhere.
    fn centre(&self, phi: &[f64]) -> Option<PirlsState> {
        self.anchor_at(phi).or_else(|| {
            self.evaluate(phi);
            self.anchor_at(phi)
        })
    }

    /// Finite-difference Hessian of the deviance over the coordinates in
    /// `free`, all evaluated from the same warm start.
    pub fn hessian(&self, phi: &[f64], free: &[usize]) -> DenseMatrix {
        let m = free.len();
        let centre = self.centre(phi);
        let f0 = self.deviance(phi, centre.as_ref());
        let steps: Vec<f64> = free
            .iter()
            .map(|&k| step_size(phi[k], HESSIAN_STEP))
            .collect();

        let shifted = |moves: &[(usize, f64)]| {
            let mut x = phi.to_vec();
            for &(a, delta) in moves {
                x[free[a]] += delta;
            }
            self.deviance(&x, centre.as_ref())
        };

        let pairs: Vec<(usize, usize)> = (0..m)
            .flat_map(|a| (a..m).map(move |b| (a, b)))
            .collect();
        let entries: Vec<f64> = pairs
            .par_iter()
            .map(|&(a, b)| {
                let (ha, hb) = (steps[a], steps[b]);
                if a == b {
                    (shifted(&[(a, ha)]) - 2.0 * f0 + shifted(&[(a, -ha)])) / (ha * ha)
                } else {
                    (shifted(&[(a, ha), (b, hb)]) - shifted(&[(a, ha), (b, -hb)])
                        - shifted(&[(a, -ha), (b, hb)])
                        + shifted(&[(a, -ha), (b, -hb)]))
                        / (4.0 * ha * hb)
                }
            })
            .collect();

        let mut h = DenseMatrix::zeros(m, m);
        for (&(a, b), &val) in pairs.iter().zip(entries.iter()) {
            h[(a, b)] = val;
            h[(b, a)] = val;
        }
        h
    }
}

impl CostFunction for LaplaceObjective<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, phi: &Self::Param) -> std::result::Result<Self::Output, Error> {
        Ok(self.evaluate(phi))
    }
}

impl Gradient for LaplaceObjective<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    /// Central differences of the deviance, every evaluation warm-started from
    /// the modes at φ. Forward differences are tried when a central point is
    /// infeasible.
    fn gradient(&self, phi: &Self::Param) -> std::result::Result<Self::Gradient, Error> {
        let centre = self.centre(phi);
        let deviance = |x: &Vec<f64>| self.deviance(x, centre.as_ref());
        let finite = |g: &[f64]| g.iter().all(|v| v.is_finite());

        let mut grad = phi.central_diff(&deviance);
        if !finite(&grad) {
            grad = phi.forward_diff(&deviance);
        }
        if !finite(&grad) {
            return Err(GlmmError::NumericalFailure(format!(
                "deviance gradient is not finite at phi = {:?}",
                phi
            ))
            .into());
        }
        Ok(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::build_random_design;
    use crate::types::DenseVector;
    use approx::assert_relative_eq;

    /// Two groups of four: one mostly successes, one mostly failures.
    fn grouped() -> (DenseMatrix, DenseVector, crate::types::SparseMat) {
        let y = DenseVector::from_vec(vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        let x = DenseMatrix::from_element(8, 1, 1.0);
        let z = build_random_design(&[0, 0, 0, 0, 1, 1, 1, 1], 2);
        (x, y, z)
    }

    #[test]
    fn test_zero_variance_is_logistic_likelihood() {
        let (x, y, z) = grouped();
        let objective = LaplaceObjective::from_pirls(Pirls::with_random(
            &x,
            &y,
            &z,
            vec![0, 0],
            1,
            PirlsOptions::default(),
        ));
        // Intercept-only logistic fit of 4/8 successes: logL = 8 log 0.5.
        assert_relative_eq!(
            objective.deviance(&[0.0], None),
            -16.0 * 0.5f64.ln(),
            epsilon = 1e-8
        );
        assert_eq!(objective.evaluations(), 1);
    }

    #[test]
    fn test_sign_symmetry_and_gradient() {
        let (x, y, z) = grouped();
        let objective = LaplaceObjective::from_pirls(Pirls::with_random(
            &x,
            &y,
            &z,
            vec![0, 0],
            1,
            PirlsOptions::default(),
        ));
        let f_pos = objective.cost(&vec![0.7]).unwrap();
        let f_neg = objective.cost(&vec![-0.7]).unwrap();
        assert_relative_eq!(f_pos, f_neg, epsilon = 1e-9);

        let g = objective.gradient(&vec![0.7]).unwrap();
        let h = 1e-3;
        let numeric = (objective.deviance(&[0.7 + h], None) - objective.deviance(&[0.7 - h], None))
            / (2.0 * h);
        assert_relative_eq!(g[0], numeric, epsilon = 1e-4);

        let g_neg = objective.gradient(&vec![-0.7]).unwrap();
        assert_relative_eq!(g_neg[0], -g[0], epsilon = 1e-4);
    }

    #[test]
    fn test_best_point_tracks_lowest_deviance() {
        let (x, y, z) = grouped();
        let objective = LaplaceObjective::from_pirls(Pirls::with_random(
            &x,
            &y,
            &z,
            vec![0, 0],
            1,
            PirlsOptions::default(),
        ));
        assert!(objective.best().is_none());

        let values: Vec<f64> = [3.0, 0.5, 1.5]
            .iter()
            .map(|&p| objective.cost(&vec![p]).unwrap())
            .collect();
        let lowest = values.iter().copied().fold(f64::INFINITY, f64::min);

        let best = objective.best().unwrap();
        assert_eq!(best.deviance, lowest);
        assert_relative_eq!(
            -2.0 * best.solution.laplace_log_lik(),
            lowest,
            epsilon = 1e-12
        );
        assert!(objective.warm_start().is_some());
    }

    #[test]
    fn test_hessian_is_symmetric() {
        let (x, y, _) = grouped();
        let z1 = build_random_design(&[0, 0, 0, 0, 1, 1, 1, 1], 2);
        let z2 = build_random_design(&[0, 1, 0, 1, 0, 1, 0, 1], 2);
        let z = crate::model::build_combined_random_design(&[z1, z2], 8);
        let objective = LaplaceObjective::from_pirls(Pirls::with_random(
            &x,
            &y,
            &z,
            vec![0, 0, 1, 1],
            2,
            PirlsOptions::default(),
        ));
        let h = objective.hessian(&[1.0, 0.5], &[0, 1]);
        assert_eq!(h.shape(), (2, 2));
        assert_eq!(h[(0, 1)], h[(1, 0)]);
        assert!(h.iter().all(|v| v.is_finite()));
    }
}
