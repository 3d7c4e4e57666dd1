use serde::{Deserialize, Serialize};

/// Model fit information criteria.
///
/// The log-likelihood is the Laplace-approximated marginal likelihood, so
/// the criteria are maximum-likelihood criteria: fixed effects and variance
/// components both count as parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFit {
    pub log_likelihood: f64,
    pub n_obs: usize,
    pub n_fixed: usize,
    pub n_variance_params: usize,
}

impl ModelFit {
    /// Number of estimated parameters.
    pub fn n_params(&self) -> usize {
        self.n_fixed + self.n_variance_params
    }

    /// AIC = -2 * logL + 2 * k.
    pub fn aic(&self) -> f64 {
        -2.0 * self.log_likelihood + 2.0 * self.n_params() as f64
    }

    /// BIC = -2 * logL + k * ln(n).
    pub fn bic(&self) -> f64 {
        -2.0 * self.log_likelihood + self.n_params() as f64 * (self.n_obs as f64).ln()
    }

    /// Corrected AIC (AICc) for small sample sizes. Infinite when n <= k + 1.
    pub fn aicc(&self) -> f64 {
        let k = self.n_params() as f64;
        let n = self.n_obs as f64;
        if n - k - 1.0 <= 0.0 {
            return f64::INFINITY;
        }
        self.aic() + 2.0 * k * (k + 1.0) / (n - k - 1.0)
    }
}
