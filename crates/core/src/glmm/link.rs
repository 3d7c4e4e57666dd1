//! Logit link and Bernoulli log-likelihood.
//!
//! Maps between the linear predictor (eta) and the success probability (mu).

use crate::types::DenseVector;

/// Lower bound on IRLS working weights `mu (1 - mu)`.
pub const WEIGHT_FLOOR: f64 = 1e-10;

/// Logit: eta = log(mu / (1 - mu)).
pub fn logit(mu: f64) -> f64 {
    (mu / (1.0 - mu)).ln()
}

/// Inverse logit, evaluated without overflow for large |eta|.
pub fn inv_logit(eta: f64) -> f64 {
    if eta >= 0.0 {
        1.0 / (1.0 + (-eta).exp())
    } else {
        let e = eta.exp();
        e / (1.0 + e)
    }
}

/// log(1 + e^eta).
pub fn log1p_exp(eta: f64) -> f64 {
    if eta > 0.0 {
        eta + (-eta).exp().ln_1p()
    } else {
        eta.exp().ln_1p()
    }
}

/// IRLS working weight for the logit link, floored at [`WEIGHT_FLOOR`].
pub fn working_weight(mu: f64) -> f64 {
    (mu * (1.0 - mu)).max(WEIGHT_FLOOR)
}

/// Bernoulli log-likelihood `sum(y * eta - log(1 + e^eta))`.
pub fn bernoulli_log_lik(y: &DenseVector, eta: &DenseVector) -> f64 {
    y.iter()
        .zip(eta.iter())
        .map(|(&yi, &ei)| yi * ei - log1p_exp(ei))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_logit_round_trip() {
        assert_relative_eq!(inv_logit(0.0), 0.5);
        assert_relative_eq!(logit(0.5), 0.0);
        assert_relative_eq!(inv_logit(logit(0.3)), 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_extreme_eta_is_finite() {
        assert_eq!(inv_logit(800.0), 1.0);
        assert!(inv_logit(-800.0) >= 0.0);
        assert_relative_eq!(log1p_exp(800.0), 800.0);
        assert!(log1p_exp(-800.0) >= 0.0);
        assert_eq!(working_weight(1.0), WEIGHT_FLOOR);
    }

    #[test]
    fn test_bernoulli_log_lik() {
        let y = DenseVector::from_vec(vec![1.0, 0.0]);
        let eta = DenseVector::from_vec(vec![0.0, 0.0]);
        assert_relative_eq!(bernoulli_log_lik(&y, &eta), 2.0 * 0.5f64.ln(), epsilon = 1e-12);

        let eta = DenseVector::from_vec(vec![2.0, -1.0]);
        let expected = inv_logit(2.0).ln() + (1.0 - inv_logit(-1.0)).ln();
        assert_relative_eq!(bernoulli_log_lik(&y, &eta), expected, epsilon = 1e-12);
    }
}
