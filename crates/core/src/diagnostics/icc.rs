//! Variance partition on the latent logistic scale.
//!
//! A Bernoulli outcome with logit link has a latent residual of variance
//! π²/3, so the share of factor k is σ²_k / (Σ σ² + π²/3).

use serde::{Deserialize, Serialize};
use statrs::function::erf::erf_inv;

use crate::glmm::VarianceComponent;

/// Variance of the standard logistic distribution.
pub const LOGISTIC_RESIDUAL_VARIANCE: f64 = std::f64::consts::PI * std::f64::consts::PI / 3.0;

/// Median odds ratio for a random-intercept variance.
///
/// MOR = exp(√(2σ²) · Φ⁻¹(0.75)): the median odds ratio between two
/// randomly chosen levels of the factor.
pub fn median_odds_ratio(variance: f64) -> f64 {
    let q75 = std::f64::consts::SQRT_2 * erf_inv(0.5);
    ((2.0 * variance.max(0.0)).sqrt() * q75).exp()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IccEntry {
    pub factor: String,
    pub parent: Option<String>,
    pub variance: f64,
    pub std_dev: f64,
    /// Share of the total latent variance due to this factor.
    pub icc: f64,
    /// Latent correlation of two observations sharing this level: the share
    /// of this factor plus all of its ancestors.
    pub cumulative_icc: f64,
    pub median_odds_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IccReport {
    pub entries: Vec<IccEntry>,
    pub residual_variance: f64,
    pub residual_share: f64,
    pub total_variance: f64,
}

/// Partition the latent variance among the grouping factors.
pub fn icc_report(components: &[VarianceComponent]) -> IccReport {
    let total_variance =
        components.iter().map(|c| c.variance).sum::<f64>() + LOGISTIC_RESIDUAL_VARIANCE;

    let entries = components
        .iter()
        .map(|c| {
            let mut cumulative = c.variance;
            let mut parent = c.parent.as_deref();
            // Bounded walk: the resolver guarantees an acyclic hierarchy.
            let mut depth = 0;
            while let Some(name) = parent {
                if depth > components.len() {
                    break;
                }
                match components.iter().find(|p| p.factor == name) {
                    Some(p) => {
                        cumulative += p.variance;
                        parent = p.parent.as_deref();
                    }
                    None => break,
                }
                depth += 1;
            }
            IccEntry {
                factor: c.factor.clone(),
                parent: c.parent.clone(),
                variance: c.variance,
                std_dev: c.std_dev,
                icc: c.variance / total_variance,
                cumulative_icc: cumulative / total_variance,
                median_odds_ratio: median_odds_ratio(c.variance),
            }
        })
        .collect();

    IccReport {
        entries,
        residual_variance: LOGISTIC_RESIDUAL_VARIANCE,
        residual_share: LOGISTIC_RESIDUAL_VARIANCE / total_variance,
        total_variance,
    }
}

impl IccReport {
    /// Sum of all shares, including the residual; 1 up to rounding.
    pub fn total_share(&self) -> f64 {
        self.entries.iter().map(|e| e.icc).sum::<f64>() + self.residual_share
    }

    pub fn entry(&self, factor: &str) -> Option<&IccEntry> {
        self.entries.iter().find(|e| e.factor == factor)
    }

    pub fn format(&self) -> String {
        let mut s = String::new();
        s.push_str("--- Intraclass Correlation (latent scale) ---\n");
        s.push_str(&format!(
            "{:<20} {:>12} {:>10} {:>12} {:>10}\n",
            "Factor", "Variance", "ICC", "Cumulative", "MOR"
        ));
        for e in &self.entries {
            s.push_str(&format!(
                "{:<20} {:>12.6} {:>10.4} {:>12.4} {:>10.4}\n",
                e.factor, e.variance, e.icc, e.cumulative_icc, e.median_odds_ratio
            ));
        }
        s.push_str(&format!(
            "{:<20} {:>12.6} {:>10.4}\n",
            "Residual (pi^2/3)", self.residual_variance, self.residual_share
        ));
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn component(factor: &str, parent: Option<&str>, variance: f64) -> VarianceComponent {
        VarianceComponent {
            factor: factor.to_string(),
            parent: parent.map(str::to_string),
            variance,
            std_dev: variance.sqrt(),
            std_dev_se: None,
        }
    }

    #[test]
    fn test_shares_sum_to_one() {
        let report = icc_report(&[component("hospital", None, 0.8), component("region", None, 0.3)]);
        assert_relative_eq!(report.total_share(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(
            report.entries[0].icc,
            0.8 / (1.1 + LOGISTIC_RESIDUAL_VARIANCE),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_single_factor_icc() {
        let report = icc_report(&[component("g", None, LOGISTIC_RESIDUAL_VARIANCE)]);
        assert_relative_eq!(report.entries[0].icc, 0.5, epsilon = 1e-12);
        assert_relative_eq!(report.entries[0].cumulative_icc, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_nested_cumulative_icc() {
        let report = icc_report(&[
            component("hospital", None, 1.0),
            component("ward", Some("hospital"), 0.5),
        ]);
        let ward = report.entry("ward").map(|e| e.cumulative_icc);
        let total = 1.5 + LOGISTIC_RESIDUAL_VARIANCE;
        assert_relative_eq!(ward.unwrap_or(f64::NAN), 1.5 / total, epsilon = 1e-12);
        assert_relative_eq!(report.entries[0].cumulative_icc, 1.0 / total, epsilon = 1e-12);
    }

    #[test]
    fn test_median_odds_ratio() {
        assert_relative_eq!(median_odds_ratio(0.0), 1.0, epsilon = 1e-12);
        // Phi^-1(0.75) = 0.6744897501960817
        let expected = (2.0f64.sqrt() * 0.6744897501960817).exp();
        assert_relative_eq!(median_odds_ratio(1.0), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_format_lists_residual() {
        let text = icc_report(&[component("g", None, 0.5)]).format();
        assert!(text.contains("Intraclass"));
        assert!(text.contains("Residual"));
    }
}
