use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use statrs::function::erf::erfc;

use crate::glmm::FittedModel;
use crate::types::{DenseMatrix, DenseVector};

/// Wald z statistic and two-sided normal p-value for one coefficient;
/// `None` for a zero or non-finite standard error.
pub fn z_test(estimate: f64, se: f64) -> Option<(f64, f64)> {
    if !(se.is_finite() && se > 0.0) {
        return None;
    }
    let z = estimate / se;
    Some((z, erfc(z.abs() / std::f64::consts::SQRT_2)))
}

/// Result of a joint Wald chi-square test for a single fixed-effect term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaldTest {
    pub term: String,
    /// W = β̂' V⁻¹ β̂ over the columns of the term.
    pub chi_square: Option<f64>,
    /// Number of columns the term contributes.
    pub df: usize,
    pub p_value: Option<f64>,
}

/// Joint Wald chi-square test for each fixed-effect term.
///
/// ```text
/// W = β̂_T' (Cov(β̂)_TT)⁻¹ β̂_T  ~  χ²(|T|)
/// ```
///
/// Columns are grouped by term so that a categorical predictor is tested as
/// a whole. Uses the full covariance sub-block; if the covariance is missing
/// or that block is not positive definite the term has no statistic.
pub fn wald_tests(model: &FittedModel) -> Vec<WaldTest> {
    let mut term_order: Vec<String> = Vec::new();
    let mut term_indices: std::collections::HashMap<String, Vec<usize>> =
        std::collections::HashMap::new();

    for (i, ef) in model.fixed_effects.iter().enumerate() {
        if !term_indices.contains_key(&ef.term) {
            term_order.push(ef.term.clone());
        }
        term_indices.entry(ef.term.clone()).or_default().push(i);
    }

    term_order
        .into_iter()
        .map(|term| {
            let indices = &term_indices[&term];
            let chi_square = term_statistic(model, indices);
            WaldTest {
                p_value: chi_square.and_then(|x| chi_square_sf(x, indices.len())),
                df: indices.len(),
                chi_square,
                term,
            }
        })
        .collect()
}

fn term_statistic(model: &FittedModel, indices: &[usize]) -> Option<f64> {
    let full = model.fixed_covariance.as_ref()?;
    let m = indices.len();
    let beta = DenseVector::from_iterator(m, indices.iter().map(|&i| model.fixed_effects[i].estimate));
    let cov = DenseMatrix::from_fn(m, m, |a, b| {
        full.get(indices[a])
            .and_then(|row| row.get(indices[b]))
            .copied()
            .unwrap_or(f64::NAN)
    });
    if cov.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let chol = cov.cholesky()?;
    Some(beta.dot(&chol.solve(&beta)))
}

fn chi_square_sf(x: f64, df: usize) -> Option<f64> {
    if !x.is_finite() {
        return None;
    }
    ChiSquared::new(df as f64).ok().map(|dist| dist.sf(x.max(0.0)))
}

fn significance(p_value: f64) -> &'static str {
    if p_value < 0.001 {
        "***"
    } else if p_value < 0.01 {
        "**"
    } else if p_value < 0.05 {
        "*"
    } else if p_value < 0.1 {
        "."
    } else {
        ""
    }
}

/// Format Wald test results as a table string.
pub fn format_wald_tests(tests: &[WaldTest]) -> String {
    let mut s = String::new();
    s.push_str("--- Wald Chi-square Tests for Fixed Effects ---\n");
    s.push_str(&format!(
        "{:<20} {:>12} {:>6} {:>12}\n",
        "Term", "Chisq", "Df", "Pr(>Chisq)"
    ));
    s.push_str(&format!("{}\n", "-".repeat(54)));

    for test in tests {
        let chi_square = test
            .chi_square
            .map_or_else(|| "-".to_string(), |x| format!("{:.4}", x));
        let p_value = test
            .p_value
            .map_or_else(|| "-".to_string(), |p| format!("{:.4e}", p));
        s.push_str(&format!(
            "{:<20} {:>12} {:>6} {:>12} {}\n",
            test.term,
            chi_square,
            test.df,
            p_value,
            test.p_value.map_or("", significance)
        ));
    }

    s.push_str("---\nSignif. codes:  0 '***' 0.001 '**' 0.01 '*' 0.05 '.' 0.1 ' ' 1\n");
    s
}
