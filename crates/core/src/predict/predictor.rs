use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::data::DataFrame;
use crate::error::{GlmmError, Result};
use crate::glmm::link::inv_logit;
use crate::glmm::FittedModel;
use crate::grouping::{GroupingIndex, LevelRef};
use crate::types::DenseVector;

use super::options::{PredictOptions, PredictionScale, UnseenLevelPolicy};

/// Rows of a request that referenced levels absent from the fit data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnseenCount {
    pub factor: String,
    pub rows: usize,
    /// Distinct unseen levels.
    pub levels: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub values: Vec<f64>,
    pub scale: PredictionScale,
    /// One entry per grouping factor, in model order.
    pub unseen: Vec<UnseenCount>,
}

impl Prediction {
    pub fn unseen_rows(&self) -> usize {
        self.unseen.iter().map(|u| u.rows).sum()
    }
}

/// A request resolved against a fitted model.
pub(crate) struct Request {
    /// Xβ for every row.
    pub fixed: DenseVector,
    /// Level of every row, indexed `[factor][row]`.
    pub refs: Vec<Vec<LevelRef>>,
    pub unseen: Vec<UnseenCount>,
}

impl Request {
    pub(crate) fn new(model: &FittedModel, df: &DataFrame, policy: UnseenLevelPolicy) -> Result<Self> {
        let x = model.schema.build_rows(df)?;
        let beta = model.coefficients();
        if x.ncols() != beta.len() {
            return Err(GlmmError::DimensionMismatch {
                expected: beta.len(),
                got: x.ncols(),
                context: "fixed-effect columns".into(),
            });
        }
        let fixed = &x * &beta;
        let refs = GroupingIndex::lookup(&model.factors, df)?;

        let mut unseen = Vec::with_capacity(refs.len());
        for (factor, rows) in model.factors.iter().zip(&refs) {
            let missing: Vec<&LevelRef> = rows.iter().filter(|r| r.index.is_none()).collect();
            if policy == UnseenLevelPolicy::Reject {
                if let Some(first) = missing.first() {
                    return Err(GlmmError::UnseenLevel {
                        factor: factor.name().to_string(),
                        level: first.key.clone(),
                    });
                }
            }
            let levels: IndexSet<&str> = missing.iter().map(|r| r.key.as_str()).collect();
            unseen.push(UnseenCount {
                factor: factor.name().to_string(),
                rows: missing.len(),
                levels: levels.len(),
            });
        }

        Ok(Self { fixed, refs, unseen })
    }

    pub(crate) fn n_rows(&self) -> usize {
        self.fixed.len()
    }
}

/// Predict for the rows of `df`.
///
/// η = xβ + Σ_k b_k(level), with the conditional mode for levels seen in
/// the fit and zero otherwise.
///
/// # Errors
/// [`GlmmError::UnseenLevel`] under [`UnseenLevelPolicy::Reject`]; data
/// errors when a column is missing or a categorical value was not seen at fit
/// time.
pub fn predict(model: &FittedModel, df: &DataFrame, options: &PredictOptions) -> Result<Prediction> {
    let policy = options
        .unseen_level_policy
        .unwrap_or(model.unseen_level_policy);
    let request = Request::new(model, df, policy)?;

    let mut eta = request.fixed.clone();
    if options.use_fitted_random_effects {
        for (block, rows) in model.random_effects.iter().zip(&request.refs) {
            for (i, level) in rows.iter().enumerate() {
                if let Some(j) = level.index {
                    eta[i] += block.modes[j];
                }
            }
        }
    }

    let values = match options.scale {
        PredictionScale::Link => eta.iter().copied().collect(),
        PredictionScale::Response => eta.iter().map(|&e| inv_logit(e)).collect(),
    };

    Ok(Prediction {
        values,
        scale: options.scale,
        unseen: request.unseen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glmm::tests_support::minimal_model;
    use approx::assert_relative_eq;

    fn request(labels: &[&str]) -> DataFrame {
        let mut df = DataFrame::new();
        df.add_factor_column("g", labels).unwrap();
        df
    }

    #[test]
    fn test_predict_uses_modes() {
        let model = minimal_model();
        let options = PredictOptions {
            scale: PredictionScale::Link,
            ..PredictOptions::default()
        };
        let p = predict(&model, &request(&["a", "b", "a"]), &options).unwrap();
        assert_relative_eq!(p.values[0], 0.3 + 0.4, epsilon = 1e-12);
        assert_relative_eq!(p.values[1], 0.3 - 0.4, epsilon = 1e-12);
        assert_eq!(p.values[0], p.values[2]);
        assert_eq!(p.unseen_rows(), 0);
    }

    #[test]
    fn test_population_prediction() {
        let model = minimal_model();
        let options = PredictOptions {
            use_fitted_random_effects: false,
            ..PredictOptions::default()
        };
        let p = predict(&model, &request(&["a", "b"]), &options).unwrap();
        assert_relative_eq!(p.values[0], inv_logit(0.3), epsilon = 1e-12);
        assert_eq!(p.values[0], p.values[1]);
    }

    #[test]
    fn test_unseen_level_policies() {
        let model = minimal_model();
        let df = request(&["a", "zzz", "zzz", "yyy"]);

        let p = predict(&model, &df, &PredictOptions::default()).unwrap();
        assert_relative_eq!(p.values[1], inv_logit(0.3), epsilon = 1e-15);
        assert_eq!(p.unseen[0].rows, 3);
        assert_eq!(p.unseen[0].levels, 2);

        let reject = PredictOptions {
            unseen_level_policy: Some(UnseenLevelPolicy::Reject),
            ..PredictOptions::default()
        };
        match predict(&model, &df, &reject) {
            Err(GlmmError::UnseenLevel { factor, level }) => {
                assert_eq!(factor, "g");
                assert_eq!(level, "zzz");
            }
            other => panic!("expected UnseenLevel, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_group_column() {
        let model = minimal_model();
        let mut df = DataFrame::new();
        df.add_float_column("x", vec![1.0]).unwrap();
        assert!(predict(&model, &df, &PredictOptions::default()).is_err());
    }
}
