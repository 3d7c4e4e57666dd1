//! Laplace-approximation fitting of binary random-intercept models.
//!
//! PIRLS finds the conditional modes at fixed variance components, the
//! Laplace evaluator turns them into a marginal deviance, and the outer
//! optimizer minimizes that deviance over the component standard deviations.

mod fit;
mod laplace;
pub mod link;
mod optimizer;
mod pirls;
mod result;
mod serialization;

pub use fit::{fit, FitConfig, SINGULAR_THRESHOLD};
pub use laplace::{theta_from_phi, BestPoint, LaplaceObjective};
pub use optimizer::{
    minimize, CancellationToken, OptimizerMethod, OptimizerOutcome, OptimizerSettings, Params,
    Termination,
};
pub use pirls::{fit_logistic, Pirls, PirlsOptions, PirlsSolution, PirlsState};
pub use result::{
    FitStatus, FitWarning, FittedModel, FixedEffect, RandomEffectBlock, VarianceComponent,
    MODEL_FORMAT, MODEL_VERSION,
};
pub use serialization::{from_json_str, load_model_json, save_model_json, to_json_string};

#[cfg(test)]
pub(crate) mod tests_support {
    use indexmap::IndexMap;

    use super::*;
    use crate::grouping::GroupingSpec;
    use crate::model::{DesignSchema, EncodedTerm, FixedEffectLabel, FixedTerm, ModelSpec};
    use crate::predict::UnseenLevelPolicy;

    /// Intercept-only model with one two-level factor `g`.
    pub(crate) fn minimal_model() -> FittedModel {
        let mut levels = IndexMap::new();
        levels.insert("a".to_string(), 0);
        levels.insert("b".to_string(), 1);
        FittedModel {
            format: MODEL_FORMAT.to_string(),
            version: MODEL_VERSION,
            spec: ModelSpec {
                response: "y".into(),
                fixed: vec![FixedTerm::Intercept],
                groups: vec![GroupingSpec::new("g")],
            },
            schema: DesignSchema {
                terms: vec![EncodedTerm::Intercept],
                labels: vec![FixedEffectLabel {
                    term: "(Intercept)".into(),
                    level: String::new(),
                }],
            },
            fixed_effects: vec![FixedEffect {
                term: "(Intercept)".into(),
                level: String::new(),
                estimate: 0.1 + 0.2,
                se: Some(0.5),
                z: Some(0.6),
                p_value: Some(0.548506),
            }],
            fixed_covariance: Some(vec![vec![0.25]]),
            variance_components: vec![VarianceComponent {
                factor: "g".into(),
                parent: None,
                variance: 0.64,
                std_dev: 0.8,
                std_dev_se: Some(0.3),
            }],
            factors: vec![crate::grouping::GroupingFactor {
                spec: GroupingSpec::new("g"),
                parent: None,
                levels,
                raw_labels: vec!["a".into(), "b".into()],
                parent_levels: vec![None, None],
            }],
            random_effects: vec![RandomEffectBlock {
                factor: "g".into(),
                modes: vec![0.4, -0.4],
                conditional_variances: Some(vec![0.2, 0.2]),
                counts: vec![5, 5],
            }],
            log_likelihood: -6.5,
            deviance: 13.0,
            status: FitStatus::Converged,
            warnings: Vec::new(),
            method: OptimizerMethod::Bfgs,
            outer_iterations: 4,
            inner_iterations: 3,
            function_evaluations: 20,
            n_obs: 10,
            unseen_level_policy: UnseenLevelPolicy::Zero,
            history: Vec::new(),
        }
    }
}
