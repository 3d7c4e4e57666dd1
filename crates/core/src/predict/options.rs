use serde::{Deserialize, Serialize};

/// Treatment of group levels that were not present in the fit data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnseenLevelPolicy {
    /// Contribute a random intercept of exactly zero (the prior mean).
    #[default]
    Zero,
    /// Fail the request with [`crate::GlmmError::UnseenLevel`].
    Reject,
}

/// Scale of deterministic predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PredictionScale {
    /// Linear predictor η.
    Link,
    /// Probability 1 / (1 + e^-η).
    #[default]
    Response,
}

/// What each simulated draw returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SimulationScale {
    /// A sampled 0/1 outcome.
    #[default]
    Outcome,
    /// The probability the outcome would be sampled from.
    Probability,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictOptions {
    pub scale: PredictionScale,
    /// Add the conditional modes of the rows' levels; `false` predicts for a
    /// typical group (all random intercepts zero).
    pub use_fitted_random_effects: bool,
    /// Overrides the policy stored on the model.
    pub unseen_level_policy: Option<UnseenLevelPolicy>,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            scale: PredictionScale::Response,
            use_fitted_random_effects: true,
            unseen_level_policy: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulateOptions {
    pub n_draws: usize,
    /// Start from the conditional modes of existing levels; `false` draws
    /// every level from N(0, σ²).
    pub use_fitted_random_effects: bool,
    /// Draw existing levels from N(mode, conditional variance) instead of
    /// using the mode.
    pub conditional_uncertainty: bool,
    pub scale: SimulationScale,
    pub seed: u64,
    pub unseen_level_policy: Option<UnseenLevelPolicy>,
}

impl Default for SimulateOptions {
    fn default() -> Self {
        Self {
            n_draws: 1000,
            use_fitted_random_effects: false,
            conditional_uncertainty: false,
            scale: SimulationScale::Outcome,
            seed: 42,
            unseen_level_policy: None,
        }
    }
}
