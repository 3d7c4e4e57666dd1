use indexmap::IndexMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Bernoulli, Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::DataFrame;
use crate::error::{GlmmError, Result};
use crate::glmm::link::inv_logit;
use crate::glmm::{CancellationToken, FittedModel};
use crate::types::DenseMatrix;

use super::options::{SimulateOptions, SimulationScale};
use super::predictor::{Request, UnseenCount};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Simulation {
    /// `n_draws × n_rows`.
    pub draws: DenseMatrix,
    /// Mean over draws of every row.
    pub means: Vec<f64>,
    pub scale: SimulationScale,
    pub seed: u64,
    pub unseen: Vec<UnseenCount>,
}

/// Levels referenced by a request for one factor.
struct FactorSlots {
    /// Slot of every row.
    row_slot: Vec<usize>,
    /// Fitted level index of every slot (`None` for unseen levels).
    levels: Vec<Option<usize>>,
    std_dev: f64,
}

/// Draw outcomes (or probabilities) for the rows of `df`.
///
/// Each draw samples one intercept per referenced level of every factor and
/// shares it among the rows of that level. Draw `d` uses its own ChaCha8
/// stream of `seed`, so results do not depend on how draws are scheduled.
///
/// # Errors
/// [`GlmmError::Cancelled`] if `token` is cancelled between draws;
/// [`GlmmError::UnseenLevel`] under the reject policy;
/// [`GlmmError::ModelSpec`] if conditional uncertainty is requested from a
/// model fitted without conditional variances.
pub fn simulate(
    model: &FittedModel,
    df: &DataFrame,
    options: &SimulateOptions,
    token: &CancellationToken,
) -> Result<Simulation> {
    if options.n_draws == 0 {
        return Err(GlmmError::ModelSpec("n_draws must be at least 1".into()));
    }
    if options.use_fitted_random_effects && options.conditional_uncertainty {
        if let Some(block) = model
            .random_effects
            .iter()
            .find(|b| b.conditional_variances.is_none())
        {
            return Err(GlmmError::ModelSpec(format!(
                "conditional variances of '{}' are unavailable",
                block.factor
            )));
        }
    }
    let policy = options
        .unseen_level_policy
        .unwrap_or(model.unseen_level_policy);
    let request = Request::new(model, df, policy)?;
    token.check()?;

    let slots: Vec<FactorSlots> = request
        .refs
        .iter()
        .zip(&model.variance_components)
        .map(|(rows, vc)| {
            let mut keys: IndexMap<&str, Option<usize>> = IndexMap::new();
            let row_slot = rows
                .iter()
                .map(|r| keys.insert_full(r.key.as_str(), r.index).0)
                .collect();
            FactorSlots {
                row_slot,
                levels: keys.into_values().collect(),
                std_dev: vc.std_dev,
            }
        })
        .collect();

    log::debug!(
        "Simulating {} draws for {} rows (seed {})",
        options.n_draws,
        request.n_rows(),
        options.seed
    );

    let rows: Vec<Vec<f64>> = (0..options.n_draws)
        .into_par_iter()
        .map(|d| {
            token.check()?;
            one_draw(model, &request, &slots, options, d)
        })
        .collect::<Result<Vec<_>>>()?;

    let n = request.n_rows();
    let draws = DenseMatrix::from_fn(options.n_draws, n, |d, i| rows[d][i]);
    let means = (0..n)
        .map(|i| draws.column(i).mean())
        .collect();

    Ok(Simulation {
        draws,
        means,
        scale: options.scale,
        seed: options.seed,
        unseen: request.unseen,
    })
}

fn one_draw(
    model: &FittedModel,
    request: &Request,
    slots: &[FactorSlots],
    options: &SimulateOptions,
    d: usize,
) -> Result<Vec<f64>> {
    let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
    rng.set_stream(d as u64);

    let mut eta = request.fixed.clone();
    for (factor, block) in slots.iter().zip(&model.random_effects) {
        // One normal per slot, used or not, keeps the stream layout fixed.
        let effects: Vec<f64> = factor
            .levels
            .iter()
            .map(|level| {
                let z: f64 = rng.sample(StandardNormal);
                match (options.use_fitted_random_effects, level) {
                    (true, Some(j)) if options.conditional_uncertainty => {
                        let var = block
                            .conditional_variances
                            .as_ref()
                            .map_or(0.0, |cv| cv[*j].max(0.0));
                        block.modes[*j] + var.sqrt() * z
                    }
                    (true, Some(j)) => block.modes[*j],
                    _ => factor.std_dev * z,
                }
            })
            .collect();
        for (i, &slot) in factor.row_slot.iter().enumerate() {
            eta[i] += effects[slot];
        }
    }

    eta.iter()
        .map(|&e| {
            let p = inv_logit(e);
            match options.scale {
                SimulationScale::Probability => Ok(p),
                SimulationScale::Outcome => {
                    let bernoulli = Bernoulli::new(p)
                        .map_err(|err| GlmmError::NumericalFailure(err.to_string()))?;
                    Ok(if bernoulli.sample(&mut rng) { 1.0 } else { 0.0 })
                }
            }
        })
        .collect()
}
