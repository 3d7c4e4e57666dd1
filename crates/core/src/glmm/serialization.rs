//! Persisting fitted models as JSON.
//!
//! The file is the serde rendering of [`FittedModel`], tagged with a format
//! name and version that are checked on load.

use std::path::Path;

use crate::error::{GlmmError, Result};

use super::result::{FittedModel, MODEL_FORMAT, MODEL_VERSION};

pub fn to_json_string(model: &FittedModel) -> Result<String> {
    Ok(serde_json::to_string_pretty(model)?)
}

pub fn from_json_str(json: &str) -> Result<FittedModel> {
    let model: FittedModel = serde_json::from_str(json)?;
    validate(&model)?;
    Ok(model)
}

/// Save a fitted model to a JSON file.
pub fn save_model_json(model: &FittedModel, path: &Path) -> Result<()> {
    std::fs::write(path, to_json_string(model)?)?;
    Ok(())
}

/// Load a fitted model from a JSON file written by [`save_model_json`].
pub fn load_model_json(path: &Path) -> Result<FittedModel> {
    let json = std::fs::read_to_string(path)?;
    from_json_str(&json)
}

fn validate(model: &FittedModel) -> Result<()> {
    if model.format != MODEL_FORMAT {
        return Err(GlmmError::Serialization(format!(
            "expected format '{}', got '{}'",
            MODEL_FORMAT, model.format
        )));
    }
    if model.version > MODEL_VERSION {
        return Err(GlmmError::Serialization(format!(
            "model version {} is newer than supported version {}",
            model.version, MODEL_VERSION
        )));
    }
    if model.factors.len() != model.random_effects.len()
        || model.factors.len() != model.variance_components.len()
    {
        return Err(GlmmError::Serialization(
            "grouping factors, variance components and random effects disagree".into(),
        ));
    }
    for (factor, block) in model.factors.iter().zip(&model.random_effects) {
        if factor.n_levels() != block.modes.len() {
            return Err(GlmmError::Serialization(format!(
                "factor '{}' has {} levels but {} modes",
                factor.name(),
                factor.n_levels(),
                block.modes.len()
            )));
        }
        if let Some(ref cv) = block.conditional_variances {
            if cv.len() != block.modes.len() {
                return Err(GlmmError::Serialization(format!(
                    "factor '{}' has {} modes but {} conditional variances",
                    factor.name(),
                    block.modes.len(),
                    cv.len()
                )));
            }
        }
    }
    if model.schema.n_columns() != model.fixed_effects.len() {
        return Err(GlmmError::Serialization(
            "design schema does not match the fixed effects".into(),
        ));
    }
    Ok(())
}
