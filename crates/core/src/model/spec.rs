use serde::{Deserialize, Serialize};

use crate::data::{Column, DataFrame};
use crate::error::{GlmmError, Result};
use crate::grouping::GroupingSpec;

/// A single fixed-effect term in the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixedTerm {
    /// An intercept (column of ones).
    Intercept,
    /// A numeric covariate (float or integer column).
    Numeric(String),
    /// A 0/1 indicator (boolean column, or numeric column holding 0 and 1).
    Boolean(String),
    /// A categorical column expanded to indicator variables.
    ///
    /// `reference` is the dropped level; `None` drops the first level in
    /// order of appearance.
    Categorical {
        column: String,
        reference: Option<String>,
    },
}

impl FixedTerm {
    pub fn numeric(column: &str) -> Self {
        FixedTerm::Numeric(column.to_string())
    }

    pub fn boolean(column: &str) -> Self {
        FixedTerm::Boolean(column.to_string())
    }

    pub fn categorical(column: &str) -> Self {
        FixedTerm::Categorical {
            column: column.to_string(),
            reference: None,
        }
    }

    pub fn categorical_with_reference(column: &str, reference: &str) -> Self {
        FixedTerm::Categorical {
            column: column.to_string(),
            reference: Some(reference.to_string()),
        }
    }

    /// Column read by this term (`None` for the intercept).
    pub fn column(&self) -> Option<&str> {
        match self {
            FixedTerm::Intercept => None,
            FixedTerm::Numeric(c) | FixedTerm::Boolean(c) => Some(c),
            FixedTerm::Categorical { column, .. } => Some(column),
        }
    }
}

/// Structure of a binary random-intercept model.
///
/// The family is always Bernoulli with logit link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub response: String,
    pub fixed: Vec<FixedTerm>,
    pub groups: Vec<GroupingSpec>,
}

impl ModelSpec {
    pub fn has_intercept(&self) -> bool {
        self.fixed.contains(&FixedTerm::Intercept)
    }

    /// Static checks that do not need the data.
    pub fn validate(&self) -> Result<()> {
        if self.response.trim().is_empty() {
            return Err(GlmmError::ModelSpec("No response variable specified".into()));
        }
        if self.groups.is_empty() {
            return Err(GlmmError::ModelSpec(
                "At least one grouping factor is required".into(),
            ));
        }
        if self.fixed.is_empty() {
            return Err(GlmmError::ModelSpec(
                "The fixed-effect part has no terms".into(),
            ));
        }
        let intercepts = self
            .fixed
            .iter()
            .filter(|t| **t == FixedTerm::Intercept)
            .count();
        if intercepts > 1 {
            return Err(GlmmError::ModelSpec("Intercept listed more than once".into()));
        }
        for term in &self.fixed {
            if term.column() == Some(self.response.as_str()) {
                return Err(GlmmError::ModelSpec(format!(
                    "Response '{}' cannot also be a fixed-effect term",
                    self.response
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for term in &self.fixed {
            if let Some(col) = term.column() {
                if !seen.insert(col) {
                    return Err(GlmmError::ModelSpec(format!(
                        "Fixed-effect column '{}' listed more than once",
                        col
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Parse a term list like `"1 + age + female + ward_type"` into fixed terms.
///
/// `1`, `intercept` and `mu` add the intercept; `0` or `-1` removes it. Other
/// names are typed by their column: float and integer columns become numeric
/// covariates, boolean columns indicators and factor columns categorical
/// terms. An intercept is added unless the list removes it.
pub fn parse_fixed_formula(formula: &str, df: &DataFrame) -> Result<Vec<FixedTerm>> {
    let mut terms = Vec::new();
    let mut intercept = true;

    for part in formula.split('+') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        match part.to_lowercase().as_str() {
            "mu" | "intercept" | "1" => intercept = true,
            "0" | "-1" => intercept = false,
            _ => {
                let term = match df.get_column(part)? {
                    Column::Float(_) | Column::Integer(_) => FixedTerm::numeric(part),
                    Column::Boolean(_) => FixedTerm::boolean(part),
                    Column::Factor(_) => FixedTerm::categorical(part),
                };
                terms.push(term);
            }
        }
    }

    if intercept {
        terms.insert(0, FixedTerm::Intercept);
    }
    Ok(terms)
}
