use std::collections::HashMap;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use sprs::TriMat;

use crate::data::{Column, DataFrame};
use crate::error::{GlmmError, Result};
use crate::types::{DenseMatrix, DenseVector, SparseMat};

use super::spec::FixedTerm;

/// Label for a single column in the fixed-effects design matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedEffectLabel {
    pub term: String,
    /// Level of a categorical or indicator term; empty for the intercept and
    /// numeric covariates.
    pub level: String,
}

impl FixedEffectLabel {
    /// Display name, `term` or `term[level]`.
    pub fn name(&self) -> String {
        if self.level.is_empty() {
            self.term.clone()
        } else {
            format!("{}[{}]", self.term, self.level)
        }
    }
}

/// A fixed-effect term together with the coding decided at fit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EncodedTerm {
    Intercept,
    Numeric {
        column: String,
    },
    Boolean {
        column: String,
    },
    Categorical {
        column: String,
        /// Dropped level, `None` when every level has its own column.
        reference: Option<String>,
        /// Levels with a design column, in column order.
        levels: Vec<String>,
    },
}

/// Everything needed to rebuild fixed-effect rows for new data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignSchema {
    pub terms: Vec<EncodedTerm>,
    pub labels: Vec<FixedEffectLabel>,
}

impl DesignSchema {
    /// Decide the coding of every term from the fit data.
    ///
    /// Categorical levels are ordered by first appearance. The default
    /// reference is the first level; without an intercept the first
    /// categorical term keeps all of its levels.
    pub fn from_terms(df: &DataFrame, terms: &[FixedTerm]) -> Result<Self> {
        let has_intercept = terms.contains(&FixedTerm::Intercept);
        let mut full_coding_available = !has_intercept;

        let mut encoded = Vec::with_capacity(terms.len());
        let mut labels = Vec::new();

        for term in terms {
            match term {
                FixedTerm::Intercept => {
                    labels.push(FixedEffectLabel {
                        term: "(Intercept)".to_string(),
                        level: String::new(),
                    });
                    encoded.push(EncodedTerm::Intercept);
                }
                FixedTerm::Numeric(column) => {
                    df.numeric_values(column)?;
                    labels.push(FixedEffectLabel {
                        term: column.clone(),
                        level: String::new(),
                    });
                    encoded.push(EncodedTerm::Numeric {
                        column: column.clone(),
                    });
                }
                FixedTerm::Boolean(column) => {
                    indicator_values(df, column)?;
                    labels.push(FixedEffectLabel {
                        term: column.clone(),
                        level: "true".to_string(),
                    });
                    encoded.push(EncodedTerm::Boolean {
                        column: column.clone(),
                    });
                }
                FixedTerm::Categorical { column, reference } => {
                    let observed: IndexSet<String> = df.labels(column)?.into_iter().collect();
                    if observed.len() < 2 {
                        return Err(GlmmError::ModelSpec(format!(
                            "Categorical term '{}' needs at least two levels, found {}",
                            column,
                            observed.len()
                        )));
                    }

                    let reference = match reference {
                        Some(r) if !observed.contains(r) => {
                            return Err(GlmmError::ModelSpec(format!(
                                "Reference level '{}' does not occur in column '{}'",
                                r, column
                            )));
                        }
                        Some(r) => Some(r.clone()),
                        None if full_coding_available => None,
                        None => observed.first().cloned(),
                    };
                    full_coding_available = false;

                    let levels: Vec<String> = observed
                        .into_iter()
                        .filter(|l| Some(l) != reference.as_ref())
                        .collect();
                    for level in &levels {
                        labels.push(FixedEffectLabel {
                            term: column.clone(),
                            level: level.clone(),
                        });
                    }
                    encoded.push(EncodedTerm::Categorical {
                        column: column.clone(),
                        reference,
                        levels,
                    });
                }
            }
        }

        Ok(Self {
            terms: encoded,
            labels,
        })
    }

    pub fn n_columns(&self) -> usize {
        self.labels.len()
    }

    /// Build the dense fixed-effect rows of `df` with this coding.
    ///
    /// # Errors
    /// Missing or mistyped columns, non-finite covariates, and categorical
    /// levels that were not present at fit time.
    pub fn build_rows(&self, df: &DataFrame) -> Result<DenseMatrix> {
        let n = df.nrows();
        let mut x = DenseMatrix::zeros(n, self.n_columns());
        let mut col = 0;

        for term in &self.terms {
            match term {
                EncodedTerm::Intercept => {
                    x.column_mut(col).fill(1.0);
                    col += 1;
                }
                EncodedTerm::Numeric { column } => {
                    let values = df.numeric_values(column)?;
                    for (i, &v) in values.iter().enumerate() {
                        if !v.is_finite() {
                            return Err(GlmmError::Data(format!(
                                "Non-finite value in covariate '{}' at row {}",
                                column,
                                i + 1
                            )));
                        }
                        x[(i, col)] = v;
                    }
                    col += 1;
                }
                EncodedTerm::Boolean { column } => {
                    for (i, v) in indicator_values(df, column)?.into_iter().enumerate() {
                        x[(i, col)] = v;
                    }
                    col += 1;
                }
                EncodedTerm::Categorical {
                    column,
                    reference,
                    levels,
                } => {
                    let position: HashMap<&str, usize> = levels
                        .iter()
                        .enumerate()
                        .map(|(j, l)| (l.as_str(), j))
                        .collect();
                    for (i, label) in df.labels(column)?.iter().enumerate() {
                        if let Some(&j) = position.get(label.as_str()) {
                            x[(i, col + j)] = 1.0;
                        } else if reference.as_deref() != Some(label.as_str()) {
                            return Err(GlmmError::Data(format!(
                                "Level '{}' of fixed-effect term '{}' was not present in the fitted data",
                                label, column
                            )));
                        }
                    }
                    col += levels.len();
                }
            }
        }

        Ok(x)
    }
}

/// Build the dense fixed-effects design matrix (X) and its schema.
pub fn build_fixed_design(
    df: &DataFrame,
    terms: &[FixedTerm],
) -> Result<(DenseMatrix, DesignSchema)> {
    if df.nrows() == 0 {
        return Err(GlmmError::Data("DataFrame has no observations".into()));
    }
    let schema = DesignSchema::from_terms(df, terms)?;
    let x = schema.build_rows(df)?;
    Ok((x, schema))
}

/// Read a binary response as 0.0 / 1.0.
///
/// Boolean columns, integer columns holding only 0 and 1, and float columns
/// holding only 0.0 and 1.0 are accepted.
pub fn build_response(df: &DataFrame, column: &str) -> Result<DenseVector> {
    let not_binary = |row: usize, value: String| {
        GlmmError::Data(format!(
            "Response '{}' must be binary (0/1), found {} at row {}",
            column,
            value,
            row + 1
        ))
    };

    let values: Vec<f64> = match df.get_column(column)? {
        Column::Boolean(v) => v.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect(),
        Column::Integer(v) => v
            .iter()
            .enumerate()
            .map(|(i, &x)| match x {
                0 => Ok(0.0),
                1 => Ok(1.0),
                other => Err(not_binary(i, other.to_string())),
            })
            .collect::<Result<_>>()?,
        Column::Float(v) => v
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                if x == 0.0 || x == 1.0 {
                    Ok(x)
                } else {
                    Err(not_binary(i, x.to_string()))
                }
            })
            .collect::<Result<_>>()?,
        Column::Factor(_) => {
            return Err(GlmmError::Data(format!(
                "Response '{}' is a Factor column, expected 0/1 or boolean",
                column
            )));
        }
    };

    Ok(DenseVector::from_vec(values))
}

/// Build a random-effects incidence matrix (Z) for one grouping factor.
///
/// For observation i in level k, Z[i, k] = 1.
pub fn build_random_design(codes: &[usize], n_levels: usize) -> SparseMat {
    let mut tri = TriMat::new((codes.len(), n_levels));
    for (i, &code) in codes.iter().enumerate() {
        tri.add_triplet(i, code, 1.0);
    }
    tri.to_csc()
}

/// Horizontal concatenation Z = [Z1 | Z2 | ...].
pub fn build_combined_random_design(z_blocks: &[SparseMat], n: usize) -> SparseMat {
    let total_cols: usize = z_blocks.iter().map(|z| z.cols()).sum();
    let mut tri = TriMat::new((n, total_cols));
    let mut col_offset = 0;

    for z in z_blocks {
        for (val, (row, col)) in z.iter() {
            tri.add_triplet(row, col_offset + col, *val);
        }
        col_offset += z.cols();
    }

    tri.to_csc()
}

/// Numerical rank: singular values above `max(n, p) * eps * sigma_max`.
pub fn numerical_rank(x: &DenseMatrix) -> usize {
    let (n, p) = x.shape();
    if n == 0 || p == 0 {
        return 0;
    }
    let sv = x.clone().svd(false, false).singular_values;
    let smax = sv.max();
    let tol = n.max(p) as f64 * f64::EPSILON * smax;
    sv.iter().filter(|&&s| s > tol).count()
}

/// Fail with [`GlmmError::RankDeficient`] unless X has full column rank.
pub fn check_full_rank(x: &DenseMatrix, labels: &[FixedEffectLabel]) -> Result<()> {
    let p = x.ncols();
    let rank = numerical_rank(x);
    if rank == p {
        return Ok(());
    }

    let offending = (1..=p)
        .find(|&j| numerical_rank(&x.columns(0, j).into_owned()) < j)
        .map(|j| j - 1)
        .unwrap_or(p - 1);
    let detail = if x.nrows() < p {
        format!("{} observations for {} coefficients", x.nrows(), p)
    } else {
        format!(
            "column '{}' is a linear combination of the preceding columns",
            labels
                .get(offending)
                .map(|l| l.name())
                .unwrap_or_default()
        )
    };

    Err(GlmmError::RankDeficient {
        rank,
        columns: p,
        detail,
    })
}

fn indicator_values(df: &DataFrame, column: &str) -> Result<Vec<f64>> {
    let values = df.numeric_values(column)?;
    if let Some((i, v)) = values
        .iter()
        .enumerate()
        .find(|(_, &v)| v != 0.0 && v != 1.0)
    {
        return Err(GlmmError::Data(format!(
            "Indicator term '{}' must be 0/1, found {} at row {}",
            column,
            v,
            i + 1
        )));
    }
    Ok(values)
}
