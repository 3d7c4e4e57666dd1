use indexmap::IndexMap;

use super::factor::FactorColumn;
use crate::error::{GlmmError, Result};

/// A single column in a [`DataFrame`].
#[derive(Debug, Clone)]
pub enum Column {
    /// A column of 64-bit floating-point values.
    Float(Vec<f64>),
    /// A column of 64-bit signed integers.
    Integer(Vec<i64>),
    /// A column of booleans (binary responses or indicator covariates).
    Boolean(Vec<bool>),
    /// A categorical column with string levels mapped to integer codes.
    Factor(FactorColumn),
}

impl Column {
    /// Returns the number of elements in the column.
    pub fn len(&self) -> usize {
        match self {
            Column::Float(v) => v.len(),
            Column::Integer(v) => v.len(),
            Column::Boolean(v) => v.len(),
            Column::Factor(f) => f.len(),
        }
    }

    /// Returns `true` if the column is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Column::Float(_) => "Float",
            Column::Integer(_) => "Integer",
            Column::Boolean(_) => "Boolean",
            Column::Factor(_) => "Factor",
        }
    }
}

/// A lightweight columnar table of observations.
///
/// Columns are stored in insertion order using an [`IndexMap`]. All columns
/// must have the same number of rows.
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub(crate) columns: IndexMap<String, Column>,
    pub(crate) nrows: usize,
}

impl DataFrame {
    /// Create an empty DataFrame with no columns and no rows.
    pub fn new() -> Self {
        DataFrame {
            columns: IndexMap::new(),
            nrows: 0,
        }
    }

    /// Add a floating-point column.
    ///
    /// # Errors
    /// Returns an error if the column length does not match existing rows,
    /// or if a column with the same name already exists.
    pub fn add_float_column(&mut self, name: &str, data: Vec<f64>) -> Result<()> {
        self.insert_column(name, Column::Float(data))
    }

    /// Add an integer column.
    pub fn add_integer_column(&mut self, name: &str, data: Vec<i64>) -> Result<()> {
        self.insert_column(name, Column::Integer(data))
    }

    /// Add a boolean column.
    pub fn add_boolean_column(&mut self, name: &str, data: Vec<bool>) -> Result<()> {
        self.insert_column(name, Column::Boolean(data))
    }

    /// Add a factor (categorical) column from a slice of string values.
    ///
    /// Levels are auto-discovered in order of first appearance.
    pub fn add_factor_column(&mut self, name: &str, data: &[&str]) -> Result<()> {
        self.insert_column(name, Column::Factor(FactorColumn::new(data)))
    }

    /// Retrieve a column by name.
    ///
    /// # Errors
    /// Returns [`GlmmError::ColumnNotFound`] if no column with the given name exists.
    pub fn get_column(&self, name: &str) -> Result<&Column> {
        self.columns
            .get(name)
            .ok_or_else(|| GlmmError::ColumnNotFound(name.to_string()))
    }

    /// Retrieve a float column's data as a slice.
    pub fn get_float(&self, name: &str) -> Result<&[f64]> {
        match self.get_column(name)? {
            Column::Float(v) => Ok(v.as_slice()),
            other => Err(wrong_type(name, other, "Float")),
        }
    }

    /// Retrieve a factor column reference.
    pub fn get_factor(&self, name: &str) -> Result<&FactorColumn> {
        match self.get_column(name)? {
            Column::Factor(f) => Ok(f),
            other => Err(wrong_type(name, other, "Factor")),
        }
    }

    /// Numeric view of a column: floats as-is, integers widened, booleans as 0/1.
    ///
    /// # Errors
    /// Factor columns cannot be read numerically.
    pub fn numeric_values(&self, name: &str) -> Result<Vec<f64>> {
        match self.get_column(name)? {
            Column::Float(v) => Ok(v.clone()),
            Column::Integer(v) => Ok(v.iter().map(|&x| x as f64).collect()),
            Column::Boolean(v) => Ok(v.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect()),
            other => Err(wrong_type(name, other, "numeric")),
        }
    }

    /// Per-row string labels of a categorical-like column.
    ///
    /// Factor levels are returned verbatim, integers and booleans are rendered
    /// with `to_string`. Float columns are refused: continuous values are not
    /// group labels.
    pub fn labels(&self, name: &str) -> Result<Vec<String>> {
        match self.get_column(name)? {
            Column::Factor(f) => Ok((0..f.len()).map(|i| f.label(i).to_string()).collect()),
            Column::Integer(v) => Ok(v.iter().map(|x| x.to_string()).collect()),
            Column::Boolean(v) => Ok(v.iter().map(|x| x.to_string()).collect()),
            other => Err(wrong_type(name, other, "Factor, Integer or Boolean")),
        }
    }

    /// Returns the number of rows.
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    /// Returns the number of columns.
    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    /// Returns a vector of column names in insertion order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.keys().map(|s| s.as_str()).collect()
    }

    /// Validate column length and name uniqueness, then insert.
    pub(crate) fn insert_column(&mut self, name: &str, column: Column) -> Result<()> {
        if self.columns.contains_key(name) {
            return Err(GlmmError::Data(format!(
                "Column '{}' already exists in DataFrame",
                name
            )));
        }

        let col_len = column.len();

        if self.columns.is_empty() {
            self.nrows = col_len;
        } else if col_len != self.nrows {
            return Err(GlmmError::DimensionMismatch {
                expected: self.nrows,
                got: col_len,
                context: format!("adding column '{}'", name),
            });
        }

        self.columns.insert(name.to_string(), column);
        Ok(())
    }
}

impl Default for DataFrame {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(name: &str, col: &Column, expected: &str) -> GlmmError {
    GlmmError::Data(format!(
        "Column '{}' is a {} column, expected {}",
        name,
        col.type_name(),
        expected
    ))
}
