use std::path::Path;

use crate::error::{GlmmError, Result};

use super::dataframe::{Column, DataFrame};
use super::factor::FactorColumn;

impl DataFrame {
    /// Read a CSV file into a DataFrame.
    ///
    /// The first row is treated as a header. Each column is auto-detected:
    /// - every value parses as `i64` -> `Integer` (group ids, 0/1 responses),
    /// - every value parses as `f64` -> `Float`,
    /// - every value is `true`/`false` (any case) -> `Boolean`,
    /// - otherwise -> `Factor`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened, if the CSV is malformed,
    /// or if rows have inconsistent numbers of fields.
    ///
    /// # Examples
    /// ```no_run
    /// use binary_glmm_core::data::DataFrame;
    ///
    /// let df = DataFrame::from_csv("patients.csv").unwrap();
    /// println!("rows = {}, cols = {}", df.nrows(), df.ncols());
    /// ```
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_csv_reader(file)
    }

    /// Read CSV data from any reader (see [`DataFrame::from_csv`]).
    pub fn from_csv_reader<R: std::io::Read>(input: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(input);

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.to_string())
            .collect();

        if headers.is_empty() {
            return Ok(DataFrame::new());
        }

        let ncols = headers.len();
        let mut string_columns: Vec<Vec<String>> = vec![Vec::new(); ncols];

        for (row, result) in reader.records().enumerate() {
            let record = result?;
            if record.len() != ncols {
                return Err(GlmmError::Data(format!(
                    "Row {} has {} fields but header has {} columns",
                    row + 1,
                    record.len(),
                    ncols
                )));
            }
            for (i, field) in record.iter().enumerate() {
                string_columns[i].push(field.to_string());
            }
        }

        if string_columns[0].is_empty() {
            return Ok(DataFrame::new());
        }

        let mut df = DataFrame::new();
        for (header, raw) in headers.iter().zip(string_columns) {
            df.insert_column(header, detect_column(raw))?;
        }

        Ok(df)
    }
}

fn detect_column(raw: Vec<String>) -> Column {
    if let Ok(values) = raw.iter().map(|s| s.parse::<i64>()).collect::<std::result::Result<Vec<_>, _>>() {
        return Column::Integer(values);
    }
    if let Ok(values) = raw.iter().map(|s| s.parse::<f64>()).collect::<std::result::Result<Vec<_>, _>>() {
        return Column::Float(values);
    }
    let booleans: Option<Vec<bool>> = raw
        .iter()
        .map(|s| match s.to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        })
        .collect();
    if let Some(values) = booleans {
        return Column::Boolean(values);
    }
    Column::Factor(FactorColumn::from_labels(&raw))
}
