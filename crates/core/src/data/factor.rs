use indexmap::IndexMap;

/// A categorical (factor) column that maps string levels to integer codes.
///
/// Levels are discovered in order of first appearance and assigned 0-based codes.
/// Grouping columns and categorical fixed-effect terms are both stored this way.
#[derive(Debug, Clone)]
pub struct FactorColumn {
    /// Maps level string -> integer code (0-based), ordered by first appearance.
    levels: IndexMap<String, usize>,
    /// The integer codes for each observation.
    codes: Vec<usize>,
}

impl FactorColumn {
    /// Create a new `FactorColumn` from a slice of string values.
    ///
    /// # Examples
    /// ```
    /// use binary_glmm_core::data::FactorColumn;
    ///
    /// let col = FactorColumn::new(&["A", "B", "A", "C", "B"]);
    /// assert_eq!(col.n_levels(), 3);
    /// assert_eq!(col.codes(), &[0, 1, 0, 2, 1]);
    /// ```
    pub fn new(values: &[&str]) -> Self {
        Self::from_labels(values.iter().copied())
    }

    /// Create a `FactorColumn` from any iterator of labels.
    pub fn from_labels<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut levels = IndexMap::new();
        let mut codes = Vec::new();

        for val in values {
            let next_code = levels.len();
            let code = *levels.entry(val.as_ref().to_string()).or_insert(next_code);
            codes.push(code);
        }

        FactorColumn { levels, codes }
    }

    /// Returns the number of distinct levels.
    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    /// Returns a slice of the integer codes for each observation.
    pub fn codes(&self) -> &[usize] {
        &self.codes
    }

    /// Returns the level name for a given integer code.
    pub fn level_name(&self, code: usize) -> Option<&str> {
        self.levels.get_index(code).map(|(name, _)| name.as_str())
    }

    /// Returns the label of observation `row`.
    pub fn label(&self, row: usize) -> &str {
        self.level_name(self.codes[row]).unwrap_or("")
    }

    /// Returns the number of observations (rows).
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Returns `true` if the column has no observations.
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_basic() {
        let col = FactorColumn::new(&["A", "B", "A", "C", "B"]);
        assert_eq!(col.n_levels(), 3);
        assert_eq!(col.len(), 5);
        assert_eq!(col.codes(), &[0, 1, 0, 2, 1]);
    }

    #[test]
    fn test_level_order_is_first_appearance() {
        let col = FactorColumn::new(&["C", "A", "B", "A"]);
        assert_eq!(col.level_name(0), Some("C"));
        assert_eq!(col.level_name(2), Some("B"));
        assert_eq!(col.codes(), &[0, 1, 2, 1]);
    }

    #[test]
    fn test_level_lookup() {
        let col = FactorColumn::new(&["X", "Y", "Z"]);
        assert_eq!(col.level_name(1), Some("Y"));
        assert_eq!(col.level_name(3), None);
        assert_eq!(col.level_name(col.codes()[2]), Some("Z"));
        assert_eq!(col.label(0), "X");
    }

    #[test]
    fn test_from_labels_owned() {
        let labels = vec!["s1".to_string(), "s2".to_string(), "s1".to_string()];
        let col = FactorColumn::from_labels(&labels);
        assert_eq!(col.n_levels(), 2);
        assert_eq!(col.codes(), &[0, 1, 0]);
    }

    #[test]
    fn test_empty() {
        let col = FactorColumn::new(&[]);
        assert_eq!(col.n_levels(), 0);
        assert!(col.is_empty());
    }
}
