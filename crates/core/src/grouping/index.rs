use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::spec::{GroupingSpec, Nesting};
use crate::data::DataFrame;
use crate::error::{GlmmError, Result};

/// Separator between a parent level key and a child's label.
const NEST_SEPARATOR: char = '/';
/// Separator between the labels of an interaction key.
const INTERACTION_SEPARATOR: char = ':';
const ESCAPE: char = '\\';

/// A resolved grouping factor: its declaration plus the canonical level set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingFactor {
    pub spec: GroupingSpec,
    /// Index of the parent factor in the owning [`GroupingIndex`].
    pub parent: Option<usize>,
    /// Canonical level key -> level index, in order of first appearance.
    pub levels: IndexMap<String, usize>,
    /// Raw (un-prefixed, unescaped) label of each level.
    pub raw_labels: Vec<String>,
    /// Parent level of each level (for nested factors).
    pub parent_levels: Vec<Option<usize>>,
}

impl GroupingFactor {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    /// Canonical key of level `index`.
    pub fn level_key(&self, index: usize) -> Option<&str> {
        self.levels.get_index(index).map(|(k, _)| k.as_str())
    }

    /// Index of the level with canonical key `key`.
    pub fn level_index(&self, key: &str) -> Option<usize> {
        self.levels.get(key).copied()
    }
}

/// Reference from one row to a level of one factor.
///
/// `index` is `None` when the canonical key was not seen at fit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelRef {
    pub key: String,
    pub index: Option<usize>,
}

/// The read-only grouping index built once per fit.
#[derive(Debug, Clone)]
pub struct GroupingIndex {
    factors: Vec<GroupingFactor>,
    /// `codes[k][i]`: level of observation `i` in factor `k`.
    codes: Vec<Vec<usize>>,
    n_obs: usize,
}

impl GroupingIndex {
    /// Resolve the declared grouping factors against a table.
    ///
    /// # Errors
    /// Returns a configuration error for missing or malformed declarations,
    /// unknown or cyclic parents, unreadable label columns, and ambiguous
    /// nesting (see [`Nesting::Unspecified`]).
    pub fn resolve(df: &DataFrame, specs: &[GroupingSpec]) -> Result<Self> {
        let parents = validate_specs(specs)?;
        let order = topological_order(&parents);
        let n = df.nrows();

        let mut factors: Vec<Option<GroupingFactor>> = vec![None; specs.len()];
        let mut codes: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
        let mut keys: Vec<Vec<String>> = vec![Vec::new(); specs.len()];

        for &k in &order {
            let spec = &specs[k];
            let rows = row_labels(df, spec)?;

            let mut levels: IndexMap<String, usize> = IndexMap::new();
            let mut raw_labels = Vec::new();
            let mut parent_levels = Vec::new();
            let mut factor_codes = Vec::with_capacity(n);
            let mut factor_keys = Vec::with_capacity(n);

            for (i, row) in rows.into_iter().enumerate() {
                let parent_key = parents[k].map(|p| keys[p][i].as_str());
                let key = level_key(parent_key, &row);
                let parent_level = parents[k].map(|p| codes[p][i]);
                let next = levels.len();
                let code = *levels.entry(key.clone()).or_insert_with(|| {
                    raw_labels.push(row.join(":"));
                    parent_levels.push(parent_level);
                    next
                });
                factor_codes.push(code);
                factor_keys.push(key);
            }

            codes[k] = factor_codes;
            keys[k] = factor_keys;
            factors[k] = Some(GroupingFactor {
                spec: spec.clone(),
                parent: parents[k],
                levels,
                raw_labels,
                parent_levels,
            });
        }

        let factors: Vec<GroupingFactor> = factors.into_iter().flatten().collect();
        check_ambiguous_nesting(&factors, &codes)?;

        for f in &factors {
            log::debug!(
                "grouping factor '{}': {} levels{}",
                f.name(),
                f.n_levels(),
                f.spec
                    .parent()
                    .map(|p| format!(" (nested within '{}')", p))
                    .unwrap_or_default()
            );
        }

        Ok(Self {
            factors,
            codes,
            n_obs: n,
        })
    }

    pub fn factors(&self) -> &[GroupingFactor] {
        &self.factors
    }

    pub fn into_factors(self) -> Vec<GroupingFactor> {
        self.factors
    }

    pub fn n_factors(&self) -> usize {
        self.factors.len()
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    /// Level codes of every observation for factor `k`.
    pub fn codes(&self, k: usize) -> &[usize] {
        &self.codes[k]
    }

    /// Look up new rows against already-resolved factors.
    ///
    /// Returns one [`LevelRef`] per factor per row. A nested level whose parent
    /// level is unseen is unseen itself, because its canonical key cannot exist.
    /// Keys are built exactly as in [`GroupingIndex::resolve`].
    pub fn lookup(factors: &[GroupingFactor], df: &DataFrame) -> Result<Vec<Vec<LevelRef>>> {
        let parents: Vec<Option<usize>> = factors.iter().map(|f| f.parent).collect();
        let order = topological_order(&parents);

        let mut refs: Vec<Vec<LevelRef>> = vec![Vec::new(); factors.len()];
        for &k in &order {
            let factor = &factors[k];
            let rows = row_labels(df, &factor.spec)?;
            refs[k] = rows
                .into_iter()
                .enumerate()
                .map(|(i, row)| {
                    let parent_key = factor.parent.map(|p| refs[p][i].key.as_str());
                    let key = level_key(parent_key, &row);
                    let index = factor.level_index(&key);
                    LevelRef { key, index }
                })
                .collect();
        }
        Ok(refs)
    }
}

/// Validate declarations and return the parent index of every factor.
fn validate_specs(specs: &[GroupingSpec]) -> Result<Vec<Option<usize>>> {
    if specs.is_empty() {
        return Err(GlmmError::ModelSpec(
            "At least one grouping factor is required".into(),
        ));
    }

    let mut by_name: IndexMap<&str, usize> = IndexMap::new();
    for (k, spec) in specs.iter().enumerate() {
        if spec.name.trim().is_empty() {
            return Err(GlmmError::ModelSpec("Grouping factor name is empty".into()));
        }
        if spec.columns.is_empty() {
            return Err(GlmmError::ModelSpec(format!(
                "Grouping factor '{}' has no label columns",
                spec.name
            )));
        }
        if by_name.insert(spec.name.as_str(), k).is_some() {
            return Err(GlmmError::ModelSpec(format!(
                "Grouping factor '{}' is declared twice",
                spec.name
            )));
        }
    }

    let mut parents = Vec::with_capacity(specs.len());
    for spec in specs {
        let parent = match &spec.nesting {
            Nesting::Within(p) if p == &spec.name => {
                return Err(GlmmError::ModelSpec(format!(
                    "Grouping factor '{}' cannot be nested within itself",
                    spec.name
                )));
            }
            Nesting::Within(p) => Some(*by_name.get(p.as_str()).ok_or_else(|| {
                GlmmError::ModelSpec(format!(
                    "Grouping factor '{}' is nested within unknown factor '{}'",
                    spec.name, p
                ))
            })?),
            Nesting::Unspecified | Nesting::Crossed => None,
        };
        parents.push(parent);
    }

    // A parent chain longer than the number of factors must revisit a factor.
    for (k, spec) in specs.iter().enumerate() {
        let mut current = parents[k];
        let mut steps = 0;
        while let Some(p) = current {
            steps += 1;
            if steps > specs.len() {
                return Err(GlmmError::ModelSpec(format!(
                    "Nesting declarations for '{}' form a cycle",
                    spec.name
                )));
            }
            current = parents[p];
        }
    }

    Ok(parents)
}

/// Parents before children, otherwise declaration order. Assumes no cycles.
fn topological_order(parents: &[Option<usize>]) -> Vec<usize> {
    fn depth(k: usize, parents: &[Option<usize>]) -> usize {
        let mut d = 0;
        let mut current = parents[k];
        while let Some(p) = current {
            d += 1;
            current = parents[p];
        }
        d
    }

    let mut order: Vec<usize> = (0..parents.len()).collect();
    order.sort_by_key(|&k| depth(k, parents));
    order
}

/// Per-row labels of a factor, one entry per label column.
fn row_labels(df: &DataFrame, spec: &GroupingSpec) -> Result<Vec<Vec<String>>> {
    let columns: Vec<Vec<String>> = spec
        .columns
        .iter()
        .map(|c| df.labels(c))
        .collect::<Result<_>>()?;

    Ok((0..df.nrows())
        .map(|i| columns.iter().map(|col| col[i].clone()).collect())
        .collect())
}

/// Canonical key of a level: the escaped labels joined with `:`, prefixed by
/// the parent key and `/` for nested factors.
///
/// Separators and the escape character inside labels are backslash-escaped,
/// so distinct (parent, labels) combinations never share a key.
fn level_key(parent_key: Option<&str>, labels: &[String]) -> String {
    let mut key = String::new();
    if let Some(parent) = parent_key {
        key.push_str(parent);
        key.push(NEST_SEPARATOR);
    }
    for (i, label) in labels.iter().enumerate() {
        if i > 0 {
            key.push(INTERACTION_SEPARATOR);
        }
        for c in label.chars() {
            if c == NEST_SEPARATOR || c == INTERACTION_SEPARATOR || c == ESCAPE {
                key.push(ESCAPE);
            }
            key.push(c);
        }
    }
    key
}

/// Reject unspecified factors whose labels repeat across a coarser factor.
fn check_ambiguous_nesting(factors: &[GroupingFactor], codes: &[Vec<usize>]) -> Result<()> {
    for (b, factor) in factors.iter().enumerate() {
        if factor.spec.nesting != Nesting::Unspecified {
            continue;
        }
        for (a, other) in factors.iter().enumerate() {
            // A pair with an explicitly crossed member is never ambiguous.
            if a == b
                || other.n_levels() >= factor.n_levels()
                || other.spec.nesting == Nesting::Crossed
            {
                continue;
            }
            let mut seen_under: Vec<Option<usize>> = vec![None; factor.n_levels()];
            for (&lb, &la) in codes[b].iter().zip(codes[a].iter()) {
                match seen_under[lb] {
                    None => seen_under[lb] = Some(la),
                    Some(prev) if prev != la => {
                        return Err(GlmmError::AmbiguousNesting {
                            factor: factor.name().to_string(),
                            other: other.name().to_string(),
                            label: factor.raw_labels[lb].clone(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two hospitals each with a ward called "A".
    fn hospital_df() -> DataFrame {
        let mut df = DataFrame::new();
        df.add_factor_column("hospital", &["H1", "H1", "H1", "H2", "H2", "H2"])
            .unwrap();
        df.add_factor_column("ward", &["A", "A", "B", "A", "C", "C"])
            .unwrap();
        df
    }

    #[test]
    fn test_nested_levels_disambiguate_repeated_labels() {
        let df = hospital_df();
        let specs = vec![
            GroupingSpec::new("hospital"),
            GroupingSpec::new("ward").within("hospital"),
        ];
        let index = GroupingIndex::resolve(&df, &specs).unwrap();

        let ward = &index.factors()[1];
        assert_eq!(ward.n_levels(), 4);
        let keys: Vec<&str> = ward.levels.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["H1/A", "H1/B", "H2/A", "H2/C"]);
        assert_eq!(ward.raw_labels, vec!["A", "B", "A", "C"]);
        assert_eq!(ward.parent_levels, vec![Some(0), Some(0), Some(1), Some(1)]);
        assert_eq!(index.codes(1), &[0, 0, 1, 2, 3, 3]);
    }

    #[test]
    fn test_unspecified_repeated_labels_are_ambiguous() {
        let df = hospital_df();
        let specs = vec![GroupingSpec::new("hospital"), GroupingSpec::new("ward")];
        let err = GroupingIndex::resolve(&df, &specs).unwrap_err();
        match err {
            GlmmError::AmbiguousNesting {
                factor,
                other,
                label,
            } => {
                assert_eq!(factor, "ward");
                assert_eq!(other, "hospital");
                assert_eq!(label, "A");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_explicit_crossed_is_accepted() {
        let df = hospital_df();
        let specs = vec![
            GroupingSpec::new("hospital"),
            GroupingSpec::new("ward").crossed(),
        ];
        let index = GroupingIndex::resolve(&df, &specs).unwrap();
        assert_eq!(index.factors()[1].n_levels(), 3);
    }

    #[test]
    fn test_interaction_matches_nested_incidence() {
        let df = hospital_df();
        let nested = GroupingIndex::resolve(
            &df,
            &[
                GroupingSpec::new("hospital"),
                GroupingSpec::new("ward").within("hospital"),
            ],
        )
        .unwrap();
        let interaction = GroupingIndex::resolve(
            &df,
            &[
                GroupingSpec::new("hospital"),
                GroupingSpec::interaction("ward:hospital", &["ward", "hospital"]),
            ],
        )
        .unwrap();

        assert_eq!(nested.codes(1), interaction.codes(1));
        assert_eq!(interaction.factors()[1].level_key(0), Some("A:H1"));
    }

    #[test]
    fn test_separators_inside_labels_keep_levels_apart() {
        let mut df = DataFrame::new();
        df.add_factor_column("hospital", &["H1/A", "H1/A", "H1", "H1"])
            .unwrap();
        df.add_factor_column("ward", &["B", "B", "A/B", "A/B"]).unwrap();
        let specs = vec![
            GroupingSpec::new("hospital"),
            GroupingSpec::new("ward").within("hospital"),
        ];
        let index = GroupingIndex::resolve(&df, &specs).unwrap();

        let ward = &index.factors()[1];
        assert_eq!(ward.n_levels(), 2);
        assert_eq!(ward.parent_levels, vec![Some(0), Some(1)]);
        assert_eq!(ward.raw_labels, vec!["B", "A/B"]);
        assert_ne!(ward.level_key(0), ward.level_key(1));
        assert_eq!(index.codes(1), &[0, 0, 1, 1]);

        let refs = GroupingIndex::lookup(index.factors(), &df).unwrap();
        let looked_up: Vec<Option<usize>> = refs[1].iter().map(|r| r.index).collect();
        assert_eq!(looked_up, vec![Some(0), Some(0), Some(1), Some(1)]);
    }

    #[test]
    fn test_separators_inside_interaction_labels() {
        let mut df = DataFrame::new();
        df.add_factor_column("a", &["x:y", "x"]).unwrap();
        df.add_factor_column("b", &["z", "y:z"]).unwrap();
        let index = GroupingIndex::resolve(
            &df,
            &[GroupingSpec::interaction("a:b", &["a", "b"]).crossed()],
        )
        .unwrap();

        let factor = &index.factors()[0];
        assert_eq!(factor.n_levels(), 2);
        assert_eq!(factor.level_key(0), Some("x\\:y:z"));
        assert_eq!(factor.level_key(1), Some("x:y\\:z"));
    }

    #[test]
    fn test_declaration_errors() {
        let df = hospital_df();

        assert!(GroupingIndex::resolve(&df, &[]).is_err());

        let dup = vec![GroupingSpec::new("hospital"), GroupingSpec::new("hospital")];
        assert!(matches!(
            GroupingIndex::resolve(&df, &dup),
            Err(GlmmError::ModelSpec(_))
        ));

        let unknown = vec![GroupingSpec::new("ward").within("region")];
        assert!(matches!(
            GroupingIndex::resolve(&df, &unknown),
            Err(GlmmError::ModelSpec(_))
        ));

        let own = vec![GroupingSpec::new("ward").within("ward")];
        assert!(GroupingIndex::resolve(&df, &own).is_err());

        let cycle = vec![
            GroupingSpec::new("hospital").within("ward"),
            GroupingSpec::new("ward").within("hospital"),
        ];
        let err = GroupingIndex::resolve(&df, &cycle).unwrap_err();
        assert!(err.to_string().contains("cycle"));

        let missing = vec![GroupingSpec::new("nurse")];
        assert!(matches!(
            GroupingIndex::resolve(&df, &missing),
            Err(GlmmError::ColumnNotFound(_))
        ));
    }

    #[test]
    fn test_child_declared_before_parent() {
        let df = hospital_df();
        let specs = vec![
            GroupingSpec::new("ward").within("hospital"),
            GroupingSpec::new("hospital"),
        ];
        let index = GroupingIndex::resolve(&df, &specs).unwrap();
        assert_eq!(index.factors()[0].name(), "ward");
        assert_eq!(index.factors()[0].parent, Some(1));
        assert_eq!(index.factors()[0].n_levels(), 4);
    }

    #[test]
    fn test_lookup_new_rows() {
        let df = hospital_df();
        let index = GroupingIndex::resolve(
            &df,
            &[
                GroupingSpec::new("hospital"),
                GroupingSpec::new("ward").within("hospital"),
            ],
        )
        .unwrap();

        let mut new = DataFrame::new();
        new.add_factor_column("hospital", &["H2", "H1", "H9"]).unwrap();
        new.add_factor_column("ward", &["A", "C", "A"]).unwrap();

        let refs = GroupingIndex::lookup(index.factors(), &new).unwrap();
        assert_eq!(refs[0][0].index, Some(1));
        assert_eq!(refs[1][0].index, Some(2));
        // H1 has no ward C.
        assert_eq!(refs[1][1].key, "H1/C");
        assert_eq!(refs[1][1].index, None);
        // Unseen parent implies unseen child.
        assert_eq!(refs[0][2].index, None);
        assert_eq!(refs[1][2].index, None);
    }
}
