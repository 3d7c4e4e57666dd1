use serde::{Deserialize, Serialize};

/// How a grouping factor relates to the other declared factors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Nesting {
    /// Top-level factor whose raw labels are global. The resolver rejects the
    /// factor if its labels repeat across the levels of a coarser factor,
    /// because that pattern could mean either nesting or crossing.
    #[default]
    Unspecified,
    /// Explicitly crossed: labels are global and may combine freely with the
    /// levels of every other factor.
    Crossed,
    /// Nested within the named parent factor: a level exists only inside one
    /// parent level, and raw labels may repeat across parents.
    Within(String),
}

/// Declaration of one random-intercept grouping factor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingSpec {
    /// Factor name used in reports and nesting declarations.
    pub name: String,
    /// Label columns. More than one column forms an interaction key
    /// (`"b:a"`), the explicit-crossed spelling of a nested factor.
    pub columns: Vec<String>,
    pub nesting: Nesting,
}

impl GroupingSpec {
    /// A factor whose levels are the labels of the column of the same name.
    pub fn new(name: &str) -> Self {
        Self::column(name, name)
    }

    /// A factor named `name` reading its labels from `column`.
    pub fn column(name: &str, column: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: vec![column.to_string()],
            nesting: Nesting::Unspecified,
        }
    }

    /// An interaction factor keyed by the combination of several columns.
    ///
    /// `GroupingSpec::interaction("ward:hospital", &["ward", "hospital"])`
    /// is equivalent to declaring `ward` nested within `hospital`.
    pub fn interaction(name: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            nesting: Nesting::Unspecified,
        }
    }

    /// Declare this factor nested within `parent`.
    pub fn within(mut self, parent: &str) -> Self {
        self.nesting = Nesting::Within(parent.to_string());
        self
    }

    /// Declare this factor explicitly crossed with the others.
    pub fn crossed(mut self) -> Self {
        self.nesting = Nesting::Crossed;
        self
    }

    /// Name of the parent factor, if nested.
    pub fn parent(&self) -> Option<&str> {
        match &self.nesting {
            Nesting::Within(p) => Some(p.as_str()),
            _ => None,
        }
    }
}
