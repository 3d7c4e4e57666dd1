use thiserror::Error;

#[derive(Error, Debug)]
pub enum GlmmError {
    #[error("Data error: {0}")]
    Data(String),

    #[error("Column '{0}' not found in DataFrame")]
    ColumnNotFound(String),

    #[error("Model specification error: {0}")]
    ModelSpec(String),

    #[error("Fixed-effect design is rank deficient: rank {rank} < {columns} columns ({detail})")]
    RankDeficient {
        rank: usize,
        columns: usize,
        detail: String,
    },

    #[error(
        "Ambiguous nesting for grouping factor '{factor}': label '{label}' appears under \
         several levels of '{other}'; declare it nested within '{other}' or crossed"
    )]
    AmbiguousNesting {
        factor: String,
        other: String,
        label: String,
    },

    #[error("Dimension mismatch: expected {expected}, got {got} in {context}")]
    DimensionMismatch {
        expected: usize,
        got: usize,
        context: String,
    },

    #[error("Level '{level}' of grouping factor '{factor}' was not present in the fitted data")]
    UnseenLevel { factor: String, level: String },

    #[error("Penalized system is not positive definite")]
    NotPositiveDefinite,

    #[error("Numerical failure: {0}")]
    NumericalFailure(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GlmmError {
    /// True for errors caused by a malformed model or data specification.
    ///
    /// These are raised before any numerical work starts and are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            GlmmError::Data(_)
                | GlmmError::ColumnNotFound(_)
                | GlmmError::ModelSpec(_)
                | GlmmError::RankDeficient { .. }
                | GlmmError::AmbiguousNesting { .. }
                | GlmmError::DimensionMismatch { .. }
        )
    }
}

/// Errors raised inside an argmin run come back as the original
/// [`GlmmError`] when they started out as one.
impl From<argmin::core::Error> for GlmmError {
    fn from(err: argmin::core::Error) -> Self {
        match err.downcast::<GlmmError>() {
            Ok(err) => err,
            Err(other) => GlmmError::NumericalFailure(format!("optimizer: {}", other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, GlmmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_classification() {
        assert!(GlmmError::ModelSpec("x".into()).is_configuration());
        assert!(GlmmError::ColumnNotFound("x".into()).is_configuration());
        assert!(GlmmError::RankDeficient {
            rank: 1,
            columns: 2,
            detail: String::new()
        }
        .is_configuration());
        assert!(!GlmmError::Cancelled.is_configuration());
        assert!(!GlmmError::UnseenLevel {
            factor: "a".into(),
            level: "b".into()
        }
        .is_configuration());
    }

    #[test]
    fn test_optimizer_errors_keep_their_kind() {
        let wrapped: argmin::core::Error = GlmmError::Cancelled.into();
        assert!(matches!(GlmmError::from(wrapped), GlmmError::Cancelled));

        let foreign = argmin::core::Error::msg("line search failed");
        match GlmmError::from(foreign) {
            GlmmError::NumericalFailure(msg) => assert!(msg.contains("line search failed")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unseen_level_message() {
        let err = GlmmError::UnseenLevel {
            factor: "school".into(),
            level: "S9".into(),
        };
        assert!(err.to_string().contains("S9"));
        assert!(err.to_string().contains("school"));
    }
}
