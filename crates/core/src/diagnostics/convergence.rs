use serde::{Deserialize, Serialize};

/// History of the variance-component optimizer, one record per iteration.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceMonitor {
    history: Vec<ConvergenceRecord>,
}

/// One outer iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceRecord {
    pub iteration: usize,
    /// Objective (deviance) at the current point.
    pub objective: f64,
    /// Euclidean gradient norm under L-BFGS; `null` for Nelder–Mead.
    #[serde(with = "non_finite_as_null")]
    pub gradient_norm: f64,
    /// Largest parameter change since the previous record.
    #[serde(with = "non_finite_as_null")]
    pub param_change: f64,
    /// Relative objective change since the previous record.
    #[serde(with = "non_finite_as_null")]
    pub objective_change: f64,
}

/// JSON has no infinities: the first record's changes are stored as `null`.
mod non_finite_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

impl ConvergenceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new iteration.
    pub fn record(
        &mut self,
        iteration: usize,
        objective: f64,
        gradient_norm: f64,
        param_change: f64,
    ) {
        let objective_change = if let Some(prev) = self.history.last() {
            (objective - prev.objective).abs() / (1.0 + objective.abs())
        } else {
            f64::INFINITY
        };

        self.history.push(ConvergenceRecord {
            iteration,
            objective,
            gradient_norm,
            param_change,
            objective_change,
        });
    }

    /// Number of iterations recorded.
    pub fn n_iterations(&self) -> usize {
        self.history.len()
    }

    pub fn history(&self) -> &[ConvergenceRecord] {
        &self.history
    }

    pub fn into_history(self) -> Vec<ConvergenceRecord> {
        self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objective_change_is_relative() {
        let mut monitor = ConvergenceMonitor::new();
        monitor.record(1, 100.0, 1.0, f64::INFINITY);
        monitor.record(2, 99.0, 5e-5, 0.3);
        assert_eq!(monitor.n_iterations(), 2);
        assert!(monitor.history()[0].objective_change.is_infinite());
        assert!((monitor.history()[1].objective_change - 1.0 / 100.0).abs() < 1e-12);
    }

    #[test]
    fn test_record_json_keeps_infinite_changes() {
        let mut monitor = ConvergenceMonitor::new();
        monitor.record(1, 3.0, 0.5, f64::INFINITY);
        let json = serde_json::to_string(monitor.history()).unwrap();
        assert!(json.contains("null"));
        let back: Vec<ConvergenceRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, monitor.into_history());
    }
}
