pub mod data;
pub mod diagnostics;
pub mod error;
pub mod glmm;
pub mod grouping;
pub mod model;
pub mod predict;
pub mod types;

pub use error::{GlmmError, Result};
pub use glmm::{fit, CancellationToken, FitConfig, FittedModel, OptimizerMethod};
pub use grouping::{GroupingSpec, Nesting};
pub use model::{FixedTerm, GlmmBuilder, GlmmProblem, ModelSpec};
pub use predict::{predict, simulate, PredictOptions, SimulateOptions, UnseenLevelPolicy};
