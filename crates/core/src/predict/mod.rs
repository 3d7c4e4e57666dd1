//! Deterministic prediction and seeded simulation from a fitted model.

mod options;
mod predictor;
mod simulator;

pub use options::{
    PredictOptions, PredictionScale, SimulateOptions, SimulationScale, UnseenLevelPolicy,
};
pub use predictor::{predict, Prediction, UnseenCount};
pub use simulator::{simulate, Simulation};
