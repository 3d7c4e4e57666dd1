mod convergence;
mod icc;
mod information;
pub mod wald;

pub use convergence::{ConvergenceMonitor, ConvergenceRecord};
pub use icc::{icc_report, median_odds_ratio, IccEntry, IccReport, LOGISTIC_RESIDUAL_VARIANCE};
pub use information::ModelFit;
pub use wald::{format_wald_tests, wald_tests, z_test, WaldTest};
