//! Gaussian diffusion core.
//!
//! A variance [`Schedule`] is turned once into an immutable [`CoefficientSet`],
//! which is then borrowed by the closed-form [`ForwardProcess`] and the
//! iterative [`ReverseProcess`]. The noise-prediction model stays outside the
//! crate behind the [`NoisePredictor`] trait.

pub mod coefficients;
pub mod config;
pub mod embedding;
pub mod error;
pub mod forward;
pub mod inference;
pub mod noise;
pub mod predictor;
pub mod reverse;
pub mod schedule;

pub use coefficients::{Coefficient, CoefficientSet};
pub use config::DiffusionConfig;
pub use error::{DiffusionError, Result};
pub use forward::ForwardProcess;
pub use predictor::{NoisePredictor, OraclePredictor};
pub use reverse::{ReverseProcess, ReverseSteps, Trajectory};
pub use schedule::{Schedule, ScheduleKind};
