use crate::error::{DiffusionError, Result};
use std::fmt;
use std::str::FromStr;

/// How the variance sequence grows between its bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleKind {
    /// Evenly spaced betas.
    Linear,
    /// Evenly spaced square roots of the bounds, squared: slower early, faster late.
    Quadratic,
}

impl FromStr for ScheduleKind {
    type Err = DiffusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "quadratic" => Ok(Self::Quadratic),
            other => Err(DiffusionError::config(format!(
                "unknown schedule kind '{}' (expected 'linear' or 'quadratic')",
                other
            ))),
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => f.write_str("linear"),
            Self::Quadratic => f.write_str("quadratic"),
        }
    }
}

/// Per-timestep variance (beta) sequence. Immutable once generated.
#[derive(Clone, Debug, PartialEq)]
pub struct Schedule {
    kind: ScheduleKind,
    betas: Vec<f64>,
}

impl Schedule {
    /// Generates `num_steps` betas between `beta_start` and `beta_end` inclusive.
    pub fn new(kind: ScheduleKind, beta_start: f64, beta_end: f64, num_steps: usize) -> Result<Self> {
        if num_steps < 1 {
            return Err(DiffusionError::config("schedule needs at least one timestep"));
        }
        if !(beta_start > 0.0 && beta_end < 1.0 && beta_start < beta_end) {
            return Err(DiffusionError::config(format!(
                "schedule bounds must satisfy 0 < beta_start < beta_end < 1, got {} and {}",
                beta_start, beta_end
            )));
        }

        let betas = match kind {
            ScheduleKind::Linear => linspace(beta_start, beta_end, num_steps),
            ScheduleKind::Quadratic => linspace(beta_start.sqrt(), beta_end.sqrt(), num_steps)
                .into_iter()
                .map(|b| b * b)
                .collect(),
        };

        Ok(Self { kind, betas })
    }

    pub fn kind(&self) -> ScheduleKind {
        self.kind
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn len(&self) -> usize {
        self.betas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.betas.is_empty()
    }
}

/// `n` evenly spaced values from `start` to `end` inclusive; a single value is `start`.
fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n)
        .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
        .collect()
}
