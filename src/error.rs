use thiserror::Error;

/// Errors raised by the diffusion core.
#[derive(Debug, Error)]
pub enum DiffusionError {
    /// Invalid schedule parameters, zero batch size or a degenerate coefficient cache.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mismatched batch, timestep, noise or prediction dimensions.
    #[error("Shape mismatch in {op}: expected {expected:?}, got {got:?}")]
    Shape {
        op: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Timestep indices must be a `U32` tensor; other dtypes are never cast.
    #[error("Timesteps must be a U32 tensor, got {0:?}")]
    TimestepDType(candle_core::DType),

    #[error("Timestep {t} out of range for a schedule of {num_steps} steps")]
    TimestepOutOfRange { t: usize, num_steps: usize },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl DiffusionError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn shape(op: &'static str, expected: &[usize], got: &[usize]) -> Self {
        Self::Shape {
            op,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DiffusionError>;
