use crate::coefficients::{Coefficient, CoefficientSet};
use crate::error::{DiffusionError, Result};
use candle_core::Tensor;

/// Estimates the noise that was mixed into `x_t` at per-sample timesteps `t`.
///
/// Implementations must return one estimate per sample with exactly the shape
/// of `x_t`, and be deterministic for fixed model state.
pub trait NoisePredictor {
    fn predict_noise(&self, x_t: &Tensor, t: &Tensor) -> Result<Tensor>;
}

impl<F> NoisePredictor for F
where
    F: Fn(&Tensor, &Tensor) -> Result<Tensor>,
{
    fn predict_noise(&self, x_t: &Tensor, t: &Tensor) -> Result<Tensor> {
        self(x_t, t)
    }
}

/// Stand-in for a trained model that knows the clean data.
///
/// Returns the exact noise that would turn `target` into `x_t` at `t`, so the
/// reverse chain driven by it converges onto `target`.
pub struct OraclePredictor<'a> {
    coefficients: &'a CoefficientSet,
    target: Tensor,
}

impl<'a> OraclePredictor<'a> {
    /// `target` must broadcast against the batches it will be asked about.
    pub fn new(coefficients: &'a CoefficientSet, target: Tensor) -> Self {
        Self { coefficients, target }
    }

    pub fn target(&self) -> &Tensor {
        &self.target
    }
}

impl NoisePredictor for OraclePredictor<'_> {
    fn predict_noise(&self, x_t: &Tensor, t: &Tensor) -> Result<Tensor> {
        let shape = x_t.dims();
        let target = self
            .target
            .to_dtype(x_t.dtype())?
            .broadcast_as(shape)
            .map_err(|_| DiffusionError::shape("oracle target", shape, self.target.dims()))?;
        self.coefficients.check_timesteps(t, shape)?;
        let signal = self
            .coefficients
            .lookup(Coefficient::SqrtCumprod, t, shape, x_t.dtype())?;
        let spread = self
            .coefficients
            .lookup(Coefficient::SqrtOneMinusCumprod, t, shape, x_t.dtype())?;
        let residual = (x_t - target.broadcast_mul(&signal)?)?;
        Ok(residual.broadcast_div(&spread)?)
    }
}
