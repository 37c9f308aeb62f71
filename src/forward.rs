use crate::coefficients::{Coefficient, CoefficientSet};
use crate::error::{DiffusionError, Result};
use crate::noise;
use candle_core::Tensor;
use rand::Rng;

/// Closed-form forward corruption: jumps straight from `x0` to any timestep
/// without simulating the intermediate steps.
#[derive(Clone, Copy, Debug)]
pub struct ForwardProcess<'a> {
    coefficients: &'a CoefficientSet,
}

impl<'a> ForwardProcess<'a> {
    pub fn new(coefficients: &'a CoefficientSet) -> Self {
        Self { coefficients }
    }

    pub fn coefficients(&self) -> &'a CoefficientSet {
        self.coefficients
    }

    /// `sqrt_cumprod[t] * x0 + sqrt_one_minus_cumprod[t] * noise`, per sample.
    pub fn corrupt(&self, x0: &Tensor, t: &Tensor, noise: &Tensor) -> Result<Tensor> {
        if noise.dims() != x0.dims() {
            return Err(DiffusionError::shape("corrupt", x0.dims(), noise.dims()));
        }
        let shape = x0.dims();
        self.coefficients.check_timesteps(t, shape)?;
        let signal = self
            .coefficients
            .lookup(Coefficient::SqrtCumprod, t, shape, x0.dtype())?;
        let spread = self
            .coefficients
            .lookup(Coefficient::SqrtOneMinusCumprod, t, shape, x0.dtype())?;
        let x_t = (x0.broadcast_mul(&signal)? + noise.broadcast_mul(&spread)?)?;
        Ok(x_t)
    }

    /// Corrupts `x0` with fresh standard-normal noise drawn from `rng`.
    pub fn corrupt_with_rng<R: Rng + ?Sized>(&self, x0: &Tensor, t: &Tensor, rng: &mut R) -> Result<Tensor> {
        self.corrupt_pair(x0, t, rng).map(|(x_t, _)| x_t)
    }

    /// Like [`corrupt_with_rng`](Self::corrupt_with_rng) but also hands back the
    /// drawn noise, which is the regression target for a noise predictor.
    pub fn corrupt_pair<R: Rng + ?Sized>(
        &self,
        x0: &Tensor,
        t: &Tensor,
        rng: &mut R,
    ) -> Result<(Tensor, Tensor)> {
        let noise = noise::standard_normal_like(rng, x0)?;
        let x_t = self.corrupt(x0, t, &noise)?;
        Ok((x_t, noise))
    }
}
