use crate::coefficients::{broadcast_shape, Coefficient, CoefficientSet};
use crate::error::{DiffusionError, Result};
use crate::noise;
use crate::predictor::NoisePredictor;
use candle_core::{DType, Tensor};
use rand::Rng;
use tracing::{debug, trace};

/// Sequences a reverse step reads.
const REVERSE_COEFFICIENTS: [Coefficient; 5] = [
    Coefficient::SqrtRecipCumprod,
    Coefficient::SqrtRecipm1Cumprod,
    Coefficient::PosteriorMeanCoef1,
    Coefficient::PosteriorMeanCoef2,
    Coefficient::PosteriorLogVarianceClipped,
];

/// Iterative reconstruction: undoes one corruption step at a time, driven by
/// an external noise predictor.
#[derive(Clone, Copy, Debug)]
pub struct ReverseProcess<'a> {
    coefficients: &'a CoefficientSet,
    dtype: DType,
}

impl<'a> ReverseProcess<'a> {
    /// Samples are drawn as `F32` unless changed with [`with_dtype`](Self::with_dtype).
    pub fn new(coefficients: &'a CoefficientSet) -> Self {
        Self {
            coefficients,
            dtype: DType::F32,
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn coefficients(&self) -> &'a CoefficientSet {
        self.coefficients
    }

    pub fn num_steps(&self) -> usize {
        self.coefficients.num_steps()
    }

    /// Inverts the forward equation: `sqrt_recip_cumprod[t] * x_t - sqrt_recipm1_cumprod[t] * noise`.
    pub fn reconstruct_origin(&self, x_t: &Tensor, t: &Tensor, noise: &Tensor) -> Result<Tensor> {
        self.coefficients.check_timesteps(t, x_t.dims())?;
        self.reconstruct_checked(x_t, t, noise)
    }

    fn reconstruct_checked(&self, x_t: &Tensor, t: &Tensor, noise: &Tensor) -> Result<Tensor> {
        if noise.dims() != x_t.dims() {
            return Err(DiffusionError::shape("reconstruct_origin", x_t.dims(), noise.dims()));
        }
        let shape = x_t.dims();
        let recip = self
            .coefficients
            .lookup(Coefficient::SqrtRecipCumprod, t, shape, x_t.dtype())?;
        let recipm1 = self
            .coefficients
            .lookup(Coefficient::SqrtRecipm1Cumprod, t, shape, x_t.dtype())?;
        let x0_hat = (x_t.broadcast_mul(&recip)? - noise.broadcast_mul(&recipm1)?)?;
        Ok(x0_hat)
    }

    /// Mean and clipped log-variance of `q(x_{t-1} | x_t, x0_hat)`.
    ///
    /// The log-variance is looked up, not recomputed, and comes back
    /// broadcast to the batch shape.
    pub fn posterior(&self, x0_hat: &Tensor, x_t: &Tensor, t: &Tensor) -> Result<(Tensor, Tensor)> {
        self.coefficients.check_timesteps(t, x_t.dims())?;
        self.posterior_checked(x0_hat, x_t, t)
    }

    fn posterior_checked(&self, x0_hat: &Tensor, x_t: &Tensor, t: &Tensor) -> Result<(Tensor, Tensor)> {
        if x0_hat.dims() != x_t.dims() {
            return Err(DiffusionError::shape("posterior", x_t.dims(), x0_hat.dims()));
        }
        let shape = x_t.dims();
        let dtype = x_t.dtype();
        let coef1 = self
            .coefficients
            .lookup(Coefficient::PosteriorMeanCoef1, t, shape, dtype)?;
        let coef2 = self
            .coefficients
            .lookup(Coefficient::PosteriorMeanCoef2, t, shape, dtype)?;
        let mean = (x0_hat.broadcast_mul(&coef1)? + x_t.broadcast_mul(&coef2)?)?;
        let log_variance = self
            .coefficients
            .lookup(Coefficient::PosteriorLogVarianceClipped, t, shape, dtype)?
            .broadcast_as(shape)?;
        Ok((mean, log_variance))
    }

    /// One reverse transition with the injected noise `z` given explicitly.
    ///
    /// Samples whose timestep is 0 receive the posterior mean exactly; all
    /// others get `exp(0.5 * log_variance) * z` added.
    pub fn step_with_noise<P>(&self, predictor: &P, x_t: &Tensor, t: &Tensor, z: &Tensor) -> Result<Tensor>
    where
        P: NoisePredictor + ?Sized,
    {
        let shape = x_t.dims();
        check_batch_shape(shape)?;
        let ids = self.coefficients.check_timesteps(t, shape)?;
        if z.dims() != shape {
            return Err(DiffusionError::shape("step noise", shape, z.dims()));
        }

        let predicted = predictor.predict_noise(x_t, t)?;
        if predicted.dims() != shape {
            return Err(DiffusionError::shape("predict_noise", shape, predicted.dims()));
        }

        let x0_hat = self.reconstruct_checked(x_t, t, &predicted)?;
        let (mean, log_variance) = self.posterior_checked(&x0_hat, x_t, t)?;

        let mask: Vec<f64> = ids.iter().map(|&id| if id == 0 { 0.0 } else { 1.0 }).collect();
        let mask = Tensor::from_vec(mask, broadcast_shape(shape), x_t.device())?.to_dtype(x_t.dtype())?;

        let std = (log_variance * 0.5)?.exp()?;
        let injected = (std * z)?.broadcast_mul(&mask)?;
        Ok((mean + injected)?)
    }

    /// One reverse transition with fresh standard-normal noise from `rng`.
    pub fn step<P, R>(&self, predictor: &P, x_t: &Tensor, t: &Tensor, rng: &mut R) -> Result<Tensor>
    where
        P: NoisePredictor + ?Sized,
        R: Rng + ?Sized,
    {
        let z = noise::standard_normal_like(rng, x_t)?;
        self.step_with_noise(predictor, x_t, t, &z)
    }

    /// Lazily walks the chain from pure noise down to timestep 0.
    ///
    /// The first item is the initial noise state, followed by one state per
    /// timestep `T-1, ..., 0`. Stopping early leaves every yielded state intact.
    pub fn steps<'p, 'r, P, R>(
        &self,
        predictor: &'p P,
        shape: &[usize],
        rng: &'r mut R,
    ) -> Result<ReverseSteps<'a, 'p, 'r, P, R>>
    where
        P: NoisePredictor + ?Sized,
        R: Rng + ?Sized,
    {
        check_batch_shape(shape)?;
        self.coefficients.check_representable(&REVERSE_COEFFICIENTS, self.dtype)?;
        debug!(num_steps = self.num_steps(), ?shape, "Starting reverse diffusion");
        Ok(ReverseSteps {
            process: *self,
            predictor,
            rng,
            shape: shape.to_vec(),
            current: None,
            next_t: Some(self.num_steps() - 1),
            failed: false,
        })
    }

    /// Runs the full chain and records all `T + 1` states.
    pub fn run_trajectory<P, R>(&self, predictor: &P, shape: &[usize], rng: &mut R) -> Result<Trajectory>
    where
        P: NoisePredictor + ?Sized,
        R: Rng + ?Sized,
    {
        let mut states = Vec::with_capacity(self.num_steps() + 1);
        for state in self.steps(predictor, shape, rng)? {
            states.push(state?);
        }
        debug!(states = states.len(), "Reverse diffusion finished");
        Ok(Trajectory { states })
    }
}

fn check_batch_shape(shape: &[usize]) -> Result<()> {
    match shape.first().copied() {
        None => Err(DiffusionError::config("batch shape needs a leading batch dimension")),
        Some(0) => Err(DiffusionError::config("batch size must be at least 1")),
        Some(_) => Ok(()),
    }
}

/// Iterator returned by [`ReverseProcess::steps`]. Fused after the first error.
pub struct ReverseSteps<'a, 'p, 'r, P: ?Sized, R: ?Sized> {
    process: ReverseProcess<'a>,
    predictor: &'p P,
    rng: &'r mut R,
    shape: Vec<usize>,
    current: Option<Tensor>,
    next_t: Option<usize>,
    failed: bool,
}

impl<P, R> ReverseSteps<'_, '_, '_, P, R>
where
    P: NoisePredictor + ?Sized,
    R: Rng + ?Sized,
{
    /// Number of states still to be yielded.
    pub fn remaining(&self) -> usize {
        if self.failed {
            return 0;
        }
        match (&self.current, self.next_t) {
            (None, _) => self.process.num_steps() + 1,
            (Some(_), Some(t)) => t + 1,
            (Some(_), None) => 0,
        }
    }

    /// Timestep the next transition will run at, if any remain.
    pub fn next_timestep(&self) -> Option<usize> {
        if self.failed {
            None
        } else {
            self.next_t
        }
    }

    fn advance(&mut self) -> Option<Result<Tensor>> {
        let x_t = match &self.current {
            None => {
                let device = self.process.coefficients.device();
                return Some(noise::standard_normal(
                    &mut *self.rng,
                    self.shape.clone(),
                    self.process.dtype,
                    device,
                ));
            }
            Some(x_t) => x_t,
        };
        let t = self.next_t?;
        trace!(t, "Reverse step");
        let result = self
            .process
            .coefficients
            .timesteps(t, self.shape[0])
            .and_then(|ids| self.process.step(self.predictor, x_t, &ids, &mut *self.rng));
        if result.is_ok() {
            self.next_t = t.checked_sub(1);
        }
        Some(result)
    }
}

impl<P, R> Iterator for ReverseSteps<'_, '_, '_, P, R>
where
    P: NoisePredictor + ?Sized,
    R: Rng + ?Sized,
{
    type Item = Result<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance()? {
            Ok(state) => {
                self.current = Some(state.clone());
                Some(Ok(state))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (0, Some(n))
    }
}

/// Every state of one full reverse run: the initial noise followed by the
/// output of the steps at `T-1, ..., 0`.
#[derive(Clone, Debug)]
pub struct Trajectory {
    states: Vec<Tensor>,
}

impl Trajectory {
    pub fn states(&self) -> &[Tensor] {
        &self.states
    }

    pub fn into_states(self) -> Vec<Tensor> {
        self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// The pure-noise starting state.
    pub fn initial(&self) -> &Tensor {
        &self.states[0]
    }

    /// The reconstruction produced by the step at timestep 0.
    pub fn final_state(&self) -> &Tensor {
        &self.states[self.states.len() - 1]
    }

    /// State produced by the step at timestep `t`.
    pub fn state_at(&self, t: usize) -> Option<&Tensor> {
        let num_steps = self.states.len() - 1;
        if t >= num_steps {
            return None;
        }
        self.states.get(num_steps - t)
    }
}
