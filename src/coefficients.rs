use crate::error::{DiffusionError, Result};
use crate::schedule::Schedule;
use candle_core::{DType, Device, Tensor};
use tracing::debug;

/// Floor applied to the posterior variance before taking its log.
pub const POSTERIOR_VARIANCE_FLOOR: f64 = 1e-20;

/// Names every sequence derived from a schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Coefficient {
    Beta,
    Alpha,
    Cumprod,
    CumprodPrev,
    SqrtCumprod,
    SqrtOneMinusCumprod,
    LogOneMinusCumprod,
    SqrtRecipCumprod,
    SqrtRecipm1Cumprod,
    PosteriorVariance,
    PosteriorLogVarianceClipped,
    PosteriorMeanCoef1,
    PosteriorMeanCoef2,
}

impl Coefficient {
    pub const ALL: [Coefficient; 13] = [
        Coefficient::Beta,
        Coefficient::Alpha,
        Coefficient::Cumprod,
        Coefficient::CumprodPrev,
        Coefficient::SqrtCumprod,
        Coefficient::SqrtOneMinusCumprod,
        Coefficient::LogOneMinusCumprod,
        Coefficient::SqrtRecipCumprod,
        Coefficient::SqrtRecipm1Cumprod,
        Coefficient::PosteriorVariance,
        Coefficient::PosteriorLogVarianceClipped,
        Coefficient::PosteriorMeanCoef1,
        Coefficient::PosteriorMeanCoef2,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Every quantity the forward and reverse processes need, derived once from a
/// schedule and read-only afterwards.
///
/// Values are computed in `f64` on the host and uploaded once per sequence to
/// `device` so that lookups are a single `index_select`.
#[derive(Debug)]
pub struct CoefficientSet {
    num_steps: usize,
    device: Device,
    values: Vec<Vec<f64>>,
    max_abs: Vec<f64>,
    tables: Vec<Tensor>,
}

impl CoefficientSet {
    pub fn new(schedule: &Schedule, device: &Device) -> Result<Self> {
        let betas = schedule.betas();
        let num_steps = betas.len();
        if num_steps == 0 {
            return Err(DiffusionError::config("cannot derive coefficients from an empty schedule"));
        }

        let alpha: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();

        let mut cumprod = Vec::with_capacity(num_steps);
        let mut prod = 1.0f64;
        for (t, &a) in alpha.iter().enumerate() {
            prod *= a;
            if prod == 0.0 {
                return Err(DiffusionError::config(format!(
                    "cumulative alpha product underflows to 0 at timestep {}; lower beta_end",
                    t
                )));
            }
            if prod == 1.0 {
                return Err(DiffusionError::config(format!(
                    "1 - cumulative alpha product is 0 at timestep {}; beta_start is below f64 resolution",
                    t
                )));
            }
            cumprod.push(prod);
        }

        let mut cumprod_prev = Vec::with_capacity(num_steps);
        cumprod_prev.push(1.0);
        cumprod_prev.extend_from_slice(&cumprod[..num_steps - 1]);

        let map = |f: &dyn Fn(usize) -> f64| (0..num_steps).map(f).collect::<Vec<f64>>();

        let sqrt_cumprod = map(&|t| cumprod[t].sqrt());
        let sqrt_one_minus_cumprod = map(&|t| (1.0 - cumprod[t]).sqrt());
        let log_one_minus_cumprod = map(&|t| (1.0 - cumprod[t]).ln());
        let sqrt_recip_cumprod = map(&|t| (1.0 / cumprod[t]).sqrt());
        let sqrt_recipm1_cumprod = map(&|t| (1.0 / cumprod[t] - 1.0).sqrt());
        let posterior_variance =
            map(&|t| betas[t] * (1.0 - cumprod_prev[t]) / (1.0 - cumprod[t]));
        let posterior_log_variance_clipped =
            map(&|t| posterior_variance[t].max(POSTERIOR_VARIANCE_FLOOR).ln());
        let posterior_mean_coef1 =
            map(&|t| betas[t] * cumprod_prev[t].sqrt() / (1.0 - cumprod[t]));
        let posterior_mean_coef2 =
            map(&|t| (1.0 - cumprod_prev[t]) * alpha[t].sqrt() / (1.0 - cumprod[t]));

        // Order must follow `Coefficient::ALL`.
        let values = vec![
            betas.to_vec(),
            alpha,
            cumprod,
            cumprod_prev,
            sqrt_cumprod,
            sqrt_one_minus_cumprod,
            log_one_minus_cumprod,
            sqrt_recip_cumprod,
            sqrt_recipm1_cumprod,
            posterior_variance,
            posterior_log_variance_clipped,
            posterior_mean_coef1,
            posterior_mean_coef2,
        ];

        let max_abs = values
            .iter()
            .map(|v| v.iter().fold(0.0f64, |m, x| m.max(x.abs())))
            .collect();

        let tables = values
            .iter()
            .map(|v| Tensor::new(v.as_slice(), device))
            .collect::<candle_core::Result<Vec<_>>>()?;

        debug!(
            num_steps,
            kind = %schedule.kind(),
            final_cumprod = values[Coefficient::Cumprod.index()][num_steps - 1],
            "Derived diffusion coefficients"
        );

        Ok(Self {
            num_steps,
            device: device.clone(),
            values,
            max_abs,
            tables,
        })
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Host-side copy of a derived sequence, aligned with the schedule.
    pub fn values(&self, coef: Coefficient) -> &[f64] {
        &self.values[coef.index()]
    }

    /// Builds a per-sample timestep tensor with every sample at `t`.
    pub fn timesteps(&self, t: usize, batch_size: usize) -> Result<Tensor> {
        if t >= self.num_steps {
            return Err(DiffusionError::TimestepOutOfRange {
                t,
                num_steps: self.num_steps,
            });
        }
        let ids = vec![t as u32; batch_size];
        Ok(Tensor::from_vec(ids, batch_size, &self.device)?)
    }

    /// Fails unless every value of each sequence in `coefs` is finite once cast to `dtype`.
    pub fn check_representable(&self, coefs: &[Coefficient], dtype: DType) -> Result<()> {
        let limit = max_finite(dtype)?;
        for &coef in coefs {
            let peak = self.max_abs[coef.index()];
            if peak > limit {
                return Err(DiffusionError::config(format!(
                    "{:?} reaches {:e}, which overflows {:?}; use a wider dtype or lower beta_end",
                    coef, peak, dtype
                )));
            }
        }
        Ok(())
    }

    /// Checks `t` against a batch of shape `batch_shape` and returns the host indices.
    ///
    /// This is the only check that copies timesteps off the device.
    pub(crate) fn check_timesteps(&self, t: &Tensor, batch_shape: &[usize]) -> Result<Vec<u32>> {
        check_layout(t, batch_shape)?;
        let ids = t.to_vec1::<u32>()?;
        if let Some(&bad) = ids.iter().find(|&&id| id as usize >= self.num_steps) {
            return Err(DiffusionError::TimestepOutOfRange {
                t: bad as usize,
                num_steps: self.num_steps,
            });
        }
        Ok(ids)
    }

    /// Lookup for timesteps already range-checked by [`check_timesteps`](Self::check_timesteps).
    pub(crate) fn lookup(
        &self,
        coef: Coefficient,
        t: &Tensor,
        batch_shape: &[usize],
        dtype: DType,
    ) -> Result<Tensor> {
        check_layout(t, batch_shape)?;
        self.check_representable(&[coef], dtype)?;
        let picked = self.tables[coef.index()].index_select(t, 0)?;
        Ok(picked.reshape(broadcast_shape(batch_shape))?.to_dtype(dtype)?)
    }

    /// Looks up `coef` at each sample's timestep.
    ///
    /// `t` must be a rank-1 `U32` tensor with one index per sample. The result
    /// has shape `[N, 1, ..., 1]` with the rank of `batch_shape`, so it
    /// broadcasts against the batch's feature dimensions.
    pub fn extract(&self, coef: Coefficient, t: &Tensor, batch_shape: &[usize]) -> Result<Tensor> {
        self.extract_as(coef, t, batch_shape, DType::F64)
    }

    /// Like [`extract`](Self::extract), converted to `dtype`.
    ///
    /// Fails with a config error when the sequence overflows `dtype`.
    pub fn extract_as(
        &self,
        coef: Coefficient,
        t: &Tensor,
        batch_shape: &[usize],
        dtype: DType,
    ) -> Result<Tensor> {
        self.check_timesteps(t, batch_shape)?;
        self.lookup(coef, t, batch_shape, dtype)
    }
}

fn check_layout(t: &Tensor, batch_shape: &[usize]) -> Result<()> {
    let batch_size = match batch_shape.first() {
        Some(&n) => n,
        None => return Err(DiffusionError::config("batch must have a leading batch dimension")),
    };
    if t.dtype() != DType::U32 {
        return Err(DiffusionError::TimestepDType(t.dtype()));
    }
    if t.dims() != [batch_size].as_slice() {
        return Err(DiffusionError::shape("timesteps", &[batch_size], t.dims()));
    }
    Ok(())
}

/// Largest finite magnitude of a float dtype.
fn max_finite(dtype: DType) -> Result<f64> {
    match dtype {
        DType::F64 => Ok(f64::MAX),
        DType::F32 => Ok(f32::MAX as f64),
        DType::BF16 => Ok(3.389_531_389_251_535_5e38),
        DType::F16 => Ok(65_504.0),
        other => Err(DiffusionError::config(format!(
            "coefficients need a float dtype, got {:?}",
            other
        ))),
    }
}

/// `[N, 1, ..., 1]` with the same rank as `batch_shape`.
pub(crate) fn broadcast_shape(batch_shape: &[usize]) -> Vec<usize> {
    let mut shape = vec![1; batch_shape.len().max(1)];
    shape[0] = batch_shape.first().copied().unwrap_or(1);
    shape
}
