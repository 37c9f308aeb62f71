//! Standard-normal draws from an injected random source.
//!
//! Every random tensor in the crate comes through here, so seeding the
//! `Rng` handed to a process reproduces a whole trajectory.

use crate::error::Result;
use candle_core::{DType, Device, Shape, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;

/// Draws i.i.d. N(0, 1) samples of the given shape.
pub fn standard_normal<R, S>(rng: &mut R, shape: S, dtype: DType, device: &Device) -> Result<Tensor>
where
    R: Rng + ?Sized,
    S: Into<Shape>,
{
    let shape = shape.into();
    let values: Vec<f64> = (0..shape.elem_count())
        .map(|_| rng.sample::<f64, _>(StandardNormal))
        .collect();
    let noise = Tensor::from_vec(values, shape, device)?.to_dtype(dtype)?;
    Ok(noise)
}

/// Draws noise matching the shape, dtype and device of `like`.
pub fn standard_normal_like<R: Rng + ?Sized>(rng: &mut R, like: &Tensor) -> Result<Tensor> {
    standard_normal(rng, like.shape().clone(), like.dtype(), like.device())
}
