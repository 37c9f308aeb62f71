use crate::error::{DiffusionError, Result};
use candle_core::{DType, Device, Tensor};

/// Period of the slowest embedding frequency.
pub const MAX_PERIOD: f64 = 10_000.0;

/// Sinusoidal timestep embedding consumed by noise-prediction models.
///
/// Row `i` is `[sin(t_i * f_0), .., sin(t_i * f_{h-1}), cos(t_i * f_0), .., cos(t_i * f_{h-1})]`
/// with `h = dim / 2` and `f_k = exp(-ln(MAX_PERIOD) * k / h)`. An odd `dim`
/// gets a trailing zero column.
pub fn timestep_embedding(t: &Tensor, dim: usize, device: &Device) -> Result<Tensor> {
    if dim == 0 {
        return Err(DiffusionError::config("embedding dimension must be at least 1"));
    }
    if t.rank() != 1 {
        return Err(DiffusionError::shape("timestep_embedding", &[t.elem_count()], t.dims()));
    }

    let steps = t.to_dtype(DType::F64)?.to_vec1::<f64>()?;
    let half = dim / 2;
    let freqs: Vec<f64> = (0..half)
        .map(|k| (-MAX_PERIOD.ln() * k as f64 / half as f64).exp())
        .collect();

    let mut values = Vec::with_capacity(steps.len() * dim);
    for &step in &steps {
        values.extend(freqs.iter().map(|f| (step * f).sin()));
        values.extend(freqs.iter().map(|f| (step * f).cos()));
        if dim % 2 == 1 {
            values.push(0.0);
        }
    }

    Ok(Tensor::from_vec(values, (steps.len(), dim), device)?.to_dtype(DType::F32)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_at_zero() -> Result<()> {
        let device = Device::Cpu;
        let t = Tensor::new(&[0u32], &device)?;
        let emb = timestep_embedding(&t, 8, &device)?.to_vec2::<f32>()?;
        assert_eq!(emb[0], vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_embedding_values() -> Result<()> {
        let device = Device::Cpu;
        let t = Tensor::new(&[3u32, 100], &device)?;
        let emb = timestep_embedding(&t, 4, &device)?.to_vec2::<f32>()?;
        // half = 2: frequencies 1 and 1/100
        assert!((emb[0][0] - 3f32.sin()).abs() < 1e-6);
        assert!((emb[0][1] - 0.03f32.sin()).abs() < 1e-6);
        assert!((emb[1][2] - 100f32.cos()).abs() < 1e-5);
        assert!((emb[1][3] - 1f32.cos()).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_odd_dimension_is_zero_padded() -> Result<()> {
        let device = Device::Cpu;
        let t = Tensor::new(&[7u32, 42, 249], &device)?;
        let emb = timestep_embedding(&t, 5, &device)?;
        assert_eq!(emb.dims(), &[3, 5]);
        for row in emb.to_vec2::<f32>()? {
            assert_eq!(row[4], 0.0);
        }
        let single = timestep_embedding(&t, 1, &device)?.to_vec2::<f32>()?;
        assert!(single.iter().all(|row| row == &vec![0.0]));
        Ok(())
    }

    #[test]
    fn test_embedding_is_deterministic() -> Result<()> {
        let device = Device::Cpu;
        let t = Tensor::new(&[12u32, 13], &device)?;
        let a = timestep_embedding(&t, 16, &device)?.to_vec2::<f32>()?;
        let b = timestep_embedding(&t, 16, &device)?.to_vec2::<f32>()?;
        assert_eq!(a, b);
        assert_ne!(a[0], a[1]);
        assert!(timestep_embedding(&t, 0, &device).is_err());
        Ok(())
    }
}
