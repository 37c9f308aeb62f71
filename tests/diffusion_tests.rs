use candle_core::{DType, Device, Tensor};
use diffcore::embedding::timestep_embedding;
use diffcore::{
    Coefficient, CoefficientSet, DiffusionError, ForwardProcess, NoisePredictor, OraclePredictor,
    Result, ReverseProcess, Schedule, ScheduleKind,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn device() -> Device {
    Device::Cpu
}

#[test]
fn reference_schedule_scenario() -> Result<()> {
    let schedule = Schedule::new(ScheduleKind::Linear, 1e-4, 0.02, 250)?;
    let set = CoefficientSet::new(&schedule, &device())?;
    assert!((set.values(Coefficient::Cumprod)[0] - 0.9999).abs() < 1e-12);
    assert_eq!(set.values(Coefficient::PosteriorVariance)[0], 0.0);
    assert_eq!(set.values(Coefficient::PosteriorLogVarianceClipped)[0], 1e-20f64.ln());

    let x0 = Tensor::new(&[[1.0f32, 1.0]], &device())?;
    let x_t = ForwardProcess::new(&set).corrupt(&x0, &set.timesteps(0, 1)?, &x0.zeros_like()?)?;
    for v in x_t.to_vec2::<f32>()?.concat() {
        assert!((v - 0.99995).abs() < 1e-5);
    }
    Ok(())
}

#[test]
fn one_cache_shared_by_both_processes() -> Result<()> {
    let schedule = Schedule::new(ScheduleKind::Quadratic, 1e-4, 0.02, 100)?;
    let set = CoefficientSet::new(&schedule, &device())?;
    let forward = ForwardProcess::new(&set);
    let reverse = ReverseProcess::new(&set).with_dtype(DType::F64);
    let mut rng = StdRng::seed_from_u64(99);

    let x0 = Tensor::new(&[[0.2f64, -0.4, 1.1], [2.0, 0.0, -3.0]], &device())?;
    let t = Tensor::new(&[17u32, 83], &device())?;
    let (x_t, eps) = forward.corrupt_pair(&x0, &t, &mut rng)?;
    let x0_hat = reverse.reconstruct_origin(&x_t, &t, &eps)?;
    let diff = (x0_hat - &x0)?.abs()?.flatten_all()?.to_vec1::<f64>()?;
    assert!(diff.iter().all(|d| *d < 1e-9));

    let oracle = OraclePredictor::new(&set, x0.clone());
    let trajectory = reverse.run_trajectory(&oracle, &[2, 3], &mut rng)?;
    assert_eq!(trajectory.len(), 101);
    let err = (trajectory.final_state() - &x0)?.abs()?.flatten_all()?.to_vec1::<f64>()?;
    assert!(err.iter().all(|d| *d < 1e-6));
    Ok(())
}

/// A predictor built from the timestep embedding, standing in for an external model.
struct EmbeddingPredictor {
    device: Device,
}

impl NoisePredictor for EmbeddingPredictor {
    fn predict_noise(&self, x_t: &Tensor, t: &Tensor) -> Result<Tensor> {
        let dim = x_t.dims()[1];
        let emb = timestep_embedding(t, dim, &self.device)?.to_dtype(x_t.dtype())?;
        Ok((x_t * 0.1)?.broadcast_add(&emb)?)
    }
}

#[test]
fn external_predictor_drives_lazy_chain() -> Result<()> {
    let schedule = Schedule::new(ScheduleKind::Linear, 1e-4, 0.02, 40)?;
    let set = CoefficientSet::new(&schedule, &device())?;
    let reverse = ReverseProcess::new(&set);
    let predictor = EmbeddingPredictor { device: device() };
    let mut rng = StdRng::seed_from_u64(5);

    let states: Vec<Tensor> = reverse
        .steps(&predictor, &[4, 3], &mut rng)?
        .take(12)
        .collect::<Result<_>>()?;
    assert_eq!(states.len(), 12);
    assert!(states.iter().all(|s| s.dims() == &[4, 3]));
    Ok(())
}

#[test]
fn invalid_inputs_fail_eagerly() -> Result<()> {
    assert!(matches!(
        Schedule::new(ScheduleKind::Linear, 0.02, 1e-4, 10),
        Err(DiffusionError::Config(_))
    ));
    assert!(matches!("cosine".parse::<ScheduleKind>(), Err(DiffusionError::Config(_))));

    let schedule = Schedule::new(ScheduleKind::Linear, 1e-4, 0.02, 10)?;
    let set = CoefficientSet::new(&schedule, &device())?;
    let forward = ForwardProcess::new(&set);
    let x0 = Tensor::ones((3, 2), DType::F32, &device())?;
    let noise = Tensor::ones((2, 2), DType::F32, &device())?;
    assert!(matches!(
        forward.corrupt(&x0, &set.timesteps(1, 3)?, &noise),
        Err(DiffusionError::Shape { .. })
    ));
    Ok(())
}
