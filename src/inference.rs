use crate::coefficients::{Coefficient, CoefficientSet};
use crate::config::{get_device, DiffusionConfig, TARGET_VALUE};
use crate::error::DiffusionError;
use crate::forward::ForwardProcess;
use crate::predictor::OraclePredictor;
use crate::reverse::ReverseProcess;
use anyhow::Result;
use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc::Sender;
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct StateStats {
    pub mean: f64,
    pub std: f64,
}

#[derive(Clone, Debug)]
pub struct SamplingReport {
    pub num_steps: usize,
    /// `sqrt_cumprod` at the last timestep: how much of the data survives full corruption.
    pub signal_retained: f64,
    /// Std of a target batch after forward corruption to the last timestep.
    pub corrupted_std: f64,
    pub states: Vec<StateStats>,
    pub p10: Vec<f64>, // per feature, over the final batch
    pub p50: Vec<f64>,
    pub p90: Vec<f64>,
    pub max_abs_error: f64,
    pub completed: bool,
}

/// Corrupts a constant target batch, then runs the reverse chain back from
/// pure noise with an oracle predictor, reporting per-state statistics.
///
/// `stop_after` caps the number of recorded states (initial noise included).
pub async fn run_sampling(
    config: DiffusionConfig,
    stop_after: Option<usize>,
    use_cuda: bool,
    progress_tx: Option<Sender<f64>>,
) -> Result<SamplingReport> {
    config.validate()?;
    if stop_after == Some(0) {
        return Err(DiffusionError::Config("stop_after must record at least one state".into()).into());
    }
    let report = tokio::task::spawn_blocking(move || {
        sample_blocking(&config, stop_after, use_cuda, progress_tx)
    })
    .await??;
    Ok(report)
}

fn sample_blocking(
    config: &DiffusionConfig,
    stop_after: Option<usize>,
    use_cuda: bool,
    progress_tx: Option<Sender<f64>>,
) -> Result<SamplingReport> {
    let device = get_device(use_cuda);
    let schedule = config.schedule()?;
    let coefficients = CoefficientSet::new(&schedule, &device)?;
    let num_steps = coefficients.num_steps();
    let (batch_size, feature_dim) = config.batch_shape();
    let mut rng = StdRng::seed_from_u64(config.seed);

    let target = (Tensor::ones((batch_size, feature_dim), DType::F32, &device)? * TARGET_VALUE)?;

    // 1. Forward: how much signal survives at the last timestep
    let forward = ForwardProcess::new(&coefficients);
    let t_last = coefficients.timesteps(num_steps - 1, batch_size)?;
    let corrupted = forward.corrupt_with_rng(&target, &t_last, &mut rng)?;
    let corrupted_std = summarize(&corrupted)?.std;
    let signal_retained = coefficients.values(Coefficient::SqrtCumprod)[num_steps - 1];
    info!(
        schedule = %schedule.kind(),
        num_steps,
        signal_retained,
        corrupted_std,
        "Forward corruption to last timestep"
    );

    // 2. Reverse: from fresh noise back to the target
    let reverse = ReverseProcess::new(&coefficients);
    let oracle = OraclePredictor::new(&coefficients, target.clone());
    let total_states = stop_after.unwrap_or(num_steps + 1).min(num_steps + 1);

    let mut stats = Vec::with_capacity(total_states);
    let mut last_state = None;
    for (i, state) in reverse
        .steps(&oracle, &[batch_size, feature_dim], &mut rng)?
        .take(total_states)
        .enumerate()
    {
        let state = state?;
        let summary = summarize(&state)?;
        debug!(state = i, mean = summary.mean, std = summary.std, "Recorded state");
        stats.push(summary);
        last_state = Some(state);

        if let Some(tx) = &progress_tx {
            let _ = tx.blocking_send((i + 1) as f64 / total_states as f64);
        }
    }
    let last_state = last_state.ok_or_else(|| anyhow::anyhow!("No states were produced"))?;

    // 3. Percentiles of the final batch, per feature
    let rows = last_state.to_dtype(DType::F64)?.to_vec2::<f64>()?;
    let mut p10 = Vec::with_capacity(feature_dim);
    let mut p50 = Vec::with_capacity(feature_dim);
    let mut p90 = Vec::with_capacity(feature_dim);
    for j in 0..feature_dim {
        let mut column: Vec<f64> = rows.iter().map(|r| r[j]).collect();
        column.sort_by(|a, b| a.total_cmp(b));
        let at = |q: f64| column[((batch_size as f64 * q) as usize).min(batch_size - 1)];
        p10.push(at(0.1));
        p50.push(at(0.5));
        p90.push(at(0.9));
    }

    let max_abs_error = rows
        .iter()
        .flatten()
        .map(|v| (v - TARGET_VALUE).abs())
        .fold(0.0f64, f64::max);

    Ok(SamplingReport {
        num_steps,
        signal_retained,
        corrupted_std,
        completed: stats.len() == num_steps + 1,
        states: stats,
        p10,
        p50,
        p90,
        max_abs_error,
    })
}

fn summarize(state: &Tensor) -> Result<StateStats> {
    let values = state.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Ok(StateStats {
        mean,
        std: variance.sqrt(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn small_config() -> DiffusionConfig {
        DiffusionConfig {
            num_steps: 50,
            batch_size: 16,
            feature_dim: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_full_run_reaches_target() -> Result<()> {
        let (tx, mut rx) = mpsc::channel(128);
        let report = run_sampling(small_config(), None, false, Some(tx)).await?;

        assert!(report.completed);
        assert_eq!(report.states.len(), 51);
        assert!(report.max_abs_error < 1e-3, "error {}", report.max_abs_error);
        for p in &report.p50 {
            assert!((p - TARGET_VALUE).abs() < 1e-3);
        }

        let mut last = 0.0;
        while let Some(p) = rx.recv().await {
            assert!(p >= last);
            last = p;
        }
        assert_eq!(last, 1.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_early_stop_keeps_recorded_states() -> Result<()> {
        let report = run_sampling(small_config(), Some(10), false, None).await?;
        assert!(!report.completed);
        assert_eq!(report.states.len(), 10);
        // initial state is standard noise, far from the constant target
        assert!(report.states[0].std > 0.5);
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_stop_after_rejected_before_sampling() {
        let (tx, mut rx) = mpsc::channel(8);
        let err = run_sampling(small_config(), Some(0), false, Some(tx))
            .await
            .expect_err("zero states requested");
        assert!(matches!(
            err.downcast_ref::<DiffusionError>(),
            Some(DiffusionError::Config(_))
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let config = DiffusionConfig {
            beta_start: 0.5,
            beta_end: 0.1,
            ..Default::default()
        };
        assert!(run_sampling(config, None, false, None).await.is_err());
    }
}
