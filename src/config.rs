use crate::error::{DiffusionError, Result};
use crate::schedule::{Schedule, ScheduleKind};
use candle_core::Device;
use tracing::{info, warn};

pub fn get_device(use_cuda: bool) -> Device {
    if use_cuda {
        #[cfg(feature = "cuda")]
        {
            match Device::new_cuda(0) {
                Ok(device) => {
                    info!("Using CUDA device 0");
                    return device;
                }
                Err(e) => {
                    warn!("Failed to initialize CUDA: {}. Falling back to CPU.", e);
                }
            }
        }
        #[cfg(not(feature = "cuda"))]
        {
            warn!("--cuda flag set but binary was compiled without the 'cuda' feature. Falling back to CPU.");
        }
    }
    info!("Using CPU device");
    Device::Cpu
}

pub const DIFF_STEPS: usize = 250;
pub const BETA_START: f64 = 1e-4;
pub const BETA_END: f64 = 0.02;
pub const FEATURE_DIM: usize = 2;
pub const BATCH_SIZE: usize = 64;
pub const SEED: u64 = 42;
/// Value every element of the demonstration target batch is set to.
pub const TARGET_VALUE: f64 = 1.0;

/// The tunable options recognized by the core.
#[derive(Clone, Debug, PartialEq)]
pub struct DiffusionConfig {
    pub schedule: ScheduleKind,
    pub beta_start: f64,
    pub beta_end: f64,
    pub num_steps: usize,
    pub feature_dim: usize,
    pub batch_size: usize,
    pub seed: u64,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleKind::Linear,
            beta_start: BETA_START,
            beta_end: BETA_END,
            num_steps: DIFF_STEPS,
            feature_dim: FEATURE_DIM,
            batch_size: BATCH_SIZE,
            seed: SEED,
        }
    }
}

impl DiffusionConfig {
    /// Checks every option eagerly; nothing is corrected silently.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DiffusionError::config("batch size must be at least 1"));
        }
        if self.feature_dim == 0 {
            return Err(DiffusionError::config("feature dimension must be at least 1"));
        }
        self.schedule().map(|_| ())
    }

    pub fn schedule(&self) -> Result<Schedule> {
        Schedule::new(
            self.schedule,
            self.beta_start,
            self.beta_end,
            self.num_steps,
        )
    }

    pub fn batch_shape(&self) -> (usize, usize) {
        (self.batch_size, self.feature_dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() -> Result<()> {
        let config = DiffusionConfig::default();
        config.validate()?;
        assert_eq!(config.schedule()?.len(), DIFF_STEPS);
        assert_eq!(config.batch_shape(), (BATCH_SIZE, FEATURE_DIM));
        Ok(())
    }

    #[test]
    fn test_rejects_zero_sizes_and_bad_bounds() {
        let zero_batch = DiffusionConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(zero_batch.validate(), Err(DiffusionError::Config(_))));

        let zero_dim = DiffusionConfig {
            feature_dim: 0,
            ..Default::default()
        };
        assert!(matches!(zero_dim.validate(), Err(DiffusionError::Config(_))));

        let inverted = DiffusionConfig {
            schedule: ScheduleKind::Quadratic,
            beta_start: 0.02,
            beta_end: 1e-4,
            ..Default::default()
        };
        assert!(matches!(inverted.validate(), Err(DiffusionError::Config(_))));
    }
}
