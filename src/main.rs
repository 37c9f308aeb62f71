use clap::Parser;
use diffcore::config::{self, DiffusionConfig};
use diffcore::inference;
use diffcore::ScheduleKind;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "diffcore: Gaussian diffusion forward corruption and reverse sampling",
    after_help = "EXAMPLES:
    # Run the full reverse chain with the default linear schedule
    cargo run --release

    # Quadratic schedule, 1000 steps, stop after the first 100 states
    cargo run --release -- --schedule quadratic --steps 1000 --stop-after 100

    # Verbose per-state logging
    RUST_LOG=diffcore=debug cargo run --release"
)]
struct Args {
    /// Number of diffusion timesteps T
    #[arg(long, default_value_t = config::DIFF_STEPS)]
    steps: usize,

    /// Variance schedule kind: linear or quadratic
    #[arg(long, default_value_t = ScheduleKind::Linear, value_parser = parse_schedule)]
    schedule: ScheduleKind,

    /// First beta of the schedule
    #[arg(long, default_value_t = config::BETA_START)]
    beta_start: f64,

    /// Last beta of the schedule
    #[arg(long, default_value_t = config::BETA_END)]
    beta_end: f64,

    /// Feature dimensionality D of each sample
    #[arg(long, default_value_t = config::FEATURE_DIM)]
    dim: usize,

    /// Number of samples N per batch
    #[arg(long, default_value_t = config::BATCH_SIZE)]
    batch_size: usize,

    /// Seed for every random draw
    #[arg(long, default_value_t = config::SEED)]
    seed: u64,

    /// Stop after recording this many states (initial noise included)
    #[arg(long)]
    stop_after: Option<usize>,

    /// Use CUDA GPU acceleration (requires --features cuda at compile time)
    #[arg(long)]
    cuda: bool,
}

fn parse_schedule(s: &str) -> Result<ScheduleKind, String> {
    s.parse::<ScheduleKind>().map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let config = DiffusionConfig {
        schedule: args.schedule,
        beta_start: args.beta_start,
        beta_end: args.beta_end,
        num_steps: args.steps,
        feature_dim: args.dim,
        batch_size: args.batch_size,
        seed: args.seed,
    };

    let (progress_tx, mut progress_rx) = mpsc::channel::<f64>(100);
    let progress = tokio::spawn(async move {
        let mut next_mark = 0.25;
        while let Some(p) = progress_rx.recv().await {
            if p >= next_mark {
                info!("Reverse diffusion {:.0}% done", p * 100.0);
                next_mark += 0.25;
            }
        }
    });

    let result = inference::run_sampling(config, args.stop_after, args.cuda, Some(progress_tx)).await;
    let _ = progress.await;

    match result {
        Ok(report) => {
            info!(
                num_steps = report.num_steps,
                states = report.states.len(),
                completed = report.completed,
                signal_retained = report.signal_retained,
                corrupted_std = report.corrupted_std,
                "Sampling finished"
            );
            for (j, ((p10, p50), p90)) in report
                .p10
                .iter()
                .zip(&report.p50)
                .zip(&report.p90)
                .enumerate()
            {
                info!("Feature {}: P10={:.4}, P50={:.4}, P90={:.4}", j, p10, p50, p90);
            }
            info!("Max abs error vs target: {:.6}", report.max_abs_error);
            Ok(())
        }
        Err(e) => {
            error!("Sampling failed: {}", e);
            Err(e)
        }
    }
}
