//! Drover: adaptive job acquisition
//!
//! Main binary with subcommands:
//! - `simulate`: competing workers draining an in-memory job store
//! - `curve`: idle and backoff waits at each escalation level

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use drover_scheduler::AcquisitionConfig;

mod curve;
mod simulate;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "drover")]
#[command(about = "Adaptive job acquisition scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Policy tuning shared by every subcommand.
///
/// Flags override values from `--config`, which override the defaults.
#[derive(Args, Debug, Default)]
struct PolicyArgs {
    /// JSON file with (a subset of) the policy configuration
    #[arg(long, env = "DROVER_CONFIG")]
    config: Option<PathBuf>,

    /// Wait after the first idle cycle, in milliseconds
    #[arg(long, env = "DROVER_BASE_IDLE_WAIT_MS")]
    base_idle_wait_ms: Option<u64>,

    /// Growth of the idle wait per idle cycle
    #[arg(long, env = "DROVER_IDLE_FACTOR")]
    idle_factor: Option<f64>,

    /// Upper bound on the idle wait, in milliseconds
    #[arg(long, env = "DROVER_MAX_IDLE_WAIT_MS")]
    max_idle_wait_ms: Option<u64>,

    /// Base of the saturation backoff, in milliseconds
    #[arg(long, env = "DROVER_BASE_BACKOFF_WAIT_MS")]
    base_backoff_wait_ms: Option<u64>,

    /// Growth of the backoff wait per saturation level
    #[arg(long, env = "DROVER_BACKOFF_FACTOR")]
    backoff_factor: Option<f64>,

    /// Upper bound on the backoff wait, in milliseconds
    #[arg(long, env = "DROVER_MAX_BACKOFF_WAIT_MS")]
    max_backoff_wait_ms: Option<u64>,

    /// Healthy cycles before backoff and throttling unwind one step
    #[arg(long, env = "DROVER_DECREASE_THRESHOLD")]
    decrease_threshold: Option<u32>,

    /// Jobs requested per queue and cycle when not throttled
    #[arg(long, env = "DROVER_BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Wait on the first fully rejected cycle, in milliseconds
    #[arg(long, env = "DROVER_SATURATION_WAIT_MS")]
    saturation_wait_ms: Option<u64>,

    /// Randomize backoff waits.
    /// Accepts "1", "true", "yes", "on" or "0", "false", "no", "off".
    #[arg(long, env = "DROVER_JITTER", value_parser = parse_bool_env)]
    jitter: Option<bool>,
}

impl PolicyArgs {
    /// Build the effective configuration and validate it.
    fn resolve(&self) -> Result<AcquisitionConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path).map_err(|e| {
                    miette::miette!("failed to read config {}: {}", path.display(), e)
                })?;
                AcquisitionConfig::from_json(&json)
                    .map_err(|e| miette::miette!("{}: {}", path.display(), e))?
            }
            None => AcquisitionConfig::default(),
        };

        if let Some(value) = self.base_idle_wait_ms {
            config.base_idle_wait_ms = value;
        }
        if let Some(value) = self.idle_factor {
            config.idle_factor = value;
        }
        if let Some(value) = self.max_idle_wait_ms {
            config.max_idle_wait_ms = value;
        }
        if let Some(value) = self.base_backoff_wait_ms {
            config.base_backoff_wait_ms = value;
        }
        if let Some(value) = self.backoff_factor {
            config.backoff_factor = value;
        }
        if let Some(value) = self.max_backoff_wait_ms {
            config.max_backoff_wait_ms = value;
        }
        if let Some(value) = self.decrease_threshold {
            config.decrease_threshold = value;
        }
        if let Some(value) = self.batch_size {
            config.default_batch_size = value;
        }
        if let Some(value) = self.saturation_wait_ms {
            config.saturation_wait_ms = value;
        }
        if let Some(value) = self.jitter {
            config.jitter_enabled = value;
        }

        config.validate().map_err(|e| miette::miette!("{}", e))?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run competing workers against an in-memory job store
    Simulate {
        #[command(flatten)]
        policy: PolicyArgs,

        /// Number of competing workers
        #[arg(long, default_value = "3")]
        workers: usize,

        /// Jobs to enqueue, spread across the queues
        #[arg(long, default_value = "200")]
        jobs: usize,

        /// Number of queues each worker polls
        #[arg(long, default_value = "2")]
        queues: usize,

        /// Execution slots per worker
        #[arg(long, default_value = "4")]
        pool_size: usize,

        /// Job lock expiry in milliseconds
        #[arg(long, default_value = "2000")]
        lock_time_ms: u64,

        /// Simulated execution time per job in milliseconds
        #[arg(long, default_value = "50")]
        work_time_ms: u64,

        /// Stop once every worker has run this many cycles
        #[arg(long)]
        max_cycles: Option<u64>,

        /// Stop after this many seconds even if jobs remain
        #[arg(long, default_value = "60")]
        timeout_secs: u64,

        /// Print cycle reports as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Print the wait at each escalation level of a policy
    Curve {
        #[command(flatten)]
        policy: PolicyArgs,

        /// Seed for backoff jitter
        #[arg(long)]
        seed: Option<u64>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "drover=info,drover_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            policy,
            workers,
            jobs,
            queues,
            pool_size,
            lock_time_ms,
            work_time_ms,
            max_cycles,
            timeout_secs,
            json,
        } => {
            let config = policy.resolve()?;
            let options = simulate::SimulateOptions {
                workers,
                jobs,
                queues,
                pool_size,
                lock_time: Duration::from_millis(lock_time_ms),
                work_time: Duration::from_millis(work_time_ms),
                max_cycles,
                timeout: Duration::from_secs(timeout_secs),
                json,
            };
            simulate::run(config, options).await
        }

        Commands::Curve { policy, seed, json } => {
            let config = policy.resolve()?;
            curve::run(config, seed, json)
        }
    }
}
