//! Escalation curve of a policy configuration.

use miette::Result;
use serde::Serialize;

use drover_scheduler::{AcquisitionConfig, AdaptiveBackoffPolicy, SchedulerError};

/// Waits at one escalation level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurvePoint {
    pub level: u32,
    pub idle_wait_ms: u64,
    pub backoff_wait_ms: u64,
}

/// Waits for every level up to the later of the two caps.
pub fn compute(config: &AcquisitionConfig, seed: u64) -> Result<Vec<CurvePoint>, SchedulerError> {
    let mut policy = AdaptiveBackoffPolicy::with_seed(config.clone(), seed)?;
    let levels = policy.max_idle_level().max(policy.max_backoff_level());

    Ok((1..=levels)
        .map(|level| CurvePoint {
            level,
            idle_wait_ms: policy.idle_wait(level).as_millis() as u64,
            backoff_wait_ms: policy.backoff_wait(level).as_millis() as u64,
        })
        .collect())
}

pub fn run(config: AcquisitionConfig, seed: Option<u64>, json: bool) -> Result<()> {
    let points = compute(&config, seed.unwrap_or(0)).map_err(|e| miette::miette!("{}", e))?;

    if json {
        let out = serde_json::to_string_pretty(&points)
            .map_err(|e| miette::miette!("failed to serialize curve: {}", e))?;
        println!("{}", out);
        return Ok(());
    }

    println!("{:>5}  {:>12}  {:>15}", "level", "idle_wait_ms", "backoff_wait_ms");
    for point in &points {
        println!(
            "{:>5}  {:>12}  {:>15}",
            point.level, point.idle_wait_ms, point.backoff_wait_ms
        );
    }
    Ok(())
}
