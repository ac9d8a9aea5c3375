//! Policy configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Wait applied on the first fully rejected cycle, giving the execution pool
/// room to drain before exponential backoff takes over.
pub const DEFAULT_EXECUTION_SATURATION_WAIT: Duration = Duration::from_millis(100);

/// Tuning knobs for [`AdaptiveBackoffPolicy`](crate::AdaptiveBackoffPolicy).
///
/// All fields carry defaults, so a JSON document only needs the values it
/// overrides. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Wait after the first idle cycle.
    pub base_idle_wait_ms: u64,
    /// Growth of the idle wait per further idle cycle.
    pub idle_factor: f64,
    /// Upper bound on the idle wait.
    pub max_idle_wait_ms: u64,
    /// Base of the exponential backoff; level `L` waits `base * factor^(L-1)`.
    pub base_backoff_wait_ms: u64,
    /// Growth of the backoff wait per saturation level.
    pub backoff_factor: f64,
    /// Upper bound on the backoff wait.
    pub max_backoff_wait_ms: u64,
    /// Healthy cycles needed before escalation unwinds one step.
    pub decrease_threshold: u32,
    /// Batch size of a queue that has not been throttled.
    pub default_batch_size: usize,
    /// Randomize backoff waits to decorrelate competing workers.
    pub jitter_enabled: bool,
    /// Wait on the first fully rejected cycle.
    pub saturation_wait_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            base_idle_wait_ms: 5_000,
            idle_factor: 2.0,
            max_idle_wait_ms: 60_000,
            base_backoff_wait_ms: 100,
            backoff_factor: 2.0,
            max_backoff_wait_ms: 5_000,
            decrease_threshold: 100,
            default_batch_size: 3,
            jitter_enabled: true,
            saturation_wait_ms: DEFAULT_EXECUTION_SATURATION_WAIT.as_millis() as u64,
        }
    }
}

impl AcquisitionConfig {
    /// Parse a (possibly partial) JSON configuration and validate it.
    pub fn from_json(json: &str) -> Result<Self, SchedulerError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration describes a consistent policy.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        check_factor("idle_factor", self.idle_factor)?;
        check_factor("backoff_factor", self.backoff_factor)?;

        if self.max_idle_wait_ms < self.base_idle_wait_ms {
            return Err(SchedulerError::InvalidConfig(format!(
                "max_idle_wait_ms ({}) is below base_idle_wait_ms ({})",
                self.max_idle_wait_ms, self.base_idle_wait_ms
            )));
        }
        if self.max_backoff_wait_ms < self.base_backoff_wait_ms {
            return Err(SchedulerError::InvalidConfig(format!(
                "max_backoff_wait_ms ({}) is below base_backoff_wait_ms ({})",
                self.max_backoff_wait_ms, self.base_backoff_wait_ms
            )));
        }
        if self.decrease_threshold < 1 {
            return Err(SchedulerError::InvalidConfig(
                "decrease_threshold must be at least 1".to_string(),
            ));
        }
        if self.default_batch_size < 1 {
            return Err(SchedulerError::InvalidConfig(
                "default_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn base_idle_wait(&self) -> Duration {
        Duration::from_millis(self.base_idle_wait_ms)
    }

    pub fn max_idle_wait(&self) -> Duration {
        Duration::from_millis(self.max_idle_wait_ms)
    }

    pub fn base_backoff_wait(&self) -> Duration {
        Duration::from_millis(self.base_backoff_wait_ms)
    }

    pub fn max_backoff_wait(&self) -> Duration {
        Duration::from_millis(self.max_backoff_wait_ms)
    }

    pub fn saturation_wait(&self) -> Duration {
        Duration::from_millis(self.saturation_wait_ms)
    }
}

fn check_factor(name: &str, factor: f64) -> Result<(), SchedulerError> {
    if !factor.is_finite() || factor <= 1.0 {
        return Err(SchedulerError::InvalidConfig(format!(
            "{name} must be a finite number greater than 1, got {factor}"
        )));
    }
    Ok(())
}
