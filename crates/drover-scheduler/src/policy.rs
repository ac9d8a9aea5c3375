//! Scheduling policies: how long to wait and how much to ask for next.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::{AcquisitionConfig, AcquisitionCycle, QueueName, SchedulerError};

/// Decides the wait between polls and the per-queue batch sizes.
///
/// One policy instance belongs to one scheduling loop and may serve several
/// queues. Only [`reconfigure`](Self::reconfigure) mutates it.
pub trait SchedulingPolicy: Send {
    /// Fold the results of a finished cycle into the policy state.
    fn reconfigure(&mut self, cycle: &AcquisitionCycle);

    /// Wait before the next poll, as computed by the last `reconfigure`.
    fn wait_time(&self) -> Duration;

    /// Capacity the next poll of `queue` should request. Always at least 1.
    fn batch_size(&self, queue: &str) -> usize;
}

/// How contended a cycle was, from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Contention {
    None,
    Partial,
    Saturated,
}

/// Reduced batch size for a queue that saw partial rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueThrottle {
    batch_size: usize,
    healthy_cycles: u32,
}

/// Policy with an idle track, a saturation track and per-queue batch throttling.
///
/// - Idle: every cycle that locks nothing anywhere raises the idle level;
///   any locked job drops it back to zero.
/// - Saturation: a cycle in which some queue had every locked job rejected
///   raises the backoff level; `decrease_threshold` consecutive cycles without
///   rejections lower it by one.
/// - Throttling: a queue with some (not all) jobs rejected requests fewer jobs
///   next time, and doubles back toward the default after each window of
///   `decrease_threshold` rejection-free cycles.
///
/// The wait is the larger of the idle wait and the backoff wait.
pub struct AdaptiveBackoffPolicy {
    config: AcquisitionConfig,
    max_idle_level: u32,
    max_backoff_level: u32,
    idle_level: u32,
    backoff_level: u32,
    healthy_cycles: u32,
    throttles: HashMap<QueueName, QueueThrottle>,
    wait: Duration,
    rng: StdRng,
}

impl fmt::Debug for AdaptiveBackoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveBackoffPolicy")
            .field("idle_level", &self.idle_level)
            .field("max_idle_level", &self.max_idle_level)
            .field("backoff_level", &self.backoff_level)
            .field("max_backoff_level", &self.max_backoff_level)
            .field("healthy_cycles", &self.healthy_cycles)
            .field("throttled_queues", &self.throttles.len())
            .field("wait", &self.wait)
            .finish()
    }
}

impl AdaptiveBackoffPolicy {
    /// Create a policy, failing if the configuration is inconsistent.
    pub fn new(config: AcquisitionConfig) -> Result<Self, SchedulerError> {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Create a policy whose jitter is reproducible.
    pub fn with_seed(config: AcquisitionConfig, seed: u64) -> Result<Self, SchedulerError> {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: AcquisitionConfig, rng: StdRng) -> Result<Self, SchedulerError> {
        config.validate()?;

        let max_idle_level = max_level(
            config.base_idle_wait_ms,
            config.idle_factor,
            config.max_idle_wait_ms,
        );
        let max_backoff_level = max_level(
            config.base_backoff_wait_ms,
            config.backoff_factor,
            config.max_backoff_wait_ms,
        );

        Ok(Self {
            config,
            max_idle_level,
            max_backoff_level,
            idle_level: 0,
            backoff_level: 0,
            healthy_cycles: 0,
            throttles: HashMap::new(),
            wait: Duration::ZERO,
            rng,
        })
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn idle_level(&self) -> u32 {
        self.idle_level
    }

    pub fn backoff_level(&self) -> u32 {
        self.backoff_level
    }

    /// Level at which the idle wait reaches its cap.
    pub fn max_idle_level(&self) -> u32 {
        self.max_idle_level
    }

    /// Level at which the backoff wait reaches its cap.
    pub fn max_backoff_level(&self) -> u32 {
        self.max_backoff_level
    }

    /// Idle wait for a given idle level.
    ///
    /// The first idle level waits exactly `base_idle_wait`; each further level
    /// multiplies by `idle_factor`, truncated to whole milliseconds and capped
    /// at `max_idle_wait`.
    pub fn idle_wait(&self, level: u32) -> Duration {
        if level == 0 {
            return Duration::ZERO;
        }
        let millis = scaled_millis(
            self.config.base_idle_wait_ms,
            self.config.idle_factor,
            level.min(self.max_idle_level),
        );
        Duration::from_millis(millis.min(self.config.max_idle_wait_ms))
    }

    /// Backoff wait for a given backoff level.
    ///
    /// Level 1 is the first saturated cycle and waits the fixed saturation
    /// wait. Levels at or past the cap wait `max_backoff_wait`. Levels in
    /// between grow exponentially, plus up to half again as much jitter when
    /// enabled.
    pub fn backoff_wait(&mut self, level: u32) -> Duration {
        match level {
            0 => Duration::ZERO,
            1 => self.config.saturation_wait(),
            level if level >= self.max_backoff_level => self.config.max_backoff_wait(),
            level => {
                let base = scaled_millis(
                    self.config.base_backoff_wait_ms,
                    self.config.backoff_factor,
                    level,
                );
                let mut millis = base;
                if self.config.jitter_enabled {
                    millis = millis.saturating_add(self.rng.gen_range(0..=base / 2));
                }
                Duration::from_millis(millis.min(self.config.max_backoff_wait_ms))
            }
        }
    }

    fn reconfigure_idle_level(&mut self, cycle: &AcquisitionCycle) {
        if cycle.is_idle() {
            if self.idle_level < self.max_idle_level {
                self.idle_level += 1;
            }
        } else if self.idle_level > 0 {
            debug!(previous = self.idle_level, "jobs acquired, leaving idle");
            self.idle_level = 0;
        }
    }

    /// Throttle partially rejected queues and relax healthy ones.
    fn reconfigure_throttles(&mut self, cycle: &AcquisitionCycle) -> Contention {
        let mut contention = Contention::None;

        for queue in cycle.queues() {
            let rejections = cycle.rejections_for(queue);
            if rejections.is_empty() {
                continue;
            }
            let outcome = cycle.outcome_for(queue);
            let acquired = outcome.acquired();
            // Batches this cycle never locked were reported late for an earlier cycle.
            let rejected = rejections
                .iter()
                .filter(|batch| outcome.batches().contains(batch))
                .count();

            if rejected == 0 {
                debug!(
                    queue,
                    late = rejections.len(),
                    "rejections for locks from an earlier cycle"
                );
                if let Some(throttle) = self.throttles.get_mut(queue) {
                    throttle.healthy_cycles = 0;
                }
                contention = contention.max(Contention::Partial);
            } else if rejected < acquired {
                let batch_size = (acquired - rejected).min(self.batch_size(queue)).max(1);
                debug!(queue, acquired, rejected, batch_size, "throttling contended queue");
                if batch_size < self.config.default_batch_size {
                    self.throttles.insert(
                        queue.to_string(),
                        QueueThrottle {
                            batch_size,
                            healthy_cycles: 0,
                        },
                    );
                } else {
                    self.throttles.remove(queue);
                }
                contention = contention.max(Contention::Partial);
            } else {
                debug!(queue, acquired, rejected, "every locked job rejected");
                if let Some(throttle) = self.throttles.get_mut(queue) {
                    throttle.healthy_cycles = 0;
                }
                contention = Contention::Saturated;
            }
        }

        let default_batch_size = self.config.default_batch_size;
        let threshold = self.config.decrease_threshold;
        self.throttles.retain(|queue, throttle| {
            if !cycle.rejections_for(queue).is_empty() {
                return true;
            }
            throttle.healthy_cycles = throttle.healthy_cycles.saturating_add(1);
            if throttle.healthy_cycles < threshold {
                return true;
            }
            throttle.healthy_cycles = 0;
            throttle.batch_size = throttle
                .batch_size
                .saturating_mul(2)
                .min(default_batch_size);
            debug!(queue = %queue, batch_size = throttle.batch_size, "relaxing throttle");
            throttle.batch_size < default_batch_size
        });

        contention
    }

    fn reconfigure_backoff_level(&mut self, contention: Contention) {
        match contention {
            Contention::Saturated => {
                if self.backoff_level < self.max_backoff_level {
                    self.backoff_level += 1;
                    debug!(level = self.backoff_level, "execution saturated, backing off");
                }
                self.healthy_cycles = 0;
            }
            Contention::Partial => self.healthy_cycles = 0,
            Contention::None => {
                if self.backoff_level == 0 {
                    return;
                }
                self.healthy_cycles = self.healthy_cycles.saturating_add(1);
                if self.healthy_cycles >= self.config.decrease_threshold {
                    self.backoff_level -= 1;
                    self.healthy_cycles = 0;
                    debug!(level = self.backoff_level, "unwinding backoff");
                }
            }
        }
    }
}

impl SchedulingPolicy for AdaptiveBackoffPolicy {
    fn reconfigure(&mut self, cycle: &AcquisitionCycle) {
        self.reconfigure_idle_level(cycle);
        let contention = self.reconfigure_throttles(cycle);
        self.reconfigure_backoff_level(contention);

        let idle_wait = self.idle_wait(self.idle_level);
        let backoff_wait = self.backoff_wait(self.backoff_level);
        self.wait = idle_wait.max(backoff_wait);
    }

    fn wait_time(&self) -> Duration {
        self.wait
    }

    fn batch_size(&self, queue: &str) -> usize {
        self.throttles
            .get(queue)
            .map(|throttle| throttle.batch_size)
            .unwrap_or(self.config.default_batch_size)
            .max(1)
    }
}

/// `base * factor^(level - 1)` in whole milliseconds.
fn scaled_millis(base_ms: u64, factor: f64, level: u32) -> u64 {
    let exponent = level.saturating_sub(1);
    let scale = match i32::try_from(exponent) {
        Ok(exponent) => factor.powi(exponent),
        Err(_) => factor.powf(f64::from(exponent)),
    };
    // `as` saturates, so an overflowing product lands on u64::MAX.
    (base_ms as f64 * scale) as u64
}

/// Smallest level whose unclamped wait reaches `max_ms`.
///
/// Estimated as `ceil(log_factor(max / base)) + 1`, then corrected against
/// [`scaled_millis`] since truncation to whole milliseconds can shift the
/// boundary by a level. Saturates at `u32::MAX` for factors barely above 1.
fn max_level(base_ms: u64, factor: f64, max_ms: u64) -> u32 {
    if base_ms == 0 || base_ms >= max_ms {
        return 1;
    }
    let estimate = ((max_ms as f64 / base_ms as f64).ln() / factor.ln()).ceil() + 1.0;
    let mut level = (estimate as u32).max(2);
    while level > 2 && scaled_millis(base_ms, factor, level - 1) >= max_ms {
        level -= 1;
    }
    while level < u32::MAX && scaled_millis(base_ms, factor, level) < max_ms {
        level += 1;
    }
    level
}
