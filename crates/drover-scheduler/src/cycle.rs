//! Per-cycle scoreboard of acquisition outcomes and rejections.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::{AcquisitionOutcome, JobIdBatch, QueueName};

static EMPTY_OUTCOME: AcquisitionOutcome = AcquisitionOutcome::EMPTY;

/// Everything that happened to every queue during one acquisition cycle.
///
/// The poll loop resets the cycle, submits one outcome per polled queue,
/// records rejections reported by the execution side, and hands the cycle to
/// [`SchedulingPolicy::reconfigure`](crate::SchedulingPolicy::reconfigure).
#[derive(Debug, Clone, Default)]
pub struct AcquisitionCycle {
    outcomes: HashMap<QueueName, AcquisitionOutcome>,
    rejections: HashMap<QueueName, Vec<JobIdBatch>>,
}

impl AcquisitionCycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of this cycle's poll for `queue`.
    ///
    /// A second outcome for the same queue replaces the first.
    pub fn submit_outcome(&mut self, queue: impl Into<QueueName>, outcome: AcquisitionOutcome) {
        let queue = queue.into();
        if let Some(previous) = self.outcomes.insert(queue.clone(), outcome) {
            warn!(
                queue = %queue,
                previous_acquired = previous.acquired(),
                "outcome submitted twice in one cycle, keeping the latest"
            );
        }
    }

    /// Record a batch for `queue` whose lock turned out to be invalid.
    pub fn submit_rejection(&mut self, queue: impl Into<QueueName>, batch: JobIdBatch) {
        let queue = queue.into();
        let rejected = self.rejections.entry(queue).or_default();
        if rejected.contains(&batch) {
            debug!(ids = ?batch.ids(), "ignoring repeated rejection report");
            return;
        }
        rejected.push(batch);
    }

    /// Reject the batch that locked `job_id` for `queue`.
    ///
    /// Returns `false` if this cycle's outcome for the queue never locked the job.
    pub fn invalidate(&mut self, queue: &str, job_id: &str) -> bool {
        let Some(batch) = self
            .outcomes
            .get(queue)
            .and_then(|outcome| outcome.batch_containing(job_id))
            .cloned()
        else {
            return false;
        };

        self.submit_rejection(queue, batch);
        true
    }

    /// Forget all outcomes and rejections.
    pub fn reset(&mut self) {
        self.outcomes.clear();
        self.rejections.clear();
    }

    /// The outcome submitted for `queue`, or the empty outcome if it was skipped.
    pub fn outcome_for(&self, queue: &str) -> &AcquisitionOutcome {
        self.outcomes.get(queue).unwrap_or(&EMPTY_OUTCOME)
    }

    /// Batches rejected for `queue` during this cycle.
    pub fn rejections_for(&self, queue: &str) -> &[JobIdBatch] {
        self.rejections.get(queue).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every queue with an outcome or a rejection, sorted by name.
    pub fn queues(&self) -> BTreeSet<&str> {
        self.outcomes
            .keys()
            .chain(self.rejections.keys())
            .map(String::as_str)
            .collect()
    }

    /// Batches locked across all queues.
    pub fn total_acquired(&self) -> usize {
        self.outcomes.values().map(AcquisitionOutcome::acquired).sum()
    }

    /// Batches rejected across all queues.
    pub fn total_rejected(&self) -> usize {
        self.rejections.values().map(Vec::len).sum()
    }

    /// Whether nothing was locked anywhere.
    pub fn is_idle(&self) -> bool {
        self.total_acquired() == 0
    }
}
