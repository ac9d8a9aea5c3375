//! Per-queue acquisition outcomes.

use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Identifier of a job in the shared job table.
pub type JobId = String;

/// Name of one logical job stream.
pub type QueueName = String;

/// Job ids locked together in a single lock attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobIdBatch(Vec<JobId>);

impl JobIdBatch {
    /// Create a batch from the given ids.
    pub fn new(ids: Vec<JobId>) -> Self {
        Self(ids)
    }

    /// Create a batch holding a single job.
    pub fn single(id: impl Into<JobId>) -> Self {
        Self(vec![id.into()])
    }

    pub fn ids(&self) -> &[JobId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.0.iter().any(|id| id == job_id)
    }
}

impl From<Vec<JobId>> for JobIdBatch {
    fn from(ids: Vec<JobId>) -> Self {
        Self(ids)
    }
}

/// What one poll of one queue asked for and what it actually locked.
///
/// Outcomes are snapshots: once built they never change. Locks that turn out
/// to be stale are reported to the [`AcquisitionCycle`](crate::AcquisitionCycle)
/// instead of being removed from the outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionOutcome {
    requested: usize,
    batches: Vec<JobIdBatch>,
}

impl AcquisitionOutcome {
    /// The outcome of a queue that requested nothing and locked nothing.
    pub const EMPTY: AcquisitionOutcome = AcquisitionOutcome {
        requested: 0,
        batches: Vec::new(),
    };

    /// Create an outcome, checking that no more batches were locked than requested.
    pub fn new(requested: usize, batches: Vec<JobIdBatch>) -> Result<Self, SchedulerError> {
        if batches.len() > requested {
            return Err(SchedulerError::InvalidOutcome {
                requested,
                acquired: batches.len(),
            });
        }
        Ok(Self { requested, batches })
    }

    pub fn empty() -> Self {
        Self::EMPTY
    }

    /// Capacity asked for in this poll.
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Locked batches, in lock order.
    pub fn batches(&self) -> &[JobIdBatch] {
        &self.batches
    }

    /// Number of locked batches.
    pub fn acquired(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// All locked job ids, flattened in lock order.
    pub fn job_ids(&self) -> impl Iterator<Item = &JobId> {
        self.batches.iter().flat_map(|batch| batch.ids().iter())
    }

    /// Find the batch a job was locked in.
    pub fn batch_containing(&self, job_id: &str) -> Option<&JobIdBatch> {
        self.batches.iter().find(|batch| batch.contains(job_id))
    }
}
