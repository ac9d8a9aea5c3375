//! Adaptive job-acquisition scheduling for Drover workers.
//!
//! Workers poll a shared job store in cycles. After every cycle the
//! scheduling policy decides how long to wait before polling again and how
//! many jobs each queue should try to lock next:
//! - Backs off while there is no work (idle escalation)
//! - Backs off while the execution side rejects everything it was handed
//!   (saturation escalation)
//! - Shrinks per-queue batches under ordinary lock contention
//! - Unwinds all of the above once cycles are healthy again

mod config;
mod cycle;
mod error;
pub mod memory;
mod outcome;
mod policy;
mod runtime;

pub use config::{AcquisitionConfig, DEFAULT_EXECUTION_SATURATION_WAIT};
pub use cycle::AcquisitionCycle;
pub use error::SchedulerError;
pub use outcome::{AcquisitionOutcome, JobId, JobIdBatch, QueueName};
pub use policy::{AdaptiveBackoffPolicy, SchedulingPolicy};
pub use runtime::{
    AcquisitionLoop, CycleReport, DispatchOutcome, JobAcquirer, JobDispatcher, RejectionHandle,
    WakeHandle,
};
