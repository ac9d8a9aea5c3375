//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid policy configuration.
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    /// An acquisition outcome locked more batches than it asked for.
    #[error("outcome acquired {acquired} batches but only requested {requested}")]
    InvalidOutcome { requested: usize, acquired: usize },

    /// The job store failed to lock jobs.
    #[error("job acquisition failed: {0}")]
    Acquisition(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
