//! Scheduler errors

use thiserror::Error;

use super::failure::TaskFailure;
use super::task::TaskPriority;

/// Scheduler result
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler is shut down")]
    Shutdown,

    #[error("Recurring period must be at least one millisecond")]
    InvalidPeriod,

    #[error("Interrupted while waiting for tasks")]
    Interrupted,

    #[error("Failed to start scheduler thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error(transparent)]
    TaskFailed(#[from] TaskFailure),
}

/// A queue bookkeeping defect. Never expected outside of a bug in this crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("queue invariant violated in the {priority} queue set: {detail}")]
pub struct InvariantViolation {
    pub priority: TaskPriority,
    pub detail: String,
}
