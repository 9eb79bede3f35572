//! Scheduler and queue error types.

use std::time::Duration;

use thiserror::Error;

/// Scheduler construction and scheduling failures.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Task slices must make progress.
    #[error("task time slice must be > 0")]
    TimeSlice,

    /// Thresholds are stored as signed nanoseconds.
    #[error("steal threshold {0:?} is too large")]
    StealThreshold(Duration),

    /// Region ticks need a period.
    #[error("tick interval must be > 0")]
    TickInterval,

    /// Thread names must be non-empty and contain no NUL bytes.
    #[error("invalid thread name prefix {0:?}")]
    ThreadName(String),

    /// The tick was already scheduled, is running, or was cancelled.
    #[error("tick {0} is already scheduled")]
    AlreadyScheduled(u64),

    /// The OS refused to start a worker thread.
    #[error("failed to spawn tick runner: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Rejected [`DynamicPriorityQueue`](crate::DynamicPriorityQueue) insertion.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("element already queued")]
    Duplicate,

    #[error("priority {priority} out of range 0..{max}")]
    PriorityOutOfRange { priority: usize, max: usize },
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
