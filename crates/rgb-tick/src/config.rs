//! Scheduler tuning.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SchedulerError, SchedulerResult};

/// Tuning knobs for a [`TickScheduler`](crate::TickScheduler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Grace period a tick's preferred worker gets before others may steal it.
    pub steal_threshold: Duration,
    /// Upper bound of one deferred-task slice run while waiting for a deadline.
    pub task_time_slice: Duration,
    /// Worker threads started on construction.
    pub core_threads: usize,
    /// Worker threads are named `{prefix}-{id}`.
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            steal_threshold: Duration::from_millis(2),
            task_time_slice: Duration::from_micros(100),
            core_threads: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            thread_name_prefix: "rgb-tick".to_owned(),
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub const fn with_steal_threshold(mut self, threshold: Duration) -> Self {
        self.steal_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_task_time_slice(mut self, slice: Duration) -> Self {
        self.task_time_slice = slice;
        self
    }

    #[must_use]
    pub const fn with_core_threads(mut self, threads: usize) -> Self {
        self.core_threads = threads;
        self
    }

    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.task_time_slice.is_zero() {
            return Err(SchedulerError::TimeSlice);
        }
        if self.steal_threshold.as_nanos() > i64::MAX as u128 / 2 {
            return Err(SchedulerError::StealThreshold(self.steal_threshold));
        }
        if self.thread_name_prefix.is_empty() || self.thread_name_prefix.contains('\0') {
            return Err(SchedulerError::ThreadName(self.thread_name_prefix.clone()));
        }
        Ok(())
    }
}
