//! Schedulable ticks.
//!
//! # State machine
//!
//! ```text
//! UNSCHEDULED ──schedule──▶ SCHEDULED ──notify──▶ SCHEDULED_TASKS
//!                              │  ▲                    │
//!                     claim    ▼  │ reinsert           ▼ claim
//!                           TICKING / TASKS ◀──────────┘
//!                              │
//!           cancel mid-run     ▼
//!                   TICKING_CANCELLED / TASKS_CANCELLED ──run ends──▶ CANCELLED
//! ```
//!
//! `CANCELLED` is terminal. A cancel that lands while a run is in progress is
//! parked in a `*_CANCELLED` state and applied exactly once when the run ends.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::clock;
use crate::scheduler::ScheduledTickTask;

/// Periodic work driven by a [`TickScheduler`](crate::TickScheduler).
pub trait SchedulableTick: Send + Sync + 'static {
    /// Run one periodic pass.
    ///
    /// Set the next deadline with [`TickHandle::set_scheduled_start`] before
    /// returning `true`; returning `false` retires the tick.
    fn run_tick(&self, handle: &TickHandle) -> bool;

    /// Whether deferred work is pending.
    fn has_tasks(&self) -> bool;

    /// Run deferred work while `can_continue` returns `true`.
    ///
    /// Returning `false` retires the tick.
    fn run_tasks(&self, handle: &TickHandle, can_continue: &dyn Fn() -> bool) -> bool;
}

/// Scheduling state of a [`TickHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TickState {
    Unscheduled = 0,
    Scheduled = 1,
    ScheduledTasks = 2,
    Ticking = 3,
    Tasks = 4,
    TickingCancelled = 5,
    TasksCancelled = 6,
    Cancelled = 7,
}

impl TickState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unscheduled,
            1 => Self::Scheduled,
            2 => Self::ScheduledTasks,
            3 => Self::Ticking,
            4 => Self::Tasks,
            5 => Self::TickingCancelled,
            6 => Self::TasksCancelled,
            _ => Self::Cancelled,
        }
    }
}

static NEXT_TICK_ID: AtomicU64 = AtomicU64::new(0);

/// Scheduler-facing wrapper around a [`SchedulableTick`].
///
/// The scheduler only keeps weak references; whoever owns the `Arc` keeps the
/// tick alive, and a dropped handle is silently discarded by the workers.
pub struct TickHandle {
    id: u64,
    scheduled_start: AtomicI64,
    state: AtomicU8,
    task: Mutex<Option<Arc<ScheduledTickTask>>>,
    tick: Box<dyn SchedulableTick>,
}

/// Moves the tick to CANCELLED if the user callback unwinds.
struct CancelOnUnwind<'a>(&'a TickHandle);

impl Drop for CancelOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!("tick {} panicked, cancelling", self.0.id);
            self.0.set_state(TickState::Cancelled);
        }
    }
}

impl TickHandle {
    /// Wrap a tick whose first deadline is `start`.
    pub fn new(tick: impl SchedulableTick, start: Instant) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TICK_ID.fetch_add(1, Ordering::Relaxed),
            scheduled_start: AtomicI64::new(clock::to_nanos(start)),
            state: AtomicU8::new(TickState::Unscheduled as u8),
            task: Mutex::new(None),
            tick: Box::new(tick),
        })
    }

    /// Unique id, used to break deadline ties.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> TickState {
        TickState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Queued and waiting for a worker.
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        matches!(
            self.state(),
            TickState::Scheduled | TickState::ScheduledTasks
        )
    }

    /// A cancel was requested (possibly still pending on a running pass).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.state(),
            TickState::TickingCancelled | TickState::TasksCancelled | TickState::Cancelled
        )
    }

    /// Deadline of the next periodic pass.
    #[must_use]
    pub fn scheduled_start(&self) -> Instant {
        clock::from_nanos(self.scheduled_start_nanos())
    }

    /// Set the deadline of the next periodic pass.
    ///
    /// Only meaningful from inside [`SchedulableTick::run_tick`] or before the
    /// tick is scheduled.
    pub fn set_scheduled_start(&self, start: Instant) {
        self.set_scheduled_start_nanos(clock::to_nanos(start));
    }

    pub(crate) fn scheduled_start_nanos(&self) -> i64 {
        self.scheduled_start.load(Ordering::Acquire)
    }

    pub(crate) fn set_scheduled_start_nanos(&self, start: i64) {
        self.scheduled_start.store(start, Ordering::Release);
    }

    #[must_use]
    pub fn has_tasks(&self) -> bool {
        self.tick.has_tasks()
    }

    /// The wrapped tick.
    #[must_use]
    pub fn inner(&self) -> &dyn SchedulableTick {
        &*self.tick
    }

    pub(crate) fn current_task(&self) -> Option<Arc<ScheduledTickTask>> {
        self.task.lock().clone()
    }

    pub(crate) fn set_current_task(&self, task: Arc<ScheduledTickTask>) {
        *self.task.lock() = Some(task);
    }

    fn set_state(&self, state: TickState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: TickState, to: TickState) -> Result<TickState, TickState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(TickState::from_u8)
            .map_err(TickState::from_u8)
    }

    pub(crate) fn set_scheduled(&self) -> bool {
        self.transition(TickState::Unscheduled, TickState::Scheduled)
            .is_ok()
    }

    pub(crate) fn set_scheduled_tasks(&self) -> bool {
        self.transition(TickState::Unscheduled, TickState::ScheduledTasks)
            .is_ok()
    }

    pub(crate) fn upgrade_to_scheduled_tasks(&self) -> bool {
        self.transition(TickState::Scheduled, TickState::ScheduledTasks)
            .is_ok()
    }

    /// Request cancellation. Returns `false` if the tick was never scheduled or
    /// a cancel already happened.
    pub(crate) fn cancel(&self) -> bool {
        let mut current = self.state();
        loop {
            let next = match current {
                TickState::Unscheduled
                | TickState::TickingCancelled
                | TickState::TasksCancelled
                | TickState::Cancelled => return false,
                TickState::Scheduled | TickState::ScheduledTasks => TickState::Cancelled,
                TickState::Ticking => TickState::TickingCancelled,
                TickState::Tasks => TickState::TasksCancelled,
            };
            match self.transition(current, next) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Claim a scheduled tick for a run of kind `to`.
    fn claim(&self, to: TickState) -> bool {
        let mut current = self.state();
        loop {
            match current {
                TickState::Unscheduled => {
                    panic!("tick {} claimed while unscheduled", self.id)
                }
                TickState::Scheduled | TickState::ScheduledTasks => {
                    match self.transition(current, to) {
                        Ok(_) => return true,
                        Err(actual) => current = actual,
                    }
                }
                _ => return false,
            }
        }
    }

    /// Settle after a run of kind `running`; returns whether to reinsert.
    fn finish(&self, running: TickState, cancelled: TickState, keep: bool) -> bool {
        if !keep {
            self.set_state(TickState::Cancelled);
            return false;
        }
        let mut current = self.state();
        loop {
            if current == running {
                match self.transition(running, TickState::Scheduled) {
                    Ok(_) => return true,
                    Err(actual) => current = actual,
                }
            } else if current == cancelled {
                match self.transition(cancelled, TickState::Cancelled) {
                    Ok(_) => return false,
                    Err(actual) => current = actual,
                }
            } else {
                panic!("tick {} in illegal state {current:?} after run", self.id);
            }
        }
    }

    /// Run the periodic pass; returns whether the tick should be reinserted.
    pub(crate) fn tick(&self) -> bool {
        if !self.claim(TickState::Ticking) {
            return false;
        }
        let guard = CancelOnUnwind(self);
        let keep = self.tick.run_tick(self);
        drop(guard);
        self.finish(TickState::Ticking, TickState::TickingCancelled, keep)
    }

    /// Run a deferred-task slice; returns whether the tick should be reinserted.
    pub(crate) fn tasks(&self, can_continue: &dyn Fn() -> bool) -> bool {
        if !self.claim(TickState::Tasks) {
            return false;
        }
        let guard = CancelOnUnwind(self);
        let keep = self.tick.run_tasks(self, can_continue);
        drop(guard);
        self.finish(TickState::Tasks, TickState::TasksCancelled, keep)
    }
}

impl fmt::Debug for TickHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
