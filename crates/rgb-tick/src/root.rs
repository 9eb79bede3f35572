//! Non-partitioned periodic tick for global work.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;

use crate::clock;
use crate::tasks::Task;
use crate::tick::{SchedulableTick, TickHandle};

struct RootInner {
    interval: i64,
    body: Box<dyn Fn(u64) -> bool + Send + Sync>,
    ticks: AtomicU64,
    tasks: SegQueue<Task>,
}

/// A tick that runs `body` every interval alongside region ticks, with a FIFO
/// of deferred tasks. Clones share state.
#[derive(Clone)]
pub struct RootTick {
    inner: Arc<RootInner>,
}

impl RootTick {
    /// `body` receives the pass number and returns `false` to retire.
    pub fn new(interval: Duration, body: impl Fn(u64) -> bool + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(RootInner {
                interval: clock::duration_nanos(interval),
                body: Box::new(body),
                ticks: AtomicU64::new(0),
                tasks: SegQueue::new(),
            }),
        }
    }

    /// Wrap a clone for scheduling, first due at `start`. The tick only runs
    /// while the returned handle is kept alive.
    #[must_use]
    pub fn handle(&self, start: Instant) -> Arc<TickHandle> {
        TickHandle::new(self.clone(), start)
    }

    /// Queue deferred work. Call
    /// [`TickScheduler::notify_tasks`](crate::TickScheduler::notify_tasks)
    /// to have it picked up before the next pass.
    pub fn queue_task(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.tasks.push(Box::new(task));
    }

    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.inner.ticks.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.inner.tasks.len()
    }
}

impl SchedulableTick for RootTick {
    fn run_tick(&self, handle: &TickHandle) -> bool {
        let inner = &self.inner;
        for _ in 0..inner.tasks.len() {
            match inner.tasks.pop() {
                Some(task) => task(),
                None => break,
            }
        }

        let tick = inner.ticks.fetch_add(1, Ordering::AcqRel);
        let keep = (inner.body)(tick);
        handle.set_scheduled_start_nanos(clock::next_deadline(
            handle.scheduled_start_nanos(),
            inner.interval,
            clock::now(),
        ));
        keep
    }

    fn has_tasks(&self) -> bool {
        !self.inner.tasks.is_empty()
    }

    fn run_tasks(&self, _handle: &TickHandle, can_continue: &dyn Fn() -> bool) -> bool {
        while let Some(task) = self.inner.tasks.pop() {
            task();
            if !can_continue() {
                break;
            }
        }
        true
    }
}

impl fmt::Debug for RootTick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootTick")
            .field("ticks", &self.ticks())
            .field("pending_tasks", &self.pending_tasks())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_runs_queued_tasks_then_body() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = order.clone();
        let root = RootTick::new(Duration::from_millis(50), move |tick| {
            sink.lock().push(format!("tick {tick}"));
            tick < 1
        });
        for n in 0..2 {
            let sink = order.clone();
            root.queue_task(move || sink.lock().push(format!("task {n}")));
        }

        let handle = root.handle(Instant::now());
        let start = handle.scheduled_start();
        assert!(root.run_tick(&handle));
        assert!(handle.scheduled_start() > start);
        assert!(!root.run_tick(&handle), "body retires on the second pass");

        assert_eq!(*order.lock(), vec!["task 0", "task 1", "tick 0", "tick 1"]);
        assert_eq!(root.ticks(), 2);
    }

    #[test]
    fn test_task_slice_respects_can_continue() {
        let ran = Arc::new(AtomicUsize::new(0));
        let root = RootTick::new(Duration::from_millis(50), |_| true);
        for _ in 0..5 {
            let ran = ran.clone();
            root.queue_task(move || {
                ran.fetch_add(1, Ordering::Relaxed);
            });
        }

        let handle = root.handle(Instant::now());
        let budget = AtomicUsize::new(2);
        assert!(root.run_tasks(&handle, &|| budget.fetch_sub(1, Ordering::Relaxed) > 1));
        assert_eq!(ran.load(Ordering::Relaxed), 2);
        assert!(root.has_tasks());
        assert_eq!(root.pending_tasks(), 3);
    }
}
