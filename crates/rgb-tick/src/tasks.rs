//! Positional deferred-task queue.
//!
//! Every task remembers the cell it was queued for, so a region's queue can be
//! redistributed when the region is merged or split.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rgb_spatial::CellPos;
use rustc_hash::FxHashMap;
use tracing::error;

use crate::error::QueueError;
use crate::priority::DynamicPriorityQueue;

/// Deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Identifies a queued task for cancellation or priority changes.
///
/// Unique among the queues sharing one [`TaskIds`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// Id source shared by queues that hand tasks to each other.
#[derive(Clone, Default, Debug)]
pub struct TaskIds(Arc<AtomicU64>);

impl TaskIds {
    fn next(&self) -> TaskId {
        TaskId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

struct PendingTask {
    pos: CellPos,
    run: Task,
}

/// Tasks ordered by priority bucket, then FIFO.
pub struct TaskQueue {
    ids: TaskIds,
    order: DynamicPriorityQueue<TaskId>,
    pending: Mutex<FxHashMap<TaskId, PendingTask>>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    /// Queue with its own id source.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ids(TaskIds::default())
    }

    /// Queue drawing ids from `ids`; tasks may only be redistributed between
    /// queues sharing a source.
    #[must_use]
    pub fn with_ids(ids: TaskIds) -> Self {
        Self {
            ids,
            order: DynamicPriorityQueue::new(),
            pending: Mutex::new(FxHashMap::default()),
        }
    }

    /// Queue `run` for cell `pos` at `priority` (0 runs first).
    pub fn push(
        &self,
        pos: CellPos,
        priority: usize,
        run: impl FnOnce() + Send + 'static,
    ) -> Result<TaskId, QueueError> {
        let id = self.ids.next();
        self.insert(id, priority, PendingTask {
            pos,
            run: Box::new(run),
        })?;
        Ok(id)
    }

    fn insert(&self, id: TaskId, priority: usize, task: PendingTask) -> Result<(), QueueError> {
        // Pending first, so a dequeued id always finds its closure.
        self.pending.lock().insert(id, task);
        if let Err(err) = self.order.try_enqueue(id, priority) {
            self.pending.lock().remove(&id);
            return Err(err);
        }
        Ok(())
    }

    /// Run the highest-priority task. Returns `false` if the queue was empty.
    pub fn run_next(&self) -> bool {
        while let Some(id) = self.order.dequeue() {
            let task = self.pending.lock().remove(&id);
            if let Some(task) = task {
                (task.run)();
                return true;
            }
        }
        false
    }

    /// Move a queued task to another priority bucket.
    ///
    /// Returns `false` if the task already ran, was cancelled, or has that
    /// priority.
    ///
    /// # Panics
    /// If `priority` is out of range.
    pub fn change_priority(&self, id: TaskId, priority: usize) -> bool {
        self.order.change_priority(&id, priority)
    }

    /// Drop a queued task without running it.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.order.remove(&id) && self.pending.lock().remove(&id).is_some()
    }

    #[must_use]
    pub fn contains(&self, id: TaskId) -> bool {
        self.order.contains(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Move every queued task into the queue `route` picks for its cell,
    /// keeping ids and priorities. Tasks routed to `None` stay here.
    pub(crate) fn redistribute<'a>(&self, mut route: impl FnMut(CellPos) -> Option<&'a Self>) {
        let drained: Vec<(TaskId, PendingTask)> = {
            let mut pending = self.pending.lock();
            let mut drained: Vec<_> = pending.drain().collect();
            drained.sort_unstable_by_key(|(id, _)| *id);
            drained
        };

        for (id, task) in drained {
            let Some(target) = route(task.pos).filter(|target| !std::ptr::eq(*target, self)) else {
                self.pending.lock().insert(id, task);
                continue;
            };
            // Gone from the order queue means it was cancelled meanwhile.
            let Some(priority) = self.order.priority_of(&id) else {
                continue;
            };
            if !self.order.remove(&id) {
                continue;
            }
            if let Err(err) = target.insert(id, priority, task) {
                error!("failed to move {id}: {err}");
            }
        }
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
