//! Work-stealing deadline scheduler.
//!
//! # Layout
//!
//! ```text
//! Shared
//!   ├── waiting_or_idle: SkipMap<WaitKey, Runner>   idle first, then latest deadline
//!   ├── unwatched_ticks: SkipMap<TickKey, Task>     every queued tick nobody watches
//!   └── scheduled_tasks: SkipMap<TaskKey, Task>     ticks with deferred work
//! Runner (one per worker thread)
//!   ├── scheduled_ticks: SkipMap<TickKey, Task>     ticks assigned to this worker
//!   └── scheduled_tasks: SkipMap<TaskKey, Task>
//! ```
//!
//! A tick assigned to a worker is also visible globally, but other workers only
//! consider it `steal_threshold` after its deadline. Ticks that no worker can
//! take in time are queued unowned with their deadline pulled forward by the
//! threshold, so they become visible to everyone at their real deadline.
//!
//! Entries are never edited in place: claiming a run flips the entry's `taken`
//! flag, stale entries are skipped and dropped lazily, and a reinsertion
//! creates a fresh entry.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::sync::{Parker, Unparker};
use crossbeam_skiplist::SkipMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, trace};

use crate::clock::{self, DEADLINE_NOT_SET};
use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::tick::TickHandle;

// ----------------------------------------------------------------------------
// Queue entries
// ----------------------------------------------------------------------------


/// Deadline order: earliest start, then tick id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TickKey {
    start: i64,
    tick: u64,
    seq: u64,
}

/// Deferred-work order: oldest notification, then tick id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TaskKey {
    notified: i64,
    tick: u64,
    seq: u64,
}

/// Position of a worker in the waiting-or-idle set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WaitKey {
    deadline: i64,
    runner: u64,
}

impl Ord for WaitKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        let idle = self.deadline == DEADLINE_NOT_SET;
        let other_idle = other.deadline == DEADLINE_NOT_SET;
        match (idle, other_idle) {
            (true, false) => CmpOrdering::Less,
            (false, true) => CmpOrdering::Greater,
            _ => other
                .deadline
                .cmp(&self.deadline)
                .then_with(|| other.runner.cmp(&self.runner)),
        }
    }
}

impl PartialOrd for WaitKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// One queued occurrence of a tick.
pub(crate) struct ScheduledTickTask {
    tick: Weak<TickHandle>,
    tick_id: u64,
    seq: u64,
    tick_start: i64,
    last_task_notify: AtomicI64,
    owner: Option<Weak<Runner>>,
    owner_id: Option<u64>,
    taken: AtomicBool,
    watched: AtomicBool,
}

impl ScheduledTickTask {
    fn new(
        tick: &Arc<TickHandle>,
        seq: u64,
        tick_start: i64,
        last_task_notify: i64,
        owner: Option<&Arc<Runner>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tick: Arc::downgrade(tick),
            tick_id: tick.id(),
            seq,
            tick_start,
            last_task_notify: AtomicI64::new(last_task_notify),
            owner: owner.map(Arc::downgrade),
            owner_id: owner.map(|runner| runner.id),
            taken: AtomicBool::new(false),
            watched: AtomicBool::new(false),
        })
    }

    fn tick(&self) -> Option<Arc<TickHandle>> {
        self.tick.upgrade()
    }

    fn owner(&self) -> Option<Arc<Runner>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }

    const fn tick_key(&self) -> TickKey {
        TickKey {
            start: self.tick_start,
            tick: self.tick_id,
            seq: self.seq,
        }
    }

    fn task_key(&self) -> TaskKey {
        TaskKey {
            notified: self.last_task_notify.load(Ordering::Acquire),
            tick: self.tick_id,
            seq: self.seq,
        }
    }

    fn is_stale(&self) -> bool {
        self.is_taken() || self.tick.strong_count() == 0
    }

    /// Single-claim: exactly one caller ever gets `true`.
    fn take(&self) -> bool {
        !self.taken.load(Ordering::Acquire)
            && self
                .taken
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    fn is_taken(&self) -> bool {
        self.taken.load(Ordering::Acquire)
    }

    fn watch(&self) -> bool {
        !self.watched.load(Ordering::Acquire)
            && self
                .watched
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    fn unwatch(&self) -> bool {
        self.watched
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_watched(&self) -> bool {
        self.watched.load(Ordering::Acquire)
    }
}

type TickQueue = SkipMap<TickKey, Arc<ScheduledTickTask>>;
type TaskQueue = SkipMap<TaskKey, Arc<ScheduledTickTask>>;

fn first_non_taken<K: Ord + Send + 'static>(
    map: &SkipMap<K, Arc<ScheduledTickTask>>,
) -> Option<Arc<ScheduledTickTask>> {
    loop {
        let first = map.front()?;
        let task = first.value().clone();
        if task.is_stale() {
            first.remove();
            continue;
        }
        return Some(task);
    }
}

fn first_non_taken_non_watched(map: &TickQueue) -> Option<Arc<ScheduledTickTask>> {
    loop {
        let first = map.front()?;
        let task = first.value().clone();
        if task.is_stale() || task.is_watched() {
            first.remove();
            // Raced with an unwatch: put it back.
            if !task.is_stale() && !task.is_watched() {
                map.insert(task.tick_key(), task);
            }
            continue;
        }
        return Some(task);
    }
}

// ----------------------------------------------------------------------------
// Runners
// ----------------------------------------------------------------------------

const RUNNER_IDLE: u8 = 0;
const RUNNER_WAITING: u8 = 1;
const RUNNER_TASKS: u8 = 2;
const RUNNER_INTERRUPT: u8 = 3;
const RUNNER_TICKING: u8 = 4;
const RUNNER_HALTED: u8 = 5;

/// Shared half of a worker: state word, wake handle and owned queues.
pub(crate) struct Runner {
    id: u64,
    state: AtomicU8,
    unparker: Unparker,
    scheduled_ticks: TickQueue,
    scheduled_tasks: TaskQueue,
}

impl Runner {
    fn new(id: u64, unparker: Unparker) -> Self {
        Self {
            id,
            state: AtomicU8::new(RUNNER_INTERRUPT),
            unparker,
            scheduled_ticks: SkipMap::new(),
            scheduled_tasks: SkipMap::new(),
        }
    }

    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn transition(&self, from: u8, to: u8) -> Result<u8, u8> {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
    }

    fn is_halted(&self) -> bool {
        self.state() == RUNNER_HALTED
    }

    /// Wake the worker only if it is parked.
    fn interrupt_if_waiting(&self) -> bool {
        let mut current = self.state();
        loop {
            match current {
                RUNNER_IDLE | RUNNER_WAITING => match self.transition(current, RUNNER_INTERRUPT) {
                    Ok(_) => {
                        self.unparker.unpark();
                        return true;
                    }
                    Err(actual) => current = actual,
                },
                _ => return false,
            }
        }
    }

    /// Make the worker re-evaluate its queues, cutting short any task slice.
    fn interrupt(&self) -> bool {
        let mut current = self.state();
        loop {
            match current {
                RUNNER_IDLE | RUNNER_WAITING | RUNNER_TASKS => {
                    match self.transition(current, RUNNER_INTERRUPT) {
                        Ok(_) => {
                            if current != RUNNER_TASKS {
                                self.unparker.unpark();
                            }
                            return true;
                        }
                        Err(actual) => current = actual,
                    }
                }
                _ => return false,
            }
        }
    }

    fn halt(&self) {
        let mut current = self.state();
        loop {
            if current == RUNNER_HALTED {
                return;
            }
            match self.transition(current, RUNNER_HALTED) {
                Ok(_) => {
                    if matches!(current, RUNNER_IDLE | RUNNER_WAITING) {
                        self.unparker.unpark();
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Shared state
// ----------------------------------------------------------------------------

struct Lifecycle {
    shutdown: bool,
    next_runner_id: u64,
}

struct Shared {
    config: SchedulerConfig,
    steal_threshold: i64,
    task_time_slice: i64,
    lifecycle: Mutex<Lifecycle>,
    core: RwLock<Vec<Arc<Runner>>>,
    alive: Mutex<Vec<Arc<Runner>>>,
    alive_changed: Condvar,
    waiting_or_idle: SkipMap<WaitKey, Arc<Runner>>,
    unwatched_ticks: TickQueue,
    scheduled_tasks: TaskQueue,
    /// Tie-break for queue entries with equal keys, in insertion order.
    task_seq: AtomicU64,
}

impl Shared {
    fn next_seq(&self) -> u64 {
        self.task_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn interrupt_all_runners(&self) {
        for runner in self.core.read().iter() {
            runner.interrupt();
        }
    }

    fn interrupt_one_runner(&self) {
        for runner in self.core.read().iter() {
            if runner.interrupt() {
                return;
            }
        }
    }

    fn insert(&self, tick: &Arc<TickHandle>, has_tasks: bool) {
        let schedule_time = tick.scheduled_start_nanos();
        let notified = if has_tasks {
            clock::now()
        } else {
            DEADLINE_NOT_SET
        };

        loop {
            let first = self.waiting_or_idle.front();
            let best = first.as_ref().map(|entry| *entry.key());

            // Nobody is free, or even the latest-waking worker is due before this
            // tick: queue it unowned for whoever frees up first.
            if best.is_none_or(|key| key.deadline != DEADLINE_NOT_SET && key.deadline < schedule_time) {
                let task = ScheduledTickTask::new(
                    tick,
                    self.next_seq(),
                    schedule_time.saturating_sub(self.steal_threshold),
                    notified,
                    None,
                );
                tick.set_current_task(task.clone());
                self.unwatched_ticks.insert(task.tick_key(), task.clone());
                if has_tasks {
                    self.scheduled_tasks.insert(task.task_key(), task);
                }
                self.interrupt_one_runner();
                break;
            }

            let Some(entry) = first else { continue };
            if !entry.remove() {
                continue;
            }
            let runner = entry.value().clone();

            let task = ScheduledTickTask::new(
                tick,
                self.next_seq(),
                schedule_time,
                notified,
                Some(&runner),
            );
            tick.set_current_task(task.clone());
            self.unwatched_ticks.insert(task.tick_key(), task.clone());
            runner.scheduled_ticks.insert(task.tick_key(), task.clone());
            if has_tasks {
                self.scheduled_tasks.insert(task.task_key(), task.clone());
                runner.scheduled_tasks.insert(task.task_key(), task);
            }

            if !runner.interrupt() && runner.is_halted() {
                self.interrupt_one_runner();
            }
            break;
        }

        if !has_tasks && tick.has_tasks() {
            self.notify_tasks(tick);
        }
    }

    fn reinsert(&self, tick: &Arc<TickHandle>, owner: Option<&Arc<Runner>>) {
        let task = ScheduledTickTask::new(
            tick,
            self.next_seq(),
            tick.scheduled_start_nanos(),
            DEADLINE_NOT_SET,
            owner,
        );
        tick.set_current_task(task.clone());

        self.unwatched_ticks.insert(task.tick_key(), task.clone());
        if let Some(owner) = owner {
            owner.scheduled_ticks.insert(task.tick_key(), task.clone());
        }

        // A notify that raced with the run saw the old, taken entry; publish
        // directly instead of going through the state upgrade again.
        if tick.has_tasks() {
            tick.upgrade_to_scheduled_tasks();
            self.publish_tasks(&task);
        }
    }

    fn notify_tasks(&self, tick: &TickHandle) {
        if !tick.is_scheduled() || !tick.upgrade_to_scheduled_tasks() {
            return;
        }
        let Some(task) = tick.current_task() else {
            return;
        };
        if task.is_taken() {
            return;
        }

        self.publish_tasks(&task);
    }

    fn publish_tasks(&self, task: &Arc<ScheduledTickTask>) {
        if task
            .last_task_notify
            .compare_exchange(
                DEADLINE_NOT_SET,
                clock::now(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        self.scheduled_tasks.insert(task.task_key(), task.clone());
        if let Some(owner) = task.owner() {
            owner.scheduled_tasks.insert(task.task_key(), task.clone());
            owner.interrupt_if_waiting();
        } else {
            self.interrupt_one_runner();
        }
    }

    fn unlink(&self, task: &ScheduledTickTask) {
        self.unwatched_ticks.remove(&task.tick_key());
        self.scheduled_tasks.remove(&task.task_key());
        if let Some(owner) = task.owner() {
            owner.scheduled_ticks.remove(&task.tick_key());
            owner.scheduled_tasks.remove(&task.task_key());
        }
    }

    fn remove_alive(&self, runner: &Arc<Runner>) {
        let mut alive = self.alive.lock();
        alive.retain(|other| !Arc::ptr_eq(other, runner));
        self.alive_changed.notify_all();
    }
}

// ----------------------------------------------------------------------------
// Worker loop
// ----------------------------------------------------------------------------

/// Thread-owned half of a worker.
struct Worker {
    shared: Arc<Shared>,
    runner: Arc<Runner>,
    parker: Parker,
    wait_state: Option<WaitKey>,
    watch: Option<Arc<ScheduledTickTask>>,
}

impl Worker {
    fn run(mut self) {
        debug!("tick runner {} started", self.runner.id);
        self.setup_wait_state(DEADLINE_NOT_SET);
        self.do_run();
    }

    fn setup_wait_state(&mut self, deadline: i64) {
        assert!(
            self.wait_state.is_none(),
            "runner {} wait state already set",
            self.runner.id
        );
        let key = WaitKey {
            deadline,
            runner: self.runner.id,
        };
        self.shared
            .waiting_or_idle
            .insert(key, self.runner.clone());
        self.wait_state = Some(key);
    }

    fn clean_wait_state(&mut self) {
        if let Some(key) = self.wait_state.take() {
            self.shared.waiting_or_idle.remove(&key);
        }
    }

    fn cleanup_watch(&mut self, wake: bool) {
        let Some(watch) = self.watch.take() else {
            return;
        };
        watch.unwatch();
        if !watch.is_taken() {
            self.shared
                .unwatched_ticks
                .insert(watch.tick_key(), watch);
            if wake {
                self.shared.interrupt_one_runner();
            }
        }
    }

    /// Pick the tick to wait for: our own earliest, or a global one once it is
    /// past the steal threshold, whichever comes first.
    fn find_tick(&mut self) -> Option<Arc<ScheduledTickTask>> {
        let steal = self.shared.steal_threshold;
        while self.runner.state() == RUNNER_WAITING {
            let global_first = first_non_taken_non_watched(&self.shared.unwatched_ticks);
            let our_first = first_non_taken(&self.runner.scheduled_ticks);

            let to_wait_for = match (&global_first, &our_first) {
                (None, ours) => ours.clone(),
                (global, None) => global.clone(),
                (Some(global), Some(ours)) => {
                    if ours.tick_start <= global.tick_start.saturating_add(steal) {
                        Some(ours.clone())
                    } else {
                        Some(global.clone())
                    }
                }
            };

            let Some(to_wait_for) = to_wait_for else {
                self.setup_wait_state(DEADLINE_NOT_SET);
                let _ = self.runner.transition(RUNNER_WAITING, RUNNER_IDLE);
                if !self.runner.scheduled_ticks.is_empty()
                    || !self.shared.unwatched_ticks.is_empty()
                {
                    self.runner.interrupt();
                }
                return None;
            };

            let is_global = global_first
                .as_ref()
                .is_some_and(|global| Arc::ptr_eq(global, &to_wait_for));
            if is_global {
                if to_wait_for.watch() {
                    self.shared
                        .unwatched_ticks
                        .remove(&to_wait_for.tick_key());
                    self.watch = Some(to_wait_for.clone());
                } else if !our_first
                    .as_ref()
                    .is_some_and(|ours| Arc::ptr_eq(ours, &to_wait_for))
                {
                    continue;
                }
            }

            return Some(to_wait_for);
        }
        None
    }

    /// Whether something became due before `deadline` after we picked a tick.
    fn find_earlier_task(&self, deadline: i64) -> bool {
        let global_first = first_non_taken_non_watched(&self.shared.unwatched_ticks);
        if global_first.is_some_and(|global| {
            global
                .tick_start
                .saturating_add(self.shared.steal_threshold)
                < deadline
        }) {
            return true;
        }
        first_non_taken(&self.runner.scheduled_ticks).is_some_and(|ours| ours.tick_start < deadline)
    }

    fn run_tasks(&self, task: &Arc<ScheduledTickTask>, deadline: i64) {
        if self
            .runner
            .transition(RUNNER_WAITING, RUNNER_TASKS)
            .is_err()
        {
            return;
        }

        let tick = task.tick();
        let Some(tick) = tick.filter(|_| task.take()) else {
            let _ = self.runner.transition(RUNNER_TASKS, RUNNER_WAITING);
            return;
        };

        self.shared.unlink(task);

        let runner = &self.runner;
        let can_continue =
            || runner.state() == RUNNER_TASKS && clock::now() < deadline;
        if tick.tasks(&can_continue) {
            let owner = task.owner().unwrap_or_else(|| self.runner.clone());
            self.shared.reinsert(&tick, Some(&owner));
        }

        let _ = self.runner.transition(RUNNER_TASKS, RUNNER_WAITING);
    }

    /// Wait for the chosen tick's deadline, running deferred-task slices in the
    /// meantime. Returns the tick once it is taken, or `None` when the worker
    /// must re-evaluate.
    fn wait_for_tick(&mut self) -> Option<Arc<ScheduledTickTask>> {
        let tick = self.find_tick()?;

        let tick_deadline = if tick.owner_id == Some(self.runner.id) {
            tick.tick_start
        } else {
            tick.tick_start
                .saturating_add(self.shared.steal_threshold)
        };
        self.setup_wait_state(tick_deadline);

        loop {
            if self.runner.state() != RUNNER_WAITING
                || tick.is_taken()
                || self.find_earlier_task(tick_deadline)
            {
                self.cleanup_watch(false);
                self.clean_wait_state();
                self.runner.interrupt();
                return None;
            }

            let now = clock::now();
            let our_task = first_non_taken(&self.runner.scheduled_tasks);
            let global_task = first_non_taken(&self.shared.scheduled_tasks);

            if now >= tick_deadline {
                if !tick.take() {
                    continue;
                }
                self.clean_wait_state();
                self.watch = None;
                return Some(tick);
            }

            let Some(to_task) = our_task.or(global_task) else {
                self.parker
                    .park_timeout(Duration::from_nanos(tick_deadline.abs_diff(now)));
                continue;
            };

            let deadline = tick_deadline.min(now.saturating_add(self.shared.task_time_slice));
            if self.runner.state() != RUNNER_WAITING {
                continue;
            }
            self.run_tasks(&to_task, deadline);
        }
    }

    fn move_to_ticking_state(&self) -> bool {
        let mut current = self.runner.state();
        loop {
            match current {
                RUNNER_HALTED => return false,
                RUNNER_WAITING | RUNNER_INTERRUPT => {
                    match self.runner.transition(current, RUNNER_TICKING) {
                        Ok(_) => {
                            // Whatever interrupted us is now someone else's job.
                            if current == RUNNER_INTERRUPT {
                                self.shared.interrupt_one_runner();
                            }
                            return true;
                        }
                        Err(actual) => current = actual,
                    }
                }
                _ => panic!(
                    "runner {} cannot start ticking from state {current}",
                    self.runner.id
                ),
            }
        }
    }

    fn do_tick(&self, task: &ScheduledTickTask) {
        self.shared.unlink(task);
        let Some(tick) = task.tick() else {
            return;
        };
        if tick.tick() {
            self.shared.reinsert(&tick, Some(&self.runner));
        } else {
            trace!("tick {} retired", tick.id());
        }
    }

    fn do_run(&mut self) {
        loop {
            if let Some(key) = self.wait_state {
                assert!(
                    key.deadline == DEADLINE_NOT_SET,
                    "runner {} entered idle with a deadline",
                    self.runner.id
                );
                while self.runner.state() == RUNNER_IDLE {
                    self.parker.park();
                }
                self.clean_wait_state();
            }

            match self
                .runner
                .transition(RUNNER_INTERRUPT, RUNNER_WAITING)
            {
                Ok(_) => {}
                Err(RUNNER_HALTED) => return,
                Err(state) => panic!(
                    "runner {} must be HALTED or INTERRUPT at loop start, found {state}",
                    self.runner.id
                ),
            }

            while self.runner.state() == RUNNER_WAITING {
                let Some(to_tick) = self.wait_for_tick() else {
                    break;
                };

                if !self.move_to_ticking_state() {
                    if let Some(tick) = to_tick.tick() {
                        let has_tasks = tick.has_tasks();
                        self.shared.insert(&tick, has_tasks);
                    }
                    break;
                }

                self.do_tick(&to_tick);

                if self
                    .runner
                    .transition(RUNNER_TICKING, RUNNER_WAITING)
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let panicked = thread::panicking();
        if panicked {
            error!("tick runner {} died while running a tick", self.runner.id);
            self.runner.halt();
            self.shared
                .core
                .write()
                .retain(|other| !Arc::ptr_eq(other, &self.runner));
        }
        self.cleanup_watch(!panicked);
        self.clean_wait_state();
        self.shared.remove_alive(&self.runner);
        // Hand our owned ticks to whoever is left.
        self.shared.interrupt_all_runners();
        debug!("tick runner {} exited", self.runner.id);
    }
}

// ----------------------------------------------------------------------------
// Public surface
// ----------------------------------------------------------------------------

/// Multiplexes a fixed set of worker threads across periodic ticks.
///
/// Dropping the scheduler halts its workers; use [`TickScheduler::join`] to
/// wait for them to exit.
pub struct TickScheduler {
    shared: Arc<Shared>,
}

impl TickScheduler {
    /// Create a scheduler and start `config.core_threads` workers.
    pub fn new(config: SchedulerConfig) -> SchedulerResult<Self> {
        config.validate()?;
        let threads = config.core_threads;
        let shared = Arc::new(Shared {
            steal_threshold: clock::duration_nanos(config.steal_threshold),
            task_time_slice: clock::duration_nanos(config.task_time_slice),
            config,
            lifecycle: Mutex::new(Lifecycle {
                shutdown: false,
                next_runner_id: 0,
            }),
            core: RwLock::new(Vec::new()),
            alive: Mutex::new(Vec::new()),
            alive_changed: Condvar::new(),
            waiting_or_idle: SkipMap::new(),
            unwatched_ticks: SkipMap::new(),
            scheduled_tasks: SkipMap::new(),
            task_seq: AtomicU64::new(0),
        });
        let scheduler = Self { shared };
        scheduler.set_core_threads(threads)?;
        Ok(scheduler)
    }

    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Queue a tick for its [`scheduled_start`](TickHandle::scheduled_start).
    ///
    /// The scheduler holds the handle weakly: a tick whose last `Arc` is
    /// dropped is skipped from then on.
    ///
    /// # Panics
    /// If the tick is already scheduled, running, or cancelled.
    pub fn schedule(&self, tick: &Arc<TickHandle>) {
        if let Err(err) = self.try_schedule(tick) {
            panic!("{err}");
        }
    }

    /// Queue a tick, failing if it is already scheduled, running, or cancelled.
    pub fn try_schedule(&self, tick: &Arc<TickHandle>) -> SchedulerResult<()> {
        let has_tasks = tick.has_tasks();
        let claimed = if has_tasks {
            tick.set_scheduled_tasks()
        } else {
            tick.set_scheduled()
        };
        if !claimed {
            return Err(SchedulerError::AlreadyScheduled(tick.id()));
        }
        self.shared.insert(tick, has_tasks);
        Ok(())
    }

    /// Tell the scheduler a queued tick has deferred work to run early.
    pub fn notify_tasks(&self, tick: &TickHandle) {
        self.shared.notify_tasks(tick);
    }

    /// Cancel a tick. A running pass finishes first; the tick is never run
    /// again. Returns `false` if it was never scheduled or already cancelled.
    pub fn cancel(&self, tick: &TickHandle) -> bool {
        if !tick.cancel() {
            return false;
        }
        if let Some(task) = tick.current_task() {
            if task.take() {
                self.shared.unlink(&task);
            }
        }
        true
    }

    /// Grow or shrink the worker set.
    ///
    /// Removed workers halt after their current run; new workers join the
    /// idle pool immediately. No-op after [`halt`](Self::halt).
    pub fn set_core_threads(&self, threads: usize) -> SchedulerResult<()> {
        let mut lifecycle = self.shared.lifecycle.lock();
        if lifecycle.shutdown {
            return Ok(());
        }

        let current = self.shared.core.read().len();
        if threads == current {
            return Ok(());
        }

        if threads < current {
            let removed: Vec<Arc<Runner>> = self.shared.core.write().split_off(threads);
            for runner in &removed {
                runner.halt();
            }
            self.shared.interrupt_all_runners();
            info!("tick runners {current} -> {threads}");
            return Ok(());
        }

        for _ in current..threads {
            let id = lifecycle.next_runner_id;
            lifecycle.next_runner_id += 1;

            let parker = Parker::new();
            let runner = Arc::new(Runner::new(id, parker.unparker().clone()));
            self.shared.core.write().push(runner.clone());
            self.shared.alive.lock().push(runner.clone());

            let worker = Worker {
                shared: self.shared.clone(),
                runner: runner.clone(),
                parker,
                wait_state: None,
                watch: None,
            };
            let spawned = thread::Builder::new()
                .name(format!("{}-{id}", self.shared.config.thread_name_prefix))
                .spawn(move || worker.run());
            if let Err(err) = spawned {
                self.shared
                    .core
                    .write()
                    .retain(|other| !Arc::ptr_eq(other, &runner));
                return Err(err.into());
            }
        }
        info!("tick runners {current} -> {threads}");
        Ok(())
    }

    /// Workers currently accepting ticks.
    #[must_use]
    pub fn core_threads(&self) -> usize {
        self.shared.core.read().len()
    }

    /// Worker threads that have not exited yet, halted ones included.
    #[must_use]
    pub fn alive_threads(&self) -> usize {
        self.shared.alive.lock().len()
    }

    /// Stop every worker after its current run and drop all queued ticks.
    pub fn halt(&self) {
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            if lifecycle.shutdown {
                return;
            }
            lifecycle.shutdown = true;
        }
        for runner in self.shared.core.read().iter() {
            runner.halt();
        }
        self.shared.unwatched_ticks.clear();
        self.shared.scheduled_tasks.clear();
        info!("tick scheduler halted");
    }

    /// Wait up to `timeout` for every worker thread to exit.
    pub fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut alive = self.shared.alive.lock();
        while !alive.is_empty() {
            if self
                .shared
                .alive_changed
                .wait_until(&mut alive, deadline)
                .timed_out()
            {
                return alive.is_empty();
            }
        }
        true
    }
}

impl Drop for TickScheduler {
    fn drop(&mut self) {
        self.halt();
    }
}

impl std::fmt::Debug for TickScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickScheduler")
            .field("core_threads", &self.core_threads())
            .field("alive_threads", &self.alive_threads())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_key_order_idle_first_then_latest() {
        let idle_a = WaitKey {
            deadline: DEADLINE_NOT_SET,
            runner: 1,
        };
        let idle_b = WaitKey {
            deadline: DEADLINE_NOT_SET,
            runner: 2,
        };
        let soon = WaitKey {
            deadline: 100,
            runner: 3,
        };
        let late = WaitKey {
            deadline: 500,
            runner: 4,
        };

        let mut keys = vec![soon, idle_a, late, idle_b];
        keys.sort();
        assert_eq!(keys, vec![idle_b, idle_a, late, soon]);
    }

    #[test]
    fn test_tick_key_orders_by_deadline_then_id() {
        let a = TickKey {
            start: 10,
            tick: 5,
            seq: 0,
        };
        let b = TickKey {
            start: 10,
            tick: 6,
            seq: 0,
        };
        let c = TickKey {
            start: 5,
            tick: 9,
            seq: 0,
        };
        let mut keys = vec![a, b, c];
        keys.sort();
        assert_eq!(keys, vec![c, a, b]);
    }

    #[test]
    fn test_single_claim() {
        let handle = TickHandle::new(Noop, Instant::now());
        let task = ScheduledTickTask::new(&handle, 0, 0, DEADLINE_NOT_SET, None);
        assert!(task.take());
        assert!(!task.take());
        assert!(task.watch());
        assert!(!task.watch());
        assert!(task.unwatch());
        assert!(!task.unwatch());
    }

    #[test]
    fn test_stale_entries_are_skipped() {
        let map: TickQueue = SkipMap::new();
        let live = TickHandle::new(Noop, Instant::now());
        let dropped = TickHandle::new(Noop, Instant::now());

        let taken = ScheduledTickTask::new(&live, 0, 1, DEADLINE_NOT_SET, None);
        assert!(taken.take());
        let orphan = ScheduledTickTask::new(&dropped, 1, 2, DEADLINE_NOT_SET, None);
        let good = ScheduledTickTask::new(&live, 2, 3, DEADLINE_NOT_SET, None);
        for task in [&taken, &orphan, &good] {
            map.insert(task.tick_key(), task.clone());
        }
        drop(dropped);

        let first = first_non_taken(&map).unwrap();
        assert!(Arc::ptr_eq(&first, &good));
        assert_eq!(map.len(), 1);
    }

    struct Noop;

    impl crate::SchedulableTick for Noop {
        fn run_tick(&self, _handle: &TickHandle) -> bool {
            false
        }

        fn has_tasks(&self) -> bool {
            false
        }

        fn run_tasks(&self, _handle: &TickHandle, _can_continue: &dyn Fn() -> bool) -> bool {
            false
        }
    }
}
