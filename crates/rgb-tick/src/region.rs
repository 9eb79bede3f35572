//! Binding between the spatial partitioner and the tick scheduler.
//!
//! Every region owns a [`TickHandle`] and a positional [`TaskQueue`]. The
//! handle is scheduled when the region becomes READY and cancelled when it
//! stops being schedulable; once cancelled it is never reused, because a
//! region that leaves READY is always merged away or split afterwards.
//!
//! ```text
//! on_region_active ──▶ schedule(now + interval)
//!       worker: try_mark_ticking ─▶ tasks ─▶ RegionLogic::tick ─▶ mark_not_ticking
//!               └── READY and not cancelled? reinsert at previous + interval
//! on_region_inactive / on_region_destroy ──▶ cancel
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use rgb_spatial::{CellPos, FxHashMap, Region, RegionCallbacks, RegionData, Regionizer, SectionPos};
use tracing::{trace, warn};

use crate::clock;
use crate::error::{QueueError, SchedulerError, SchedulerResult};
use crate::scheduler::TickScheduler;
use crate::tasks::{TaskId, TaskIds, TaskQueue};
use crate::tick::{SchedulableTick, TickHandle, TickState};

/// Region managed by [`TickRegions`].
pub type TickRegion<L> = Region<TickRegions<L>>;

/// Host simulation logic run for every region.
///
/// `on_merge` and `on_split` run under the partitioner's structural lock and
/// must not call locking partitioner operations.
pub trait RegionLogic: Send + Sync + Sized + 'static {
    /// One periodic pass over `region`, which is TICKING for the duration.
    ///
    /// `tick` counts passes of this region, continuing the count of the
    /// regions it was merged or split from.
    fn tick(&self, region: &Arc<TickRegion<Self>>, tick: u64);

    fn on_merge(&self, _from: &Arc<TickRegion<Self>>, _into: &Arc<TickRegion<Self>>) {}

    fn on_split(&self, _from: &Arc<TickRegion<Self>>, _into: &[Arc<TickRegion<Self>>]) {}
}

/// Partitioner callbacks that drive every region through a [`TickScheduler`].
pub struct TickRegions<L> {
    logic: L,
    scheduler: Arc<TickScheduler>,
    interval: Duration,
    task_ids: TaskIds,
}

impl<L: RegionLogic> TickRegions<L> {
    /// Tick every region each `interval`.
    pub fn new(logic: L, scheduler: Arc<TickScheduler>, interval: Duration) -> SchedulerResult<Self> {
        if interval.is_zero() {
            return Err(SchedulerError::TickInterval);
        }
        Ok(Self {
            logic,
            scheduler,
            interval,
            task_ids: TaskIds::default(),
        })
    }

    #[must_use]
    pub const fn logic(&self) -> &L {
        &self.logic
    }

    #[must_use]
    pub const fn scheduler(&self) -> &Arc<TickScheduler> {
        &self.scheduler
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }
}

impl<L: RegionLogic> RegionCallbacks for TickRegions<L> {
    type RegionData = RegionTickData;
    type SectionData = ();

    fn create_section_data(&self, _section_x: i32, _section_z: i32, _section_shift: u32) {}

    fn create_region_data(&self, region: &Weak<TickRegion<L>>) -> RegionTickData {
        let tick = RegionTick {
            region: region.clone(),
        };
        RegionTickData {
            handle: TickHandle::new(tick, Instant::now()),
            tasks: TaskQueue::with_ids(self.task_ids.clone()),
            ticks: AtomicU64::new(0),
        }
    }

    fn on_region_destroy(&self, region: &Arc<TickRegion<L>>) {
        self.scheduler.cancel(&region.data().handle);
    }

    fn on_region_active(&self, region: &Arc<TickRegion<L>>) {
        let handle = &region.data().handle;
        if handle.state() != TickState::Unscheduled {
            warn!(
                "region {} activated with tick in state {:?}",
                region.id(),
                handle.state()
            );
            return;
        }
        handle.set_scheduled_start(Instant::now() + self.interval);
        if let Err(err) = self.scheduler.try_schedule(handle) {
            warn!("region {} not scheduled: {err}", region.id());
        }
    }

    fn on_region_inactive(&self, region: &Arc<TickRegion<L>>) {
        self.scheduler.cancel(&region.data().handle);
    }

    fn pre_merge(&self, from: &Arc<TickRegion<L>>, into: &Arc<TickRegion<L>>) {
        self.logic.on_merge(from, into);
    }

    fn pre_split(&self, from: &Arc<TickRegion<L>>, into: &[Arc<TickRegion<L>>]) {
        self.logic.on_split(from, into);
    }
}

/// Per-region scheduling state.
pub struct RegionTickData {
    handle: Arc<TickHandle>,
    tasks: TaskQueue,
    ticks: AtomicU64,
}

impl RegionTickData {
    #[must_use]
    pub const fn handle(&self) -> &Arc<TickHandle> {
        &self.handle
    }

    #[must_use]
    pub const fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    /// Completed periodic passes, inherited across merges and splits.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    fn inherit_ticks(&self, from: &Self) {
        self.ticks.fetch_max(from.ticks(), Ordering::AcqRel);
    }
}

impl<L: RegionLogic> RegionData<TickRegions<L>> for RegionTickData {
    fn split(
        &self,
        regionizer: &Regionizer<TickRegions<L>>,
        into: &FxHashMap<SectionPos, Arc<TickRegion<L>>>,
        regions: &[Arc<TickRegion<L>>],
    ) {
        let shift = regionizer.config().section_shift;
        for region in regions {
            region.data().inherit_ticks(self);
        }
        // Tasks whose section was collected go to the first new region.
        self.tasks.redistribute(|pos| {
            into.get(&pos.section(shift))
                .or_else(|| regions.first())
                .map(|region| &region.data().tasks)
        });
    }

    fn merge_into(&self, into: &Arc<TickRegion<L>>) {
        let target = into.data();
        target.inherit_ticks(self);
        self.tasks.redistribute(|_| Some(&target.tasks));

        if !target.tasks.is_empty() {
            if let Some(regionizer) = into.regionizer() {
                regionizer.callbacks().scheduler.notify_tasks(&target.handle);
            }
        }
    }
}

impl std::fmt::Debug for RegionTickData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionTickData")
            .field("handle", &self.handle)
            .field("tasks", &self.tasks.len())
            .field("ticks", &self.ticks())
            .finish()
    }
}

/// The schedulable side of a region.
struct RegionTick<L: RegionLogic> {
    region: Weak<TickRegion<L>>,
}

type Acquired<L> = (Arc<TickRegion<L>>, Arc<Regionizer<TickRegions<L>>>);

impl<L: RegionLogic> RegionTick<L> {
    /// Acquire the region for a run.
    ///
    /// A scheduled region can only be unavailable if it was cancelled under
    /// the structural lock first; anything else is a lifecycle bug.
    fn acquire(&self, handle: &TickHandle) -> Option<Acquired<L>> {
        let region = self.region.upgrade()?;
        let regionizer = region.regionizer()?;
        if region.try_mark_ticking(|| handle.is_cancelled()) {
            return Some((region, regionizer));
        }
        assert!(
            handle.is_cancelled(),
            "scheduled region {} should be acquirable",
            region.id()
        );
        None
    }
}

impl<L: RegionLogic> SchedulableTick for RegionTick<L> {
    fn run_tick(&self, handle: &TickHandle) -> bool {
        let Some((region, regionizer)) = self.acquire(handle) else {
            return false;
        };
        let callbacks = regionizer.callbacks();
        let data = region.data();

        // Only what was queued before the pass started.
        for _ in 0..data.tasks.len() {
            if !data.tasks.run_next() {
                break;
            }
        }

        let tick = data.ticks.fetch_add(1, Ordering::AcqRel);
        callbacks.logic.tick(&region, tick);

        let ready = region.mark_not_ticking();
        handle.set_scheduled_start_nanos(clock::next_deadline(
            handle.scheduled_start_nanos(),
            clock::duration_nanos(callbacks.interval),
            clock::now(),
        ));
        if !ready {
            trace!("region {} retired its tick", region.id());
        }
        ready && !handle.is_cancelled()
    }

    fn has_tasks(&self) -> bool {
        self.region
            .upgrade()
            .is_some_and(|region| !region.data().tasks.is_empty())
    }

    fn run_tasks(&self, handle: &TickHandle, can_continue: &dyn Fn() -> bool) -> bool {
        let Some((region, _regionizer)) = self.acquire(handle) else {
            return false;
        };
        let tasks = &region.data().tasks;
        while tasks.run_next() && can_continue() {}

        region.mark_not_ticking() && !handle.is_cancelled()
    }
}

/// Deferred-task routing on a partitioner driven by [`TickRegions`].
///
/// Tasks are addressed by cell; the region owning the cell's section at the
/// time of the call receives them, and merges and splits carry them along.
pub trait TickRegionizerExt {
    /// Queue `task` on the region owning cell `(x, z)` and wake the scheduler.
    ///
    /// Returns `Ok(None)` when no region covers the cell.
    fn queue_task(
        &self,
        x: i32,
        z: i32,
        priority: usize,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<Option<TaskId>, QueueError>;

    /// Drop a task queued for cell `(x, z)` before it runs.
    fn cancel_task(&self, x: i32, z: i32, id: TaskId) -> bool;

    /// Move a task queued for cell `(x, z)` to another priority bucket.
    fn change_task_priority(&self, x: i32, z: i32, id: TaskId, priority: usize) -> bool;
}

impl<L: RegionLogic> TickRegionizerExt for Regionizer<TickRegions<L>> {
    fn queue_task(
        &self,
        x: i32,
        z: i32,
        priority: usize,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<Option<TaskId>, QueueError> {
        self.compute_at_region_if_present_or_else(
            x,
            z,
            |region| {
                let data = region.data();
                let id = data.tasks.push(CellPos::new(x, z), priority, task)?;
                self.callbacks().scheduler.notify_tasks(&data.handle);
                Ok(Some(id))
            },
            || Ok(None),
        )
    }

    fn cancel_task(&self, x: i32, z: i32, id: TaskId) -> bool {
        self.compute_at_region_if_present_or_else(
            x,
            z,
            |region| region.data().tasks.cancel(id),
            || false,
        )
    }

    fn change_task_priority(&self, x: i32, z: i32, id: TaskId, priority: usize) -> bool {
        if priority >= crate::priority::DEFAULT_MAX_PRIORITY {
            return false;
        }
        self.compute_at_region_if_present_or_else(
            x,
            z,
            |region| region.data().tasks.change_priority(id, priority),
            || false,
        )
    }
}
