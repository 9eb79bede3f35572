//! Regions driven by the scheduler: periodic ticks, deferred tasks routed by
//! cell, and task hand-over across merges and splits.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rgb_spatial::{RegionId, RegionState, Regionizer, RegionizerConfig};
use rgb_tick::{
    QueueError, RegionLogic, SchedulerConfig, TickRegion, TickRegionizerExt, TickRegions,
    TickScheduler, TickState,
};

#[derive(Default)]
struct Observed {
    ticks: AtomicUsize,
    in_flight: Mutex<HashSet<RegionId>>,
    overlapped: AtomicBool,
    unowned: AtomicBool,
    merges: AtomicUsize,
    splits: AtomicUsize,
}

struct Logic(Arc<Observed>);

impl RegionLogic for Logic {
    fn tick(&self, region: &Arc<TickRegion<Self>>, _tick: u64) {
        if !region.is_ticking() {
            self.0.unowned.store(true, Ordering::Relaxed);
        }
        if !self.0.in_flight.lock().insert(region.id()) {
            self.0.overlapped.store(true, Ordering::Relaxed);
        }
        thread::sleep(Duration::from_micros(100));
        self.0.in_flight.lock().remove(&region.id());
        self.0.ticks.fetch_add(1, Ordering::Relaxed);
    }

    fn on_merge(&self, _from: &Arc<TickRegion<Self>>, _into: &Arc<TickRegion<Self>>) {
        self.0.merges.fetch_add(1, Ordering::Relaxed);
    }

    fn on_split(&self, _from: &Arc<TickRegion<Self>>, _into: &[Arc<TickRegion<Self>>]) {
        self.0.splits.fetch_add(1, Ordering::Relaxed);
    }
}

type World = Regionizer<TickRegions<Logic>>;

struct Harness {
    scheduler: Arc<TickScheduler>,
    world: Arc<World>,
    observed: Arc<Observed>,
}

fn harness(threads: usize, interval: Duration) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("rgb_tick=debug,rgb_spatial=debug")
        .try_init();

    let scheduler =
        Arc::new(TickScheduler::new(SchedulerConfig::default().with_core_threads(threads)).unwrap());
    let observed = Arc::new(Observed::default());
    let callbacks = TickRegions::new(Logic(observed.clone()), scheduler.clone(), interval).unwrap();
    let config = RegionizerConfig::default()
        .with_section_shift(0)
        .with_create_radius(1)
        .with_merge_radius(1)
        .with_gc(2, 0.1);
    let world = Regionizer::new(config, callbacks).unwrap();
    Harness {
        scheduler,
        world,
        observed,
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    done()
}

#[test]
fn test_zero_interval_is_rejected() {
    let scheduler = Arc::new(TickScheduler::new(SchedulerConfig::default().with_core_threads(0)).unwrap());
    let observed = Arc::new(Observed::default());
    assert!(TickRegions::new(Logic(observed), scheduler, Duration::ZERO).is_err());
}

#[test]
fn test_active_region_is_ticked_periodically() {
    let h = harness(2, Duration::from_millis(2));
    h.world.add_cell(0, 0);
    let region = h.world.region_at_unsynchronized(0, 0).unwrap();
    assert_eq!(region.state(), RegionState::Ready);

    assert!(wait_until(Duration::from_secs(5), || region.data().ticks() >= 5));
    assert!(!h.observed.overlapped.load(Ordering::Relaxed));
    assert!(!h.observed.unowned.load(Ordering::Relaxed));
    assert!(!region.data().handle().is_cancelled());
}

#[test]
fn test_queued_task_runs_before_next_tick() {
    let h = harness(1, Duration::from_secs(1));
    h.world.add_cell(0, 0);
    let region = h.world.region_at_unsynchronized(0, 0).unwrap();

    let ran_while_owned = Arc::new(AtomicBool::new(false));
    let flag = ran_while_owned.clone();
    let inside = region.clone();
    let id = h
        .world
        .queue_task(1, 0, 0, move || {
            flag.store(inside.is_ticking(), Ordering::Release);
        })
        .unwrap();
    assert!(id.is_some());

    assert!(wait_until(Duration::from_secs(1), || {
        ran_while_owned.load(Ordering::Acquire)
    }));
    assert_eq!(h.observed.ticks.load(Ordering::Relaxed), 0);
    assert!(region.data().tasks().is_empty());
}

#[test]
fn test_queue_task_outside_any_region() {
    let h = harness(0, Duration::from_secs(1));
    h.world.add_cell(0, 0);

    assert_eq!(h.world.queue_task(500, 500, 0, || {}), Ok(None));
    assert!(matches!(
        h.world.queue_task(0, 0, 1_000, || {}),
        Err(QueueError::PriorityOutOfRange { .. })
    ));
}

#[test]
fn test_cancel_and_reprioritise_queued_tasks() {
    let h = harness(0, Duration::from_secs(1));
    h.world.add_cell(0, 0);

    let a = h.world.queue_task(0, 0, 5, || {}).unwrap().unwrap();
    let b = h.world.queue_task(0, 0, 5, || {}).unwrap().unwrap();
    assert!(h.world.change_task_priority(0, 0, a, 0));
    assert!(!h.world.change_task_priority(0, 0, a, 0));
    assert!(!h.world.change_task_priority(0, 0, a, 1_000));
    assert!(h.world.cancel_task(0, 0, b));
    assert!(!h.world.cancel_task(0, 0, b));
    assert!(!h.world.cancel_task(500, 500, a));

    let region = h.world.region_at_unsynchronized(0, 0).unwrap();
    assert_eq!(region.data().tasks().len(), 1);
}

#[test]
fn test_tasks_follow_merge_and_split() {
    // No workers: regions are driven by hand so the hand-over is observable.
    let h = harness(0, Duration::from_secs(1));
    h.world.add_cell(0, 0);
    h.world.add_cell(4, 0);
    assert_eq!(h.world.region_count(), 2);

    for _ in 0..2 {
        h.world.queue_task(0, 0, 3, || {}).unwrap().unwrap();
    }
    for _ in 0..3 {
        h.world.queue_task(4, 0, 1, || {}).unwrap().unwrap();
    }
    let west_before = h.world.region_at_unsynchronized(0, 0).unwrap();
    let east_before = h.world.region_at_unsynchronized(4, 0).unwrap();

    // Bridge: both regions fold into one, tasks included.
    h.world.add_cell(2, 0);
    assert_eq!(h.world.region_count(), 1);
    assert_eq!(h.observed.merges.load(Ordering::Relaxed), 1);
    let merged = h.world.region_at_unsynchronized(2, 0).unwrap();
    assert_eq!(merged.data().tasks().len(), 5);

    let dead = if west_before.is_dead() { &west_before } else { &east_before };
    assert!(dead.is_dead());
    assert_eq!(dead.data().handle().state(), TickState::Cancelled);
    assert!(dead.data().tasks().is_empty());

    // Remove the bridge; the release collects it and splits the region.
    h.world.remove_cell(2, 0);
    assert!(merged.try_mark_ticking(|| false));
    assert!(!merged.mark_not_ticking());
    assert!(merged.is_dead());
    assert_eq!(h.observed.splits.load(Ordering::Relaxed), 1);
    assert_eq!(h.world.region_count(), 2);

    let west = h.world.region_at_unsynchronized(0, 0).unwrap();
    let east = h.world.region_at_unsynchronized(4, 0).unwrap();
    assert_eq!(west.data().tasks().len(), 2);
    assert_eq!(east.data().tasks().len(), 3);
    assert!(west.data().handle().is_scheduled());
    assert!(east.data().handle().is_scheduled());
    assert_eq!(merged.data().handle().state(), TickState::Cancelled);
}

#[test]
fn test_merges_under_load_keep_ticks_exclusive() {
    let h = harness(4, Duration::from_millis(1));
    h.world.add_cell(0, 0);
    h.world.add_cell(4, 0);
    h.world.add_cell(40, 40);
    let handles: Vec<_> = [(0, 0), (4, 0)]
        .iter()
        .map(|&(x, z)| h.world.region_at_unsynchronized(x, z).unwrap())
        .collect();

    assert!(wait_until(Duration::from_secs(5), || {
        h.observed.ticks.load(Ordering::Relaxed) >= 20
    }));

    // Merge while the regions are being ticked; may be deferred to a release.
    h.world.add_cell(2, 0);
    assert!(wait_until(Duration::from_secs(5), || h.world.region_count() == 2));

    let survivor = h.world.region_at_unsynchronized(2, 0).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        survivor.state() != RegionState::Transient
    }));
    let before = survivor.data().ticks();
    assert!(wait_until(Duration::from_secs(5), || {
        survivor.data().ticks() > before + 5
    }));

    for region in &handles {
        if region.id() != survivor.id() {
            assert!(region.is_dead());
            assert!(wait_until(Duration::from_secs(1), || {
                region.data().handle().state() == TickState::Cancelled
            }));
        }
    }

    assert!(!h.observed.overlapped.load(Ordering::Relaxed));
    assert!(!h.observed.unowned.load(Ordering::Relaxed));
    assert_eq!(h.scheduler.alive_threads(), 4, "a worker died");
}
