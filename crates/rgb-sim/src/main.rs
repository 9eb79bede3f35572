//! Soak runner for the regionizer and tick scheduler.
//!
//! Occupies and vacates random cells while regions are ticked on a worker
//! pool, queueing deferred tasks along the way. A root tick reports progress.
//!
//! Environment:
//! - `RGB_THREADS`: worker threads (default 4)
//! - `RGB_CELLS`: cell operations per second (default 2000)
//! - `RGB_DURATION`: run time in seconds (default 10)
//! - `RGB_INTERVAL_MS`: region tick interval (default 50)

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rgb_spatial::{Regionizer, RegionizerConfig};
use rgb_tick::{
    RegionLogic, RootTick, SchedulerConfig, TickRegion, TickRegionizerExt, TickRegions,
    TickScheduler,
};
use tracing::{debug, info, warn};

/// World extent, in cells, on each axis around the origin.
const WORLD_RADIUS: i32 = 2048;

#[derive(Default)]
struct Stats {
    ticks: AtomicU64,
    tasks: AtomicU64,
    merges: AtomicU64,
    splits: AtomicU64,
}

struct SimLogic {
    stats: Arc<Stats>,
}

impl RegionLogic for SimLogic {
    fn tick(&self, region: &Arc<TickRegion<Self>>, tick: u64) {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        if tick % 100 == 0 {
            debug!(region = %region.id(), tick, "region tick");
        }
    }

    fn on_merge(&self, _from: &Arc<TickRegion<Self>>, _into: &Arc<TickRegion<Self>>) {
        self.stats.merges.fetch_add(1, Ordering::Relaxed);
    }

    fn on_split(&self, _from: &Arc<TickRegion<Self>>, _into: &[Arc<TickRegion<Self>>]) {
        self.stats.splits.fetch_add(1, Ordering::Relaxed);
    }
}

struct XorShift(u64);

impl XorShift {
    const fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    const fn coord(&mut self) -> i32 {
        (self.next() % (2 * WORLD_RADIUS as u64)) as i32 - WORLD_RADIUS
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rgb_sim=info".parse()?),
        )
        .init();

    let threads: usize = env_or("RGB_THREADS", 4);
    let cells_per_sec: u64 = env_or("RGB_CELLS", 2_000);
    let duration = Duration::from_secs(env_or("RGB_DURATION", 10));
    let interval = Duration::from_millis(env_or("RGB_INTERVAL_MS", 50));

    info!(threads, cells_per_sec, ?duration, ?interval, "starting soak");

    let scheduler = Arc::new(TickScheduler::new(
        SchedulerConfig::default()
            .with_core_threads(threads)
            .with_thread_name_prefix("rgb-sim-worker"),
    )?);
    let stats = Arc::new(Stats::default());
    let callbacks = TickRegions::new(
        SimLogic {
            stats: stats.clone(),
        },
        scheduler.clone(),
        interval,
    )?;
    let world = Regionizer::new(RegionizerConfig::default(), callbacks)?;

    let report = {
        let world = world.clone();
        let stats = stats.clone();
        RootTick::new(Duration::from_secs(1), move |pass| {
            if pass > 0 {
                info!(
                    regions = world.region_count(),
                    ticks = stats.ticks.load(Ordering::Relaxed),
                    tasks = stats.tasks.load(Ordering::Relaxed),
                    merges = stats.merges.load(Ordering::Relaxed),
                    splits = stats.splits.load(Ordering::Relaxed),
                    "progress"
                );
            }
            true
        })
    };
    // Held until shutdown; the scheduler only keeps a weak reference.
    let report_handle = report.handle(Instant::now());
    scheduler.try_schedule(&report_handle)?;

    let mut rng = XorShift(0x9e37_79b9_7f4a_7c15);
    let mut occupied: Vec<(i32, i32)> = Vec::new();
    let mut occupied_set = HashSet::new();
    let step = Duration::from_secs(1) / u32::try_from(cells_per_sec.max(1)).unwrap_or(u32::MAX);
    let started = Instant::now();

    while started.elapsed() < duration {
        // Bias towards adding so the world fills up before it churns.
        if occupied.is_empty() || rng.next() % 3 != 0 {
            let cell = (rng.coord(), rng.coord());
            if occupied_set.insert(cell) {
                world.add_cell(cell.0, cell.1);
                occupied.push(cell);
            }
        } else {
            let idx = (rng.next() % occupied.len() as u64) as usize;
            let (x, z) = occupied.swap_remove(idx);
            occupied_set.remove(&(x, z));
            world.remove_cell(x, z);
        }

        if let Some(&(x, z)) = occupied.last() {
            let priority = (rng.next() % 8) as usize;
            let counter = stats.clone();
            world.queue_task(x, z, priority, move || {
                counter.tasks.fetch_add(1, Ordering::Relaxed);
            })?;
        }

        thread::sleep(step);
    }

    scheduler.halt();
    if !scheduler.join(Duration::from_secs(5)) {
        warn!(
            alive = scheduler.alive_threads(),
            "workers did not stop in time"
        );
    }

    info!(
        occupied = occupied.len(),
        regions = world.region_count(),
        ticks = stats.ticks.load(Ordering::Relaxed),
        tasks = stats.tasks.load(Ordering::Relaxed),
        merges = stats.merges.load(Ordering::Relaxed),
        splits = stats.splits.load(Ordering::Relaxed),
        root_passes = report.ticks(),
        "soak finished"
    );
    drop(report_handle);

    Ok(())
}
