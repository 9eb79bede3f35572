#![allow(clippy::redundant_pub_crate)]
#![allow(clippy::missing_fields_in_debug)]

//! Work-stealing deadline scheduler for per-region ticks.
//!
//! # Execution Model
//!
//! ```text
//! worker ─┬─ wait for earliest deadline: own ticks, or anyone's + steal_threshold
//!         ├─ while waiting: run deferred-task slices (≤ task_time_slice each)
//!         ├─ deadline reached: take tick ─▶ run_tick ─▶ reinsert or retire
//!         └─ nothing queued: park until interrupted
//! ```
//!
//! A tick is handed to the worker that will be free soonest; it stays private
//! to that worker for `steal_threshold` past its deadline, then any worker may
//! take it. A tick is only ever run by one worker at a time.
//!
//! [`TickRegions`] plugs this into an [`rgb_spatial::Regionizer`] so every
//! region becomes a tick that is scheduled while READY.
//!
//! # Example
//!
//! ```ignore
//! let scheduler = Arc::new(TickScheduler::new(SchedulerConfig::default())?);
//! let callbacks = TickRegions::new(MyLogic, scheduler.clone(), Duration::from_millis(50))?;
//! let regionizer = Regionizer::new(RegionizerConfig::default(), callbacks)?;
//!
//! regionizer.add_cell(0, 0); // region created, READY, scheduled
//! regionizer.queue_task(0, 0, 0, || println!("runs before the next pass"))?;
//! ```

mod clock;
pub mod config;
pub mod error;
pub mod priority;
pub mod region;
pub mod root;
pub mod scheduler;
pub mod tasks;
pub mod tick;

pub use config::SchedulerConfig;
pub use error::{QueueError, SchedulerError, SchedulerResult};
pub use priority::{DEFAULT_MAX_PRIORITY, DynamicPriorityQueue};
pub use region::{RegionLogic, RegionTickData, TickRegion, TickRegionizerExt, TickRegions};
pub use root::RootTick;
pub use scheduler::TickScheduler;
pub use tasks::{Task, TaskId, TaskIds, TaskQueue};
pub use tick::{SchedulableTick, TickHandle, TickState};
