#![allow(clippy::redundant_pub_crate)]
#![allow(clippy::missing_fields_in_debug)]

//! RGB Spatial Partitioning
//!
//! Groups occupied cells of an unbounded 2D grid into regions that can be
//! ticked independently and in parallel.
//!
//! # Model
//!
//! ```text
//! cell (x, z) ──▶ section (x >> shift, z >> shift) ──▶ region
//! ```
//!
//! - Occupying a cell creates its section plus a ring of empty sections within
//!   `empty_section_create_radius`, so nearby regions meet before they touch.
//! - Sections within `region_section_merge_radius` of each other always end up
//!   in the same region. Regions that come close merge, immediately when the
//!   other side is idle or deferred until it stops ticking.
//! - Emptied sections are only marked dead; they are collected when their
//!   region releases its ticking rights, which may split it.
//!
//! # Example
//!
//! ```ignore
//! let regionizer = Regionizer::new(RegionizerConfig::default(), MyCallbacks)?;
//! regionizer.add_cell(10, 10);
//!
//! let region = regionizer.region_at_unsynchronized(10, 10).unwrap();
//! if region.try_mark_ticking(|| false) {
//!     // exclusive access to everything in `region`
//!     region.mark_not_ticking();
//! }
//! ```

pub mod callbacks;
pub mod cell;
pub mod config;
pub mod error;
pub mod region;
pub mod regionizer;
pub mod section;

pub use callbacks::{RegionCallbacks, RegionData};
pub use cell::{CellPos, SectionPos, chebyshev_distance, pack_key};
pub use config::RegionizerConfig;
pub use error::{ConfigError, ConfigResult};
pub use region::{Region, RegionId, RegionState};
pub use regionizer::{PendingMerges, Regionizer, RegionizerReadGuard};
pub use rustc_hash::FxHashMap;
pub use section::Section;
