//! Host hooks invoked by the partitioner.
//!
//! Every hook runs on the thread performing the structural change, while the
//! structural lock is held. Hooks must not call back into locking partitioner
//! operations (that is a recursive acquisition and panics); lock-free queries
//! such as [`Regionizer::region_at_unsynchronized`] are fine.

use std::sync::{Arc, Weak};

use rustc_hash::FxHashMap;

use crate::cell::SectionPos;
use crate::region::Region;
use crate::regionizer::Regionizer;

/// Per-region host payload.
pub trait RegionData<C: RegionCallbacks>: Send + Sync {
    /// This region is being split.
    ///
    /// `into` maps every section of the old region to its new owner; `regions`
    /// lists each new region exactly once. Implementations move whatever they
    /// hold into the new regions' payloads.
    fn split(
        &self,
        regionizer: &Regionizer<C>,
        into: &FxHashMap<SectionPos, Arc<Region<C>>>,
        regions: &[Arc<Region<C>>],
    );

    /// This region has been killed and its sections now belong to `into`.
    fn merge_into(&self, into: &Arc<Region<C>>);
}

/// Factories and lifecycle hooks supplied by the host.
pub trait RegionCallbacks: Send + Sync + Sized + 'static {
    /// Payload attached to each region.
    type RegionData: RegionData<Self> + 'static;
    /// Payload attached to each section.
    type SectionData: Send + Sync + 'static;

    /// Create the payload of a new section.
    fn create_section_data(&self, section_x: i32, section_z: i32, section_shift: u32)
    -> Self::SectionData;

    /// Create the payload of a new region.
    ///
    /// `region` cannot be upgraded yet; keep it to reach the region later.
    fn create_region_data(&self, region: &Weak<Region<Self>>) -> Self::RegionData;

    /// The region was registered.
    fn on_region_create(&self, _region: &Arc<Region<Self>>) {}

    /// The region was removed (merged away, split, or emptied).
    fn on_region_destroy(&self, _region: &Arc<Region<Self>>) {}

    /// The region became READY and may be scheduled.
    fn on_region_active(&self, _region: &Arc<Region<Self>>) {}

    /// The region left READY (blocked on a merge, or about to be destroyed).
    fn on_region_inactive(&self, _region: &Arc<Region<Self>>) {}

    /// `from` is about to be merged into `into`.
    fn pre_merge(&self, _from: &Arc<Region<Self>>, _into: &Arc<Region<Self>>) {}

    /// `from` is about to be split into `into`.
    fn pre_split(&self, _from: &Arc<Region<Self>>, _into: &[Arc<Region<Self>>]) {}
}
