//! Regions: connected sets of sections, the unit of independent ticking.

use std::fmt;
use std::sync::Weak;
use std::sync::atomic::{AtomicU8, Ordering};

use rustc_hash::FxHashSet;

use crate::callbacks::RegionCallbacks;
use crate::cell::{CellPos, SectionPos};
use crate::regionizer::Regionizer;

/// Identifier of a region, unique within one [`Regionizer`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(u64);

impl RegionId {
    /// Sentinel stored in sections that have no region yet.
    pub(crate) const NONE: Self = Self(0);

    pub(crate) const fn new(raw: u64) -> Self {
        assert!(raw != 0, "region id 0 is reserved");
        Self(raw)
    }

    pub(crate) const fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }

    /// Raw id value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Region#{}", self.0)
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a region.
///
/// ```text
/// TRANSIENT ──▶ READY ◀──▶ TICKING
///     │           │           │ (release with pending merges)
///     │           │           ▼
///     └───────────┴──────▶ DEAD      TRANSIENT
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegionState {
    /// Created or blocked on a merge; not schedulable.
    Transient = 0,
    /// Schedulable; no pending merge obligations.
    Ready = 1,
    /// Exclusively held by one thread.
    Ticking = 2,
    /// Merged away or split; never comes back.
    Dead = 3,
}

impl RegionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Transient,
            1 => Self::Ready,
            2 => Self::Ticking,
            _ => Self::Dead,
        }
    }
}

/// Shared handle to a region.
///
/// The handle is stable for the lifetime of the region; structural state
/// (sections, pending merges) lives inside the partitioner and is only touched
/// under its lock. The `state` field is written under that lock and may be read
/// without it.
pub struct Region<C: RegionCallbacks> {
    id: RegionId,
    state: AtomicU8,
    regionizer: Weak<Regionizer<C>>,
    data: C::RegionData,
}

impl<C: RegionCallbacks> Region<C> {
    pub(crate) fn new(id: RegionId, regionizer: Weak<Regionizer<C>>, data: C::RegionData) -> Self {
        Self {
            id,
            state: AtomicU8::new(RegionState::Transient as u8),
            regionizer,
            data,
        }
    }

    /// Region id.
    #[must_use]
    pub const fn id(&self) -> RegionId {
        self.id
    }

    /// Host payload created by [`RegionCallbacks::create_region_data`].
    #[must_use]
    pub const fn data(&self) -> &C::RegionData {
        &self.data
    }

    /// Current state; may be stale by the time the caller looks at it.
    #[must_use]
    pub fn state(&self) -> RegionState {
        RegionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: RegionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[must_use]
    pub fn is_ticking(&self) -> bool {
        self.state() == RegionState::Ticking
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.state() == RegionState::Dead
    }

    /// The partitioner that owns this region, if it is still alive.
    #[must_use]
    pub fn regionizer(&self) -> Option<std::sync::Arc<Regionizer<C>>> {
        self.regionizer.upgrade()
    }

    /// Acquire exclusive ticking rights.
    ///
    /// Succeeds only if the region is READY and `abort` returns `false`;
    /// `abort` runs under the structural lock.
    ///
    /// # Panics
    /// If called while the current thread holds the structural lock.
    pub fn try_mark_ticking(&self, abort: impl FnOnce() -> bool) -> bool {
        match self.regionizer.upgrade() {
            Some(regionizer) => regionizer.try_mark_ticking(self.id, abort),
            None => false,
        }
    }

    /// Release ticking rights, resolving deferred merges and collecting dead
    /// sections (possibly splitting this region).
    ///
    /// Returns `true` if the region is READY afterwards; `false` means it is
    /// now TRANSIENT (blocked on a merge) or DEAD (merged away or split).
    ///
    /// # Panics
    /// If the region is not TICKING.
    pub fn mark_not_ticking(&self) -> bool {
        match self.regionizer.upgrade() {
            Some(regionizer) => regionizer.mark_not_ticking(self.id),
            None => false,
        }
    }

    /// Positions of every section owned by this region, taking the read lock.
    #[must_use]
    pub fn owned_sections(&self) -> Vec<SectionPos> {
        self.regionizer
            .upgrade()
            .map(|r| r.read().owned_sections(self.id))
            .unwrap_or_default()
    }

    /// Every occupied cell owned by this region, taking the read lock.
    #[must_use]
    pub fn owned_cells(&self) -> Vec<CellPos> {
        self.regionizer
            .upgrade()
            .map(|r| r.read().owned_cells(self.id))
            .unwrap_or_default()
    }

    /// Median owned section by key order.
    #[must_use]
    pub fn center_section(&self) -> Option<SectionPos> {
        let mut sections = self.owned_sections();
        if sections.is_empty() {
            return None;
        }
        sections.sort_unstable_by_key(|s| s.key());
        Some(sections[sections.len() >> 1])
    }

    /// Median owned cell by key order.
    #[must_use]
    pub fn center_cell(&self) -> Option<CellPos> {
        let mut cells = self.owned_cells();
        if cells.is_empty() {
            return None;
        }
        cells.sort_unstable_by_key(|c| c.key());
        Some(cells[cells.len() >> 1])
    }
}

impl<C: RegionCallbacks> fmt::Debug for Region<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Mutable region state. Lives in the structural graph, touched only under the lock.
pub(crate) struct RegionNode<C: RegionCallbacks> {
    pub(crate) handle: std::sync::Arc<Region<C>>,
    pub(crate) state: RegionState,
    pub(crate) sections: FxHashSet<SectionPos>,
    pub(crate) dead_sections: FxHashSet<SectionPos>,
    /// Regions this one owes a merge into (blocked because they were ticking).
    pub(crate) merge_into_later: FxHashSet<RegionId>,
    /// Regions that owe a merge into this one.
    pub(crate) expecting_merge_from: FxHashSet<RegionId>,
}

impl<C: RegionCallbacks> RegionNode<C> {
    pub(crate) fn new(handle: std::sync::Arc<Region<C>>) -> Self {
        Self {
            handle,
            state: RegionState::Transient,
            sections: FxHashSet::default(),
            dead_sections: FxHashSet::default(),
            merge_into_later: FxHashSet::default(),
            expecting_merge_from: FxHashSet::default(),
        }
    }

    pub(crate) fn id(&self) -> RegionId {
        self.handle.id()
    }

    pub(crate) fn set_state(&mut self, state: RegionState) {
        self.state = state;
        self.handle.set_state(state);
    }

    pub(crate) fn has_pending_merges(&self) -> bool {
        !self.merge_into_later.is_empty() || !self.expecting_merge_from.is_empty()
    }

    pub(crate) fn has_no_alive_sections(&self) -> bool {
        self.dead_sections.len() == self.sections.len()
    }

    pub(crate) fn dead_section_percent(&self) -> f64 {
        self.dead_sections.len() as f64 / self.sections.len() as f64
    }
}
