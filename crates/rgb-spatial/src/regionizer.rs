//! Online spatial partitioner.
//!
//! # Structure
//!
//! ```text
//! Regionizer
//!   ├── sections:      SkipMap<key, Arc<Section>>   lock-free read index
//!   ├── regions_by_id: SkipMap<id, Arc<Region>>     lock-free registry
//!   └── graph: Mutex<Graph>                         structural lock
//!         ├── regions:  id  -> RegionNode  (state, sections, dead sections, pending merges)
//!         └── sections: pos -> SectionNode (cell bitset, neighbour count, owner)
//! ```
//!
//! Every structural change happens under the graph lock; the lock-free maps are
//! only written while it is held, so point queries are eventually consistent.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, error, trace};

use crate::callbacks::{RegionCallbacks, RegionData};
use crate::cell::{CellPos, SectionPos};
use crate::config::RegionizerConfig;
use crate::error::ConfigResult;
use crate::region::{Region, RegionId, RegionNode, RegionState};
use crate::section::{Liveness, Section, SectionNode};

type SectionHandle<C> = Arc<Section<<C as RegionCallbacks>::SectionData>>;

/// Partitions occupied cells into independently tickable regions.
pub struct Regionizer<C: RegionCallbacks> {
    config: RegionizerConfig,
    callbacks: C,
    this: Weak<Self>,
    sections: SkipMap<u64, SectionHandle<C>>,
    regions_by_id: SkipMap<u64, Arc<Region<C>>>,
    next_region_id: AtomicU64,
    graph: Mutex<Graph<C>>,
    /// Token of the thread holding `graph`, 0 when unlocked.
    lock_owner: AtomicU64,
}

pub(crate) struct Graph<C: RegionCallbacks> {
    regions: FxHashMap<RegionId, RegionNode<C>>,
    sections: FxHashMap<SectionPos, SectionNode<C::SectionData>>,
}

impl<C: RegionCallbacks> Graph<C> {
    fn region(&self, id: RegionId) -> &RegionNode<C> {
        self.regions
            .get(&id)
            .unwrap_or_else(|| panic!("{id:?} is not a live region"))
    }

    fn region_mut(&mut self, id: RegionId) -> &mut RegionNode<C> {
        self.regions
            .get_mut(&id)
            .unwrap_or_else(|| panic!("{id:?} is not a live region"))
    }

    fn section_mut(&mut self, pos: SectionPos) -> &mut SectionNode<C::SectionData> {
        self.sections
            .get_mut(&pos)
            .unwrap_or_else(|| panic!("{pos:?} does not exist"))
    }

    fn apply_liveness(&mut self, region: RegionId, pos: SectionPos, liveness: Liveness) {
        match liveness {
            Liveness::Unchanged => {}
            Liveness::BecameAlive => {
                self.region_mut(region).dead_sections.remove(&pos);
            }
            Liveness::BecameDead => {
                self.region_mut(region).dead_sections.insert(pos);
            }
        }
    }

    fn add_section(&mut self, region: RegionId, pos: SectionPos) {
        let section = self.section_mut(pos);
        assert!(
            section.region == RegionId::NONE,
            "{pos:?} already belongs to {:?}",
            section.region
        );
        section.set_region(region);
        let inserted = self.region_mut(region).sections.insert(pos);
        assert!(inserted, "{region:?} already owns {pos:?}");
    }

    fn merge_into_later(&mut self, from: RegionId, into: RegionId) {
        let target = self.region_mut(into);
        assert!(
            target.state != RegionState::Dead,
            "trying to merge later into dead {into:?}"
        );
        target.expecting_merge_from.insert(from);
        self.region_mut(from).merge_into_later.insert(into);
    }
}

fn thread_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TOKEN: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|token| *token)
}

/// Exclusive access to the structural graph.
struct Locked<'a, C: RegionCallbacks> {
    graph: MutexGuard<'a, Graph<C>>,
    owner: &'a AtomicU64,
    operation: &'static str,
}

impl<C: RegionCallbacks> Deref for Locked<'_, C> {
    type Target = Graph<C>;

    fn deref(&self) -> &Self::Target {
        &self.graph
    }
}

impl<C: RegionCallbacks> DerefMut for Locked<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.graph
    }
}

impl<C: RegionCallbacks> Drop for Locked<'_, C> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("regionizer operation '{}' panicked", self.operation);
        }
        self.owner.store(0, Ordering::Release);
    }
}

/// Consistent snapshot access, holding the structural lock.
///
/// Obtained from [`Regionizer::read`]. Acquiring it (or any other locking
/// operation) again on the same thread while it is alive panics.
pub struct RegionizerReadGuard<'a, C: RegionCallbacks> {
    locked: Locked<'a, C>,
    shift: u32,
}

/// Pending merge relations of a region.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingMerges {
    /// Regions this region owes a merge into.
    pub merge_into_later: Vec<RegionId>,
    /// Regions that owe a merge into this region.
    pub expecting_merge_from: Vec<RegionId>,
}

impl<C: RegionCallbacks> RegionizerReadGuard<'_, C> {
    /// Region owning the section containing cell `(x, z)`.
    #[must_use]
    pub fn region_at(&self, x: i32, z: i32) -> Option<Arc<Region<C>>> {
        let pos = CellPos::new(x, z).section(self.shift);
        let section = self.locked.sections.get(&pos)?;
        self.locked
            .regions
            .get(&section.region)
            .map(|node| node.handle.clone())
    }

    /// Every live (non-dead) region, including transient ones.
    #[must_use]
    pub fn regions(&self) -> Vec<Arc<Region<C>>> {
        self.locked
            .regions
            .values()
            .map(|node| node.handle.clone())
            .collect()
    }

    /// Number of live regions.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.locked.regions.len()
    }

    /// Number of sections, dead ones included.
    #[must_use]
    pub fn section_count(&self) -> usize {
        self.locked.sections.len()
    }

    /// Sections owned by a region (empty if it is not live).
    #[must_use]
    pub fn owned_sections(&self, region: RegionId) -> Vec<SectionPos> {
        self.locked
            .regions
            .get(&region)
            .map(|node| node.sections.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Occupied cells owned by a region (empty if it is not live).
    #[must_use]
    pub fn owned_cells(&self, region: RegionId) -> Vec<CellPos> {
        let Some(node) = self.locked.regions.get(&region) else {
            return Vec::new();
        };
        node.sections
            .iter()
            .filter_map(|pos| self.locked.sections.get(pos))
            .flat_map(SectionNode::cells)
            .collect()
    }

    /// Sections of a region currently marked dead.
    #[must_use]
    pub fn dead_sections(&self, region: RegionId) -> Vec<SectionPos> {
        self.locked
            .regions
            .get(&region)
            .map(|node| node.dead_sections.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Pending merge relations, `None` if the region is not live.
    #[must_use]
    pub fn pending_merges(&self, region: RegionId) -> Option<PendingMerges> {
        let node = self.locked.regions.get(&region)?;
        Some(PendingMerges {
            merge_into_later: node.merge_into_later.iter().copied().collect(),
            expecting_merge_from: node.expecting_merge_from.iter().copied().collect(),
        })
    }

    /// Owner of a section, `None` if the section does not exist.
    #[must_use]
    pub fn section_owner(&self, pos: SectionPos) -> Option<RegionId> {
        self.locked.sections.get(&pos).map(|section| section.region)
    }

    /// Occupied cell count of a section.
    #[must_use]
    pub fn section_cell_count(&self, pos: SectionPos) -> Option<u32> {
        self.locked.sections.get(&pos).map(SectionNode::cell_count)
    }
}

impl<C: RegionCallbacks> Regionizer<C> {
    /// Create a partitioner.
    pub fn new(config: RegionizerConfig, callbacks: C) -> ConfigResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new_cyclic(|this| Self {
            config,
            callbacks,
            this: this.clone(),
            sections: SkipMap::new(),
            regions_by_id: SkipMap::new(),
            next_region_id: AtomicU64::new(1),
            graph: Mutex::new(Graph {
                regions: FxHashMap::default(),
                sections: FxHashMap::default(),
            }),
            lock_owner: AtomicU64::new(0),
        }))
    }

    #[must_use]
    pub const fn config(&self) -> &RegionizerConfig {
        &self.config
    }

    #[must_use]
    pub const fn callbacks(&self) -> &C {
        &self.callbacks
    }

    /// Section coordinate for a cell coordinate.
    #[must_use]
    pub const fn section_coordinate(&self, cell: i32) -> i32 {
        cell >> self.config.section_shift
    }

    fn lock(&self, operation: &'static str) -> Locked<'_, C> {
        let token = thread_token();
        assert!(
            self.lock_owner.load(Ordering::Acquire) != token,
            "cannot recursively operate in the regionizer ({operation})"
        );
        let graph = self.graph.lock();
        self.lock_owner.store(token, Ordering::Release);
        Locked {
            graph,
            owner: &self.lock_owner,
            operation,
        }
    }

    /// Take the structural lock for a consistent snapshot.
    ///
    /// # Panics
    /// If the current thread already holds the structural lock.
    pub fn read(&self) -> RegionizerReadGuard<'_, C> {
        RegionizerReadGuard {
            locked: self.lock("read"),
            shift: self.config.section_shift,
        }
    }

    // ------------------------------------------------------------------
    // Lock-free queries
    // ------------------------------------------------------------------

    /// Region at cell `(x, z)` without locking. May be stale.
    #[must_use]
    pub fn region_at_unsynchronized(&self, x: i32, z: i32) -> Option<Arc<Region<C>>> {
        let key = CellPos::new(x, z).section(self.config.section_shift).key();
        let section = self.sections.get(&key)?;
        let id = section.value().region_id()?;
        self.regions_by_id
            .get(&id.get())
            .map(|entry| entry.value().clone())
    }

    /// Region at cell `(x, z)`, under the structural lock.
    ///
    /// # Panics
    /// If the current thread already holds the structural lock.
    #[must_use]
    pub fn region_at_synchronized(&self, x: i32, z: i32) -> Option<Arc<Region<C>>> {
        self.read().region_at(x, z)
    }

    /// Section containing cell `(x, z)` without locking.
    #[must_use]
    pub fn section_at_unsynchronized(&self, x: i32, z: i32) -> Option<SectionHandle<C>> {
        let key = CellPos::new(x, z).section(self.config.section_shift).key();
        self.sections.get(&key).map(|entry| entry.value().clone())
    }

    /// Region by id without locking. Dead regions are gone.
    #[must_use]
    pub fn region_by_id(&self, id: RegionId) -> Option<Arc<Region<C>>> {
        self.regions_by_id
            .get(&id.get())
            .map(|entry| entry.value().clone())
    }

    /// Number of registered regions without locking.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions_by_id.len()
    }

    /// Run `present` with the region at `(x, z)`, or `absent`, under the lock.
    pub fn compute_at_region_if_present_or_else<R>(
        &self,
        x: i32,
        z: i32,
        present: impl FnOnce(&Arc<Region<C>>) -> R,
        absent: impl FnOnce() -> R,
    ) -> R {
        let guard = self.read();
        match guard.region_at(x, z) {
            Some(region) => present(&region),
            None => absent(),
        }
    }

    /// Run `present` with the region at `(x, z)`, or `absent`, without locking.
    pub fn compute_at_region_if_present_or_else_unsynchronized<R>(
        &self,
        x: i32,
        z: i32,
        present: impl FnOnce(&Arc<Region<C>>) -> R,
        absent: impl FnOnce() -> R,
    ) -> R {
        match self.region_at_unsynchronized(x, z) {
            Some(region) => present(&region),
            None => absent(),
        }
    }

    /// Visit every registered region under the lock.
    pub fn compute_for_all_regions(&self, mut f: impl FnMut(&Arc<Region<C>>)) {
        let _guard = self.lock("compute for all regions");
        for entry in self.regions_by_id.iter() {
            f(entry.value());
        }
    }

    /// Visit every registered region without locking.
    pub fn compute_for_all_regions_unsynchronized(&self, mut f: impl FnMut(&Arc<Region<C>>)) {
        for entry in self.regions_by_id.iter() {
            f(entry.value());
        }
    }

    /// Collect the distinct regions owning a section that intersects the cell
    /// rectangle `[from, to]` (inclusive), pass them to `f` under the lock, and
    /// return how many there were.
    pub fn compute_for_regions(
        &self,
        from_x: i32,
        from_z: i32,
        to_x: i32,
        to_z: i32,
        f: impl FnOnce(&[Arc<Region<C>>]),
    ) -> usize {
        let shift = self.config.section_shift;
        let graph = self.lock("compute for regions");

        let mut seen = FxHashSet::default();
        let mut regions = Vec::new();
        for sz in (from_z >> shift)..=(to_z >> shift) {
            for sx in (from_x >> shift)..=(to_x >> shift) {
                let Some(section) = graph.sections.get(&SectionPos::new(sx, sz)) else {
                    continue;
                };
                if seen.insert(section.region) {
                    regions.push(graph.region(section.region).handle.clone());
                }
            }
        }

        f(&regions);
        regions.len()
    }

    // ------------------------------------------------------------------
    // Occupancy
    // ------------------------------------------------------------------

    /// Mark cell `(x, z)` occupied, creating, attaching and merging regions.
    ///
    /// # Panics
    /// If the cell is already occupied, or the current thread holds the lock.
    pub fn add_cell(&self, x: i32, z: i32) {
        let pos = CellPos::new(x, z).section(self.config.section_shift);
        let mut locked = self.lock("add cell");
        let graph = &mut *locked;

        let mut new_sections: SmallVec<[SectionPos; 32]> = SmallVec::new();

        if let Some(section) = graph.sections.get_mut(&pos) {
            let was_empty = section.is_empty();
            let liveness = section.add_cell(x, z);
            let region = section.region;
            graph.apply_liveness(region, pos, liveness);
            if !was_empty {
                return;
            }
        } else {
            let mut section = self.new_section_node(pos);
            section.add_cell(x, z);
            self.insert_section(graph, section);
            new_sections.push(pos);
        }

        let create_radius = self.config.empty_section_create_radius;
        let search_radius = create_radius + self.config.region_section_merge_radius;
        // Candidate order is unspecified: any non-ticking candidate
        // may become the merge target.
        let mut nearby: hashbrown::HashSet<RegionId> = hashbrown::HashSet::new();

        for dx in -search_radius..=search_radius {
            for dz in -search_radius..=search_radius {
                if dx == 0 && dz == 0 {
                    continue;
                }
                let in_create_range = dx.abs().max(dz.abs()) <= create_radius;
                let neighbour_pos = pos.offset(dx, dz);

                if let Some(neighbour) = graph.sections.get_mut(&neighbour_pos) {
                    let region = neighbour.region;
                    nearby.insert(region);
                    if in_create_range {
                        let liveness = neighbour.increment_neighbours(create_radius);
                        graph.apply_liveness(region, neighbour_pos, liveness);
                    }
                    continue;
                }

                if !in_create_range {
                    continue;
                }

                let mut neighbour = self.new_section_node(neighbour_pos);
                neighbour.increment_neighbours(create_radius);
                self.insert_section(graph, neighbour);
                new_sections.push(neighbour_pos);
            }
        }

        if new_sections.is_empty() {
            return;
        }

        if nearby.is_empty() {
            let region = self.create_region(graph);
            for &section in &new_sections {
                graph.add_section(region, section);
            }
            self.on_region_create(graph, region);
            self.activate(graph, region);
            return;
        }

        let first_unlocked = nearby
            .iter()
            .copied()
            .find(|&id| graph.region(id).state != RegionState::Ticking);

        if let Some(id) = first_unlocked {
            let node = graph.region(id);
            assert!(
                !(node.state == RegionState::Ready && node.has_pending_merges()),
                "illegal state for unlocked {id:?}: READY with pending merges"
            );
        }

        let target = match first_unlocked {
            Some(id) => id,
            None => self.create_region(graph),
        };

        for &section in &new_sections {
            graph.add_section(target, section);
        }

        if first_unlocked.is_none() {
            self.on_region_create(graph, target);
        }

        if first_unlocked.is_some() && nearby.len() == 1 {
            return;
        }

        for &region in &nearby {
            if region == target {
                continue;
            }
            if !self.kill_and_merge_into(graph, region, target) {
                graph.merge_into_later(target, region);
            }
        }

        if let Some(id) = first_unlocked {
            let node = graph.region_mut(id);
            if node.state == RegionState::Ready && node.has_pending_merges() {
                node.set_state(RegionState::Transient);
                let handle = node.handle.clone();
                self.callbacks.on_region_inactive(&handle);
            }
        }

        if first_unlocked.is_none() && !graph.region(target).has_pending_merges() {
            self.activate(graph, target);
        }
    }

    /// Mark cell `(x, z)` empty.
    ///
    /// Sections left without cells and without occupied neighbours are only
    /// marked dead; they are collected when their region is next released.
    ///
    /// # Panics
    /// If the cell is not occupied, or the current thread holds the lock.
    pub fn remove_cell(&self, x: i32, z: i32) {
        let pos = CellPos::new(x, z).section(self.config.section_shift);
        let mut locked = self.lock("remove cell");
        let graph = &mut *locked;

        let section = graph
            .sections
            .get_mut(&pos)
            .unwrap_or_else(|| panic!("cell ({x}, {z}) has no section"));
        let region = section.region;
        let liveness = section.remove_cell(x, z);
        let now_empty = section.is_empty();
        graph.apply_liveness(region, pos, liveness);

        if !now_empty {
            return;
        }

        let radius = self.config.empty_section_create_radius;
        for dx in -radius..=radius {
            for dz in -radius..=radius {
                if dx == 0 && dz == 0 {
                    continue;
                }
                let neighbour_pos = pos.offset(dx, dz);
                if let Some(neighbour) = graph.sections.get_mut(&neighbour_pos) {
                    let region = neighbour.region;
                    let liveness = neighbour.decrement_neighbours();
                    graph.apply_liveness(region, neighbour_pos, liveness);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Ticking rights
    // ------------------------------------------------------------------

    pub(crate) fn try_mark_ticking(&self, id: RegionId, abort: impl FnOnce() -> bool) -> bool {
        let mut graph = self.lock("mark ticking");
        let Some(node) = graph.regions.get_mut(&id) else {
            return false;
        };
        if node.state != RegionState::Ready || abort() {
            return false;
        }
        assert!(
            !node.has_pending_merges(),
            "{id:?} is READY with pending merges"
        );
        node.set_state(RegionState::Ticking);
        true
    }

    pub(crate) fn mark_not_ticking(&self, id: RegionId) -> bool {
        let mut locked = self.lock("release region");
        let graph = &mut *locked;
        let state = graph.regions.get(&id).map(|node| node.state);
        assert!(
            state == Some(RegionState::Ticking),
            "attempting to release {id:?} which is not ticking (state {state:?})"
        );
        self.on_region_release(graph, id);
        graph
            .regions
            .get(&id)
            .is_some_and(|node| node.state == RegionState::Ready)
    }

    fn on_region_release(&self, graph: &mut Graph<C>, id: RegionId) {
        let node = graph.region(id);
        assert!(
            node.merge_into_later.is_empty(),
            "{id:?} should not have any regions to merge into"
        );

        let has_expecting_merges = !node.expecting_merge_from.is_empty();
        if has_expecting_merges {
            let expecting: Vec<RegionId> = node.expecting_merge_from.iter().copied().collect();
            for from in expecting {
                assert!(
                    self.kill_and_merge_into(graph, from, id),
                    "{from:?} should be killable when merging into {id:?}"
                );
            }

            let node = graph.region_mut(id);
            assert!(
                node.expecting_merge_from.is_empty(),
                "{id:?} should no longer have merge requests"
            );
            if !node.merge_into_later.is_empty() {
                node.set_state(RegionState::Transient);
                let handle = node.handle.clone();
                self.callbacks.on_region_inactive(&handle);
                return;
            }
        }

        let node = graph.region(id);
        let remove_dead_sections = has_expecting_merges
            || node.has_no_alive_sections()
            || (node.sections.len() >= self.config.effective_min_recalc_count()
                && node.dead_section_percent() >= self.config.max_dead_section_percent);
        let removed_dead_sections = remove_dead_sections && !node.dead_sections.is_empty();

        if remove_dead_sections {
            let dead: Vec<SectionPos> = graph.region_mut(id).dead_sections.drain().collect();
            for pos in dead {
                let section = graph
                    .sections
                    .remove(&pos)
                    .unwrap_or_else(|| panic!("dead {pos:?} of {id:?} is missing"));
                assert!(section.is_empty(), "dead {section:?} has cells");
                assert!(
                    !section.has_non_empty_neighbours(),
                    "dead {section:?} has non-empty neighbours"
                );
                let owned = graph.region_mut(id).sections.remove(&pos);
                assert!(owned, "{id:?} is inconsistent, it should contain {pos:?}");
                self.sections.remove(&pos.key());
            }
        }

        if !removed_dead_sections {
            self.set_ready(graph, id);
            return;
        }

        let mut remaining: FxHashSet<SectionPos> = graph.region(id).sections.clone();
        if remaining.is_empty() {
            debug!("region {id} has no sections left, destroying");
            graph.region_mut(id).set_state(RegionState::Dead);
            self.on_region_remove(graph, id, true);
            graph.regions.remove(&id);
            return;
        }

        let radius = self.config.split_radius();
        let mut components: Vec<Vec<SectionPos>> = Vec::new();
        while let Some(&start) = remaining.iter().next() {
            remaining.remove(&start);
            let mut component = vec![start];
            let mut idx = 0;
            while idx < component.len() && !remaining.is_empty() {
                let center = component[idx];
                idx += 1;
                for dz in -radius..=radius {
                    for dx in -radius..=radius {
                        if dx == 0 && dz == 0 {
                            continue;
                        }
                        let candidate = center.offset(dx, dz);
                        if remaining.remove(&candidate) {
                            component.push(candidate);
                        }
                    }
                }
            }
            components.push(component);
        }

        if components.len() == 1 {
            self.set_ready(graph, id);
            return;
        }

        self.split(graph, id, components);
    }

    fn split(&self, graph: &mut Graph<C>, id: RegionId, components: Vec<Vec<SectionPos>>) {
        debug!("splitting region {id} into {} regions", components.len());

        let new_ids: Vec<RegionId> = components
            .iter()
            .map(|_| self.create_region(graph))
            .collect();
        let new_regions: Vec<Arc<Region<C>>> = new_ids
            .iter()
            .map(|&new_id| graph.region(new_id).handle.clone())
            .collect();

        let old = graph.region(id).handle.clone();
        self.callbacks.pre_split(&old, &new_regions);

        graph.region_mut(id).set_state(RegionState::Dead);
        self.on_region_remove(graph, id, true);
        graph.regions.remove(&id);

        let mut into = FxHashMap::default();
        for ((sections, &new_id), handle) in components.iter().zip(&new_ids).zip(&new_regions) {
            for &pos in sections {
                graph.section_mut(pos).set_region(new_id);
                graph.region_mut(new_id).sections.insert(pos);
                into.insert(pos, handle.clone());
            }
        }

        old.data().split(self, &into, &new_regions);

        for new_id in new_ids {
            self.on_region_create(graph, new_id);
            self.activate(graph, new_id);
        }
    }

    // ------------------------------------------------------------------
    // Region lifecycle
    // ------------------------------------------------------------------

    fn new_section_node(&self, pos: SectionPos) -> SectionNode<C::SectionData> {
        let shift = self.config.section_shift;
        let data = self.callbacks.create_section_data(pos.x, pos.z, shift);
        SectionNode::new(Arc::new(Section::new(pos, data)), shift)
    }

    fn insert_section(&self, graph: &mut Graph<C>, section: SectionNode<C::SectionData>) {
        let pos = section.pos();
        self.sections.insert(pos.key(), section.handle.clone());
        let previous = graph.sections.insert(pos, section);
        assert!(previous.is_none(), "failed to insert new {pos:?}");
    }

    fn create_region(&self, graph: &mut Graph<C>) -> RegionId {
        let id = RegionId::new(self.next_region_id.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new_cyclic(|weak| {
            Region::new(id, self.this.clone(), self.callbacks.create_region_data(weak))
        });
        graph.regions.insert(id, RegionNode::new(handle));
        id
    }

    fn on_region_create(&self, graph: &Graph<C>, id: RegionId) {
        let handle = graph.region(id).handle.clone();
        assert!(
            !self.regions_by_id.contains_key(&id.get()),
            "{id:?} is already registered"
        );
        self.regions_by_id.insert(id.get(), handle.clone());
        trace!("region {id} created");
        self.callbacks.on_region_create(&handle);
    }

    fn on_region_remove(&self, graph: &Graph<C>, id: RegionId, was_active: bool) {
        let handle = graph.region(id).handle.clone();
        if was_active {
            self.callbacks.on_region_inactive(&handle);
        }
        self.callbacks.on_region_destroy(&handle);
        self.regions_by_id.remove(&id.get());
        trace!("region {id} destroyed");
    }

    fn set_ready(&self, graph: &mut Graph<C>, id: RegionId) {
        let node = graph.region_mut(id);
        assert!(
            !node.has_pending_merges(),
            "{id:?} cannot be READY with pending merges"
        );
        node.set_state(RegionState::Ready);
    }

    fn activate(&self, graph: &mut Graph<C>, id: RegionId) {
        self.set_ready(graph, id);
        let handle = graph.region(id).handle.clone();
        self.callbacks.on_region_active(&handle);
    }

    fn try_kill(&self, graph: &mut Graph<C>, id: RegionId) -> bool {
        let node = graph.region_mut(id);
        match node.state {
            RegionState::Transient => {
                node.set_state(RegionState::Dead);
                self.on_region_remove(graph, id, false);
                true
            }
            RegionState::Ready => {
                node.set_state(RegionState::Dead);
                self.on_region_remove(graph, id, true);
                true
            }
            RegionState::Ticking => false,
            RegionState::Dead => panic!("{id:?} is already dead"),
        }
    }

    /// Kill `source` and fold its sections and pending relations into `target`.
    ///
    /// Returns `false` without side effects if `source` is ticking or `target`
    /// is no longer live.
    pub(crate) fn kill_and_merge_into(
        &self,
        graph: &mut Graph<C>,
        source: RegionId,
        target: RegionId,
    ) -> bool {
        if graph.region(source).state == RegionState::Ticking {
            return false;
        }
        match graph.regions.get(&target) {
            Some(node) if node.state != RegionState::Dead => {}
            _ => return false,
        }

        let from = graph.region(source).handle.clone();
        let into = graph.region(target).handle.clone();
        self.callbacks.pre_merge(&from, &into);

        if !self.try_kill(graph, source) {
            return false;
        }

        self.merge_into(graph, source, target);
        debug!("region {source} merged into {target}");
        true
    }

    fn merge_into(&self, graph: &mut Graph<C>, source: RegionId, target: RegionId) {
        assert_ne!(source, target, "cannot merge a region onto itself");
        let dead = graph
            .regions
            .remove(&source)
            .unwrap_or_else(|| panic!("{source:?} is not a live region"));
        assert!(
            dead.state == RegionState::Dead,
            "source {source:?} is not dead, merging into {target:?}"
        );
        assert!(
            graph.region(target).state != RegionState::Dead,
            "target {target:?} is dead, merging from {source:?}"
        );

        for &pos in &dead.sections {
            graph.section_mut(pos).set_region(target);
            let inserted = graph.region_mut(target).sections.insert(pos);
            assert!(inserted, "{target:?} already owns {pos:?} from {source:?}");
        }
        for &pos in &dead.dead_sections {
            let inserted = graph.region_mut(target).dead_sections.insert(pos);
            assert!(
                inserted,
                "{target:?} already has dead {pos:?} from {source:?}"
            );
        }

        for &region in &dead.expecting_merge_from {
            let removed = graph
                .regions
                .get_mut(&region)
                .is_some_and(|node| node.merge_into_later.remove(&source));
            if removed && region != target {
                graph.merge_into_later(region, target);
            }
        }
        for &region in &dead.merge_into_later {
            let removed = graph
                .regions
                .get_mut(&region)
                .is_some_and(|node| node.expecting_merge_from.remove(&source));
            if removed && region != target {
                graph.merge_into_later(target, region);
            }
        }

        let into = graph.region(target).handle.clone();
        dead.handle.data().merge_into(&into);
    }
}

impl<C: RegionCallbacks> std::fmt::Debug for Regionizer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Regionizer")
            .field("config", &self.config)
            .field("regions", &self.regions_by_id.len())
            .field("sections", &self.sections.len())
            .finish_non_exhaustive()
    }
}
