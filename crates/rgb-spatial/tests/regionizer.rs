//! End-to-end partitioner behaviour: merging, deferred merging, splitting, and
//! the structural invariants under a mixed workload.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use rgb_spatial::{
    CellPos, FxHashMap, Region, RegionCallbacks, RegionData, RegionId, RegionState, Regionizer,
    RegionizerConfig, SectionPos,
};

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    active: AtomicUsize,
    inactive: AtomicUsize,
    merges: AtomicUsize,
    pre_splits: AtomicUsize,
    splits: AtomicUsize,
}

impl Counters {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }
}

struct Hooks(Arc<Counters>);

struct Payload(Arc<Counters>);

impl RegionData<Hooks> for Payload {
    fn split(
        &self,
        _regionizer: &Regionizer<Hooks>,
        into: &FxHashMap<SectionPos, Arc<Region<Hooks>>>,
        regions: &[Arc<Region<Hooks>>],
    ) {
        let distinct: HashSet<RegionId> = into.values().map(|r| r.id()).collect();
        assert_eq!(distinct.len(), regions.len());
        self.0.splits.fetch_add(1, Ordering::Relaxed);
    }

    fn merge_into(&self, into: &Arc<Region<Hooks>>) {
        assert!(!into.is_dead());
        self.0.merges.fetch_add(1, Ordering::Relaxed);
    }
}

impl RegionCallbacks for Hooks {
    type RegionData = Payload;
    type SectionData = ();

    fn create_section_data(&self, _x: i32, _z: i32, _shift: u32) {}

    fn create_region_data(&self, _region: &Weak<Region<Self>>) -> Payload {
        Payload(self.0.clone())
    }

    fn on_region_create(&self, _region: &Arc<Region<Self>>) {
        self.0.created.fetch_add(1, Ordering::Relaxed);
    }

    fn on_region_destroy(&self, region: &Arc<Region<Self>>) {
        assert_eq!(region.state(), RegionState::Dead);
        self.0.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    fn on_region_active(&self, region: &Arc<Region<Self>>) {
        assert_eq!(region.state(), RegionState::Ready);
        self.0.active.fetch_add(1, Ordering::Relaxed);
    }

    fn on_region_inactive(&self, _region: &Arc<Region<Self>>) {
        self.0.inactive.fetch_add(1, Ordering::Relaxed);
    }

    fn pre_split(&self, _from: &Arc<Region<Self>>, _into: &[Arc<Region<Self>>]) {
        self.0.pre_splits.fetch_add(1, Ordering::Relaxed);
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("rgb_spatial=debug")
        .try_init();
}

fn build(config: RegionizerConfig) -> (Arc<Regionizer<Hooks>>, Arc<Counters>) {
    init_tracing();
    let counters = Arc::new(Counters::default());
    let regionizer = Regionizer::new(config, Hooks(counters.clone())).unwrap();
    (regionizer, counters)
}

fn unit_sections(create: i32, merge: i32) -> RegionizerConfig {
    RegionizerConfig::default()
        .with_section_shift(0)
        .with_create_radius(create)
        .with_merge_radius(merge)
}

fn id_at(r: &Regionizer<Hooks>, x: i32, z: i32) -> RegionId {
    r.region_at_unsynchronized(x, z).unwrap().id()
}

fn tick(region: &Region<Hooks>) -> bool {
    assert!(region.try_mark_ticking(|| false));
    region.mark_not_ticking()
}

/// Tick every READY region once, collecting dead sections.
fn tick_all(r: &Regionizer<Hooks>) {
    let mut regions = Vec::new();
    r.compute_for_all_regions(|region| regions.push(region.clone()));
    for region in regions {
        if region.try_mark_ticking(|| false) {
            region.mark_not_ticking();
        }
    }
}

/// Check the structural invariants against the set of occupied cells.
fn check_invariants(r: &Regionizer<Hooks>, occupied: &HashSet<CellPos>) {
    let radius = r.config().split_radius();
    let guard = r.read();

    let mut seen = HashSet::new();
    for region in guard.regions() {
        let id = region.id();
        assert!(!region.is_dead());

        if region.state() == RegionState::Ready {
            let pending = guard.pending_merges(id).unwrap();
            assert!(pending.merge_into_later.is_empty(), "{id:?} READY with pending merges");
            assert!(pending.expecting_merge_from.is_empty(), "{id:?} READY with pending merges");
        }

        for cell in guard.owned_cells(id) {
            assert!(occupied.contains(&cell), "{cell:?} owned by {id:?} but not occupied");
            assert!(seen.insert(cell), "{cell:?} owned by two regions");
        }

        let sections: HashSet<SectionPos> = guard.owned_sections(id).into_iter().collect();
        assert!(!sections.is_empty());
        for &pos in &sections {
            assert_eq!(guard.section_owner(pos), Some(id));
        }

        let start = *sections.iter().next().unwrap();
        let mut reached = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(pos) = queue.pop_front() {
            for dx in -radius..=radius {
                for dz in -radius..=radius {
                    let next = pos.offset(dx, dz);
                    if sections.contains(&next) && reached.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
        }
        assert_eq!(reached.len(), sections.len(), "{id:?} is not connected");
    }

    assert_eq!(seen.len(), occupied.len(), "some occupied cell has no region");
}

#[test]
fn test_isolated_cells_get_own_regions() {
    let (r, counters) = build(unit_sections(2, 1));
    r.add_cell(0, 0);
    r.add_cell(7, 0);

    assert_ne!(id_at(&r, 0, 0), id_at(&r, 7, 0));
    assert_eq!(r.region_count(), 2);
    assert_eq!(Counters::get(&counters.created), 2);
    assert_eq!(Counters::get(&counters.active), 2);
    assert_eq!(r.region_at_unsynchronized(3, 0).map(|region| region.id()), None);
}

#[test]
fn test_bridging_cell_merges_regions() {
    let (r, counters) = build(unit_sections(2, 1));
    r.add_cell(0, 0);
    r.add_cell(7, 0);
    r.add_cell(3, 0);

    let region = id_at(&r, 0, 0);
    assert_eq!(id_at(&r, 7, 0), region);
    assert_eq!(id_at(&r, 3, 0), region);
    assert_eq!(r.region_count(), 1);
    assert_eq!(Counters::get(&counters.merges), 1);
    assert_eq!(Counters::get(&counters.destroyed), 1);
    assert_eq!(
        r.region_at_unsynchronized(0, 0).unwrap().state(),
        RegionState::Ready
    );

    let mut cells = r.region_at_unsynchronized(3, 0).unwrap().owned_cells();
    cells.sort();
    assert_eq!(
        cells,
        vec![CellPos::new(0, 0), CellPos::new(3, 0), CellPos::new(7, 0)]
    );
}

#[test]
fn test_three_way_merge_in_one_step() {
    let (r, counters) = build(unit_sections(2, 1));
    r.add_cell(-2, -1);
    r.add_cell(8, -1);
    r.add_cell(3, 5);
    assert_eq!(r.region_count(), 3);

    r.add_cell(3, 0);
    assert_eq!(r.region_count(), 1);
    assert_eq!(Counters::get(&counters.merges), 2);
    let id = id_at(&r, 3, 0);
    for (x, z) in [(-2, -1), (8, -1), (3, 5)] {
        assert_eq!(id_at(&r, x, z), id);
    }
}

/// Cells (0,0), (10,10), (3,3) with create radius 2 and merge radius 1.
///
/// `add_cell` looks `create + merge = 3` sections out from the new cell. At
/// shift 0, (3,3) reaches the first region but not the second (7 sections
/// away). At any coarser shift (10,10) already lands within reach of the
/// first region, so no second region ever forms.
#[test]
fn test_three_cell_example_across_shifts() {
    let cells = [CellPos::new(0, 0), CellPos::new(10, 10), CellPos::new(3, 3)];
    for shift in 0..=4 {
        let config = RegionizerConfig::default()
            .with_section_shift(shift)
            .with_create_radius(2)
            .with_merge_radius(1);
        let (r, counters) = build(config);

        r.add_cell(0, 0);
        r.add_cell(10, 10);
        let independent = id_at(&r, 0, 0) != id_at(&r, 10, 10);
        assert_eq!(independent, shift == 0, "shift {shift}");

        r.add_cell(3, 3);
        check_invariants(&r, &cells.iter().copied().collect());
        assert_eq!(id_at(&r, 3, 3), id_at(&r, 0, 0), "shift {shift}");
        if shift == 0 {
            assert_eq!(r.region_count(), 2);
            assert_ne!(id_at(&r, 10, 10), id_at(&r, 0, 0));
            assert_eq!(Counters::get(&counters.merges), 0);
        } else {
            assert_eq!(r.region_count(), 1, "shift {shift}");
            assert_eq!(id_at(&r, 10, 10), id_at(&r, 0, 0));
        }
    }
}

#[test]
fn test_chained_merges_fire_once_per_absorbed_region() {
    let (r, counters) = build(unit_sections(2, 1));
    r.add_cell(0, 0);
    r.add_cell(7, 0);
    r.add_cell(14, 0);
    assert_eq!(r.region_count(), 3);

    r.add_cell(3, 0);
    r.add_cell(10, 0);
    assert_eq!(r.region_count(), 1);
    assert_eq!(Counters::get(&counters.merges), 2);
}

#[test]
fn test_merge_into_ticking_region_is_deferred() {
    let (r, counters) = build(unit_sections(2, 1));
    r.add_cell(0, 0);
    r.add_cell(7, 0);
    let a = r.region_at_unsynchronized(0, 0).unwrap();
    let b = r.region_at_unsynchronized(7, 0).unwrap();

    assert!(a.try_mark_ticking(|| false));
    r.add_cell(3, 0);

    // The bridge went to the idle region, which now owes a merge.
    assert_eq!(id_at(&r, 3, 0), b.id());
    assert_eq!(b.state(), RegionState::Transient);
    assert!(!b.try_mark_ticking(|| false));
    {
        let guard = r.read();
        let pending = guard.pending_merges(b.id()).unwrap();
        assert_eq!(pending.merge_into_later, vec![a.id()]);
        let pending = guard.pending_merges(a.id()).unwrap();
        assert_eq!(pending.expecting_merge_from, vec![b.id()]);
    }

    assert!(a.mark_not_ticking());
    assert!(b.is_dead());
    assert_eq!(a.state(), RegionState::Ready);
    assert_eq!(r.region_count(), 1);
    for x in [0, 3, 7] {
        assert_eq!(id_at(&r, x, 0), a.id());
    }
    assert_eq!(Counters::get(&counters.merges), 1);
}

#[test]
fn test_bridge_between_ticking_regions_resolves_in_order() {
    let (r, _counters) = build(unit_sections(2, 1));
    r.add_cell(0, 0);
    r.add_cell(7, 0);
    let a = r.region_at_unsynchronized(0, 0).unwrap();
    let b = r.region_at_unsynchronized(7, 0).unwrap();

    assert!(a.try_mark_ticking(|| false));
    assert!(b.try_mark_ticking(|| false));
    r.add_cell(3, 0);

    let bridge = r.region_at_unsynchronized(3, 0).unwrap();
    assert_ne!(bridge.id(), a.id());
    assert_ne!(bridge.id(), b.id());
    assert_eq!(bridge.state(), RegionState::Transient);

    // `a` absorbs the bridge and inherits its debt to `b`.
    assert!(!a.mark_not_ticking());
    assert!(bridge.is_dead());
    assert_eq!(a.state(), RegionState::Transient);

    assert!(b.mark_not_ticking());
    assert!(a.is_dead());
    assert_eq!(r.region_count(), 1);
    for x in [0, 3, 7] {
        assert_eq!(id_at(&r, x, 0), b.id());
    }
}

#[test]
fn test_gap_splits_region_on_release() {
    let config = unit_sections(1, 1).with_gc(2, 0.1);
    let (r, counters) = build(config);
    for x in [0, 2, 4] {
        r.add_cell(x, 0);
    }
    assert_eq!(r.region_count(), 1);
    let original = r.region_at_unsynchronized(0, 0).unwrap();

    r.remove_cell(2, 0);
    // Removal alone never restructures.
    assert_eq!(r.region_count(), 1);
    assert_eq!(id_at(&r, 0, 0), original.id());

    assert!(!tick(&original));
    assert!(original.is_dead());
    assert_eq!(r.region_count(), 2);
    assert_eq!(Counters::get(&counters.pre_splits), 1);
    assert_eq!(Counters::get(&counters.splits), 1);

    let left = r.region_at_unsynchronized(0, 0).unwrap();
    let right = r.region_at_unsynchronized(4, 0).unwrap();
    assert_ne!(left.id(), right.id());
    assert_eq!(left.state(), RegionState::Ready);
    assert_eq!(right.state(), RegionState::Ready);
    assert!(r.region_at_unsynchronized(2, 0).is_none());
    assert_eq!(left.owned_cells(), vec![CellPos::new(0, 0)]);
    assert_eq!(right.center_cell(), Some(CellPos::new(4, 0)));
}

#[test]
fn test_split_into_k_components() {
    let config = unit_sections(1, 1).with_gc(2, 0.05);
    let (r, counters) = build(config);
    // A row of four islands joined by bridge cells.
    for x in (0..=12).step_by(2) {
        r.add_cell(x, 0);
    }
    assert_eq!(r.region_count(), 1);
    for x in [2, 6, 10] {
        r.remove_cell(x, 0);
    }
    let region = r.region_at_unsynchronized(0, 0).unwrap();
    tick(&region);

    assert_eq!(r.region_count(), 4);
    assert_eq!(Counters::get(&counters.splits), 1);
    let ids: HashSet<RegionId> = [0, 4, 8, 12].iter().map(|&x| id_at(&r, x, 0)).collect();
    assert_eq!(ids.len(), 4);
}

#[test]
fn test_emptied_region_is_destroyed() {
    let (r, counters) = build(unit_sections(1, 1));
    r.add_cell(0, 0);
    let region = r.region_at_unsynchronized(0, 0).unwrap();
    r.remove_cell(0, 0);

    assert!(!tick(&region));
    assert!(region.is_dead());
    assert_eq!(r.region_count(), 0);
    assert_eq!(r.read().section_count(), 0);
    assert_eq!(Counters::get(&counters.destroyed), 1);
    assert_eq!(Counters::get(&counters.inactive), 1);

    r.add_cell(0, 0);
    assert_eq!(r.region_count(), 1);
}

#[test]
fn test_ticking_rights_are_exclusive_across_threads() {
    let (r, _) = build(unit_sections(2, 1));
    r.add_cell(0, 0);
    let region = r.region_at_unsynchronized(0, 0).unwrap();
    let inside = AtomicUsize::new(0);
    let entered = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..500 {
                    if region.try_mark_ticking(|| false) {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        entered.fetch_add(1, Ordering::Relaxed);
                        std::hint::spin_loop();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        assert!(region.mark_not_ticking());
                    }
                }
            });
        }
    });

    assert!(entered.load(Ordering::Relaxed) > 0);
    assert_eq!(region.state(), RegionState::Ready);
}

#[test]
fn test_compute_for_regions_counts_distinct() {
    let (r, _) = build(unit_sections(2, 1));
    r.add_cell(0, 0);
    r.add_cell(20, 0);
    r.add_cell(1, 0);

    let mut seen = Vec::new();
    let count = r.compute_for_regions(-5, -5, 25, 5, |regions| {
        seen.extend(regions.iter().map(|region| region.id()));
    });
    assert_eq!(count, 2);
    assert_eq!(seen.len(), 2);

    assert_eq!(r.compute_for_regions(100, 100, 110, 110, |_| {}), 0);

    let found = r.compute_at_region_if_present_or_else(20, 0, |region| Some(region.id()), || None);
    assert_eq!(found, Some(id_at(&r, 20, 0)));
    let missing = r.compute_at_region_if_present_or_else_unsynchronized(50, 50, |_| true, || false);
    assert!(!missing);
}

#[test]
fn test_invariants_under_mixed_workload() {
    let config = RegionizerConfig::default()
        .with_section_shift(2)
        .with_create_radius(1)
        .with_merge_radius(1)
        .with_gc(2, 0.1);
    let (r, _) = build(config);

    let mut occupied = HashSet::new();
    let mut state = 0x2545_f491_4f6c_dd1d_u64;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };

    for step in 0..2_000 {
        let x = (next() % 96) as i32 - 48;
        let z = (next() % 96) as i32 - 48;
        let cell = CellPos::new(x, z);
        if occupied.remove(&cell) {
            r.remove_cell(x, z);
        } else {
            occupied.insert(cell);
            r.add_cell(x, z);
        }

        if step % 97 == 0 {
            tick_all(&r);
        }
        if step % 50 == 0 {
            check_invariants(&r, &occupied);
        }
    }

    // Drain everything; regions disappear once released.
    for cell in occupied.drain().collect::<Vec<_>>() {
        r.remove_cell(cell.x, cell.z);
    }
    for _ in 0..4 {
        tick_all(&r);
    }
    check_invariants(&r, &occupied);
    assert_eq!(r.region_count(), 0);
}

#[test]
#[should_panic(expected = "has no section")]
fn test_remove_unoccupied_cell_panics() {
    let (r, _) = build(unit_sections(2, 1));
    r.remove_cell(100, 100);
}

#[test]
#[should_panic(expected = "already occupied")]
fn test_double_add_panics() {
    let (r, _) = build(unit_sections(2, 1));
    r.add_cell(1, 1);
    r.add_cell(1, 1);
}
