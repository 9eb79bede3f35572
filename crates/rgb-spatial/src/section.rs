//! Sections: fixed-size square grids of cells, the unit of region membership.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cell::{CellPos, SectionPos};
use crate::region::RegionId;

/// Shared, lock-free view of a section.
///
/// Published in the partitioner's section index. Only the owning region id is
/// mutable here; it is written with release ordering (under the structural lock)
/// and read with acquire ordering, so a reader that resolves the id through the
/// region registry never observes a half-built region.
pub struct Section<S> {
    pos: SectionPos,
    region: AtomicU64,
    data: S,
}

impl<S> Section<S> {
    pub(crate) const fn new(pos: SectionPos, data: S) -> Self {
        Self {
            pos,
            region: AtomicU64::new(RegionId::NONE.get()),
            data,
        }
    }

    /// Section coordinates.
    #[must_use]
    pub const fn pos(&self) -> SectionPos {
        self.pos
    }

    /// Host data attached at creation.
    #[must_use]
    pub const fn data(&self) -> &S {
        &self.data
    }

    /// Id of the owning region, if the section has been attached yet.
    #[must_use]
    pub fn region_id(&self) -> Option<RegionId> {
        RegionId::from_raw(self.region.load(Ordering::Acquire))
    }

    pub(crate) fn set_region_release(&self, region: RegionId) {
        self.region.store(region.get(), Ordering::Release);
    }
}

impl<S> fmt::Debug for Section<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Section")
            .field("pos", &self.pos)
            .field("region", &self.region_id())
            .finish_non_exhaustive()
    }
}

/// Outcome of an occupancy change that may flip a section between dead and alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Liveness {
    Unchanged,
    BecameAlive,
    BecameDead,
}

/// Mutable section state. Lives in the structural graph, touched only under the lock.
pub(crate) struct SectionNode<S> {
    pub(crate) handle: std::sync::Arc<Section<S>>,
    /// Owning region; mirrors `handle.region`.
    pub(crate) region: RegionId,
    cells: Box<[u64]>,
    cell_count: u32,
    non_empty_neighbours: u32,
    shift: u32,
    mask: i32,
}

impl<S> SectionNode<S> {
    pub(crate) fn new(handle: std::sync::Arc<Section<S>>, shift: u32) -> Self {
        let size = 1usize << shift;
        let words = (size * size / 64).max(1);
        Self {
            handle,
            region: RegionId::NONE,
            cells: vec![0; words].into_boxed_slice(),
            cell_count: 0,
            non_empty_neighbours: 0,
            shift,
            mask: (1 << shift) - 1,
        }
    }

    pub(crate) fn pos(&self) -> SectionPos {
        self.handle.pos()
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.cell_count == 0
    }

    pub(crate) const fn cell_count(&self) -> u32 {
        self.cell_count
    }

    pub(crate) const fn has_non_empty_neighbours(&self) -> bool {
        self.non_empty_neighbours != 0
    }

    /// Dead sections have no cells and no occupied section within the create radius.
    pub(crate) const fn is_dead(&self) -> bool {
        self.cell_count == 0 && self.non_empty_neighbours == 0
    }

    pub(crate) fn set_region(&mut self, region: RegionId) {
        self.region = region;
        self.handle.set_region_release(region);
    }

    fn index(&self, x: i32, z: i32) -> usize {
        ((x & self.mask) | ((z & self.mask) << self.shift)) as usize
    }

    pub(crate) fn contains_cell(&self, x: i32, z: i32) -> bool {
        let idx = self.index(x, z);
        self.cells[idx >> 6] & (1 << (idx & 63)) != 0
    }

    /// Mark a cell occupied.
    ///
    /// # Panics
    /// If the cell is already occupied.
    pub(crate) fn add_cell(&mut self, x: i32, z: i32) -> Liveness {
        let idx = self.index(x, z);
        let bit = 1u64 << (idx & 63);
        let word = self.cells[idx >> 6];
        assert!(
            word & bit == 0,
            "cannot add cell ({x}, {z}) to {:?}: already occupied",
            self.pos()
        );
        self.cells[idx >> 6] = word | bit;
        self.cell_count += 1;
        if self.cell_count == 1 && self.non_empty_neighbours == 0 {
            Liveness::BecameAlive
        } else {
            Liveness::Unchanged
        }
    }

    /// Mark a cell empty.
    ///
    /// # Panics
    /// If the cell is not occupied.
    pub(crate) fn remove_cell(&mut self, x: i32, z: i32) -> Liveness {
        let idx = self.index(x, z);
        let bit = 1u64 << (idx & 63);
        let word = self.cells[idx >> 6];
        assert!(
            word & bit != 0,
            "cannot remove cell ({x}, {z}) from {:?}: not occupied",
            self.pos()
        );
        self.cells[idx >> 6] = word & !bit;
        self.cell_count -= 1;
        if self.cell_count == 0 && self.non_empty_neighbours == 0 {
            Liveness::BecameDead
        } else {
            Liveness::Unchanged
        }
    }

    pub(crate) fn increment_neighbours(&mut self, create_radius: i32) -> Liveness {
        self.non_empty_neighbours += 1;
        let side = (create_radius * 2 + 1) as u32;
        assert!(
            self.non_empty_neighbours < side * side,
            "non-empty neighbours of {:?} exceeded max for radius {create_radius}",
            self.pos()
        );
        if self.non_empty_neighbours == 1 && self.cell_count == 0 {
            Liveness::BecameAlive
        } else {
            Liveness::Unchanged
        }
    }

    pub(crate) fn decrement_neighbours(&mut self) -> Liveness {
        assert!(
            self.non_empty_neighbours > 0,
            "non-empty neighbours of {:?} went negative",
            self.pos()
        );
        self.non_empty_neighbours -= 1;
        if self.non_empty_neighbours == 0 && self.cell_count == 0 {
            Liveness::BecameDead
        } else {
            Liveness::Unchanged
        }
    }

    /// Occupied cells in this section.
    pub(crate) fn cells(&self) -> Vec<CellPos> {
        let mut out = Vec::with_capacity(self.cell_count as usize);
        if self.cell_count == 0 {
            return out;
        }
        let pos = self.pos();
        let offset_x = pos.x << self.shift;
        let offset_z = pos.z << self.shift;
        for (word_idx, &word) in self.cells.iter().enumerate() {
            let mut value = word;
            while value != 0 {
                let bit = value.trailing_zeros() as usize;
                value &= value - 1;
                let idx = (word_idx << 6) | bit;
                let local_x = (idx as i32) & self.mask;
                let local_z = ((idx >> self.shift) as i32) & self.mask;
                out.push(CellPos::new(offset_x | local_x, offset_z | local_z));
            }
        }
        out
    }
}

impl<S> fmt::Debug for SectionNode<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionNode")
            .field("pos", &self.pos())
            .field("cell_count", &self.cell_count)
            .field("non_empty_neighbours", &self.non_empty_neighbours)
            .field("region", &self.region)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn node(x: i32, z: i32, shift: u32) -> SectionNode<()> {
        SectionNode::new(Arc::new(Section::new(SectionPos::new(x, z), ())), shift)
    }

    #[test]
    fn test_cells_roundtrip_negative_section() {
        let mut n = node(-1, -2, 4);
        assert_eq!(n.add_cell(-1, -17), Liveness::BecameAlive);
        assert_eq!(n.add_cell(-16, -32), Liveness::Unchanged);
        let mut cells = n.cells();
        cells.sort();
        assert_eq!(cells, vec![CellPos::new(-16, -32), CellPos::new(-1, -17)]);
        assert!(n.contains_cell(-1, -17));
        assert!(!n.contains_cell(-2, -17));
    }

    #[test]
    fn test_single_cell_section_shift_zero() {
        let mut n = node(7, -3, 0);
        n.add_cell(7, -3);
        assert_eq!(n.cells(), vec![CellPos::new(7, -3)]);
        assert_eq!(n.remove_cell(7, -3), Liveness::BecameDead);
    }

    #[test]
    fn test_neighbours_keep_section_alive() {
        let mut n = node(0, 0, 2);
        assert_eq!(n.increment_neighbours(2), Liveness::BecameAlive);
        assert_eq!(n.add_cell(1, 1), Liveness::Unchanged);
        assert_eq!(n.remove_cell(1, 1), Liveness::Unchanged);
        assert!(!n.is_dead());
        assert_eq!(n.decrement_neighbours(), Liveness::BecameDead);
        assert!(n.is_dead());
    }

    #[test]
    #[should_panic(expected = "already occupied")]
    fn test_double_add_panics() {
        let mut n = node(0, 0, 4);
        n.add_cell(3, 3);
        n.add_cell(3, 3);
    }

    #[test]
    #[should_panic(expected = "not occupied")]
    fn test_remove_absent_panics() {
        let mut n = node(0, 0, 4);
        n.remove_cell(3, 3);
    }
}
