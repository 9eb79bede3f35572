//! Cell and section coordinates.

use std::fmt;

/// Pack two signed coordinates into one key, `x` in the low half.
#[must_use]
pub const fn pack_key(x: i32, z: i32) -> u64 {
    (x as u32 as u64) | ((z as u32 as u64) << 32)
}

/// Position of a single occupancy cell.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellPos {
    pub x: i32,
    pub z: i32,
}

impl CellPos {
    /// Create a new cell position.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Packed key (same layout as [`SectionPos::key`]).
    #[must_use]
    pub const fn key(self) -> u64 {
        pack_key(self.x, self.z)
    }

    /// Unpack a cell position from its key.
    #[must_use]
    pub const fn from_key(key: u64) -> Self {
        Self {
            x: key as u32 as i32,
            z: (key >> 32) as u32 as i32,
        }
    }

    /// Section containing this cell for a given section shift.
    #[must_use]
    pub const fn section(self, shift: u32) -> SectionPos {
        SectionPos::new(self.x >> shift, self.z >> shift)
    }
}

impl fmt::Debug for CellPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cell({}, {})", self.x, self.z)
    }
}

/// Position of a section in section-space.
///
/// A section covers `2^shift × 2^shift` cells; section `(sx, sz)` owns cells
/// `[sx << shift, (sx + 1) << shift)` on each axis. Negative coordinates use
/// arithmetic shift, so cell `-1` lives in section `-1`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionPos {
    pub x: i32,
    pub z: i32,
}

impl SectionPos {
    /// Create a new section position.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Packed key, used to index sections.
    #[must_use]
    pub const fn key(self) -> u64 {
        pack_key(self.x, self.z)
    }

    /// Unpack a section position from its key.
    #[must_use]
    pub const fn from_key(key: u64) -> Self {
        Self {
            x: key as u32 as i32,
            z: (key >> 32) as u32 as i32,
        }
    }

    /// Offset this position by `(dx, dz)` sections.
    #[must_use]
    pub const fn offset(self, dx: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.z + dz)
    }

    /// Chebyshev (square) distance to another section.
    #[must_use]
    pub fn distance(self, other: Self) -> i32 {
        chebyshev_distance((self.x, self.z), (other.x, other.z))
    }
}

impl fmt::Debug for SectionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Section({}, {})", self.x, self.z)
    }
}

/// Compute Chebyshev distance between two grid positions.
#[must_use]
pub fn chebyshev_distance(a: (i32, i32), b: (i32, i32)) -> i32 {
    let dx = (a.0 - b.0).abs();
    let dz = (a.1 - b.1).abs();
    dx.max(dz)
}
