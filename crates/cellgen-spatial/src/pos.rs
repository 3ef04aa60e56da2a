//! Cell coordinates and their packed 64-bit keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coordinate of one cell in the unbounded grid.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellPos {
    pub x: i32,
    pub z: i32,
}

impl CellPos {
    /// The origin cell.
    pub const ORIGIN: CellPos = CellPos { x: 0, z: 0 };

    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Pack into a single key: `z` in the high half, `x` in the low half.
    #[must_use]
    pub const fn key(self) -> u64 {
        ((self.z as u32 as u64) << 32) | (self.x as u32 as u64)
    }

    /// Unpack a key produced by [`CellPos::key`].
    #[must_use]
    pub const fn from_key(key: u64) -> Self {
        Self {
            x: key as u32 as i32,
            z: (key >> 32) as u32 as i32,
        }
    }

    #[must_use]
    pub const fn offset(self, dx: i32, dz: i32) -> Self {
        Self {
            x: self.x.wrapping_add(dx),
            z: self.z.wrapping_add(dz),
        }
    }

    /// Like [`CellPos::offset`] but clamped at the edges of the grid.
    #[must_use]
    pub const fn saturating_offset(self, dx: i32, dz: i32) -> Self {
        Self {
            x: self.x.saturating_add(dx),
            z: self.z.saturating_add(dz),
        }
    }

    /// Taxicab distance, used for queue ordering. Saturates at `u32::MAX`.
    #[must_use]
    pub const fn manhattan(self, other: Self) -> u32 {
        self.x.abs_diff(other.x).saturating_add(self.z.abs_diff(other.z))
    }

    /// Square (king-move) distance, used for neighborhoods and write radii.
    #[must_use]
    pub const fn chebyshev(self, other: Self) -> u32 {
        let dx = self.x.abs_diff(other.x);
        let dz = self.z.abs_diff(other.z);
        if dx > dz { dx } else { dz }
    }

    /// Lock section containing this cell for a given shift.
    #[must_use]
    pub const fn section(self, shift: u32) -> Self {
        Self {
            x: self.x >> shift,
            z: self.z >> shift,
        }
    }

    /// All cells within `radius` (square), row by row.
    pub fn square(self, radius: u32) -> impl Iterator<Item = CellPos> {
        let r = radius as i32;
        (-r..=r).flat_map(move |dz| (-r..=r).map(move |dx| self.offset(dx, dz)))
    }
}

impl fmt::Debug for CellPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellPos({}, {})", self.x, self.z)
    }
}

impl fmt::Display for CellPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

impl From<(i32, i32)> for CellPos {
    fn from((x, z): (i32, i32)) -> Self {
        Self::new(x, z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_roundtrip_negative_coordinates() {
        for pos in [
            CellPos::new(0, 0),
            CellPos::new(-1, -1),
            CellPos::new(i32::MIN, i32::MAX),
            CellPos::new(12, -7),
        ] {
            assert_eq!(CellPos::from_key(pos.key()), pos);
        }
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(CellPos::new(1, 0).key(), 1);
        assert_eq!(CellPos::new(0, 1).key(), 1 << 32);
        assert_eq!(CellPos::new(-1, 0).key(), 0xFFFF_FFFF);
    }

    #[test]
    fn test_distances() {
        let a = CellPos::new(0, 0);
        let b = CellPos::new(3, -4);
        assert_eq!(a.manhattan(b), 7);
        assert_eq!(a.chebyshev(b), 4);
    }

    #[test]
    fn test_distances_at_grid_edges() {
        let low = CellPos::new(i32::MIN, i32::MIN);
        let high = CellPos::new(i32::MAX, i32::MAX);
        assert_eq!(low.manhattan(high), u32::MAX);
        assert_eq!(low.chebyshev(high), u32::MAX);
        assert_eq!(high.offset(1, 0), CellPos::new(i32::MIN, i32::MAX));
        assert_eq!(high.saturating_offset(1, 1), high);
        assert_eq!(low.saturating_offset(-3, 2), CellPos::new(i32::MIN, i32::MIN + 2));
    }

    #[test]
    fn test_section_floors_negative() {
        assert_eq!(CellPos::new(-1, 15).section(4), CellPos::new(-1, 0));
        assert_eq!(CellPos::new(16, -17).section(4), CellPos::new(1, -2));
    }

    #[test]
    fn test_square_count() {
        assert_eq!(CellPos::new(5, 5).square(2).count(), 25);
    }
}
