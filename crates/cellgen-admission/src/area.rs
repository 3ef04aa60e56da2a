//! A square of cells tracked across moves, reporting the cells that leave it.

use cellgen_spatial::CellPos;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SquareArea {
    square: Option<(CellPos, u32)>,
}

impl SquareArea {
    #[must_use]
    pub const fn new() -> Self {
        Self { square: None }
    }

    #[must_use]
    pub const fn is_tracking(&self) -> bool {
        self.square.is_some()
    }

    #[must_use]
    pub fn contains(&self, cell: CellPos) -> bool {
        self.square
            .is_some_and(|(center, radius)| cell.chebyshev(center) <= radius)
    }

    /// Move the square. Returns the cells that were inside and no longer are.
    pub fn update(&mut self, center: CellPos, radius: u32) -> Vec<CellPos> {
        let Some((old_center, old_radius)) = self.square.replace((center, radius)) else {
            return Vec::new();
        };
        if (old_center, old_radius) == (center, radius) {
            return Vec::new();
        }
        old_center
            .square(old_radius)
            .filter(|cell| cell.chebyshev(center) > radius)
            .collect()
    }

    /// Stop tracking. Returns every cell that was inside.
    pub fn remove(&mut self) -> Vec<CellPos> {
        self.square
            .take()
            .map(|(center, radius)| center.square(radius).collect())
            .unwrap_or_default()
    }
}
