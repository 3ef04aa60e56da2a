//! Cells ordered by Manhattan distance from a consumer's center.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use cellgen_spatial::CellPos;

/// Min-heap of cells keyed by distance from `center`, FIFO among equals.
#[derive(Clone, Debug, Default)]
pub struct DistanceQueue {
    center: CellPos,
    heap: BinaryHeap<Reverse<(u32, u64, u64)>>,
    seq: u64,
}

impl DistanceQueue {
    #[must_use]
    pub fn new(center: CellPos) -> Self {
        Self {
            center,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn center(&self) -> CellPos {
        self.center
    }

    /// Empty the queue and re-center it.
    pub fn reset(&mut self, center: CellPos) {
        self.heap.clear();
        self.center = center;
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn push(&mut self, cell: CellPos) {
        self.seq += 1;
        self.heap
            .push(Reverse((cell.manhattan(self.center), self.seq, cell.key())));
    }

    #[must_use]
    pub fn peek(&self) -> Option<CellPos> {
        self.heap
            .peek()
            .map(|Reverse((_, _, key))| CellPos::from_key(*key))
    }

    pub fn pop(&mut self) -> Option<CellPos> {
        self.heap
            .pop()
            .map(|Reverse((_, _, key))| CellPos::from_key(key))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Linear scan.
    #[must_use]
    pub fn contains(&self, cell: CellPos) -> bool {
        let key = cell.key();
        self.heap.iter().any(|Reverse((_, _, k))| *k == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pops_nearest_first() {
        let mut queue = DistanceQueue::new(CellPos::new(10, 10));
        for cell in [
            CellPos::new(13, 10),
            CellPos::new(10, 11),
            CellPos::new(8, 8),
            CellPos::new(10, 10),
            CellPos::new(11, 10),
        ] {
            queue.push(cell);
        }
        assert_eq!(queue.peek(), Some(CellPos::new(10, 10)));

        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(
            order,
            vec![
                CellPos::new(10, 10),
                CellPos::new(10, 11),
                CellPos::new(11, 10),
                CellPos::new(13, 10),
                CellPos::new(8, 8),
            ]
        );
    }

    #[test]
    fn test_reset_recenters() {
        let mut queue = DistanceQueue::new(CellPos::ORIGIN);
        queue.push(CellPos::new(5, 0));
        queue.reset(CellPos::new(5, 0));
        assert!(queue.is_empty());

        queue.push(CellPos::ORIGIN);
        queue.push(CellPos::new(5, 1));
        assert_eq!(queue.pop(), Some(CellPos::new(5, 1)));
        assert!(queue.contains(CellPos::ORIGIN));
    }
}
