//! Search rings: every cell of a square ordered by Manhattan distance.
//!
//! Admission walks the ring of a consumer's load radius once per movement and
//! relies on the order to fill its distance-sorted queues without sorting.
//! Within one Manhattan distance the cells are spread apart (greedy
//! farthest-point by square distance) so that consecutive admissions touch
//! disjoint neighborhoods and generation can run in parallel.
//!
//! ```text
//!  distance:   2
//!            2 1 2
//!          2 1 0 1 2
//!            2 1 2
//!              2
//! ```
//!
//! Rings are built lazily, once per radius, and shared for the process
//! lifetime.

use std::sync::OnceLock;

use crate::{CellPos, SpatialError, SpatialResult};

/// Largest radius with a precomputed ring (64 plus a margin of 2).
pub const MAX_RING_RADIUS: u32 = 66;

static RINGS: [OnceLock<Box<[CellPos]>>; MAX_RING_RADIUS as usize + 1] =
    [const { OnceLock::new() }; MAX_RING_RADIUS as usize + 1];

/// Offsets of every cell within `radius` (square), in non-decreasing
/// Manhattan distance from the origin.
pub fn search_ring(radius: u32) -> SpatialResult<&'static [CellPos]> {
    let slot = RINGS
        .get(radius as usize)
        .ok_or(SpatialError::RadiusOutOfRange {
            radius,
            max: MAX_RING_RADIUS,
        })?;
    Ok(slot.get_or_init(|| build_ring(radius)))
}

fn build_ring(radius: u32) -> Box<[CellPos]> {
    let r = radius as i32;
    let side = 2 * radius as usize + 1;
    let mut out = Vec::with_capacity(side * side);

    for distance in 0..=2 * r {
        // first quadrant (x, z >= 0) at this distance, clipped to the square
        let lo = (distance - r).max(0);
        let hi = distance.min(r);
        let quadrant: Vec<CellPos> = (lo..=hi).map(|x| CellPos::new(x, distance - x)).collect();

        for pos in spread(quadrant) {
            out.push(pos);
            if pos.x != 0 {
                out.push(CellPos::new(-pos.x, pos.z));
            }
            if pos.x != 0 && pos.z != 0 {
                out.push(CellPos::new(-pos.x, -pos.z));
            }
            if pos.z != 0 {
                out.push(CellPos::new(pos.x, -pos.z));
            }
        }
    }

    debug_assert_eq!(out.len(), side * side);
    out.into_boxed_slice()
}

/// Reorder so each next cell maximises its minimum square distance to the
/// cells already taken.
fn spread(mut pending: Vec<CellPos>) -> Vec<CellPos> {
    let mut out = Vec::with_capacity(pending.len());
    let Some(first) = pending.pop() else {
        return out;
    };
    out.push(first);

    let mut min_dist: Vec<u32> = pending.iter().map(|p| p.chebyshev(first)).collect();

    while !pending.is_empty() {
        let mut best = 0;
        for i in 1..pending.len() {
            if min_dist[i] > min_dist[best] {
                best = i;
            }
        }

        let chosen = pending.remove(best);
        min_dist.remove(best);
        for (pos, dist) in pending.iter().zip(min_dist.iter_mut()) {
            *dist = (*dist).min(pos.chebyshev(chosen));
        }
        out.push(chosen);
    }

    out
}
