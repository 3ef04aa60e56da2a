//! Spatial primitives for cell progression.
//!
//! Cells live on an unbounded 2D grid and are addressed by a packed 64-bit
//! key. Work that writes to neighbouring cells takes an [`AreaLock`] over the
//! square it touches, so transitions whose squares are disjoint run in
//! parallel while overlapping ones serialize.
//!
//! ```text
//!   radius 1 at (0,0)        radius 1 at (5,5)        radius 1 at (1,1)
//!   ┌───────┐                                          ┌───────┐
//!   │ ▪ ▪ ▪ │                 ┌───────┐                │ ▪ ▪ ▪ │ ← shares
//!   │ ▪ ● ▪ │   disjoint →    │ ▪ ● ▪ │                │ ▪ ● ▪ │   sections
//!   │ ▪ ▪ ▪ │   parallel      │ ▪ ▪ ▪ │                │ ▪ ▪ ▪ │   with (0,0)
//!   └───────┘                 └───────┘                └───────┘
//! ```

pub mod area_lock;
mod error;
pub mod pos;
pub mod ring;

pub use area_lock::{AreaGuard, AreaLock, WriteRadius};
pub use error::{SpatialError, SpatialResult};
pub use pos::CellPos;
pub use ring::{MAX_RING_RADIUS, search_ring};
