//! Rate-limited admission of cells into a [`cellgen_scheduler::CellScheduler`].
//!
//! Each consumer gets an [`AdmissionController`] that turns its position and
//! view radii into leases, one queue step at a time, and hands finished cells
//! to a [`CellSink`]. Rates and concurrency limits come from a shared
//! [`ConfigHandle`] that can be hot-reloaded through a [`ConfigWatcher`].

mod area;
mod config;
mod controller;
mod queue;
mod rate;

pub use area::SquareArea;
pub use config::{
    AdmissionConfig, ConfigError, ConfigHandle, ConfigResult, ConfigWatcher, ViewDistances,
};
pub use controller::{
    AdmissionController, CellSink, ConsumerStage, ConsumerView, Distances, MAX_DISTANCE,
    MAX_RATE, QueueLens,
};
pub use queue::DistanceQueue;
pub use rate::{AllocatingRateLimiter, NANOS_PER_SECOND};
