//! Executors for cell progression work.
//!
//! # Execution Model
//!
//! ```text
//!                  ┌──────────────────────┐
//!  upgrade tasks ─▶│ RadiusAwareExecutor  │── range free ──┐
//!                  │ (pending, by prio)   │                │
//!                  └──────────────────────┘                ▼
//!  parallel tasks ───────────────────────────────▶ ┌──────────────┐
//!                                                  │  WorkerPool  │ rayon
//!                                                  └──────────────┘
//!  finalization ─────────────────────────────────▶ ┌──────────────┐
//!                                                  │main TaskQueue│ drained
//!                                                  └──────────────┘ per tick
//! ```
//!
//! Every task carries a [`Priority`] that may change until it starts running.

mod pool;
mod priority;
mod radius;
mod task;

pub use pool::WorkerPool;
pub use priority::Priority;
pub use radius::{RadiusAwareExecutor, RadiusTask};
pub use task::{Job, PrioritisedTask, TaskQueue, panic_message};
