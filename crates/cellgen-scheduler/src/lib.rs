//! Lease-driven progression of cells through their generation stages.
//!
//! Consumers attach [`Lease`]s to cells. The lowest lease level on a cell maps
//! through the [`LevelTable`] to the [`Stage`] the cell should reach, and the
//! [`CellScheduler`] walks it there one stage at a time:
//!
//! - loading the record from disk ([`LoadTask`]),
//! - running the registered [`StageExecutor`] for each generation stage, on
//!   the worker pool or under an area lock ([`UpgradeTask`]),
//! - batching light work through the [`LightQueue`] ([`LightTask`]),
//! - finishing on the main queue ([`FullTask`]).
//!
//! Stages never regress. Lowering a cell's target cancels work that has not
//! started; once no lease remains and nothing is in flight, the cell is
//! written back and evicted.

mod data;
mod error;
mod holder;
mod lease;
mod light;
mod progress;
mod registry;
mod scheduler;
mod stage;

pub use data::{AuxRecord, AuxRecordWork, CellData, CellRecordWork};
pub use error::{SchedulerError, SchedulerResult, StageError};
pub use holder::{HolderSnapshot, StageWaiter};
pub use lease::{Lease, LeaseCategory, LeaseOp, LeaseSet};
pub use light::LightQueue;
pub use progress::{
    FullTask, LightTask, LoadTask, ProgressKind, ProgressListener, ProgressResult,
    ProgressionTask, UpgradeTask,
};
pub use registry::{AdvanceRequest, Neighbor, NeighborView, StageExecutor, StageRegistry};
pub use scheduler::{CellScheduler, SchedulerConfig, SchedulerContext};
pub use stage::{
    BLOCK_TICKING_LEVEL, ENTITY_TICKING_LEVEL, FULL_LEVEL, LevelTable, MAX_LEVEL, Stage,
};
