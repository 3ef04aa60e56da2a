//! Scheduler error types.

use cellgen_spatial::CellPos;
use cellgen_task::TaskError;
use thiserror::Error;

use crate::Stage;

/// Failure reported by a [`crate::StageExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("{0}")]
    Failed(String),

    #[error("no executor registered for stage {0}")]
    NoExecutor(Stage),
}

impl From<StageError> for TaskError {
    fn from(error: StageError) -> Self {
        TaskError::Stage(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// Thresholds must rise in level while falling in stage.
    #[error("level table is not monotone at level {level} ({stage})")]
    NonMonotoneLevels { level: u32, stage: Stage },

    #[error("level table is empty")]
    EmptyLevelTable,

    /// A completed transition reported a stage below the recorded one.
    #[error("stage of {cell} would regress from {from} to {to}")]
    StageRegressed { cell: CellPos, from: Stage, to: Stage },

    /// A cell this transition reads from failed, so it can never run.
    #[error("{cell} cannot reach {stage}: neighbour {neighbor} failed")]
    NeighborFailed {
        cell: CellPos,
        stage: Stage,
        neighbor: CellPos,
    },

    #[error("record of {cell} is malformed: {reason}")]
    MalformedRecord { cell: CellPos, reason: String },
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
