//! Task error types.

use thiserror::Error;

/// Error carried as the result of a failed task.
///
/// Cloneable so a single failure can be delivered to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The disk loader could not produce the record.
    #[error("disk error: {0}")]
    Disk(String),

    /// A record was read but could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A stage executor reported failure.
    #[error("stage executor failed: {0}")]
    Stage(String),

    /// A phase body panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The work was asked to run a phase it does not implement.
    #[error("phase not implemented: {0}")]
    MissingPhase(&'static str),
}

/// Result type for task operations.
pub type TaskResult<T> = Result<T, TaskError>;
