//! Asynchronous, cancellable tasks that turn disk records into cell data.
//!
//! [`StagedTask`] is the shared primitive: it loads one record through a
//! [`DiskLoader`], processes it on the worker pool and/or the main queue, and
//! delivers the result exactly once through a [`CallbackQueue`]. Failures that
//! cannot be handled where they occur are sent to a [`Diagnostics`] sink.

mod callbacks;
mod context;
mod diagnostics;
mod disk;
mod error;
mod staged;

pub use callbacks::{Callback, CallbackQueue};
pub use context::TaskContext;
pub use diagnostics::{Diagnostics, FailureReport, RecordingDiagnostics, TracingDiagnostics};
pub use disk::{DataCategory, DiskCallback, DiskLoader, DiskRequest, MemoryDisk};
pub use error::{TaskError, TaskResult};
pub use staged::{Handoff, OnMainInput, Phases, StagedTask, StagedWork, TaskStage};
