use std::sync::Arc;

use cellgen_exec::{TaskQueue, WorkerPool};

use crate::{Diagnostics, DiskLoader};

/// Executors and collaborators shared by every task of one scheduler.
#[derive(Clone)]
pub struct TaskContext {
    /// Runs off-main phases.
    pub pool: Arc<WorkerPool>,
    /// Runs on-main phases; drained by the host loop.
    pub main: Arc<TaskQueue>,
    pub disk: Arc<dyn DiskLoader>,
    pub diagnostics: Arc<dyn Diagnostics>,
}

impl core::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskContext")
            .field("pool", &self.pool)
            .field("main", &self.main)
            .finish_non_exhaustive()
    }
}
