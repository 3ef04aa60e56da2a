//! Tasks that advance one cell by one stage.
//!
//! Every variant is scheduled exactly once and completes exactly once: with
//! the new [`CellData`], with an error, or with `None` when a cancel caught
//! the work before it ran. A cancel that comes too late lets the work finish
//! and its result is still delivered.

mod full;
mod light;
mod load;
mod upgrade;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use cellgen_exec::{Priority, panic_message};
use cellgen_spatial::{CellPos, WriteRadius};
use cellgen_task::{CallbackQueue, Diagnostics, FailureReport, TaskError, TaskResult};
use serde::Serialize;

pub use full::FullTask;
pub use light::LightTask;
pub use load::LoadTask;
pub use upgrade::UpgradeTask;

use crate::{AdvanceRequest, CellData, NeighborView, Stage, StageExecutor};

/// Result delivered by a progression task.
pub type ProgressResult = TaskResult<CellData>;

/// Completion listener; `None` means cancelled before running.
pub type ProgressListener = Box<dyn FnOnce(Option<&ProgressResult>) + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ProgressKind {
    Load,
    Upgrade,
    Full,
    Light,
}

pub trait ProgressionTask: Send + Sync {
    fn cell(&self) -> CellPos;
    fn target_stage(&self) -> Stage;
    fn kind(&self) -> ProgressKind;

    /// Start the work.
    ///
    /// # Panics
    ///
    /// If called twice.
    fn schedule(&self);

    /// Idempotent. Completion may run on the calling stack, so the scheduler
    /// only calls this while holding the cell's section.
    fn cancel(&self);

    fn is_scheduled(&self) -> bool;
    fn is_completed(&self) -> bool;

    fn priority(&self) -> Priority;
    fn set_priority(&self, priority: Priority);
    fn raise_priority(&self, priority: Priority);
    fn lower_priority(&self, priority: Priority);

    fn on_complete(&self, listener: ProgressListener);
}

/// State shared by every variant.
pub(crate) struct ProgressCore {
    cell: CellPos,
    target: Stage,
    scheduled: AtomicBool,
    completion: CallbackQueue<ProgressResult>,
}

impl ProgressCore {
    pub(crate) fn new(
        cell: CellPos,
        target: Stage,
        diagnostics: &Arc<dyn Diagnostics>,
    ) -> Arc<Self> {
        let diagnostics = Arc::clone(diagnostics);
        Arc::new(Self {
            cell,
            target,
            scheduled: AtomicBool::new(false),
            completion: CallbackQueue::with_panic_hook(move |message| {
                diagnostics.report(
                    &FailureReport::new(cell, message)
                        .with("stage", target)
                        .with("phase", "progress callback"),
                );
            }),
        })
    }

    pub(crate) fn mark_scheduled(&self) {
        let already = self.scheduled.swap(true, Ordering::AcqRel);
        assert!(
            !already,
            "progression task for {} to {} scheduled twice",
            self.cell, self.target
        );
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completion.is_completed()
    }

    /// First completion wins; later ones are dropped.
    pub(crate) fn complete(&self, result: Option<ProgressResult>) -> bool {
        self.completion.try_complete(result)
    }

    pub(crate) fn on_complete(&self, listener: ProgressListener) {
        self.completion.add(listener);
    }
}

/// What a transition needs, captured when its task is created.
pub(crate) struct AdvanceInput {
    pub(crate) cell: CellPos,
    pub(crate) target: Stage,
    pub(crate) data: CellData,
    pub(crate) radius: WriteRadius,
    pub(crate) view: Weak<dyn NeighborView>,
    pub(crate) executor: Arc<dyn StageExecutor>,
}

impl AdvanceInput {
    /// Snapshot the neighbours and run the executor.
    pub(crate) fn run(self) -> ProgressResult {
        let neighbors = match (self.radius, self.view.upgrade()) {
            (WriteRadius::Bounded(r), Some(view)) if r > 0 => view.neighbors(self.cell, r),
            _ => Vec::new(),
        };
        let request = AdvanceRequest {
            cell: self.cell,
            target: self.target,
            data: self.data,
            neighbors,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| self.executor.advance(&request))) {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(error)) => Err(error.into()),
            Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
        }
    }
}
