use std::sync::Arc;

use cellgen_exec::{PrioritisedTask, Priority, TaskQueue};
use cellgen_spatial::CellPos;
use cellgen_task::Diagnostics;

use super::{AdvanceInput, ProgressCore, ProgressKind, ProgressListener, ProgressionTask};
use crate::Stage;

/// Final conversion to [`Stage::Full`], run on the main queue.
///
/// The scheduler marks the cell post-processed when this completes.
pub struct FullTask {
    core: Arc<ProgressCore>,
    task: Arc<PrioritisedTask>,
}

impl FullTask {
    pub(crate) fn new(
        input: AdvanceInput,
        priority: Priority,
        main: &Arc<TaskQueue>,
        diagnostics: &Arc<dyn Diagnostics>,
    ) -> Arc<Self> {
        let core = ProgressCore::new(input.cell, input.target, diagnostics);
        let job_core = Arc::clone(&core);
        let task = main.create_task(
            Box::new(move || {
                let result = input.run();
                job_core.complete(Some(result));
            }),
            priority,
        );
        Arc::new(Self { core, task })
    }
}

impl ProgressionTask for FullTask {
    fn cell(&self) -> CellPos {
        self.core.cell
    }

    fn target_stage(&self) -> Stage {
        self.core.target
    }

    fn kind(&self) -> ProgressKind {
        ProgressKind::Full
    }

    fn schedule(&self) {
        self.core.mark_scheduled();
        self.task.queue();
    }

    fn cancel(&self) {
        if self.task.cancel() {
            self.core.complete(None);
        }
    }

    fn is_scheduled(&self) -> bool {
        self.core.is_scheduled()
    }

    fn is_completed(&self) -> bool {
        self.core.is_completed()
    }

    fn priority(&self) -> Priority {
        self.task.priority()
    }

    fn set_priority(&self, priority: Priority) {
        self.task.set_priority(priority);
    }

    fn raise_priority(&self, priority: Priority) {
        self.task.raise_priority(priority);
    }

    fn lower_priority(&self, priority: Priority) {
        self.task.lower_priority(priority);
    }

    fn on_complete(&self, listener: ProgressListener) {
        self.core.on_complete(listener);
    }
}
