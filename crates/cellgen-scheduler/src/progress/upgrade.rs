use std::sync::Arc;

use cellgen_exec::{PrioritisedTask, Priority, RadiusAwareExecutor, RadiusTask, WorkerPool};
use cellgen_spatial::CellPos;
use cellgen_task::Diagnostics;

use super::{AdvanceInput, ProgressCore, ProgressKind, ProgressListener, ProgressionTask};
use crate::Stage;

enum Route {
    /// Parallel-capable stage on the worker pool.
    Pool(Arc<PrioritisedTask>),
    /// Serialized with overlapping transitions.
    Radius(Arc<RadiusTask>),
}

/// Runs a registered [`crate::StageExecutor`] for one generation stage.
pub struct UpgradeTask {
    core: Arc<ProgressCore>,
    route: Route,
}

impl UpgradeTask {
    pub(crate) fn new(
        input: AdvanceInput,
        parallel: bool,
        priority: Priority,
        pool: &WorkerPool,
        radius: &RadiusAwareExecutor,
        diagnostics: &Arc<dyn Diagnostics>,
    ) -> Arc<Self> {
        let core = ProgressCore::new(input.cell, input.target, diagnostics);
        let (cell, write_radius) = (input.cell, input.radius);
        let job_core = Arc::clone(&core);
        let job = Box::new(move || {
            let result = input.run();
            job_core.complete(Some(result));
        });

        let route = if parallel {
            Route::Pool(pool.create_task(job, priority))
        } else {
            Route::Radius(radius.create_task(cell, write_radius, job, priority))
        };
        Arc::new(Self { core, route })
    }
}

impl ProgressionTask for UpgradeTask {
    fn cell(&self) -> CellPos {
        self.core.cell
    }

    fn target_stage(&self) -> Stage {
        self.core.target
    }

    fn kind(&self) -> ProgressKind {
        ProgressKind::Upgrade
    }

    fn schedule(&self) {
        self.core.mark_scheduled();
        match &self.route {
            Route::Pool(task) => {
                task.queue();
            }
            Route::Radius(task) => {
                task.queue();
            }
        }
    }

    fn cancel(&self) {
        let intercepted = match &self.route {
            Route::Pool(task) => task.cancel(),
            Route::Radius(task) => task.cancel(),
        };
        if intercepted {
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
        match &self.route {
            Route::Pool(task) => task.priority(),
            Route::Radius(task) => task.priority(),
        }
    }

    fn set_priority(&self, priority: Priority) {
        match &self.route {
            Route::Pool(task) => task.set_priority(priority),
            Route::Radius(task) => task.set_priority(priority),
        };
    }

    fn raise_priority(&self, priority: Priority) {
        match &self.route {
            Route::Pool(task) => task.raise_priority(priority),
            Route::Radius(task) => task.raise_priority(priority),
        };
    }

    fn lower_priority(&self, priority: Priority) {
        match &self.route {
            Route::Pool(task) => task.lower_priority(priority),
            Route::Radius(task) => task.lower_priority(priority),
        };
    }

    fn on_complete(&self, listener: ProgressListener) {
        self.core.on_complete(listener);
    }
}
