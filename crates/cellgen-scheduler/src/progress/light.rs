use std::sync::Arc;

use cellgen_exec::Priority;
use cellgen_spatial::CellPos;
use cellgen_task::Diagnostics;
use parking_lot::Mutex;

use super::{AdvanceInput, ProgressCore, ProgressKind, ProgressListener, ProgressionTask};
use crate::Stage;
use crate::light::{LightQueue, LightTicket};

enum Slot {
    Unscheduled { input: AdvanceInput, priority: Priority },
    Queued(LightTicket),
    Dropped,
}

/// Hands the lighting transition to the [`LightQueue`].
pub struct LightTask {
    core: Arc<ProgressCore>,
    queue: Arc<LightQueue>,
    slot: Mutex<Slot>,
}

impl LightTask {
    pub(crate) fn new(
        input: AdvanceInput,
        priority: Priority,
        queue: Arc<LightQueue>,
        diagnostics: &Arc<dyn Diagnostics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: ProgressCore::new(input.cell, input.target, diagnostics),
            queue,
            slot: Mutex::new(Slot::Unscheduled { input, priority }),
        })
    }
}

impl ProgressionTask for LightTask {
    fn cell(&self) -> CellPos {
        self.core.cell
    }

    fn target_stage(&self) -> Stage {
        self.core.target
    }

    fn kind(&self) -> ProgressKind {
        ProgressKind::Light
    }

    fn schedule(&self) {
        self.core.mark_scheduled();
        let mut slot = self.slot.lock();
        let Slot::Unscheduled { input, priority } = std::mem::replace(&mut *slot, Slot::Dropped)
        else {
            return;
        };
        let core = Arc::clone(&self.core);
        let ticket = self.queue.request(
            input,
            priority,
            Box::new(move |result| {
                core.complete(result.cloned());
            }),
        );
        *slot = Slot::Queued(ticket);
    }

    fn cancel(&self) {
        let intercepted = {
            let mut slot = self.slot.lock();
            match &*slot {
                Slot::Unscheduled { .. } => {
                    *slot = Slot::Dropped;
                    true
                }
                Slot::Queued(ticket) => ticket.cancel(),
                Slot::Dropped => false,
            }
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
        match &*self.slot.lock() {
            Slot::Unscheduled { priority, .. } => *priority,
            Slot::Queued(ticket) => ticket.priority(),
            Slot::Dropped => Priority::Idle,
        }
    }

    fn set_priority(&self, next: Priority) {
        match &mut *self.slot.lock() {
            Slot::Unscheduled { priority, .. } => *priority = next,
            Slot::Queued(ticket) => ticket.set_priority(next),
            Slot::Dropped => {}
        }
    }

    fn raise_priority(&self, next: Priority) {
        match &mut *self.slot.lock() {
            Slot::Unscheduled { priority, .. } => *priority = priority.max_priority(next),
            Slot::Queued(ticket) => ticket.raise_priority(next),
            Slot::Dropped => {}
        }
    }

    fn lower_priority(&self, next: Priority) {
        match &mut *self.slot.lock() {
            Slot::Unscheduled { priority, .. } => *priority = priority.min_priority(next),
            Slot::Queued(ticket) => ticket.lower_priority(next),
            Slot::Dropped => {}
        }
    }

    fn on_complete(&self, listener: ProgressListener) {
        self.core.on_complete(listener);
    }
}
