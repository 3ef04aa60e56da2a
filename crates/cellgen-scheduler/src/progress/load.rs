//! Materialization: the cell record plus its two auxiliary datasets.
//!
//! The three loads are independent and may finish in any order, so completion
//! is a countdown from three rather than a chain. The auxiliary loads belong
//! to the cell holder and may be shared with an earlier load task; one that
//! has already finished counts down as soon as the callback is attached.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use cellgen_exec::Priority;
use cellgen_spatial::CellPos;
use cellgen_task::{Diagnostics, StagedTask};
use parking_lot::Mutex;

use super::{ProgressCore, ProgressKind, ProgressListener, ProgressResult, ProgressionTask};
use crate::{AuxRecordWork, CellRecordWork, Stage};

struct Countdown {
    core: Arc<ProgressCore>,
    remaining: AtomicI32,
    record: Mutex<Option<ProgressResult>>,
}

impl Countdown {
    fn count_down(&self) {
        let left = self.remaining.fetch_sub(1, Ordering::AcqRel) - 1;
        assert!(
            left >= 0,
            "load countdown for {} fell below zero",
            self.core.cell
        );
        if left == 0 {
            let record = self.record.lock().take();
            self.core.complete(record);
        }
    }
}

pub struct LoadTask {
    core: Arc<ProgressCore>,
    record: Arc<StagedTask<CellRecordWork>>,
    aux: [Arc<StagedTask<AuxRecordWork>>; 2],
    countdown: Arc<Countdown>,
}

impl LoadTask {
    pub(crate) fn new(
        record: Arc<StagedTask<CellRecordWork>>,
        aux: [Arc<StagedTask<AuxRecordWork>>; 2],
        diagnostics: &Arc<dyn Diagnostics>,
    ) -> Arc<Self> {
        let core = ProgressCore::new(record.cell(), Stage::Empty, diagnostics);
        let countdown = Arc::new(Countdown {
            core: Arc::clone(&core),
            remaining: AtomicI32::new(3),
            record: Mutex::new(None),
        });
        Arc::new(Self {
            core,
            record,
            aux,
            countdown,
        })
    }
}

impl ProgressionTask for LoadTask {
    fn cell(&self) -> CellPos {
        self.core.cell
    }

    fn target_stage(&self) -> Stage {
        Stage::Empty
    }

    fn kind(&self) -> ProgressKind {
        ProgressKind::Load
    }

    fn schedule(&self) {
        self.core.mark_scheduled();

        let countdown = Arc::clone(&self.countdown);
        self.record.add_callback(move |result| {
            match result {
                Some(result) => *countdown.record.lock() = Some(result.clone()),
                // cancelled: nothing left worth waiting for
                None => {
                    countdown.core.complete(None);
                }
            }
            countdown.count_down();
        });
        for aux in &self.aux {
            let countdown = Arc::clone(&self.countdown);
            aux.add_callback(move |_| countdown.count_down());
        }

        self.record.schedule(false);
        for aux in &self.aux {
            aux.schedule(false);
        }
    }

    fn cancel(&self) {
        if !self.core.is_scheduled() {
            self.core.complete(None);
            return;
        }
        self.record.cancel();
        for aux in &self.aux {
            aux.cancel();
        }
    }

    fn is_scheduled(&self) -> bool {
        self.core.is_scheduled()
    }

    fn is_completed(&self) -> bool {
        self.core.is_completed()
    }

    fn priority(&self) -> Priority {
        self.record.priority()
    }

    /// Shared auxiliary loads are only ever raised.
    fn set_priority(&self, priority: Priority) {
        self.record.set_priority(priority);
        for aux in &self.aux {
            aux.raise_priority(priority);
        }
    }

    fn raise_priority(&self, priority: Priority) {
        self.record.raise_priority(priority);
        for aux in &self.aux {
            aux.raise_priority(priority);
        }
    }

    fn lower_priority(&self, priority: Priority) {
        self.record.lower_priority(priority);
    }

    fn on_complete(&self, listener: ProgressListener) {
        self.core.on_complete(listener);
    }
}
