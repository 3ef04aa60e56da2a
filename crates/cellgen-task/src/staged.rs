//! Reference-counted three-phase task over one disk record.
//!
//! ```text
//!   schedule ─▶ disk load ─▶ off-main (worker pool) ─▶ on-main (main queue) ─▶ complete
//!                  │                  │                                        ▲
//!                  │                  └── Handoff::Done ───────────────────────┤
//!                  └── no off-main phase ─▶ on-main ───────────────────────────┘
//! ```
//!
//! The stage word packs the [`TaskStage`] into its low 32 bits and the number
//! of outstanding references into the high 32 bits. Every transition is a CAS
//! on that word; a phase that finds an unexpected stage was raced by a
//! cancellation and skips its body.
//!
//! Several callers may share one task: each `schedule` adds a reference and
//! each `cancel` drops one. Only the last reference (or a task that never
//! started) actually tears down the disk request and phase tasks.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use cellgen_exec::{PrioritisedTask, Priority, panic_message};
use cellgen_spatial::CellPos;
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use tracing::trace;

use crate::{
    CallbackQueue, DataCategory, DiskRequest, FailureReport, TaskContext, TaskError, TaskResult,
};

/// Lifecycle stage stored in the low half of the stage word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum TaskStage {
    NotStarted = 0,
    Loading = 1,
    Processing = 2,
    Completed = 3,
    Cancelled = u32::MAX,
}

impl TaskStage {
    const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::NotStarted,
            1 => Self::Loading,
            2 => Self::Processing,
            3 => Self::Completed,
            _ => Self::Cancelled,
        }
    }
}

const STAGE_MASK: u64 = 0xFFFF_FFFF;

const fn pack(stage: TaskStage, refs: u32) -> u64 {
    ((refs as u64) << 32) | (stage as u32 as u64)
}

const fn unpack(word: u64) -> (TaskStage, u32) {
    (
        TaskStage::from_raw((word & STAGE_MASK) as u32),
        (word >> 32) as u32,
    )
}

/// Which processing phases follow the disk load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phases {
    OffMain,
    OnMain,
    Both,
}

impl Phases {
    #[must_use]
    pub const fn has_off_main(self) -> bool {
        matches!(self, Self::OffMain | Self::Both)
    }

    #[must_use]
    pub const fn has_on_main(self) -> bool {
        matches!(self, Self::OnMain | Self::Both)
    }
}

/// What the off-main phase produced.
#[derive(Debug)]
pub enum Handoff<I, O> {
    /// Continue on the main queue with this value.
    OnMain(I),
    /// Finish the task now.
    Done(O),
}

/// Input of the on-main phase.
#[derive(Debug)]
pub enum OnMainInput<I> {
    /// Raw record, when there is no off-main phase.
    Raw(Option<Bytes>),
    Processed(I),
}

/// The bodies run by a [`StagedTask`].
///
/// Bodies receive errors from earlier steps as values instead of being
/// skipped, so they decide whether a failure degrades or propagates.
pub trait StagedWork: Send + Sync + 'static {
    type Intermediate: Send + 'static;
    type Output: Send + Sync + 'static;

    fn phases(&self) -> Phases;

    fn off_main(
        &self,
        _cell: CellPos,
        _raw: TaskResult<Option<Bytes>>,
    ) -> TaskResult<Handoff<Self::Intermediate, Self::Output>> {
        Err(TaskError::MissingPhase("off-main"))
    }

    fn on_main(
        &self,
        _cell: CellPos,
        _input: TaskResult<OnMainInput<Self::Intermediate>>,
    ) -> TaskResult<Self::Output> {
        Err(TaskError::MissingPhase("on-main"))
    }
}

#[derive(Default)]
struct Handles {
    priority: Priority,
    disk: Option<Box<dyn DiskRequest>>,
    off_main: Option<Arc<PrioritisedTask>>,
    on_main: Option<Arc<PrioritisedTask>>,
}

pub struct StagedTask<W: StagedWork> {
    cell: CellPos,
    category: DataCategory,
    work: W,
    word: AtomicU64,
    ctx: TaskContext,
    handles: Mutex<Handles>,
    raw: Mutex<Option<TaskResult<Option<Bytes>>>>,
    handoff: Mutex<Option<TaskResult<OnMainInput<W::Intermediate>>>>,
    callbacks: CallbackQueue<TaskResult<W::Output>>,
}

impl<W: StagedWork> StagedTask<W> {
    pub fn new(
        cell: CellPos,
        category: DataCategory,
        work: W,
        priority: Priority,
        ctx: &TaskContext,
    ) -> Arc<Self> {
        let diagnostics = Arc::clone(&ctx.diagnostics);
        Arc::new(Self {
            cell,
            category,
            work,
            word: AtomicU64::new(pack(TaskStage::NotStarted, 0)),
            ctx: ctx.clone(),
            handles: Mutex::new(Handles {
                priority,
                ..Handles::default()
            }),
            raw: Mutex::new(None),
            handoff: Mutex::new(None),
            callbacks: CallbackQueue::with_panic_hook(move |message| {
                diagnostics.report(
                    &FailureReport::new(cell, message)
                        .with("category", category)
                        .with("phase", "callback"),
                );
            }),
        })
    }

    #[must_use]
    pub fn cell(&self) -> CellPos {
        self.cell
    }

    #[must_use]
    pub fn category(&self) -> DataCategory {
        self.category
    }

    #[must_use]
    pub fn stage(&self) -> TaskStage {
        unpack(self.word.load(Ordering::Acquire)).0
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        unpack(self.word.load(Ordering::Acquire)).1
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.callbacks.is_completed()
    }

    /// `None` while running; `Some(None)` once cancelled.
    #[must_use]
    pub fn result(&self) -> Option<Option<&TaskResult<W::Output>>> {
        self.callbacks.result()
    }

    /// Add a reference, starting the load on the first call.
    ///
    /// Returns true when the first call was `delayed`: the caller then owns
    /// starting the load through [`StagedTask::schedule_now`].
    ///
    /// # Panics
    ///
    /// If the reference count would overflow.
    pub fn schedule(self: &Arc<Self>, delayed: bool) -> bool {
        let backoff = Backoff::new();
        let mut current = self.word.load(Ordering::Acquire);
        let first = loop {
            let (stage, refs) = unpack(current);
            let (next, first) = match stage {
                TaskStage::NotStarted => (pack(TaskStage::Loading, 1), true),
                TaskStage::Completed | TaskStage::Cancelled => return false,
                _ => {
                    assert!(refs < u32::MAX, "staged task reference count overflow");
                    (pack(stage, refs + 1), false)
                }
            };
            match self
                .word
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break first,
                Err(actual) => {
                    current = actual;
                    backoff.spin();
                }
            }
        };

        if !first {
            return false;
        }
        if delayed {
            return true;
        }
        self.schedule_now();
        false
    }

    /// Issue the disk load.
    pub fn schedule_now(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let priority = self.handles.lock().priority;
        let request = self.ctx.disk.load_record(
            self.cell,
            self.category,
            priority,
            Box::new(move |raw| this.on_disk(raw)),
        );

        let mut handles = self.handles.lock();
        if self.stage() == TaskStage::Cancelled {
            drop(handles);
            request.cancel();
            return;
        }
        handles.disk = Some(request);
    }

    /// Drop one reference; the last one cancels the pipeline.
    ///
    /// Returns true only if this call discarded the result.
    pub fn cancel(&self) -> bool {
        let backoff = Backoff::new();
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let (stage, refs) = unpack(current);
            let next = match stage {
                TaskStage::Completed | TaskStage::Cancelled => return false,
                TaskStage::NotStarted => pack(TaskStage::Cancelled, 0),
                _ if refs <= 1 => pack(TaskStage::Cancelled, 0),
                _ => pack(stage, refs - 1),
            };
            match self
                .word
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) if unpack(next).0 == TaskStage::Cancelled => break,
                Ok(_) => return false,
                Err(actual) => {
                    current = actual;
                    backoff.spin();
                }
            }
        }

        let (disk, off_main, on_main) = {
            let mut handles = self.handles.lock();
            (
                handles.disk.take(),
                handles.off_main.take(),
                handles.on_main.take(),
            )
        };
        if let Some(disk) = disk {
            disk.cancel();
        }
        if let Some(task) = off_main {
            task.cancel();
        }
        if let Some(task) = on_main {
            task.cancel();
        }

        trace!(cell = %self.cell, category = %self.category, "staged task cancelled");
        self.callbacks.complete(None);
        true
    }

    /// Register for the result; runs immediately if already completed.
    pub fn add_callback(
        &self,
        callback: impl FnOnce(Option<&TaskResult<W::Output>>) + Send + 'static,
    ) {
        self.callbacks.add(Box::new(callback));
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.handles.lock().priority
    }

    pub fn set_priority(&self, priority: Priority) {
        let mut handles = self.handles.lock();
        handles.priority = priority;
        if let Some(disk) = &handles.disk {
            disk.set_priority(priority);
        }
        for task in handles.off_main.iter().chain(handles.on_main.iter()) {
            task.set_priority(priority);
        }
    }

    pub fn raise_priority(&self, priority: Priority) {
        let mut handles = self.handles.lock();
        if !priority.is_higher_than(handles.priority) {
            return;
        }
        handles.priority = priority;
        if let Some(disk) = &handles.disk {
            disk.raise_priority(priority);
        }
        for task in handles.off_main.iter().chain(handles.on_main.iter()) {
            task.raise_priority(priority);
        }
    }

    /// Lowers the phase tasks only; a pending disk load keeps its priority.
    pub fn lower_priority(&self, priority: Priority) {
        let mut handles = self.handles.lock();
        if !priority.is_lower_than(handles.priority) {
            return;
        }
        handles.priority = priority;
        for task in handles.off_main.iter().chain(handles.on_main.iter()) {
            task.lower_priority(priority);
        }
    }

    fn advance_stage(&self, expect: TaskStage, to: TaskStage) -> bool {
        let backoff = Backoff::new();
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let (stage, refs) = unpack(current);
            if stage != expect {
                return false;
            }
            match self.word.compare_exchange_weak(
                current,
                pack(to, refs),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => {
                    current = actual;
                    backoff.spin();
                }
            }
        }
    }

    fn on_disk(self: Arc<Self>, raw: TaskResult<Option<Bytes>>) {
        if self.stage() != TaskStage::Loading {
            return;
        }
        if self.work.phases().has_off_main() {
            *self.raw.lock() = Some(raw);
            self.queue_phase(false);
        } else {
            *self.handoff.lock() = Some(raw.map(OnMainInput::Raw));
            self.queue_phase(true);
        }
    }

    fn queue_phase(self: &Arc<Self>, on_main: bool) {
        let this = Arc::clone(self);
        let mut handles = self.handles.lock();
        let priority = handles.priority;
        let task = if on_main {
            let task = self
                .ctx
                .main
                .create_task(Box::new(move || this.run_on_main()), priority);
            handles.on_main = Some(Arc::clone(&task));
            task
        } else {
            let task = self
                .ctx
                .pool
                .create_task(Box::new(move || this.run_off_main()), priority);
            handles.off_main = Some(Arc::clone(&task));
            task
        };
        drop(handles);
        task.queue();
    }

    fn run_off_main(self: Arc<Self>) {
        if !self.advance_stage(TaskStage::Loading, TaskStage::Processing) {
            return;
        }
        let raw = self
            .raw
            .lock()
            .take()
            .unwrap_or(Err(TaskError::MissingPhase("disk")));
        let has_on_main = self.work.phases().has_on_main();

        let next = match self.guarded("off-main", || self.work.off_main(self.cell, raw)) {
            Err(panicked) => Err(panicked),
            Ok(Ok(Handoff::Done(output))) => Ok(output),
            Ok(Ok(Handoff::OnMain(value))) if has_on_main => {
                *self.handoff.lock() = Some(Ok(OnMainInput::Processed(value)));
                self.queue_phase(true);
                return;
            }
            Ok(Ok(Handoff::OnMain(_))) => Err(TaskError::MissingPhase("on-main")),
            Ok(Err(error)) if has_on_main => {
                *self.handoff.lock() = Some(Err(error));
                self.queue_phase(true);
                return;
            }
            Ok(Err(error)) => Err(error),
        };

        if self.advance_stage(TaskStage::Processing, TaskStage::Completed) {
            self.complete(next);
        }
    }

    fn run_on_main(self: Arc<Self>) {
        let expect = if self.work.phases().has_off_main() {
            TaskStage::Processing
        } else {
            TaskStage::Loading
        };
        if !self.advance_stage(expect, TaskStage::Completed) {
            return;
        }
        let input = self
            .handoff
            .lock()
            .take()
            .unwrap_or(Err(TaskError::MissingPhase("off-main")));
        let result = self
            .guarded("on-main", || self.work.on_main(self.cell, input))
            .and_then(|result| result);
        self.complete(result);
    }

    fn complete(&self, result: TaskResult<W::Output>) {
        {
            let mut handles = self.handles.lock();
            handles.disk = None;
            handles.off_main = None;
            handles.on_main = None;
        }
        self.callbacks.complete(Some(result));
    }

    fn guarded<R>(&self, phase: &'static str, body: impl FnOnce() -> R) -> Result<R, TaskError> {
        panic::catch_unwind(AssertUnwindSafe(body)).map_err(|payload| {
            let message = panic_message(payload.as_ref());
            self.ctx.diagnostics.report(
                &FailureReport::new(self.cell, &message)
                    .with("category", self.category)
                    .with("phase", phase),
            );
            TaskError::Panicked(message)
        })
    }
}

impl<W: StagedWork> core::fmt::Debug for StagedTask<W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (stage, refs) = unpack(self.word.load(Ordering::Acquire));
        f.debug_struct("StagedTask")
            .field("cell", &self.cell)
            .field("category", &self.category)
            .field("stage", &stage)
            .field("refs", &refs)
            .finish()
    }
}
