//! Executor for transitions that write to neighbouring cells.
//!
//! A task declares a center and a [`WriteRadius`]. It is dispatched to the
//! worker pool only once it holds a detached [`AreaLock`] over its square; the
//! lock is released when the job returns (or is cancelled), which re-runs the
//! dispatch pass. Unbounded tasks take the whole grid and so run only when
//! nothing else from this executor is running.
//!
//! Dispatch walks pending tasks in priority order. A task that cannot take its
//! range blocks every later task overlapping it, so a wide task is not starved
//! by a stream of small ones in its area.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use cellgen_spatial::{AreaGuard, AreaLock, CellPos, WriteRadius};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::trace;

use crate::{Job, PrioritisedTask, Priority, WorkerPool};

/// Serializes overlapping transitions, runs disjoint ones in parallel.
pub struct RadiusAwareExecutor {
    pool: Arc<WorkerPool>,
    lock: Arc<AreaLock>,
    pending: Mutex<BTreeMap<(Priority, u64), Arc<RadiusTask>>>,
    next_seq: AtomicU64,
    this: Weak<RadiusAwareExecutor>,
}

impl RadiusAwareExecutor {
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>, lock_shift: u32) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            pool,
            lock: AreaLock::new(lock_shift),
            pending: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    /// Create an unqueued task for `center` with the given write radius.
    pub fn create_task(
        &self,
        center: CellPos,
        radius: WriteRadius,
        job: Job,
        priority: Priority,
    ) -> Arc<RadiusTask> {
        Arc::new(RadiusTask {
            executor: self.this.clone(),
            center,
            radius,
            state: Mutex::new(RadiusState::Idle { priority, job }),
        })
    }

    /// Tasks waiting for their range.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn area_lock(&self) -> &Arc<AreaLock> {
        &self.lock
    }

    /// Dispatch every pending task whose range is free.
    pub fn pump(&self) {
        let ready = {
            let mut pending = self.pending.lock();
            let mut blocked: SmallVec<[(CellPos, WriteRadius); 8]> = SmallVec::new();
            let mut ready = Vec::new();

            for (key, task) in pending.iter() {
                if blocked
                    .iter()
                    .any(|&(center, radius)| overlaps(center, radius, task.center, task.radius))
                {
                    blocked.push((task.center, task.radius));
                    continue;
                }
                match self.lock.try_lock_detached(task.center, task.radius) {
                    Some(guard) => ready.push((*key, guard)),
                    None => blocked.push((task.center, task.radius)),
                }
            }

            ready
                .into_iter()
                .filter_map(|(key, guard)| pending.remove(&key).map(|task| (task, guard)))
                .collect::<Vec<_>>()
        };

        for (task, guard) in ready {
            task.dispatch(guard);
        }
    }
}

impl core::fmt::Debug for RadiusAwareExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RadiusAwareExecutor")
            .field("pending", &self.pending())
            .field("lock", &self.lock)
            .finish()
    }
}

fn overlaps(a: CellPos, ra: WriteRadius, b: CellPos, rb: WriteRadius) -> bool {
    match (ra, rb) {
        (WriteRadius::Bounded(ra), WriteRadius::Bounded(rb)) => a.chebyshev(b) <= ra + rb,
        _ => true,
    }
}

enum RadiusState {
    Idle { priority: Priority, job: Job },
    Pending { priority: Priority, seq: u64, job: Job },
    Dispatched(Arc<PrioritisedTask>),
    Done,
}

/// A transition bound to a square of cells.
pub struct RadiusTask {
    executor: Weak<RadiusAwareExecutor>,
    center: CellPos,
    radius: WriteRadius,
    state: Mutex<RadiusState>,
}

/// Releases the range and re-runs dispatch, even if the job unwinds.
struct RangeRelease {
    guard: Option<AreaGuard>,
    executor: Weak<RadiusAwareExecutor>,
}

impl Drop for RangeRelease {
    fn drop(&mut self) {
        drop(self.guard.take());
        if let Some(executor) = self.executor.upgrade() {
            executor.pump();
        }
    }
}

impl RadiusTask {
    #[must_use]
    pub fn center(&self) -> CellPos {
        self.center
    }

    #[must_use]
    pub fn radius(&self) -> WriteRadius {
        self.radius
    }

    /// Submit for dispatch. Returns false if already queued, running or done.
    pub fn queue(self: &Arc<Self>) -> bool {
        let Some(executor) = self.executor.upgrade() else {
            return false;
        };
        {
            let mut state = self.state.lock();
            let RadiusState::Idle { .. } = &*state else {
                return false;
            };
            let RadiusState::Idle { priority, job } =
                core::mem::replace(&mut *state, RadiusState::Done)
            else {
                return false;
            };
            let seq = executor.next_seq.fetch_add(1, Ordering::Relaxed);
            executor
                .pending
                .lock()
                .insert((priority, seq), Arc::clone(self));
            *state = RadiusState::Pending { priority, seq, job };
        }
        executor.pump();
        true
    }

    fn dispatch(self: Arc<Self>, guard: AreaGuard) {
        let Some(executor) = self.executor.upgrade() else {
            return;
        };
        let mut state = self.state.lock();
        let RadiusState::Pending { priority, job, .. } =
            core::mem::replace(&mut *state, RadiusState::Done)
        else {
            // cancelled between selection and dispatch
            drop(state);
            drop(guard);
            executor.pump();
            return;
        };

        trace!(center = %self.center, ?priority, "dispatching radius task");
        let release = RangeRelease {
            guard: Some(guard),
            executor: self.executor.clone(),
        };
        let task = executor.pool.create_task(
            Box::new(move || {
                let _release = release;
                job();
            }),
            priority,
        );
        *state = RadiusState::Dispatched(Arc::clone(&task));
        drop(state);
        task.queue();
    }

    /// Discard the job if it has not started running.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        match core::mem::replace(&mut *state, RadiusState::Done) {
            RadiusState::Idle { .. } => true,
            RadiusState::Pending { priority, seq, .. } => {
                if let Some(executor) = self.executor.upgrade() {
                    executor.pending.lock().remove(&(priority, seq));
                }
                true
            }
            RadiusState::Dispatched(task) => {
                // cancelling drops the job, whose release guard re-pumps
                let cancelled = task.cancel();
                *state = RadiusState::Dispatched(task);
                cancelled
            }
            RadiusState::Done => false,
        }
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        match &*self.state.lock() {
            RadiusState::Idle { priority, .. } | RadiusState::Pending { priority, .. } => *priority,
            RadiusState::Dispatched(task) => task.priority(),
            RadiusState::Done => Priority::Idle,
        }
    }

    pub fn set_priority(&self, priority: Priority) -> bool {
        self.adjust(priority, |_| true, PrioritisedTask::set_priority)
    }

    pub fn raise_priority(&self, priority: Priority) -> bool {
        self.adjust(
            priority,
            |current| priority.is_higher_than(current),
            PrioritisedTask::raise_priority,
        )
    }

    pub fn lower_priority(&self, priority: Priority) -> bool {
        self.adjust(
            priority,
            |current| priority.is_lower_than(current),
            PrioritisedTask::lower_priority,
        )
    }

    fn adjust(
        &self,
        next: Priority,
        accept: impl FnOnce(Priority) -> bool,
        forward: impl FnOnce(&PrioritisedTask, Priority) -> bool,
    ) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            RadiusState::Idle { priority, .. } => {
                if !accept(*priority) {
                    return false;
                }
                *priority = next;
                true
            }
            RadiusState::Pending { priority, seq, .. } => {
                if !accept(*priority) {
                    return false;
                }
                if let Some(executor) = self.executor.upgrade() {
                    let mut pending = executor.pending.lock();
                    if let Some(task) = pending.remove(&(*priority, *seq)) {
                        pending.insert((next, *seq), task);
                    }
                }
                *priority = next;
                true
            }
            RadiusState::Dispatched(task) => forward(task, next),
            RadiusState::Done => false,
        }
    }
}

impl core::fmt::Debug for RadiusTask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RadiusTask")
            .field("center", &self.center)
            .field("radius", &self.radius)
            .field("priority", &self.priority())
            .finish()
    }
}
