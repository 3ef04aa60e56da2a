//! Per-cell queue in front of the lighting executor.
//!
//! Requests for the same cell coalesce into one execution while it has not
//! started. Each request is a waiter on the shared entry; the entry is
//! cancelled only when its last waiter leaves before it runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use cellgen_exec::{Priority, RadiusAwareExecutor, RadiusTask};
use cellgen_spatial::CellPos;
use cellgen_task::TaskError;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::progress::{AdvanceInput, ProgressListener};

struct EntryState {
    started: bool,
    input: Option<AdvanceInput>,
    waiters: Vec<(u64, ProgressListener)>,
}

struct LightEntry {
    cell: CellPos,
    state: Mutex<EntryState>,
    task: OnceLock<Arc<RadiusTask>>,
}

impl LightEntry {
    fn run(self: &Arc<Self>, queue: &Weak<LightQueue>) {
        let input = {
            let mut state = self.state.lock();
            state.started = true;
            state.input.take()
        };
        if let Some(queue) = queue.upgrade() {
            queue.forget(self);
        }

        let result = input.map_or(Err(TaskError::MissingPhase("light input")), AdvanceInput::run);
        let waiters = std::mem::take(&mut self.state.lock().waiters);
        trace!(cell = %self.cell, waiters = waiters.len(), "light entry finished");
        for (_, waiter) in waiters {
            waiter(Some(&result));
        }
    }
}

pub struct LightQueue {
    executor: Arc<RadiusAwareExecutor>,
    entries: Mutex<HashMap<u64, Arc<LightEntry>>>,
    next_waiter: AtomicU64,
    this: Weak<LightQueue>,
}

impl LightQueue {
    #[must_use]
    pub fn new(executor: Arc<RadiusAwareExecutor>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            executor,
            entries: Mutex::new(HashMap::new()),
            next_waiter: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    /// Cells with a pending entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn request(
        &self,
        input: AdvanceInput,
        priority: Priority,
        waiter: ProgressListener,
    ) -> LightTicket {
        let cell = input.cell;
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(&cell.key()) {
            let mut state = entry.state.lock();
            if !state.started {
                state.waiters.push((id, waiter));
                drop(state);
                if let Some(task) = entry.task.get() {
                    task.raise_priority(priority);
                }
                trace!(%cell, "light request coalesced");
                return LightTicket {
                    entry: Arc::clone(entry),
                    id,
                    queue: self.this.clone(),
                };
            }
        }

        let radius = input.radius;
        let entry = Arc::new(LightEntry {
            cell,
            state: Mutex::new(EntryState {
                started: false,
                input: Some(input),
                waiters: vec![(id, waiter)],
            }),
            task: OnceLock::new(),
        });
        let job_entry = Arc::clone(&entry);
        let queue = self.this.clone();
        let task = self.executor.create_task(
            cell,
            radius,
            Box::new(move || job_entry.run(&queue)),
            priority,
        );
        let _ = entry.task.set(Arc::clone(&task));
        entries.insert(cell.key(), Arc::clone(&entry));
        drop(entries);

        task.queue();
        LightTicket {
            entry,
            id,
            queue: self.this.clone(),
        }
    }

    fn forget(&self, entry: &Arc<LightEntry>) {
        let mut entries = self.entries.lock();
        if entries
            .get(&entry.cell.key())
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            entries.remove(&entry.cell.key());
        }
    }
}

impl core::fmt::Debug for LightQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LightQueue")
            .field("entries", &self.len())
            .finish()
    }
}

/// One waiter's handle on a light entry.
pub(crate) struct LightTicket {
    entry: Arc<LightEntry>,
    id: u64,
    queue: Weak<LightQueue>,
}

impl LightTicket {
    /// Leave the entry. Returns true if this waiter was removed before the
    /// entry started running.
    pub(crate) fn cancel(&self) -> bool {
        let mut state = self.entry.state.lock();
        if state.started {
            return false;
        }
        let Some(index) = state.waiters.iter().position(|(id, _)| *id == self.id) else {
            return false;
        };
        drop(state.waiters.swap_remove(index));
        if !state.waiters.is_empty() {
            return true;
        }
        drop(state);

        if let Some(task) = self.entry.task.get() {
            task.cancel();
        }
        if let Some(queue) = self.queue.upgrade() {
            queue.forget(&self.entry);
        }
        true
    }

    fn is_sole_waiter(&self) -> bool {
        let state = self.entry.state.lock();
        state.waiters.len() == 1 && state.waiters[0].0 == self.id
    }

    pub(crate) fn priority(&self) -> Priority {
        self.entry
            .task
            .get()
            .map_or(Priority::Idle, |task| task.priority())
    }

    /// Shared entries only ever move up.
    pub(crate) fn set_priority(&self, priority: Priority) {
        if let Some(task) = self.entry.task.get() {
            if self.is_sole_waiter() {
                task.set_priority(priority);
            } else {
                task.raise_priority(priority);
            }
        }
    }

    pub(crate) fn raise_priority(&self, priority: Priority) {
        if let Some(task) = self.entry.task.get() {
            task.raise_priority(priority);
        }
    }

    pub(crate) fn lower_priority(&self, priority: Priority) {
        if let Some(task) = self.entry.task.get() {
            if self.is_sole_waiter() {
                task.lower_priority(priority);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use cellgen_exec::WorkerPool;
    use cellgen_spatial::WriteRadius;
    use crossbeam_channel::{bounded, unbounded};

    use super::*;
    use crate::{AdvanceRequest, CellData, Neighbor, NeighborView, Stage, StageError, StageExecutor};

    struct Counting(AtomicUsize);

    impl StageExecutor for Counting {
        fn advance(&self, request: &AdvanceRequest) -> Result<CellData, StageError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(CellData::new(request.target, request.data.payload.clone()))
        }
    }

    struct NoNeighbors;

    impl NeighborView for NoNeighbors {
        fn neighbors(&self, _center: CellPos, _radius: u32) -> Vec<Neighbor> {
            Vec::new()
        }
    }

    fn input(executor: &Arc<Counting>) -> AdvanceInput {
        let view: Weak<dyn NeighborView> = Weak::<NoNeighbors>::new();
        AdvanceInput {
            cell: CellPos::new(3, -2),
            target: Stage::Light,
            data: CellData::new(Stage::InitializeLight, "lit"),
            radius: WriteRadius::Bounded(2),
            view,
            executor: Arc::clone(executor) as Arc<dyn StageExecutor>,
        }
    }

    #[test]
    fn test_unstarted_requests_coalesce() {
        let pool = WorkerPool::new("light-test", 1).unwrap();
        let queue = LightQueue::new(RadiusAwareExecutor::new(Arc::clone(&pool), 2));
        let executor = Arc::new(Counting(AtomicUsize::new(0)));

        // hold the only worker so nothing starts
        let (gate_tx, gate_rx) = bounded::<()>(0);
        pool.queue_task(
            Box::new(move || {
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
            }),
            Priority::Normal,
        );

        let (tx, rx) = unbounded();
        let _tickets: Vec<LightTicket> = (0..2)
            .map(|i| {
                let tx = tx.clone();
                queue.request(
                    input(&executor),
                    Priority::Normal,
                    Box::new(move |result| {
                        let stage = result.and_then(|r| r.as_ref().ok()).map(|d| d.stage);
                        tx.send((i, stage)).unwrap();
                    }),
                )
            })
            .collect();
        assert_eq!(queue.len(), 1);

        gate_tx.send(()).unwrap();
        let mut got: Vec<_> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort_unstable();

        assert_eq!(got, vec![(0, Some(Stage::Light)), (1, Some(Stage::Light))]);
        assert_eq!(executor.0.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_entry_cancelled_with_last_waiter() {
        let pool = WorkerPool::new("light-test", 1).unwrap();
        let queue = LightQueue::new(RadiusAwareExecutor::new(Arc::clone(&pool), 2));
        let executor = Arc::new(Counting(AtomicUsize::new(0)));

        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = bounded::<()>(1);
        pool.queue_task(
            Box::new(move || {
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
                done_tx.send(()).unwrap();
            }),
            Priority::Normal,
        );

        let first = queue.request(input(&executor), Priority::Normal, Box::new(|_| {}));
        let second = queue.request(input(&executor), Priority::Normal, Box::new(|_| {}));

        assert!(first.cancel());
        assert_eq!(queue.len(), 1);
        assert!(second.cancel());
        assert!(queue.is_empty());
        assert!(!second.cancel());

        gate_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(executor.0.load(Ordering::SeqCst), 0);
    }
}
