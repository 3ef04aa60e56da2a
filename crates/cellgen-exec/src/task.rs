//! Prioritised task queue.
//!
//! A [`PrioritisedTask`] is created unqueued, may have its priority adjusted at
//! any time, and runs at most once: either popped from its [`TaskQueue`] by an
//! executor, run inline through [`PrioritisedTask::execute`], or discarded by
//! [`PrioritisedTask::cancel`].
//!
//! Lock order is always task state, then queue state.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::error;

use crate::Priority;

/// Unit of work carried by a task.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

type Waker = Box<dyn Fn() + Send + Sync>;

/// Ordered set of queued tasks, highest priority first, FIFO within a priority.
pub struct TaskQueue {
    name: &'static str,
    ready: Mutex<BTreeMap<(Priority, u64), Arc<PrioritisedTask>>>,
    next_seq: AtomicU64,
    executed: AtomicU64,
    /// Invoked once per successful `queue()`; worker pools use it to spawn a
    /// pull job. Main-thread queues have none and are drained explicitly.
    wake: Option<Waker>,
}

impl TaskQueue {
    /// A queue drained only by [`TaskQueue::run_pending`].
    #[must_use]
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            ready: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            wake: None,
        })
    }

    /// A queue that calls `wake` with a handle to itself whenever a task is
    /// queued.
    pub fn with_waker<F>(name: &'static str, wake: F) -> Arc<Self>
    where
        F: Fn(Weak<TaskQueue>) + Send + Sync + 'static,
    {
        Arc::new_cyclic(|weak: &Weak<TaskQueue>| {
            let weak = weak.clone();
            Self {
                name,
                ready: Mutex::new(BTreeMap::new()),
                next_seq: AtomicU64::new(0),
                executed: AtomicU64::new(0),
                wake: Some(Box::new(move || wake(weak.clone()))),
            }
        })
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Create a task bound to this queue without queueing it.
    pub fn create_task(self: &Arc<Self>, job: Job, priority: Priority) -> Arc<PrioritisedTask> {
        Arc::new(PrioritisedTask {
            queue: Arc::clone(self),
            state: Mutex::new(TaskState {
                priority,
                seq: None,
                job: Some(job),
            }),
        })
    }

    /// Create and immediately queue a task.
    pub fn queue_task(self: &Arc<Self>, job: Job, priority: Priority) -> Arc<PrioritisedTask> {
        let task = self.create_task(job, priority);
        task.queue();
        task
    }

    /// Pop and run the most urgent task. Returns false if nothing was queued.
    pub fn execute_one(&self) -> bool {
        let Some((_, task)) = self.ready.lock().pop_first() else {
            return false;
        };
        let job = {
            let mut state = task.state.lock();
            state.seq = None;
            state.job.take()
        };
        match job {
            Some(job) => {
                self.run_job(job);
                true
            }
            None => false,
        }
    }

    /// Run up to `max` queued tasks on the calling thread.
    pub fn run_pending(&self, max: usize) -> usize {
        let mut ran = 0;
        while ran < max && self.execute_one() {
            ran += 1;
        }
        ran
    }

    fn run_job(&self, job: Job) {
        self.executed.fetch_add(1, Ordering::Relaxed);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            error!(
                queue = self.name,
                panic = panic_message(payload.as_ref()),
                "task panicked outside of its own error handling"
            );
        }
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ready.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ready.lock().is_empty()
    }

    /// Total tasks executed through this queue.
    #[must_use]
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

impl core::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.name)
            .field("queued", &self.len())
            .field("executed", &self.executed())
            .finish()
    }
}

struct TaskState {
    priority: Priority,
    /// Sequence number while present in the ready map.
    seq: Option<u64>,
    /// Taken on execution or cancellation.
    job: Option<Job>,
}

/// A task with adjustable priority that runs at most once.
pub struct PrioritisedTask {
    queue: Arc<TaskQueue>,
    state: Mutex<TaskState>,
}

impl PrioritisedTask {
    /// Insert into the queue. Returns false if already queued, executed or
    /// cancelled.
    pub fn queue(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.lock();
            if state.job.is_none() || state.seq.is_some() {
                return false;
            }
            let seq = self.queue.next_seq.fetch_add(1, Ordering::Relaxed);
            state.seq = Some(seq);
            self.queue
                .ready
                .lock()
                .insert((state.priority, seq), Arc::clone(self));
        }
        if let Some(wake) = &self.queue.wake {
            wake();
        }
        true
    }

    /// Discard the job if it has not started. Returns whether it was discarded.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        let Some(job) = state.job.take() else {
            return false;
        };
        if let Some(seq) = state.seq.take() {
            self.queue.ready.lock().remove(&(state.priority, seq));
        }
        drop(state);
        drop(job);
        true
    }

    /// Run the job on the calling thread if it has not run yet.
    pub fn execute(&self) -> bool {
        let job = {
            let mut state = self.state.lock();
            let job = state.job.take();
            if job.is_some() {
                if let Some(seq) = state.seq.take() {
                    self.queue.ready.lock().remove(&(state.priority, seq));
                }
            }
            job
        };
        match job {
            Some(job) => {
                self.queue.run_job(job);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.state.lock().priority
    }

    /// Whether the job has run or been cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.lock().job.is_none()
    }

    #[must_use]
    pub fn is_queued(&self) -> bool {
        self.state.lock().seq.is_some()
    }

    /// Set the priority unconditionally. Returns false once done.
    pub fn set_priority(&self, priority: Priority) -> bool {
        self.adjust(|_| Some(priority))
    }

    /// Raise to `priority` if that is more urgent than the current one.
    pub fn raise_priority(&self, priority: Priority) -> bool {
        self.adjust(|current| priority.is_higher_than(current).then_some(priority))
    }

    /// Lower to `priority` if that is less urgent than the current one.
    pub fn lower_priority(&self, priority: Priority) -> bool {
        self.adjust(|current| priority.is_lower_than(current).then_some(priority))
    }

    fn adjust(&self, decide: impl FnOnce(Priority) -> Option<Priority>) -> bool {
        let mut state = self.state.lock();
        if state.job.is_none() {
            return false;
        }
        let Some(next) = decide(state.priority) else {
            return false;
        };
        if next == state.priority {
            return true;
        }
        if let Some(seq) = state.seq {
            let mut ready = self.queue.ready.lock();
            if let Some(task) = ready.remove(&(state.priority, seq)) {
                ready.insert((next, seq), task);
            }
        }
        state.priority = next;
        true
    }
}

impl core::fmt::Debug for PrioritisedTask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PrioritisedTask")
            .field("queue", &self.queue.name)
            .field("priority", &state.priority)
            .field("queued", &state.seq.is_some())
            .field("done", &state.job.is_none())
            .finish()
    }
}

/// Best-effort text of a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn core::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}
