//! Fixed worker pool.
//!
//! Every queued task spawns one pull job on a rayon pool; the pull job runs
//! whichever task is most urgent when it gets a thread, so priority changes
//! made while a task waits are honoured.

use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use tracing::debug;

use crate::{Job, PrioritisedTask, Priority, TaskQueue};

/// Fixed-size pool executing prioritised tasks off the main thread.
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    threads: Arc<ThreadPool>,
}

impl WorkerPool {
    /// Build a pool with `threads` workers (0 picks rayon's default).
    pub fn new(name: &'static str, threads: usize) -> Result<Arc<Self>, ThreadPoolBuildError> {
        let pool = Arc::new(
            ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(move |i| format!("{name}-{i}"))
                .build()?,
        );

        let spawner = Arc::clone(&pool);
        let queue = TaskQueue::with_waker(name, move |queue| {
            spawner.spawn(move || {
                if let Some(queue) = queue.upgrade() {
                    queue.execute_one();
                }
            });
        });

        debug!(name, threads = pool.current_num_threads(), "worker pool started");
        Ok(Arc::new(Self {
            queue,
            threads: pool,
        }))
    }

    /// Create an unqueued task on this pool.
    pub fn create_task(&self, job: Job, priority: Priority) -> Arc<PrioritisedTask> {
        self.queue.create_task(job, priority)
    }

    /// Create and queue a task on this pool.
    pub fn queue_task(&self, job: Job, priority: Priority) -> Arc<PrioritisedTask> {
        self.queue.queue_task(job, priority)
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.current_num_threads()
    }
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queue", &self.queue)
            .field("threads", &self.thread_count())
            .finish()
    }
}
