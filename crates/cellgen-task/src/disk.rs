//! Record storage behind the disk phase.
//!
//! [`MemoryDisk`] keeps records in a map and answers loads from a worker
//! pool, so requests are asynchronous and their priority can change while
//! they wait.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use cellgen_exec::{PrioritisedTask, Priority, WorkerPool};
use cellgen_spatial::CellPos;
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{TaskError, TaskResult};

/// Which dataset of a cell a record belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataCategory {
    Cell,
    Entity,
    Poi,
}

impl DataCategory {
    pub const ALL: [DataCategory; 3] = [DataCategory::Cell, DataCategory::Entity, DataCategory::Poi];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            DataCategory::Cell => "cell",
            DataCategory::Entity => "entity",
            DataCategory::Poi => "poi",
        }
    }
}

impl core::fmt::Display for DataCategory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Receives the raw record, `None` when nothing is stored.
pub type DiskCallback = Box<dyn FnOnce(TaskResult<Option<Bytes>>) + Send + 'static>;

/// Handle to an in-flight load.
pub trait DiskRequest: Send + Sync {
    /// Drop the load if it has not started; the callback is then never run.
    fn cancel(&self) -> bool;
    fn priority(&self) -> Priority;
    fn set_priority(&self, priority: Priority) -> bool;
    fn raise_priority(&self, priority: Priority) -> bool;
    fn lower_priority(&self, priority: Priority) -> bool;
}

pub trait DiskLoader: Send + Sync {
    fn load_record(
        &self,
        cell: CellPos,
        category: DataCategory,
        priority: Priority,
        callback: DiskCallback,
    ) -> Box<dyn DiskRequest>;

    /// Write a record; `None` deletes it.
    fn store_record(&self, cell: CellPos, category: DataCategory, data: Option<Bytes>);
}

impl DiskRequest for Arc<PrioritisedTask> {
    fn cancel(&self) -> bool {
        PrioritisedTask::cancel(self)
    }

    fn priority(&self) -> Priority {
        PrioritisedTask::priority(self)
    }

    fn set_priority(&self, priority: Priority) -> bool {
        PrioritisedTask::set_priority(self, priority)
    }

    fn raise_priority(&self, priority: Priority) -> bool {
        PrioritisedTask::raise_priority(self, priority)
    }

    fn lower_priority(&self, priority: Priority) -> bool {
        PrioritisedTask::lower_priority(self, priority)
    }
}

type RecordKey = (u64, DataCategory);

#[derive(Default)]
struct Records {
    data: HashMap<RecordKey, Bytes>,
    /// One-shot load failures.
    failures: HashMap<RecordKey, String>,
}

/// In-process [`DiskLoader`].
pub struct MemoryDisk {
    pool: Arc<WorkerPool>,
    records: Arc<RwLock<Records>>,
    loads: Arc<AtomicU64>,
    stores: AtomicU64,
}

impl MemoryDisk {
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            records: Arc::default(),
            loads: Arc::default(),
            stores: AtomicU64::new(0),
        })
    }

    /// Make the next load of this record fail with `message`.
    pub fn inject_failure(&self, cell: CellPos, category: DataCategory, message: impl Into<String>) {
        self.records
            .write()
            .failures
            .insert((cell.key(), category), message.into());
    }

    #[must_use]
    pub fn get(&self, cell: CellPos, category: DataCategory) -> Option<Bytes> {
        self.records.read().data.get(&(cell.key(), category)).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads answered so far.
    #[must_use]
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stores(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }
}

impl DiskLoader for MemoryDisk {
    fn load_record(
        &self,
        cell: CellPos,
        category: DataCategory,
        priority: Priority,
        callback: DiskCallback,
    ) -> Box<dyn DiskRequest> {
        let records = Arc::clone(&self.records);
        let loads = Arc::clone(&self.loads);
        let task = self.pool.queue_task(
            Box::new(move || {
                let key = (cell.key(), category);
                let result = {
                    let mut records = records.write();
                    match records.failures.remove(&key) {
                        Some(message) => Err(TaskError::Disk(message)),
                        None => Ok(records.data.get(&key).cloned()),
                    }
                };
                loads.fetch_add(1, Ordering::Relaxed);
                trace!(%cell, %category, found = matches!(result, Ok(Some(_))), "record loaded");
                callback(result);
            }),
            priority,
        );
        Box::new(task)
    }

    fn store_record(&self, cell: CellPos, category: DataCategory, data: Option<Bytes>) {
        let key = (cell.key(), category);
        let mut records = self.records.write();
        match data {
            Some(data) => {
                records.data.insert(key, data);
            }
            None => {
                records.data.remove(&key);
            }
        }
        self.stores.fetch_add(1, Ordering::Relaxed);
    }
}

impl core::fmt::Debug for MemoryDisk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryDisk")
            .field("records", &self.len())
            .field("loads", &self.loads())
            .field("stores", &self.stores())
            .finish()
    }
}
