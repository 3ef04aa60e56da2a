//! Per-cell scheduling record.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use cellgen_exec::Priority;
use cellgen_spatial::CellPos;
use cellgen_task::{DataCategory, StagedTask, TaskError};
use parking_lot::Mutex;
use serde::Serialize;
use smallvec::SmallVec;

use crate::progress::{ProgressKind, ProgressionTask};
use crate::{AuxRecord, AuxRecordWork, CellData, LeaseSet, LevelTable, Stage};

/// Fires with the stage reached, or `None` if the cell failed or was evicted.
pub type StageWaiter = Box<dyn FnOnce(Option<Stage>) + Send + 'static>;

pub(crate) struct InFlight {
    pub(crate) id: u64,
    pub(crate) kind: ProgressKind,
    pub(crate) task: Arc<dyn ProgressionTask>,
}

/// Stage a cell needs every other cell within `radius` to have reached
/// before its next transition may run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Demand {
    pub(crate) radius: u32,
    pub(crate) stage: Stage,
}

pub(crate) struct HolderState {
    pub(crate) data: Option<CellData>,
    /// Ticking stage derived from leases, only while `data` is full.
    pub(crate) activation: Option<Stage>,
    pub(crate) in_flight: Option<InFlight>,
    pub(crate) priority: Priority,
    pub(crate) leases: LeaseSet,
    /// Stages other cells need this one at, keyed by the other cell.
    pub(crate) demands: SmallVec<[(u64, Stage); 4]>,
    /// What this cell currently asks of the cells around it.
    pub(crate) demanding: Option<Demand>,
    pub(crate) failed: Option<TaskError>,
    /// Entity and point-of-interest loads, shared across load attempts.
    pub(crate) aux: Option<[Arc<StagedTask<AuxRecordWork>>; 2]>,
    pub(crate) waiters: Vec<(Stage, StageWaiter)>,
    pub(crate) post_processed: bool,
    pub(crate) dirty: bool,
}

impl HolderState {
    fn new() -> Self {
        Self {
            data: None,
            activation: None,
            in_flight: None,
            priority: Priority::Normal,
            leases: LeaseSet::default(),
            demands: SmallVec::new(),
            demanding: None,
            failed: None,
            aux: None,
            waiters: Vec::new(),
            post_processed: false,
            dirty: false,
        }
    }

    pub(crate) fn data_stage(&self) -> Option<Stage> {
        self.data.as_ref().map(|d| d.stage)
    }

    pub(crate) fn current_stage(&self) -> Option<Stage> {
        self.activation.or_else(|| self.data_stage())
    }

    /// Strongest of the lease level and the neighbour demands.
    pub(crate) fn target_stage(&self, levels: &LevelTable) -> Option<Stage> {
        let leased = self.leases.min_level().and_then(|level| levels.stage_for(level));
        let demanded = self.demands.iter().map(|&(_, stage)| stage).max();
        leased.max(demanded)
    }

    pub(crate) fn is_evictable(&self) -> bool {
        self.leases.is_empty() && self.demands.is_empty() && self.in_flight.is_none()
    }

    /// Cells waiting on this one to reach a stage.
    pub(crate) fn demanders(&self) -> Vec<CellPos> {
        self.demands
            .iter()
            .map(|&(owner, _)| CellPos::from_key(owner))
            .collect()
    }

    /// Waiters satisfied by the current stage.
    pub(crate) fn take_reached(&mut self) -> Vec<(StageWaiter, Option<Stage>)> {
        let Some(current) = self.current_stage() else {
            return Vec::new();
        };
        let (reached, waiting) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition::<Vec<_>, _>(|(stage, _)| *stage <= current);
        self.waiters = waiting;
        reached
            .into_iter()
            .map(|(_, waiter)| (waiter, Some(current)))
            .collect()
    }

    pub(crate) fn take_all_waiters(&mut self) -> Vec<(StageWaiter, Option<Stage>)> {
        std::mem::take(&mut self.waiters)
            .into_iter()
            .map(|(_, waiter)| (waiter, None))
            .collect()
    }

    /// Finished auxiliary load for `category`, if it completed at all.
    pub(crate) fn aux_record(&self, category: DataCategory) -> Option<&AuxRecord> {
        let index = match category {
            DataCategory::Cell => return None,
            DataCategory::Entity => 0,
            DataCategory::Poi => 1,
        };
        let task = &self.aux.as_ref()?[index];
        task.result()??.as_ref().ok()
    }

    /// What eviction should store for `category`: only a dataset that was
    /// read cleanly, so a cancelled or failed load leaves the disk untouched.
    pub(crate) fn aux_writeback(&self, category: DataCategory) -> Option<Option<Bytes>> {
        match self.aux_record(category)? {
            AuxRecord::Loaded(bytes) => Some(bytes.clone()),
            AuxRecord::Unreadable => None,
        }
    }
}

const FAILED_BIT: u8 = 0x80;

pub(crate) struct CellHolder {
    pub(crate) cell: CellPos,
    pub(crate) state: Mutex<HolderState>,
    /// Data stage plus one (zero for none), with [`FAILED_BIT`] once failed.
    /// Lets neighbours check readiness without taking `state`.
    published: AtomicU8,
}

impl CellHolder {
    pub(crate) fn new(cell: CellPos) -> Arc<Self> {
        Arc::new(Self {
            cell,
            state: Mutex::new(HolderState::new()),
            published: AtomicU8::new(0),
        })
    }

    /// Mirror `state` for lock-free readers. Call with `state` locked.
    pub(crate) fn publish(&self, state: &HolderState) {
        let stage = state.data_stage().map_or(0, |stage| stage as u8 + 1);
        let failed = if state.failed.is_some() { FAILED_BIT } else { 0 };
        self.published.store(stage | failed, Ordering::Release);
    }

    pub(crate) fn published_stage(&self) -> Option<Stage> {
        let raw = self.published.load(Ordering::Acquire) & !FAILED_BIT;
        raw.checked_sub(1).and_then(Stage::from_u8)
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.published.load(Ordering::Acquire) & FAILED_BIT != 0
    }
}

/// Point-in-time view of one holder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HolderSnapshot {
    pub cell: CellPos,
    pub stage: Option<Stage>,
    pub target: Option<Stage>,
    pub in_flight: Option<Stage>,
    pub evictable: bool,
    pub leases: usize,
    /// Neighbours waiting on this cell.
    pub demands: usize,
    pub failed: bool,
    pub post_processed: bool,
}

impl HolderSnapshot {
    pub(crate) fn capture(cell: CellPos, state: &HolderState, levels: &LevelTable) -> Self {
        Self {
            cell,
            stage: state.current_stage(),
            target: state.target_stage(levels),
            in_flight: state.in_flight.as_ref().map(|f| f.task.target_stage()),
            evictable: state.is_evictable(),
            leases: state.leases.len(),
            demands: state.demands.len(),
            failed: state.failed.is_some(),
            post_processed: state.post_processed,
        }
    }
}
