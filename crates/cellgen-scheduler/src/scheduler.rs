//! The cell scheduler.
//!
//! # Update Model
//!
//! ```text
//!   acquire / release / push_ops ──▶ dirty cells
//!                                        │ process_updates
//!                                        ▼
//!   ┌───────────────────────────────────────────────────────────┐
//!   │ per cell, under its section of the scheduling lock:       │
//!   │   target = max(level table (min lease level), demands)    │
//!   │   promote / demote ticking stages                         │
//!   │   cancel an in-flight task aiming above the target        │
//!   │   demand the previous stage of the cells a wide           │
//!   │     transition reads, and wait until they have it         │
//!   │   spawn the next task if below target, idle and ready     │
//!   │   evict if no leases, no demands and nothing in flight    │
//!   └───────────────────────────────────────────────────────────┘
//!                                        │ task completes
//!                                        ▼
//!   record stage ─▶ wake stage waiters ─▶ re-evaluate the cell (cascade)
//!                                     └─▶ re-check cells demanding it
//! ```
//!
//! A transition whose write radius is `r > 0` reads the cells within `r`, so
//! before it runs each of them must hold the stage just below the target.
//! The waiting cell places a demand on them, which raises their own target
//! like a lease would. Demands are dropped once the cell no longer needs
//! them, and a neighbour that fails short of the demanded stage fails the
//! cell waiting on it.
//!
//! Holder state is only mutated while holding the cell's section of the
//! scheduling [`AreaLock`]. That lock is reentrant for its thread, so a task
//! that completes synchronously inside a cancel may cascade on the same stack.
//! Work that may re-enter the scheduler (cancels, schedules, waiters, disk
//! writes) runs after the holder's mutex is released.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use cellgen_exec::{Priority, RadiusAwareExecutor, panic_message};
use cellgen_spatial::{AreaLock, CellPos, WriteRadius, search_ring};
use cellgen_task::{DataCategory, FailureReport, StagedTask, TaskContext, TaskError, TaskStage};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::holder::{CellHolder, Demand, HolderState, InFlight};
use crate::light::LightQueue;
use crate::progress::{
    AdvanceInput, FullTask, LightTask, LoadTask, ProgressKind, ProgressResult, ProgressionTask,
    UpgradeTask,
};
use crate::{
    AuxRecord, AuxRecordWork, CellData, CellRecordWork, HolderSnapshot, LeaseCategory, LeaseOp,
    LevelTable, Neighbor, NeighborView, SchedulerError, Stage, StageRegistry, StageWaiter,
};

/// Owner id used for transient leases.
const TRANSIENT_OWNER: u64 = 0;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Scheduling lock sections are `2^lock_shift` cells wide.
    pub lock_shift: u32,
    /// Decode cell records on the worker pool instead of the main queue.
    pub async_decode: bool,
    /// Write records back through the disk loader on eviction.
    pub store_on_evict: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_shift: 2,
            async_decode: true,
            store_on_evict: true,
        }
    }
}

/// Everything the scheduler needs, passed at construction.
#[derive(Clone, Debug)]
pub struct SchedulerContext {
    pub tasks: TaskContext,
    pub radius: Arc<RadiusAwareExecutor>,
    pub registry: StageRegistry,
    pub levels: LevelTable,
    pub config: SchedulerConfig,
}

impl SchedulerContext {
    #[must_use]
    pub fn new(
        tasks: TaskContext,
        radius: Arc<RadiusAwareExecutor>,
        registry: StageRegistry,
    ) -> Self {
        Self {
            tasks,
            radius,
            registry,
            levels: LevelTable::default(),
            config: SchedulerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_levels(mut self, levels: LevelTable) -> Self {
        self.levels = levels;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }
}

/// Work on other cells raised while a section was held, run by
/// [`CellScheduler::settle`] once it is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FollowUp {
    /// Set or clear `owner`'s demand on `cell`.
    Demand {
        cell: CellPos,
        owner: CellPos,
        stage: Option<Stage>,
    },
    /// Re-evaluate a cell that may be waiting on its neighbours.
    Recheck(CellPos),
}

/// Deferred side effects of a holder update.
enum Effect {
    Cancel(Arc<dyn ProgressionTask>),
    Schedule(Arc<dyn ProgressionTask>),
    Wake(Vec<(StageWaiter, Option<Stage>)>),
    Report(FailureReport),
    Evict,
}

pub struct CellScheduler {
    ctx: SchedulerContext,
    holders: RwLock<HashMap<u64, Arc<CellHolder>>>,
    lock: Arc<AreaLock>,
    light: Arc<LightQueue>,
    ops: Mutex<Vec<LeaseOp>>,
    dirty: Mutex<Vec<CellPos>>,
    follow_ups: Mutex<Vec<FollowUp>>,
    settling: Mutex<()>,
    /// Cells holding at least one expiring lease.
    timed: Mutex<HashSet<u64>>,
    now: AtomicU64,
    next_task: AtomicU64,
    this: Weak<CellScheduler>,
}

impl CellScheduler {
    #[must_use]
    pub fn new(ctx: SchedulerContext) -> Arc<Self> {
        let lock = AreaLock::new(ctx.config.lock_shift);
        let light = LightQueue::new(Arc::clone(&ctx.radius));
        Arc::new_cyclic(|this| Self {
            ctx,
            holders: RwLock::new(HashMap::new()),
            lock,
            light,
            ops: Mutex::new(Vec::new()),
            dirty: Mutex::new(Vec::new()),
            follow_ups: Mutex::new(Vec::new()),
            settling: Mutex::new(()),
            timed: Mutex::new(HashSet::new()),
            now: AtomicU64::new(0),
            next_task: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    #[must_use]
    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    #[must_use]
    pub fn levels(&self) -> &LevelTable {
        &self.ctx.levels
    }

    /// Current tick, advanced by [`CellScheduler::tick`].
    #[must_use]
    pub fn now(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn light_queue(&self) -> &Arc<LightQueue> {
        &self.light
    }

    fn holder(&self, cell: CellPos) -> Option<Arc<CellHolder>> {
        self.holders.read().get(&cell.key()).cloned()
    }

    fn holder_or_create(&self, cell: CellPos) -> Arc<CellHolder> {
        if let Some(holder) = self.holder(cell) {
            return holder;
        }
        Arc::clone(
            self.holders
                .write()
                .entry(cell.key())
                .or_insert_with(|| CellHolder::new(cell)),
        )
    }

    fn mark_dirty(&self, cell: CellPos, state: &mut HolderState) {
        if !state.dirty {
            state.dirty = true;
            self.dirty.lock().push(cell);
        }
    }

    fn track_timed(&self, cell: CellPos, state: &HolderState) {
        if state.leases.has_timed() {
            self.timed.lock().insert(cell.key());
        }
    }

    // ---------------------------------------------------------------------
    // Leases
    // ---------------------------------------------------------------------

    /// Add or replace the lease `(category, owner)` on `cell`.
    pub fn acquire(&self, cell: CellPos, category: LeaseCategory, level: u32, owner: u64) {
        self.apply(LeaseOp::Add {
            cell,
            category,
            owner,
            level,
        });
    }

    pub fn release(&self, cell: CellPos, category: LeaseCategory, owner: u64) {
        self.apply(LeaseOp::Remove {
            cell,
            category,
            owner,
        });
    }

    /// Queue lease changes without applying them.
    pub fn push_ops(&self, ops: impl IntoIterator<Item = LeaseOp>) {
        self.ops.lock().extend(ops);
    }

    pub fn push_op(&self, op: LeaseOp) {
        self.ops.lock().push(op);
    }

    /// Apply every queued lease change, then process the affected cells.
    pub fn flush_ops(&self) -> usize {
        let ops = std::mem::take(&mut *self.ops.lock());
        for op in ops {
            self.apply(op);
        }
        self.process_updates()
    }

    fn apply(&self, op: LeaseOp) {
        let cell = op.cell();
        let _guard = self.lock.lock(cell, WriteRadius::Bounded(0));
        let now = self.now();

        let holder = match op {
            LeaseOp::Remove { .. } => match self.holder(cell) {
                Some(holder) => holder,
                None => return,
            },
            _ => self.holder_or_create(cell),
        };
        let mut state = holder.state.lock();
        let before = state.leases.min_level();

        let removed = match op {
            LeaseOp::Add {
                category,
                owner,
                level,
                ..
            } => {
                state.leases.add(category, owner, level, now);
                false
            }
            LeaseOp::Remove {
                category, owner, ..
            } => state.leases.remove(category, owner).is_some(),
            LeaseOp::AddIfRemoved {
                add: (add_category, add_owner, level),
                remove: (category, owner),
                ..
            } => {
                let removed = state.leases.remove(category, owner).is_some();
                if removed {
                    state.leases.add(add_category, add_owner, level, now);
                }
                removed
            }
            LeaseOp::AddAndRemove {
                add: (add_category, add_owner, level),
                remove: (category, owner),
                ..
            } => {
                state.leases.add(add_category, add_owner, level, now);
                state.leases.remove(category, owner).is_some()
            }
        };

        // a removal never lowers the level within the tick it happens
        if removed {
            if let Some(old) = before {
                if state.leases.min_level().is_none_or(|after| after > old) {
                    state
                        .leases
                        .add(LeaseCategory::TRANSIENT, TRANSIENT_OWNER, old, now);
                }
            }
        }

        self.track_timed(cell, &state);
        if state.leases.min_level() != before || state.leases.is_empty() {
            self.mark_dirty(cell, &mut state);
        }
    }

    /// Advance one tick: expire timed leases, flush queued changes, and
    /// process every dirty cell.
    pub fn tick(&self) -> usize {
        let now = self.now.fetch_add(1, Ordering::AcqRel) + 1;
        let timed: Vec<u64> = self.timed.lock().iter().copied().collect();

        for key in timed {
            let cell = CellPos::from_key(key);
            let _guard = self.lock.lock(cell, WriteRadius::Bounded(0));
            let Some(holder) = self.holder(cell) else {
                self.timed.lock().remove(&key);
                continue;
            };
            let mut state = holder.state.lock();
            if state.leases.expire(now) {
                self.mark_dirty(cell, &mut state);
            }
            if !state.leases.has_timed() {
                self.timed.lock().remove(&key);
            }
        }

        self.flush_ops()
    }

    /// Re-evaluate every dirty cell. Returns the number processed.
    pub fn process_updates(&self) -> usize {
        let mut processed = 0;
        loop {
            let batch = std::mem::take(&mut *self.dirty.lock());
            if batch.is_empty() {
                return processed;
            }
            for cell in batch {
                self.update_cell(cell);
                self.settle();
                processed += 1;
            }
        }
    }

    /// Apply queued neighbour demands and re-evaluate the cells they touch
    /// until none are left. One thread settles at a time; the others leave
    /// their follow-ups in the queue for it.
    fn settle(&self) {
        // nested under a held section: the frame holding it settles afterwards
        if self.lock.current_thread_holds_any() {
            return;
        }
        loop {
            let Some(settling) = self.settling.try_lock() else {
                return;
            };
            loop {
                let batch = std::mem::take(&mut *self.follow_ups.lock());
                if batch.is_empty() {
                    break;
                }
                // demands land before their owners look at them again
                let mut cells = Vec::with_capacity(batch.len());
                for follow_up in batch {
                    match follow_up {
                        FollowUp::Demand { cell, owner, stage } => {
                            if self.apply_demand(cell, owner, stage) {
                                cells.push(cell);
                            }
                            cells.push(owner);
                        }
                        FollowUp::Recheck(cell) => cells.push(cell),
                    }
                }
                let mut seen = HashSet::with_capacity(cells.len());
                for cell in cells {
                    if seen.insert(cell.key()) {
                        self.update_cell(cell);
                    }
                }
            }
            drop(settling);
            if self.follow_ups.lock().is_empty() {
                return;
            }
        }
    }

    /// Returns whether `cell` needs re-evaluating.
    fn apply_demand(&self, cell: CellPos, owner: CellPos, stage: Option<Stage>) -> bool {
        let _guard = self.lock.lock(cell, WriteRadius::Bounded(0));
        let holder = match stage {
            Some(_) => self.holder_or_create(cell),
            None => match self.holder(cell) {
                Some(holder) => holder,
                None => return false,
            },
        };
        let mut state = holder.state.lock();
        let before = state.target_stage(&self.ctx.levels);
        let owner = owner.key();
        state.demands.retain(|&mut (o, _)| o != owner);
        if let Some(stage) = stage {
            state.demands.push((owner, stage));
        }
        state.target_stage(&self.ctx.levels) != before || state.is_evictable()
    }

    fn recheck(&self, cells: Vec<CellPos>) {
        if !cells.is_empty() {
            self.follow_ups
                .lock()
                .extend(cells.into_iter().map(FollowUp::Recheck));
        }
    }

    // ---------------------------------------------------------------------
    // Holder updates
    // ---------------------------------------------------------------------

    fn update_cell(&self, cell: CellPos) {
        let _guard = self.lock.lock(cell, WriteRadius::Bounded(0));
        let Some(holder) = self.holder(cell) else {
            return;
        };

        let effects = {
            let mut state = holder.state.lock();
            self.plan(&holder, &mut state)
        };
        self.run_effects(cell, effects);
    }

    fn plan(&self, holder: &CellHolder, state: &mut HolderState) -> Vec<Effect> {
        let cell = holder.cell;
        let mut effects = Vec::new();
        state.dirty = false;
        let target = state.target_stage(&self.ctx.levels);

        let full = state.data_stage() == Some(Stage::Full);
        let activation = target.filter(|t| full && t.is_activation());
        if state.activation != activation {
            trace!(%cell, from = ?state.activation, to = ?activation, "activation changed");
            state.activation = activation;
            effects.push(Effect::Wake(state.take_reached()));
        }

        let generation_target = target.map(|t| t.min(Stage::Full));
        let mut demand = None;
        if let Some(in_flight) = &state.in_flight {
            let stage = in_flight.task.target_stage();
            if generation_target.is_some_and(|t| stage <= t) {
                demand = self.prerequisite(stage);
            } else {
                debug!(%cell, %stage, "cancelling unwanted transition");
                // it may already be running against its neighbours
                demand = state.demanding;
                effects.push(Effect::Cancel(Arc::clone(&in_flight.task)));
            }
        } else if state.failed.is_none() {
            let next = generation_target.and_then(|goal| match state.data_stage() {
                None => Some(Stage::Empty),
                Some(stage) if stage < goal => stage.next(),
                Some(_) => None,
            });
            if let Some(next) = next {
                demand = self.prerequisite(next);
                match demand.map_or(Ok(true), |d| self.neighbors_ready(cell, d)) {
                    Ok(true) => match self.spawn(cell, next, state) {
                        Ok(task) => effects.push(Effect::Schedule(task)),
                        Err(error) => {
                            let report =
                                FailureReport::new(cell, error.to_string()).with("stage", next);
                            self.fail(holder, state, error, report, &mut effects);
                        }
                    },
                    Ok(false) => trace!(%cell, %next, "waiting on neighbours"),
                    Err(neighbor) => {
                        demand = None;
                        let error = SchedulerError::NeighborFailed {
                            cell,
                            stage: next,
                            neighbor,
                        };
                        let report = FailureReport::new(cell, error.to_string())
                            .with("stage", next)
                            .with("neighbor", neighbor);
                        let error = TaskError::Stage(error.to_string());
                        self.fail(holder, state, error, report, &mut effects);
                    }
                }
            }
        }
        self.redemand(cell, state, demand);

        if state.is_evictable() {
            effects.push(Effect::Evict);
        }
        effects
    }

    /// Record a failure, release waiters, and let dependent cells notice.
    fn fail(
        &self,
        holder: &CellHolder,
        state: &mut HolderState,
        error: TaskError,
        report: FailureReport,
        effects: &mut Vec<Effect>,
    ) {
        state.failed = Some(error);
        holder.publish(state);
        effects.push(Effect::Wake(state.take_all_waiters()));
        effects.push(Effect::Report(report));
        self.recheck(state.demanders());
    }

    /// Neighbour stage a transition into `stage` reads, if it reads any.
    ///
    /// Unbounded transitions are serialized against everything and demand
    /// nothing of their surroundings.
    fn prerequisite(&self, stage: Stage) -> Option<Demand> {
        let executor = self.ctx.registry.get(stage).ok()?;
        match executor.write_radius(stage) {
            WriteRadius::Bounded(radius) if radius > 0 => Some(Demand {
                radius,
                stage: stage.previous()?,
            }),
            _ => None,
        }
    }

    /// Whether every other cell within the demand's radius has reached its
    /// stage. `Err` names a neighbour that failed short of it.
    fn neighbors_ready(&self, cell: CellPos, demand: Demand) -> Result<bool, CellPos> {
        let holders = self.holders.read();
        let mut ready = true;
        for neighbor in cell.square(demand.radius).filter(|&n| n != cell) {
            let Some(holder) = holders.get(&neighbor.key()) else {
                ready = false;
                continue;
            };
            if holder.published_stage().is_some_and(|s| s >= demand.stage) {
                continue;
            }
            if holder.has_failed() {
                return Err(neighbor);
            }
            ready = false;
        }
        Ok(ready)
    }

    /// Move the demand `cell` places on its neighbours to `wanted`.
    fn redemand(&self, cell: CellPos, state: &mut HolderState, wanted: Option<Demand>) {
        if state.demanding == wanted {
            return;
        }
        trace!(%cell, from = ?state.demanding, to = ?wanted, "neighbour demand changed");
        let mut follow_ups = Vec::new();
        if let Some(old) = state.demanding {
            let released = cell
                .square(old.radius)
                .filter(|&n| n != cell && wanted.is_none_or(|d| cell.chebyshev(n) > d.radius));
            follow_ups.extend(released.map(|n| FollowUp::Demand {
                cell: n,
                owner: cell,
                stage: None,
            }));
        }
        if let Some(new) = wanted {
            let claimed = cell.square(new.radius).filter(|&n| n != cell);
            follow_ups.extend(claimed.map(|n| FollowUp::Demand {
                cell: n,
                owner: cell,
                stage: Some(new.stage),
            }));
        }
        state.demanding = wanted;
        self.follow_ups.lock().extend(follow_ups);
    }

    /// Completion may cascade on this stack, so `cell`'s section must be held.
    fn cancel_transition(&self, cell: CellPos, task: &dyn ProgressionTask) {
        debug_assert!(
            self.lock.is_held_by_current_thread(cell),
            "cancelling the transition of {cell} outside its section"
        );
        task.cancel();
    }

    fn run_effects(&self, cell: CellPos, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Cancel(task) => self.cancel_transition(cell, task.as_ref()),
                Effect::Schedule(task) => task.schedule(),
                Effect::Wake(waiters) => self.wake(cell, waiters),
                Effect::Report(report) => self.ctx.tasks.diagnostics.report(&report),
                Effect::Evict => self.evict(cell),
            }
        }
    }

    fn wake(&self, cell: CellPos, waiters: Vec<(StageWaiter, Option<Stage>)>) {
        for (waiter, stage) in waiters {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| waiter(stage))) {
                self.ctx.tasks.diagnostics.report(
                    &FailureReport::new(cell, panic_message(payload.as_ref()))
                        .with("phase", "stage waiter"),
                );
            }
        }
    }

    fn evict(&self, cell: CellPos) {
        let (data, entity, poi, aux, waiters) = {
            let mut holders = self.holders.write();
            let Some(holder) = holders.get(&cell.key()).cloned() else {
                return;
            };
            let mut state = holder.state.lock();
            // a waiter may have leased the cell again
            if !state.is_evictable() {
                return;
            }
            holders.remove(&cell.key());
            (
                state.data.take(),
                state.aux_writeback(DataCategory::Entity),
                state.aux_writeback(DataCategory::Poi),
                state.aux.take(),
                state.take_all_waiters(),
            )
        };

        if self.ctx.config.store_on_evict {
            let disk = &self.ctx.tasks.disk;
            // an empty cell carries nothing worth storing, and may stand in
            // for a record that could not be read
            if let Some(data) = data.as_ref().filter(|d| d.stage > Stage::Empty) {
                disk.store_record(cell, DataCategory::Cell, Some(data.encode()));
            }
            if let Some(entity) = entity {
                disk.store_record(cell, DataCategory::Entity, entity);
            }
            if let Some(poi) = poi {
                disk.store_record(cell, DataCategory::Poi, poi);
            }
        }
        for task in aux.iter().flatten() {
            task.cancel();
        }
        debug!(%cell, stage = ?data.map(|d| d.stage), "cell evicted");
        self.wake(cell, waiters);
    }

    fn spawn(
        &self,
        cell: CellPos,
        next: Stage,
        state: &mut HolderState,
    ) -> Result<Arc<dyn ProgressionTask>, TaskError> {
        let tasks = &self.ctx.tasks;
        let priority = state.priority;

        let (task, kind): (Arc<dyn ProgressionTask>, _) = if next == Stage::Empty {
            let aux = self.aux_tasks(cell, state, priority);
            let record = StagedTask::new(
                cell,
                DataCategory::Cell,
                CellRecordWork {
                    async_decode: self.ctx.config.async_decode,
                },
                priority,
                tasks,
            );
            (LoadTask::new(record, aux, &tasks.diagnostics), ProgressKind::Load)
        } else {
            let executor = Arc::clone(self.ctx.registry.get(next)?);
            let input = AdvanceInput {
                cell,
                target: next,
                data: state.data.clone().unwrap_or_default(),
                radius: executor.write_radius(next),
                view: self.this.clone(),
                executor: Arc::clone(&executor),
            };
            match next {
                Stage::Full => (
                    FullTask::new(input, priority, &tasks.main, &tasks.diagnostics),
                    ProgressKind::Full,
                ),
                Stage::Light => (
                    LightTask::new(input, priority, Arc::clone(&self.light), &tasks.diagnostics),
                    ProgressKind::Light,
                ),
                _ => (
                    UpgradeTask::new(
                        input,
                        executor.parallel_capable(next),
                        priority,
                        &tasks.pool,
                        &self.ctx.radius,
                        &tasks.diagnostics,
                    ),
                    ProgressKind::Upgrade,
                ),
            }
        };

        let id = self.next_task.fetch_add(1, Ordering::Relaxed);
        let scheduler = self.this.clone();
        task.on_complete(Box::new(move |result| {
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.on_task_complete(cell, id, result);
            }
        }));
        trace!(%cell, %next, ?kind, "spawned transition");
        state.in_flight = Some(InFlight {
            id,
            kind,
            task: Arc::clone(&task),
        });
        Ok(task)
    }

    fn aux_tasks(
        &self,
        cell: CellPos,
        state: &mut HolderState,
        priority: Priority,
    ) -> [Arc<StagedTask<AuxRecordWork>>; 2] {
        if let Some(aux) = &state.aux {
            if aux.iter().all(|task| task.stage() != TaskStage::Cancelled) {
                return aux.clone();
            }
        }
        let tasks = &self.ctx.tasks;
        let aux = [
            StagedTask::new(cell, DataCategory::Entity, AuxRecordWork, priority, tasks),
            StagedTask::new(cell, DataCategory::Poi, AuxRecordWork, priority, tasks),
        ];
        state.aux = Some(aux.clone());
        aux
    }

    fn on_task_complete(&self, cell: CellPos, id: u64, result: Option<&ProgressResult>) {
        self.record_completion(cell, id, result);
        self.settle();
    }

    fn record_completion(&self, cell: CellPos, id: u64, result: Option<&ProgressResult>) {
        let _guard = self.lock.lock(cell, WriteRadius::Bounded(0));
        let Some(holder) = self.holder(cell) else {
            return;
        };

        let mut effects = Vec::new();
        {
            let mut state = holder.state.lock();
            let Some(in_flight) = state.in_flight.take_if(|f| f.id == id) else {
                return;
            };
            let target = in_flight.task.target_stage();

            match result {
                None => trace!(%cell, %target, "transition cancelled"),
                Some(Ok(data)) => match state.data_stage() {
                    Some(current) if data.stage < current => {
                        let error = SchedulerError::StageRegressed {
                            cell,
                            from: current,
                            to: data.stage,
                        };
                        let report =
                            FailureReport::new(cell, error.to_string()).with("stage", target);
                        let error = TaskError::Stage(error.to_string());
                        self.fail(&holder, &mut state, error, report, &mut effects);
                    }
                    _ => {
                        state.data = Some(data.clone());
                        if in_flight.kind == ProgressKind::Full {
                            state.post_processed = true;
                        }
                        holder.publish(&state);
                        effects.push(Effect::Wake(state.take_reached()));
                        self.recheck(state.demanders());
                    }
                },
                Some(Err(error)) => {
                    warn!(%cell, %target, %error, "transition failed");
                    let report = FailureReport::new(cell, error.to_string())
                        .with("stage", target)
                        .with("kind", format!("{:?}", in_flight.kind));
                    self.fail(&holder, &mut state, error.clone(), report, &mut effects);
                }
            }
            effects.extend(self.plan(&holder, &mut state));
        }
        self.run_effects(cell, effects);
    }

    // ---------------------------------------------------------------------
    // Priority
    // ---------------------------------------------------------------------

    /// Update the stored priority; returns the in-flight task if it changed.
    fn update_priority(
        &self,
        cell: CellPos,
        update: impl FnOnce(&mut Priority) -> bool,
    ) -> Option<Arc<dyn ProgressionTask>> {
        let holder = self.holder(cell)?;
        let mut state = holder.state.lock();
        if !update(&mut state.priority) {
            return None;
        }
        state.in_flight.as_ref().map(|f| Arc::clone(&f.task))
    }

    pub fn set_priority(&self, cell: CellPos, priority: Priority) {
        let _guard = self.lock.lock(cell, WriteRadius::Bounded(0));
        if let Some(task) = self.update_priority(cell, |p| {
            *p = priority;
            true
        }) {
            task.set_priority(priority);
        }
    }

    pub fn raise_priority(&self, cell: CellPos, priority: Priority) {
        let _guard = self.lock.lock(cell, WriteRadius::Bounded(0));
        if let Some(task) = self.update_priority(cell, |p| {
            let raise = priority.is_higher_than(*p);
            if raise {
                *p = priority;
            }
            raise
        }) {
            task.raise_priority(priority);
        }
    }

    pub fn lower_priority(&self, cell: CellPos, priority: Priority) {
        let _guard = self.lock.lock(cell, WriteRadius::Bounded(0));
        if let Some(task) = self.update_priority(cell, |p| {
            let lower = priority.is_lower_than(*p);
            if lower {
                *p = priority;
            }
            lower
        }) {
            task.lower_priority(priority);
        }
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Call `waiter` once `cell` reaches `stage`.
    ///
    /// Runs immediately if the cell is already there, and with `None` if the
    /// cell is unknown, has failed, or is evicted before getting there.
    pub fn on_stage(&self, cell: CellPos, stage: Stage, waiter: StageWaiter) {
        let _guard = self.lock.lock(cell, WriteRadius::Bounded(0));
        let Some(holder) = self.holder(cell) else {
            self.wake(cell, vec![(waiter, None)]);
            return;
        };
        let ready = {
            let mut state = holder.state.lock();
            match state.current_stage() {
                Some(current) if current >= stage => Some(Some(current)),
                _ if state.failed.is_some() => Some(None),
                _ => {
                    state.waiters.push((stage, waiter));
                    return;
                }
            }
        };
        if let Some(reached) = ready {
            self.wake(cell, vec![(waiter, reached)]);
        }
    }

    fn read<R>(&self, cell: CellPos, f: impl FnOnce(&HolderState) -> R) -> Option<R> {
        let holder = self.holder(cell)?;
        let state = holder.state.lock();
        Some(f(&state))
    }

    #[must_use]
    pub fn current_stage(&self, cell: CellPos) -> Option<Stage> {
        self.read(cell, HolderState::current_stage).flatten()
    }

    #[must_use]
    pub fn target_stage(&self, cell: CellPos) -> Option<Stage> {
        self.read(cell, |s| s.target_stage(&self.ctx.levels)).flatten()
    }

    #[must_use]
    pub fn cell_data(&self, cell: CellPos) -> Option<CellData> {
        self.read(cell, |s| s.data.clone()).flatten()
    }

    #[must_use]
    pub fn aux_data(&self, cell: CellPos, category: DataCategory) -> Option<Bytes> {
        self.read(cell, |s| s.aux_record(category).and_then(AuxRecord::bytes).cloned())
            .flatten()
    }

    #[must_use]
    pub fn failure(&self, cell: CellPos) -> Option<TaskError> {
        self.read(cell, |s| s.failed.clone()).flatten()
    }

    #[must_use]
    pub fn is_in_flight(&self, cell: CellPos) -> bool {
        self.read(cell, |s| s.in_flight.is_some()).unwrap_or(false)
    }

    #[must_use]
    pub fn is_post_processed(&self, cell: CellPos) -> bool {
        self.read(cell, |s| s.post_processed).unwrap_or(false)
    }

    /// Mark a full cell post-processed. Returns false if it is not full yet.
    pub fn post_process(&self, cell: CellPos) -> bool {
        let _guard = self.lock.lock(cell, WriteRadius::Bounded(0));
        let Some(holder) = self.holder(cell) else {
            return false;
        };
        let mut state = holder.state.lock();
        if state.data_stage() != Some(Stage::Full) {
            return false;
        }
        state.post_processed = true;
        true
    }

    #[must_use]
    pub fn holder_count(&self) -> usize {
        self.holders.read().len()
    }

    /// State of every holder, ordered by cell key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<HolderSnapshot> {
        let holders: Vec<_> = self.holders.read().values().cloned().collect();
        let mut snapshot: Vec<_> = holders
            .iter()
            .map(|h| HolderSnapshot::capture(h.cell, &h.state.lock(), &self.ctx.levels))
            .collect();
        snapshot.sort_by_key(|s| s.cell.key());
        snapshot
    }

    /// [`CellScheduler::snapshot`] as pretty JSON.
    ///
    /// # Errors
    ///
    /// If serialization fails.
    pub fn debug_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.snapshot())
    }

    /// Run up to `max` on-main phases queued for this scheduler.
    pub fn run_main(&self, max: usize) -> usize {
        self.ctx.tasks.main.run_pending(max)
    }
}

impl NeighborView for CellScheduler {
    fn neighbors(&self, center: CellPos, radius: u32) -> Vec<Neighbor> {
        let ring = match search_ring(radius) {
            Ok(ring) => ring,
            Err(error) => {
                warn!(%center, %error, "neighbour snapshot skipped");
                return Vec::new();
            }
        };
        let holders: Vec<_> = {
            let map = self.holders.read();
            ring.iter()
                .skip(1)
                .map(|offset| {
                    let cell = center.offset(offset.x, offset.z);
                    (cell, map.get(&cell.key()).cloned())
                })
                .collect()
        };
        holders
            .into_iter()
            .map(|(cell, holder)| {
                let (stage, data) = holder.map_or((None, None), |h| {
                    let state = h.state.lock();
                    (state.current_stage(), state.data.clone())
                });
                Neighbor { cell, stage, data }
            })
            .collect()
    }
}

impl core::fmt::Debug for CellScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CellScheduler")
            .field("holders", &self.holder_count())
            .field("now", &self.now())
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use cellgen_exec::{TaskQueue, WorkerPool};
    use cellgen_task::{MemoryDisk, RecordingDiagnostics};

    use super::*;
    use crate::progress::ProgressListener;
    use crate::{AdvanceRequest, StageError, StageExecutor};

    struct Echo;

    impl StageExecutor for Echo {
        fn advance(&self, request: &AdvanceRequest) -> Result<CellData, StageError> {
            Ok(CellData::new(request.target, request.data.payload.clone()))
        }
    }

    /// Transition that only remembers being cancelled.
    #[derive(Default)]
    struct Marker {
        cancelled: AtomicBool,
    }

    impl ProgressionTask for Marker {
        fn cell(&self) -> CellPos {
            CellPos::ORIGIN
        }

        fn target_stage(&self) -> Stage {
            Stage::Noise
        }

        fn kind(&self) -> ProgressKind {
            ProgressKind::Upgrade
        }

        fn schedule(&self) {}

        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }

        fn is_scheduled(&self) -> bool {
            true
        }

        fn is_completed(&self) -> bool {
            false
        }

        fn priority(&self) -> Priority {
            Priority::Normal
        }

        fn set_priority(&self, _: Priority) {}

        fn raise_priority(&self, _: Priority) {}

        fn lower_priority(&self, _: Priority) {}

        fn on_complete(&self, _: ProgressListener) {}
    }

    fn scheduler(registry: StageRegistry) -> Arc<CellScheduler> {
        let pool = WorkerPool::new("scheduler-unit", 1).unwrap();
        let tasks = TaskContext {
            pool: Arc::clone(&pool),
            main: TaskQueue::new("main"),
            disk: MemoryDisk::new(Arc::clone(&pool)),
            diagnostics: Arc::new(RecordingDiagnostics::new()),
        };
        let radius = RadiusAwareExecutor::new(pool, 2);
        CellScheduler::new(SchedulerContext::new(tasks, radius, registry))
    }

    #[test]
    fn test_prerequisites_follow_write_radius() {
        let scheduler = scheduler(StageRegistry::uniform(Arc::new(Echo)));
        assert_eq!(
            scheduler.prerequisite(Stage::Features),
            Some(Demand {
                radius: 1,
                stage: Stage::Carvers
            })
        );
        assert_eq!(
            scheduler.prerequisite(Stage::Light),
            Some(Demand {
                radius: 2,
                stage: Stage::InitializeLight
            })
        );
        assert_eq!(scheduler.prerequisite(Stage::Noise), None);
        assert_eq!(scheduler.prerequisite(Stage::Empty), None);
    }

    #[test]
    fn test_cancel_runs_under_the_cell_section() {
        let scheduler = scheduler(StageRegistry::new());
        let cell = CellPos::new(3, 3);
        let task = Marker::default();

        let guard = scheduler.lock.lock(cell, WriteRadius::Bounded(0));
        scheduler.cancel_transition(cell, &task);
        drop(guard);
        assert!(task.cancelled.load(Ordering::SeqCst));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "outside its section")]
    fn test_cancel_outside_the_section_is_caught() {
        let scheduler = scheduler(StageRegistry::new());
        scheduler.cancel_transition(CellPos::new(3, 3), &Marker::default());
    }
}
