//! Per-consumer admission of cells into the scheduler.
//!
//! Every cell around a consumer moves through a per-consumer stage, and sits
//! in exactly one queue while it waits for the next step:
//!
//! ```text
//!   load ──(load rate, concurrency)──▶ loading ──(data present)──▶ generate
//!                                                                     │
//!          (generate rate, concurrency) ◀─────────────────────────────┘
//!                     │
//!                     ▼
//!               generating ──(cell full)──▶ tick ──(neighbours generated)──▶ send
//!                                    └──────(outside tick radius)──────────▶ send
//! ```
//!
//! Lease changes are buffered and pushed to the scheduler in batches.
//!
//! A cell the scheduler reports as failed is parked: it leaves its queue,
//! keeps its lease so the failure is not retried, and stops counting against
//! concurrency. Cells that can only tick or be sent once such a neighbour is
//! generated are dropped from those queues instead of holding up the rest.

use std::sync::Arc;

use cellgen_scheduler::{
    CellData, CellScheduler, ENTITY_TICKING_LEVEL, FULL_LEVEL, LeaseCategory, LeaseOp, MAX_LEVEL,
    Stage,
};
use cellgen_spatial::{CellPos, search_ring};
use hashbrown::{HashMap, HashSet};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::{AllocatingRateLimiter, ConfigHandle, DistanceQueue, SquareArea, ViewDistances};

/// Upper bound on any admission rate, per second.
pub const MAX_RATE: f64 = 10_000.0;
/// Largest radius a consumer may resolve to.
pub const MAX_DISTANCE: i32 = 32;

/// Neighbours that must be generated before a cell may tick.
const TICK_NEIGHBOR_RADIUS: u32 = FULL_LEVEL - ENTITY_TICKING_LEVEL;
/// Neighbours that must be generated before a cell may be sent.
const SEND_NEIGHBOR_RADIUS: u32 = 1;

/// How far a consumer has pushed one cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum ConsumerStage {
    #[default]
    None,
    Loading,
    Loaded,
    Generating,
    Generated,
    Tick,
}

impl ConsumerStage {
    /// Lease level the consumer holds on a cell at this stage.
    #[must_use]
    pub const fn level(self) -> u32 {
        match self {
            Self::None => MAX_LEVEL + 1,
            Self::Loading | Self::Loaded => MAX_LEVEL,
            Self::Generating | Self::Generated => FULL_LEVEL,
            Self::Tick => ENTITY_TICKING_LEVEL,
        }
    }
}

/// Receives cells ready for the consumer.
pub trait CellSink: Send {
    fn send(&mut self, cell: CellPos, data: Option<CellData>);
    fn unsend(&mut self, cell: CellPos);
}

/// Where the consumer is and what it asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsumerView {
    pub center: CellPos,
    /// Requested radii; negative entries fall back to the world defaults.
    pub distances: ViewDistances,
    pub can_generate: bool,
}

impl ConsumerView {
    #[must_use]
    pub const fn new(center: CellPos) -> Self {
        Self {
            center,
            distances: ViewDistances::UNSET,
            can_generate: true,
        }
    }

    #[must_use]
    pub const fn with_distances(mut self, distances: ViewDistances) -> Self {
        self.distances = distances;
        self
    }
}

/// Resolved radii with `tick < load` and `send < load`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Distances {
    pub tick: u32,
    pub load: u32,
    pub send: u32,
}

impl Distances {
    #[must_use]
    pub fn resolve(requested: ViewDistances, world: ViewDistances) -> Self {
        let or_world = |requested: i32, world: i32| if requested < 0 { world } else { requested };
        let load_or_world = or_world(requested.load, world.load);

        let tick = or_world(requested.tick, world.tick)
            .min(load_or_world)
            .clamp(0, MAX_DISTANCE);
        let load = (tick + 1).max(load_or_world).min(MAX_DISTANCE + 1);
        let send = match or_world(requested.send, world.send) {
            s if s < 0 => load - 1,
            s => s.min(load - 1),
        };

        Self {
            tick: tick as u32,
            load: load as u32,
            send: send as u32,
        }
    }
}

/// Queue sizes, for introspection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueLens {
    pub load: usize,
    pub loading: usize,
    pub generate: usize,
    pub generating: usize,
    pub tick: usize,
    pub send: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Applied {
    center: CellPos,
    distances: Distances,
    can_generate: bool,
}

/// Configured rates clamp into `[1, MAX_RATE]`; zero or negative is `MAX_RATE`.
fn effective_rate(configured: f64) -> f64 {
    if configured <= 0.0 || configured > MAX_RATE {
        MAX_RATE
    } else {
        configured.max(1.0)
    }
}

/// Remaining concurrency for a configured limit with `in_flight` running.
fn remaining_concurrency(configured: i64, load: u32, in_flight: usize) -> i64 {
    let area = (2 * i64::from(load) + 1).pow(2);
    let limit = match configured {
        0 => (area / 5).max(5),
        l if l < 0 => i64::from(i32::MAX),
        l => l,
    };
    limit - in_flight as i64
}

/// Circular send check, counting the ring adjacent to the border as inside.
fn within_send_distance(center: CellPos, distance: u32, cell: CellPos) -> bool {
    let dx = u64::from(cell.x.abs_diff(center.x).saturating_sub(1));
    let dz = u64::from(cell.z.abs_diff(center.z).saturating_sub(1));
    let far = dx.max(dz).saturating_sub(2);
    let near = dx.min(dz);
    near * near + far * far < u64::from(distance) * u64::from(distance)
}

fn bounded_take(queued: usize, remaining: i64) -> u64 {
    (queued as i64).min(remaining).min(MAX_RATE as i64).max(0) as u64
}

pub struct AdmissionController {
    owner: u64,
    scheduler: Arc<CellScheduler>,
    config: ConfigHandle,
    sink: Box<dyn CellSink>,
    applied: Option<Applied>,

    stages: HashMap<u64, ConsumerStage>,
    sent: HashSet<u64>,
    /// Failed cells, out of every queue until they leave the load area.
    parked: HashSet<u64>,
    pending: Vec<LeaseOp>,

    load_limiter: AllocatingRateLimiter,
    generate_limiter: AllocatingRateLimiter,
    send_limiter: AllocatingRateLimiter,

    load_queue: DistanceQueue,
    loading_queue: DistanceQueue,
    generate_queue: DistanceQueue,
    generating_queue: DistanceQueue,
    tick_queue: DistanceQueue,
    send_queue: DistanceQueue,

    send_area: SquareArea,
    load_area: SquareArea,
    tick_area: SquareArea,

    added: bool,
    removed: bool,
}

impl AdmissionController {
    /// `owner` identifies this consumer's leases and must be unique.
    #[must_use]
    pub fn new(
        owner: u64,
        scheduler: Arc<CellScheduler>,
        config: ConfigHandle,
        sink: Box<dyn CellSink>,
    ) -> Self {
        Self {
            owner,
            scheduler,
            config,
            sink,
            applied: None,
            stages: HashMap::new(),
            sent: HashSet::new(),
            parked: HashSet::new(),
            pending: Vec::new(),
            load_limiter: AllocatingRateLimiter::default(),
            generate_limiter: AllocatingRateLimiter::default(),
            send_limiter: AllocatingRateLimiter::default(),
            load_queue: DistanceQueue::default(),
            loading_queue: DistanceQueue::default(),
            generate_queue: DistanceQueue::default(),
            generating_queue: DistanceQueue::default(),
            tick_queue: DistanceQueue::default(),
            send_queue: DistanceQueue::default(),
            send_area: SquareArea::new(),
            load_area: SquareArea::new(),
            tick_area: SquareArea::new(),
            added: false,
            removed: false,
        }
    }

    #[must_use]
    pub const fn owner(&self) -> u64 {
        self.owner
    }

    /// Start tracking `view`. Rate limiters start with no allocation.
    ///
    /// # Panics
    ///
    /// If the consumer was already added or has been removed.
    pub fn add(&mut self, view: &ConsumerView, now: u64) {
        assert!(!self.removed, "adding removed consumer {}", self.owner);
        assert!(!self.added, "consumer {} added twice", self.owner);
        self.added = true;

        self.load_limiter.reset(now);
        self.generate_limiter.reset(now);
        self.send_limiter.reset(now);

        self.update(view);
    }

    /// Re-plan around `view`. Does nothing unless the center, a resolved
    /// radius, or generation permission changed. Returns whether it re-planned.
    ///
    /// # Panics
    ///
    /// If the consumer has been removed.
    pub fn update(&mut self, view: &ConsumerView) -> bool {
        assert!(!self.removed, "updating removed consumer {}", self.owner);
        let distances = Distances::resolve(view.distances, self.config.get().world);
        let next = Applied {
            center: view.center,
            distances,
            can_generate: view.can_generate,
        };
        if self.applied == Some(next) {
            return false;
        }

        let Distances { tick, load, send } = distances;
        for cell in self.send_area.update(view.center, send + 1) {
            self.unsend(cell);
        }
        for cell in self.load_area.update(view.center, load + 1) {
            self.leave_load_area(cell);
        }
        for cell in self.tick_area.update(view.center, tick) {
            self.leave_tick_area(cell);
        }

        for queue in self.queues_mut() {
            queue.reset(view.center);
        }
        self.applied = Some(next);

        let ring = search_ring(load + 1).unwrap_or_else(|e| {
            warn!(owner = self.owner, %e, "load ring unavailable");
            &[]
        });
        for offset in ring {
            let cell = view.center.offset(offset.x, offset.z);
            let want_sent = self.wants_sent(cell);
            let sent = if want_sent {
                self.sent.contains(&cell.key())
            } else {
                self.sent.remove(&cell.key())
            };
            if sent && !want_sent {
                self.sink.unsend(cell);
            }

            self.enqueue(cell, view.can_generate, want_sent && !sent);
        }

        debug!(
            owner = self.owner,
            center = %view.center,
            tick, load, send,
            "consumer re-planned"
        );
        self.flush();
        true
    }

    /// Advance every queue as far as rates, concurrency, and scheduler
    /// progress allow. `now` is in nanoseconds.
    ///
    /// # Panics
    ///
    /// If the consumer has been removed.
    pub fn update_queues(&mut self, now: u64) {
        assert!(!self.removed, "ticking removed consumer {}", self.owner);
        let Some(applied) = self.applied else {
            return;
        };
        let config = self.config.get();
        let load_rate = effective_rate(config.max_load_rate);
        let generate_rate = effective_rate(config.max_generate_rate);
        let send_rate = effective_rate(config.max_send_rate);

        self.load_limiter.tick_allocation(now, load_rate, load_rate);
        self.generate_limiter
            .tick_allocation(now, generate_rate, generate_rate);
        self.send_limiter.tick_allocation(now, send_rate, send_rate);

        self.drain_loading(applied.can_generate);
        let max_loads = remaining_concurrency(
            config.max_concurrent_loads,
            applied.distances.load,
            self.loading_queue.len(),
        );
        self.admit_loads(now, load_rate, max_loads);

        self.drain_generating();
        let max_generations = remaining_concurrency(
            config.max_concurrent_generations,
            applied.distances.load,
            self.generating_queue.len(),
        );
        self.admit_generations(now, generate_rate, max_generations);

        self.promote_ticking();
        self.send_ready(now, send_rate);
        self.flush();
    }

    /// Release everything this consumer holds.
    ///
    /// # Panics
    ///
    /// If called twice.
    pub fn remove(&mut self) {
        assert!(!self.removed, "consumer {} removed twice", self.owner);
        self.removed = true;

        for cell in self.send_area.remove() {
            self.unsend(cell);
        }
        for cell in self.load_area.remove() {
            self.leave_load_area(cell);
        }
        for cell in self.tick_area.remove() {
            self.leave_tick_area(cell);
        }
        for key in std::mem::take(&mut self.sent) {
            self.sink.unsend(CellPos::from_key(key));
        }
        self.parked.clear();
        for queue in self.queues_mut() {
            queue.clear();
        }
        self.flush();
        debug!(owner = self.owner, "consumer removed");
    }

    /// Queue `cell` for the step its stage waits on.
    fn enqueue(&mut self, cell: CellPos, can_generate: bool, needs_send: bool) {
        if self.parked.contains(&cell.key()) {
            return;
        }
        match self.stage_of(cell) {
            ConsumerStage::None => self.load_queue.push(cell),
            ConsumerStage::Loading => self.loading_queue.push(cell),
            ConsumerStage::Loaded => {
                if can_generate || self.is_generated(cell) {
                    self.generate_queue.push(cell);
                }
            }
            ConsumerStage::Generating => self.generating_queue.push(cell),
            ConsumerStage::Generated if self.wants_ticked(cell) => self.tick_queue.push(cell),
            ConsumerStage::Generated | ConsumerStage::Tick => {
                if needs_send {
                    self.send_queue.push(cell);
                }
            }
        }
    }

    fn drain_loading(&mut self, can_generate: bool) {
        while let Some(cell) = self.loading_queue.peek() {
            if self.scheduler.current_stage(cell).is_none() {
                if self.scheduler.failure(cell).is_none() {
                    break;
                }
                self.loading_queue.pop();
                self.park(cell);
                continue;
            }
            self.loading_queue.pop();
            self.set_stage(cell, ConsumerStage::Loaded, ConsumerStage::Loading);
            if can_generate || self.is_generated(cell) {
                self.generate_queue.push(cell);
            }
        }
    }

    fn admit_loads(&mut self, now: u64, rate: f64, remaining: i64) {
        let max = bounded_take(self.load_queue.len(), remaining);
        let count = self.load_limiter.take_allocation(now, rate, max);
        if count == 0 {
            return;
        }
        for _ in 0..count {
            let Some(cell) = self.load_queue.pop() else {
                break;
            };
            self.set_stage(cell, ConsumerStage::Loading, ConsumerStage::None);
            self.pending.push(LeaseOp::Add {
                cell,
                category: LeaseCategory::CONSUMER,
                owner: self.owner,
                level: ConsumerStage::Loading.level(),
            });
            self.loading_queue.push(cell);
        }
        // loads start from the scheduler, so the leases must land now
        self.flush();
        trace!(owner = self.owner, count, "loads admitted");
    }

    fn drain_generating(&mut self) {
        while let Some(cell) = self.generating_queue.peek() {
            if !self.is_generated(cell) {
                if self.scheduler.failure(cell).is_none() {
                    break;
                }
                self.generating_queue.pop();
                self.park(cell);
                continue;
            }
            self.generating_queue.pop();
            self.set_stage(cell, ConsumerStage::Generated, ConsumerStage::Generating);
            if self.wants_ticked(cell) {
                self.tick_queue.push(cell);
            } else if self.wants_sent(cell) && !self.sent.contains(&cell.key()) {
                self.send_queue.push(cell);
            }
        }
    }

    fn admit_generations(&mut self, now: u64, rate: f64, remaining: i64) {
        let max = bounded_take(self.generate_queue.len(), remaining);
        // only cells that actually need generating count against the rate
        let allowed = self.generate_limiter.preview_allocation(now, rate, max);
        let mut rated = 0;
        while let Some(cell) = self.generate_queue.peek() {
            if !self.is_generated(cell) {
                if rated >= allowed {
                    break;
                }
                rated += 1;
            }
            self.generate_queue.pop();
            self.set_stage(cell, ConsumerStage::Generating, ConsumerStage::Loaded);
            // same lease identity, so this replaces the loaded level
            self.pending.push(LeaseOp::Add {
                cell,
                category: LeaseCategory::CONSUMER,
                owner: self.owner,
                level: ConsumerStage::Generating.level(),
            });
            self.generating_queue.push(cell);
        }
        self.generate_limiter.take_allocation(now, rate, rated);
        if rated > 0 {
            trace!(owner = self.owner, rated, "generations admitted");
        }
    }

    fn promote_ticking(&mut self) {
        while let Some(cell) = self.tick_queue.peek() {
            if !self.neighbors_generated(cell, TICK_NEIGHBOR_RADIUS) {
                if !self.neighbor_failed(cell, TICK_NEIGHBOR_RADIUS) {
                    break;
                }
                // stays generated; it can still be sent if nothing closer failed
                self.tick_queue.pop();
                if self.wants_sent(cell) && !self.sent.contains(&cell.key()) {
                    self.send_queue.push(cell);
                }
                continue;
            }
            self.tick_queue.pop();
            self.pending.push(LeaseOp::Add {
                cell,
                category: LeaseCategory::CONSUMER,
                owner: self.owner,
                level: ConsumerStage::Tick.level(),
            });
            self.set_stage(cell, ConsumerStage::Tick, ConsumerStage::Generated);
            if self.wants_sent(cell) && !self.sent.contains(&cell.key()) {
                self.send_queue.push(cell);
            }
        }
    }

    fn send_ready(&mut self, now: u64, rate: f64) {
        // sends are limited, never targeted: unused allocation is not returned
        let allowed = self
            .send_limiter
            .take_allocation(now, rate, MAX_RATE as u64)
            .min(self.send_queue.len() as u64);
        let mut sent = 0;
        while sent < allowed {
            let Some(cell) = self.send_queue.peek() else {
                break;
            };
            if !self.neighbors_generated(cell, SEND_NEIGHBOR_RADIUS) {
                if !self.neighbor_failed(cell, SEND_NEIGHBOR_RADIUS) {
                    break;
                }
                self.send_queue.pop();
                continue;
            }
            if !self.scheduler.is_post_processed(cell) && !self.scheduler.post_process(cell) {
                break;
            }
            self.send_queue.pop();
            self.send_cell(cell);
            sent += 1;
        }
    }

    fn leave_load_area(&mut self, cell: CellPos) {
        self.parked.remove(&cell.key());
        let stage = self.stages.remove(&cell.key()).unwrap_or_default();
        if stage == ConsumerStage::None {
            return;
        }
        let level = stage.level();
        self.pending.push(LeaseOp::AddAndRemove {
            cell,
            add: (LeaseCategory::CONSUMER_DELAYED, self.owner, level),
            remove: (LeaseCategory::CONSUMER, self.owner),
        });
    }

    fn leave_tick_area(&mut self, cell: CellPos) {
        // cells that also left the load area are already gone
        let Some(stage) = self.stages.get_mut(&cell.key()) else {
            return;
        };
        if *stage != ConsumerStage::Tick {
            return;
        }
        *stage = ConsumerStage::Generated;

        // hold the ticking level for a while, then settle at generated
        self.pending.push(LeaseOp::AddAndRemove {
            cell,
            add: (
                LeaseCategory::CONSUMER_DELAYED,
                self.owner,
                ConsumerStage::Tick.level(),
            ),
            remove: (LeaseCategory::CONSUMER, self.owner),
        });
        self.pending.push(LeaseOp::Add {
            cell,
            category: LeaseCategory::CONSUMER,
            owner: self.owner,
            level: ConsumerStage::Generated.level(),
        });
    }

    fn send_cell(&mut self, cell: CellPos) {
        let inserted = self.sent.insert(cell.key());
        assert!(inserted, "{cell} sent twice to consumer {}", self.owner);
        let data = self.scheduler.cell_data(cell);
        self.sink.send(cell, data);
    }

    fn unsend(&mut self, cell: CellPos) {
        if self.sent.remove(&cell.key()) {
            self.sink.unsend(cell);
        }
    }

    fn set_stage(&mut self, cell: CellPos, stage: ConsumerStage, expected: ConsumerStage) {
        let previous = self.stages.insert(cell.key(), stage).unwrap_or_default();
        assert!(
            previous == expected,
            "{cell} moved to {stage:?} from {previous:?}, expected {expected:?}"
        );
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        self.scheduler.push_ops(self.pending.drain(..));
        self.scheduler.flush_ops();
    }

    fn is_generated(&self, cell: CellPos) -> bool {
        self.scheduler
            .current_stage(cell)
            .is_some_and(|stage| stage >= Stage::Full)
    }

    fn neighbors_generated(&self, cell: CellPos, radius: u32) -> bool {
        cell.square(radius).filter(|&n| n != cell).all(|n| {
            matches!(
                self.stage_of(n),
                ConsumerStage::Generated | ConsumerStage::Tick
            )
        })
    }

    fn park(&mut self, cell: CellPos) {
        warn!(owner = self.owner, %cell, stage = ?self.stage_of(cell), "cell failed, parked");
        self.parked.insert(cell.key());
    }

    /// Whether a cell within `radius` failed and so will never be generated.
    fn neighbor_failed(&self, cell: CellPos, radius: u32) -> bool {
        cell.square(radius)
            .filter(|&n| n != cell)
            .any(|n| self.scheduler.failure(n).is_some())
    }

    fn wants_sent(&self, cell: CellPos) -> bool {
        self.applied.is_some_and(|a| {
            let send = a.distances.send;
            cell.chebyshev(a.center) <= send + 1 && within_send_distance(a.center, send, cell)
        })
    }

    fn wants_ticked(&self, cell: CellPos) -> bool {
        self.applied
            .is_some_and(|a| cell.chebyshev(a.center) <= a.distances.tick)
    }

    fn queues(&self) -> [&DistanceQueue; 6] {
        [
            &self.load_queue,
            &self.loading_queue,
            &self.generate_queue,
            &self.generating_queue,
            &self.tick_queue,
            &self.send_queue,
        ]
    }

    fn queues_mut(&mut self) -> [&mut DistanceQueue; 6] {
        [
            &mut self.load_queue,
            &mut self.loading_queue,
            &mut self.generate_queue,
            &mut self.generating_queue,
            &mut self.tick_queue,
            &mut self.send_queue,
        ]
    }

    #[must_use]
    pub fn stage_of(&self, cell: CellPos) -> ConsumerStage {
        self.stages.get(&cell.key()).copied().unwrap_or_default()
    }

    /// Every cell with a stage past `None`.
    pub fn tracked(&self) -> impl Iterator<Item = (CellPos, ConsumerStage)> + '_ {
        self.stages
            .iter()
            .map(|(&key, &stage)| (CellPos::from_key(key), stage))
    }

    #[must_use]
    pub fn is_sent(&self, cell: CellPos) -> bool {
        self.sent.contains(&cell.key())
    }

    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }

    /// Radii in effect, once added.
    #[must_use]
    pub fn distances(&self) -> Option<Distances> {
        self.applied.map(|a| a.distances)
    }

    #[must_use]
    pub fn center(&self) -> Option<CellPos> {
        self.applied.map(|a| a.center)
    }

    /// Number of queues holding `cell`.
    #[must_use]
    pub fn queue_count(&self, cell: CellPos) -> usize {
        self.queues().iter().filter(|q| q.contains(cell)).count()
    }

    #[must_use]
    pub fn queue_lens(&self) -> QueueLens {
        QueueLens {
            load: self.load_queue.len(),
            loading: self.loading_queue.len(),
            generate: self.generate_queue.len(),
            generating: self.generating_queue.len(),
            tick: self.tick_queue.len(),
            send: self.send_queue.len(),
        }
    }

    /// Failed cells taken out of the queues.
    #[must_use]
    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    #[must_use]
    pub fn is_parked(&self, cell: CellPos) -> bool {
        self.parked.contains(&cell.key())
    }

    #[must_use]
    pub const fn is_removed(&self) -> bool {
        self.removed
    }
}

impl core::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("owner", &self.owner)
            .field("center", &self.center())
            .field("distances", &self.distances())
            .field("queues", &self.queue_lens())
            .field("sent", &self.sent.len())
            .field("parked", &self.parked.len())
            .finish_non_exhaustive()
    }
}
