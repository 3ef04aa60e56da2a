use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use cellgen_exec::{Priority, RadiusAwareExecutor, TaskQueue, WorkerPool};
use cellgen_scheduler::{
    AdvanceRequest, CellData, CellScheduler, FULL_LEVEL, LeaseCategory, LeaseOp, LevelTable,
    SchedulerContext, Stage, StageError, StageExecutor, StageRegistry,
};
use cellgen_spatial::CellPos;
use cellgen_task::{DataCategory, DiskLoader, MemoryDisk, RecordingDiagnostics, TaskContext};
use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

/// Appends the target stage to the payload and logs every call.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(CellPos, Stage)>>,
    /// Stages of the neighbours each call saw.
    seen: Mutex<Vec<(CellPos, Stage, Vec<Option<Stage>>)>>,
    fail_at: Option<Stage>,
    /// Restricts `fail_at` to one cell.
    fail_cell: Option<CellPos>,
}

impl Recorder {
    fn failing_at(stage: Stage) -> Self {
        Self {
            fail_at: Some(stage),
            ..Self::default()
        }
    }

    fn failing_cell_at(cell: CellPos, stage: Stage) -> Self {
        Self {
            fail_cell: Some(cell),
            ..Self::failing_at(stage)
        }
    }

    fn neighbors_seen(&self, cell: CellPos, stage: Stage) -> Vec<Option<Stage>> {
        self.seen
            .lock()
            .iter()
            .find(|(c, s, _)| *c == cell && *s == stage)
            .map(|(_, _, neighbors)| neighbors.clone())
            .unwrap_or_default()
    }

    fn calls_for(&self, cell: CellPos) -> Vec<Stage> {
        self.calls
            .lock()
            .iter()
            .filter(|(c, _)| *c == cell)
            .map(|&(_, stage)| stage)
            .collect()
    }
}

impl StageExecutor for Recorder {
    fn advance(&self, request: &AdvanceRequest) -> Result<CellData, StageError> {
        self.calls.lock().push((request.cell, request.target));
        let neighbors = request.neighbors.iter().map(|n| n.stage).collect();
        self.seen
            .lock()
            .push((request.cell, request.target, neighbors));
        let failing_here = self.fail_cell.is_none_or(|cell| cell == request.cell);
        if failing_here && self.fail_at == Some(request.target) {
            return Err(StageError::Failed(format!("no {} here", request.target)));
        }
        let mut payload = request.data.payload.to_vec();
        payload.push(request.target as u8);
        Ok(CellData::new(request.target, payload))
    }
}

struct Harness {
    scheduler: Arc<CellScheduler>,
    pool: Arc<WorkerPool>,
    disk: Arc<MemoryDisk>,
    diagnostics: Arc<RecordingDiagnostics>,
}

impl Harness {
    fn new(executor: Arc<Recorder>, levels: LevelTable) -> Self {
        let pool = WorkerPool::new("scheduler-test", 4).unwrap();
        let disk = MemoryDisk::new(Arc::clone(&pool));
        let diagnostics = Arc::new(RecordingDiagnostics::new());
        let tasks = TaskContext {
            pool: Arc::clone(&pool),
            main: TaskQueue::new("main"),
            disk: disk.clone(),
            diagnostics: diagnostics.clone(),
        };
        let radius = RadiusAwareExecutor::new(Arc::clone(&pool), 2);
        let ctx = SchedulerContext::new(tasks, radius, StageRegistry::uniform(executor))
            .with_levels(levels);
        Self {
            scheduler: CellScheduler::new(ctx),
            pool,
            disk,
            diagnostics,
        }
    }

    /// Occupy every worker until the returned sender is dropped.
    fn block_pool(&self) -> Sender<()> {
        let (release, blocked) = unbounded::<()>();
        let (started_tx, started) = unbounded();
        let threads = self.pool.thread_count();
        for _ in 0..threads {
            let blocked = blocked.clone();
            let started_tx = started_tx.clone();
            self.pool.queue_task(
                Box::new(move || {
                    started_tx.send(()).unwrap();
                    let _ = blocked.recv();
                }),
                Priority::Blocking,
            );
        }
        for _ in 0..threads {
            started.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        release
    }

    fn wait_for(&self, what: &str, mut done: impl FnMut(&CellScheduler) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done(&self.scheduler) {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            if self.scheduler.run_main(64) == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

fn table_5_to_12() -> LevelTable {
    LevelTable::new([
        (5, Stage::EntityTicking),
        (6, Stage::BlockTicking),
        (7, Stage::Full),
        (9, Stage::Features),
        (12, Stage::Empty),
    ])
    .unwrap()
}

#[test]
fn test_cascades_one_stage_at_a_time_to_full() {
    let executor = Arc::new(Recorder::default());
    let harness = Harness::new(Arc::clone(&executor), LevelTable::default());
    let cell = CellPos::new(4, -7);

    harness
        .scheduler
        .acquire(cell, LeaseCategory::CONSUMER, FULL_LEVEL, 1);
    harness.scheduler.process_updates();
    harness.wait_for("full", |s| s.current_stage(cell) == Some(Stage::Full));

    let expected: Vec<Stage> = Stage::ALL[1..=Stage::Full as usize].to_vec();
    assert_eq!(executor.calls_for(cell), expected);
    assert!(harness.scheduler.is_post_processed(cell));

    let data = harness.scheduler.cell_data(cell).unwrap();
    let stages: Vec<u8> = expected.iter().map(|&s| s as u8).collect();
    assert_eq!(data.payload.as_ref(), stages.as_slice());
    assert!(harness.diagnostics.reports().is_empty());
}

#[test]
fn test_strongest_lease_wins_and_release_waits_a_tick() {
    let executor = Arc::new(Recorder::default());
    let harness = Harness::new(executor, table_5_to_12());
    let scheduler = &harness.scheduler;
    let cell = CellPos::new(0, 0);

    scheduler.acquire(cell, LeaseCategory::CONSUMER, 9, 1);
    scheduler.acquire(cell, LeaseCategory::CONSUMER, 5, 2);
    scheduler.process_updates();
    assert_eq!(scheduler.target_stage(cell), Some(Stage::EntityTicking));
    harness.wait_for("entity ticking", |s| {
        s.current_stage(cell) == Some(Stage::EntityTicking)
    });

    scheduler.release(cell, LeaseCategory::CONSUMER, 2);
    scheduler.process_updates();
    assert_eq!(scheduler.target_stage(cell), Some(Stage::EntityTicking));
    assert_eq!(scheduler.current_stage(cell), Some(Stage::EntityTicking));

    scheduler.tick();
    assert_eq!(scheduler.target_stage(cell), Some(Stage::Features));
    // generated data never regresses; only the ticking activation drops
    assert_eq!(scheduler.current_stage(cell), Some(Stage::Full));
}

#[test]
fn test_batched_ops_apply_together() {
    let executor = Arc::new(Recorder::default());
    let harness = Harness::new(executor, table_5_to_12());
    let scheduler = &harness.scheduler;
    let cell = CellPos::new(2, 2);

    scheduler.push_ops([
        LeaseOp::Add {
            cell,
            category: LeaseCategory::CONSUMER,
            owner: 7,
            level: 9,
        },
        LeaseOp::AddAndRemove {
            cell,
            add: (LeaseCategory::CONSUMER_DELAYED, 7, 9),
            remove: (LeaseCategory::CONSUMER, 7),
        },
        LeaseOp::AddIfRemoved {
            cell,
            add: (LeaseCategory::FORCED, 7, 5),
            remove: (LeaseCategory::CONSUMER, 99),
        },
    ]);
    assert_eq!(scheduler.target_stage(cell), None);

    scheduler.flush_ops();
    assert_eq!(scheduler.target_stage(cell), Some(Stage::Features));
    let snapshot = scheduler.snapshot();
    let own = snapshot.iter().find(|h| h.cell == cell).unwrap();
    assert_eq!(own.leases, 1);
    assert!(snapshot.iter().all(|h| h.cell == cell || h.leases == 0));
}

#[test]
fn test_failed_stage_is_reported_and_sticks() {
    let executor = Arc::new(Recorder::failing_at(Stage::Noise));
    let harness = Harness::new(Arc::clone(&executor), LevelTable::default());
    let scheduler = &harness.scheduler;
    let cell = CellPos::new(-3, 9);

    scheduler.acquire(cell, LeaseCategory::FORCED, FULL_LEVEL, 1);
    scheduler.process_updates();
    harness.wait_for("failure", |s| s.failure(cell).is_some());

    assert_eq!(scheduler.current_stage(cell), Some(Stage::Biomes));
    assert!(!scheduler.is_in_flight(cell));

    let reports = harness.diagnostics.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].cell, cell);
    assert_eq!(reports[0].get("stage"), Some("noise"));

    // no retries, and waiters hear about it immediately
    let (tx, rx) = unbounded();
    scheduler.on_stage(cell, Stage::Full, Box::new(move |stage| tx.send(stage).unwrap()));
    assert_eq!(rx.try_recv(), Ok(None));
    scheduler.tick();
    assert_eq!(executor.calls_for(cell).last(), Some(&Stage::Noise));
}

#[test]
fn test_eviction_writes_back_and_reload_resumes() {
    let executor = Arc::new(Recorder::default());
    let harness = Harness::new(Arc::clone(&executor), table_5_to_12());
    let scheduler = &harness.scheduler;
    let cell = CellPos::new(11, 1);

    scheduler.acquire(cell, LeaseCategory::CONSUMER, 9, 1);
    scheduler.process_updates();
    // the neighbours it read are let go once it is there
    harness.wait_for("features alone", |s| {
        s.current_stage(cell) == Some(Stage::Features) && s.holder_count() == 1
    });

    scheduler.release(cell, LeaseCategory::CONSUMER, 1);
    scheduler.process_updates();
    assert_eq!(scheduler.holder_count(), 1);
    scheduler.tick();
    assert_eq!(scheduler.holder_count(), 0);

    let record = harness.disk.get(cell, DataCategory::Cell).unwrap();
    assert_eq!(record[0], Stage::Features as u8);

    let before = executor.calls_for(cell).len();
    scheduler.acquire(cell, LeaseCategory::CONSUMER, 9, 1);
    scheduler.process_updates();
    harness.wait_for("reload", |s| s.current_stage(cell) == Some(Stage::Features));
    assert_eq!(executor.calls_for(cell).len(), before);
}

#[test]
fn test_waiters_fire_on_reach_and_on_eviction() {
    let executor = Arc::new(Recorder::default());
    let harness = Harness::new(executor, table_5_to_12());
    let scheduler = &harness.scheduler;
    let cell = CellPos::new(-1, -1);
    let (tx, rx) = unbounded();

    scheduler.acquire(cell, LeaseCategory::CONSUMER, 9, 1);
    scheduler.process_updates();
    for stage in [Stage::Noise, Stage::Full] {
        let tx = tx.clone();
        scheduler.on_stage(cell, stage, Box::new(move |got| tx.send((stage, got)).unwrap()));
    }
    harness.wait_for("features", |s| s.current_stage(cell) == Some(Stage::Features));
    let (stage, got) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(stage, Stage::Noise);
    assert!(got.is_some_and(|s| s >= Stage::Noise));

    scheduler.release(cell, LeaseCategory::CONSUMER, 1);
    scheduler.process_updates();
    scheduler.tick();
    assert_eq!(rx.try_recv(), Ok((Stage::Full, None)));
}

#[test]
fn test_debug_json_lists_holders() {
    let executor = Arc::new(Recorder::default());
    let harness = Harness::new(executor, table_5_to_12());
    let scheduler = &harness.scheduler;

    scheduler.acquire(CellPos::new(1, 0), LeaseCategory::CONSUMER, 12, 1);
    scheduler.acquire(CellPos::new(0, 1), LeaseCategory::CONSUMER, 12, 1);
    scheduler.process_updates();

    let json: serde_json::Value = serde_json::from_str(&scheduler.debug_json().unwrap()).unwrap();
    let holders = json.as_array().unwrap();
    assert_eq!(holders.len(), 2);
    assert!(holders.iter().all(|h| h["target"] == "Empty"));
}

#[test]
fn test_wide_transitions_wait_for_their_neighbours() {
    let executor = Arc::new(Recorder::default());
    let harness = Harness::new(Arc::clone(&executor), LevelTable::default());
    let scheduler = &harness.scheduler;
    let center = CellPos::new(0, 0);

    scheduler.acquire(center, LeaseCategory::CONSUMER, FULL_LEVEL, 1);
    scheduler.process_updates();
    harness.wait_for("full", |s| s.current_stage(center) == Some(Stage::Full));

    let features = executor.neighbors_seen(center, Stage::Features);
    assert_eq!(features.len(), 8);
    assert!(features.iter().all(|s| s.is_some_and(|s| s >= Stage::Carvers)));

    let light = executor.neighbors_seen(center, Stage::Light);
    assert_eq!(light.len(), 24);
    assert!(light.iter().all(|s| s.is_some_and(|s| s >= Stage::InitializeLight)));

    // demands go no further than the stage below the transition needing them
    let edge = CellPos::new(2, 2);
    assert_eq!(executor.calls_for(edge).last(), Some(&Stage::InitializeLight));
    let beyond = CellPos::new(3, 0);
    assert_eq!(executor.calls_for(beyond).last(), Some(&Stage::Carvers));
    assert!(executor.calls_for(CellPos::new(4, 0)).is_empty());

    harness.wait_for("neighbours released", |s| s.holder_count() == 1);
    let record = harness.disk.get(edge, DataCategory::Cell).unwrap();
    assert_eq!(record[0], Stage::InitializeLight as u8);

    scheduler.release(center, LeaseCategory::CONSUMER, 1);
    scheduler.process_updates();
    scheduler.tick();
    assert_eq!(scheduler.holder_count(), 0);
    assert!(harness.diagnostics.reports().is_empty());
}

#[test]
fn test_failed_neighbour_fails_the_cell_waiting_on_it() {
    let broken = CellPos::new(1, 0);
    let executor = Arc::new(Recorder::failing_cell_at(broken, Stage::Carvers));
    let harness = Harness::new(Arc::clone(&executor), LevelTable::default());
    let scheduler = &harness.scheduler;
    let center = CellPos::new(0, 0);

    scheduler.acquire(center, LeaseCategory::CONSUMER, FULL_LEVEL, 1);
    scheduler.process_updates();
    harness.wait_for("center failure", |s| s.failure(center).is_some());

    assert_eq!(scheduler.current_stage(center), Some(Stage::Carvers));
    assert!(!executor.calls_for(center).contains(&Stage::Features));

    let reports = harness.diagnostics.reports();
    assert_eq!(reports.len(), 2);
    let own = reports.iter().find(|r| r.cell == broken).unwrap();
    assert_eq!(own.get("stage"), Some("carvers"));
    let waiting = reports.iter().find(|r| r.cell == center).unwrap();
    assert_eq!(waiting.get("stage"), Some("features"));
    assert_eq!(waiting.get("neighbor"), Some("(1, 0)"));
}

#[test]
fn test_unfinished_aux_loads_leave_stored_records_alone() {
    let harness = Harness::new(Arc::new(Recorder::default()), table_5_to_12());
    let scheduler = &harness.scheduler;
    let cell = CellPos::new(6, -2);
    let entities = Bytes::from_static(b"entities");
    let poi = Bytes::from_static(b"poi");
    harness
        .disk
        .store_record(cell, DataCategory::Entity, Some(entities.clone()));
    harness
        .disk
        .store_record(cell, DataCategory::Poi, Some(poi.clone()));

    let release = harness.block_pool();
    scheduler.acquire(cell, LeaseCategory::CONSUMER, 12, 1);
    scheduler.process_updates();
    assert!(scheduler.is_in_flight(cell));

    // dropped while every load is still queued behind the blocked workers
    scheduler.release(cell, LeaseCategory::CONSUMER, 1);
    scheduler.process_updates();
    scheduler.tick();
    drop(release);
    harness.wait_for("eviction", |s| s.holder_count() == 0);

    assert_eq!(harness.disk.get(cell, DataCategory::Entity), Some(entities));
    assert_eq!(harness.disk.get(cell, DataCategory::Poi), Some(poi));
    assert_eq!(harness.disk.get(cell, DataCategory::Cell), None);
}

#[test]
fn test_unreadable_aux_record_survives_eviction() {
    let harness = Harness::new(Arc::new(Recorder::default()), table_5_to_12());
    let scheduler = &harness.scheduler;
    let cell = CellPos::new(-8, 3);
    let entities = Bytes::from_static(b"entities");
    harness
        .disk
        .store_record(cell, DataCategory::Entity, Some(entities.clone()));
    harness
        .disk
        .inject_failure(cell, DataCategory::Entity, "bad sector");

    scheduler.acquire(cell, LeaseCategory::CONSUMER, 12, 1);
    scheduler.process_updates();
    harness.wait_for("loaded", |s| s.current_stage(cell) == Some(Stage::Empty));
    assert_eq!(scheduler.aux_data(cell, DataCategory::Entity), None);

    scheduler.release(cell, LeaseCategory::CONSUMER, 1);
    scheduler.process_updates();
    scheduler.tick();
    harness.wait_for("eviction", |s| s.holder_count() == 0);

    assert_eq!(harness.disk.get(cell, DataCategory::Entity), Some(entities));
    assert_eq!(harness.disk.get(cell, DataCategory::Poi), None);
    // never generated past empty, so nothing replaces the cell record either
    assert_eq!(harness.disk.get(cell, DataCategory::Cell), None);
}
