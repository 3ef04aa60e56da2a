use std::sync::Arc;
use std::time::{Duration, Instant};

use cellgen_admission::{
    AdmissionConfig, AdmissionController, CellSink, ConfigHandle, ConsumerStage, ConsumerView,
    NANOS_PER_SECOND, ViewDistances,
};
use cellgen_exec::{RadiusAwareExecutor, TaskQueue, WorkerPool};
use cellgen_scheduler::{
    AdvanceRequest, CellData, CellScheduler, SchedulerContext, Stage, StageError, StageExecutor,
    StageRegistry,
};
use cellgen_spatial::CellPos;
use cellgen_task::{MemoryDisk, RecordingDiagnostics, TaskContext};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

const TICK: u64 = NANOS_PER_SECOND / 20;

/// Finishes every stage at once.
struct Synthetic;

impl StageExecutor for Synthetic {
    fn advance(&self, request: &AdvanceRequest) -> Result<CellData, StageError> {
        Ok(CellData::new(request.target, vec![request.target as u8]))
    }
}

/// Like [`Synthetic`], but one cell never gets past its noise.
struct BrokenNoise(CellPos);

impl StageExecutor for BrokenNoise {
    fn advance(&self, request: &AdvanceRequest) -> Result<CellData, StageError> {
        if request.cell == self.0 && request.target == Stage::Noise {
            return Err(StageError::Failed("noise corrupted".into()));
        }
        Synthetic.advance(request)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum SinkEvent {
    Sent(CellPos, bool),
    Unsent(CellPos),
}

#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<Vec<SinkEvent>>>);

impl RecordingSink {
    fn events(&self) -> Vec<SinkEvent> {
        self.0.lock().clone()
    }

    fn sent(&self) -> Vec<CellPos> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Sent(cell, _) => Some(cell),
                SinkEvent::Unsent(_) => None,
            })
            .collect()
    }
}

impl CellSink for RecordingSink {
    fn send(&mut self, cell: CellPos, data: Option<CellData>) {
        self.0.lock().push(SinkEvent::Sent(cell, data.is_some()));
    }

    fn unsend(&mut self, cell: CellPos) {
        self.0.lock().push(SinkEvent::Unsent(cell));
    }
}

struct Harness {
    scheduler: Arc<CellScheduler>,
    config: ConfigHandle,
    sink: RecordingSink,
    controller: AdmissionController,
    now: u64,
}

impl Harness {
    fn new(config: AdmissionConfig) -> Self {
        Self::with_executor(config, Arc::new(Synthetic))
    }

    fn with_executor(config: AdmissionConfig, executor: Arc<dyn StageExecutor>) -> Self {
        let pool = WorkerPool::new("admission-test", 4).unwrap();
        let tasks = TaskContext {
            pool: Arc::clone(&pool),
            main: TaskQueue::new("main"),
            disk: MemoryDisk::new(Arc::clone(&pool)),
            diagnostics: Arc::new(RecordingDiagnostics::new()),
        };
        let radius = RadiusAwareExecutor::new(pool, 2);
        let registry = StageRegistry::uniform(executor);
        let scheduler = CellScheduler::new(SchedulerContext::new(tasks, radius, registry));

        let config = ConfigHandle::new(config);
        let sink = RecordingSink::default();
        let controller = AdmissionController::new(
            1,
            Arc::clone(&scheduler),
            config.clone(),
            Box::new(sink.clone()),
        );
        Self {
            scheduler,
            config,
            sink,
            controller,
            now: 0,
        }
    }

    /// Run main-thread work until no holder has a task in flight.
    fn settle(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let ran = self.scheduler.run_main(64);
            let idle = self.scheduler.snapshot().iter().all(|h| h.in_flight.is_none());
            if ran == 0 && idle {
                return;
            }
            assert!(Instant::now() < deadline, "scheduler never settled");
            if ran == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// One 50ms server tick.
    fn step(&mut self) {
        self.now += TICK;
        self.scheduler.tick();
        self.settle();
        self.controller.update_queues(self.now);
        self.settle();
    }

    fn step_until(&mut self, what: &str, mut done: impl FnMut(&AdmissionController) -> bool) {
        for _ in 0..400 {
            if done(&self.controller) {
                return;
            }
            self.step();
        }
        panic!("never reached {what}");
    }
}

fn view(tick: i32, load: i32) -> ConsumerView {
    ConsumerView::new(CellPos::ORIGIN).with_distances(ViewDistances::new(tick, load, -1))
}

#[test]
fn test_loads_admitted_nearest_first() {
    let mut harness = Harness::new(AdmissionConfig::default());
    harness.controller.add(&view(1, 3), 0);
    harness.now = TICK;
    harness.controller.update_queues(TICK);

    let loading: Vec<CellPos> = harness
        .controller
        .tracked()
        .filter(|&(_, stage)| stage == ConsumerStage::Loading)
        .map(|(cell, _)| cell)
        .collect();
    // derived concurrency for load radius 3 is 49 / 5
    assert_eq!(loading.len(), 9);

    let farthest = loading
        .iter()
        .map(|c| c.manhattan(CellPos::ORIGIN))
        .max()
        .unwrap();
    let nearest_waiting = CellPos::ORIGIN
        .square(4)
        .filter(|&c| harness.controller.stage_of(c) == ConsumerStage::None)
        .map(|c| c.manhattan(CellPos::ORIGIN))
        .min()
        .unwrap();
    assert!(farthest <= nearest_waiting);
    assert_eq!(harness.controller.queue_lens().loading, 9);
}

#[test]
fn test_generation_rate_is_respected() {
    let config = AdmissionConfig {
        max_generate_rate: 2.0,
        max_concurrent_generations: 5,
        ..AdmissionConfig::default()
    };
    let mut harness = Harness::new(config);
    harness.controller.add(&view(2, 4), 0);

    for _ in 0..20 {
        harness.step();
    }
    let generating = harness
        .controller
        .tracked()
        .filter(|&(_, stage)| {
            matches!(
                stage,
                ConsumerStage::Generating | ConsumerStage::Generated | ConsumerStage::Tick
            )
        })
        .count();
    assert!((1..=2).contains(&generating), "{generating} generations in one second");
}

#[test]
fn test_center_is_ticked_and_sent_once() {
    let mut harness = Harness::new(AdmissionConfig::default());
    let center = CellPos::ORIGIN;
    harness.controller.add(&view(1, 3), 0);

    for _ in 0..400 {
        if harness.controller.is_sent(center)
            && harness.controller.stage_of(center) == ConsumerStage::Tick
        {
            break;
        }
        harness.step();
        for cell in center.square(4) {
            assert!(harness.controller.queue_count(cell) <= 1, "{cell} queued twice");
        }
    }

    assert_eq!(harness.controller.stage_of(center), ConsumerStage::Tick);
    assert_eq!(
        harness.scheduler.current_stage(center),
        Some(Stage::EntityTicking)
    );

    let sent = harness.sink.sent();
    assert_eq!(sent.iter().filter(|&&c| c == center).count(), 1);
    let mut unique = sent.clone();
    unique.sort_by_key(|c| c.key());
    unique.dedup();
    assert_eq!(unique.len(), sent.len());
    assert!(
        harness
            .sink
            .events()
            .iter()
            .all(|e| !matches!(e, SinkEvent::Sent(_, false)))
    );
}

#[test]
fn test_unchanged_view_is_ignored() {
    let mut harness = Harness::new(AdmissionConfig::default());
    harness.controller.add(&view(1, 3), 0);
    assert!(!harness.controller.update(&view(1, 3)));
    assert!(harness.controller.update(&view(1, 2)));

    // a world default change re-resolves unset radii
    let unset = ConsumerView::new(CellPos::ORIGIN);
    assert!(harness.controller.update(&unset));
    harness
        .config
        .update(|c| c.world = ViewDistances::new(4, 6, -1));
    assert!(harness.controller.update(&unset));
    assert_eq!(harness.controller.distances().map(|d| d.load), Some(6));
}

#[test]
fn test_moving_away_unsends_and_forgets() {
    let mut harness = Harness::new(AdmissionConfig::default());
    harness.controller.add(&view(1, 3), 0);
    harness.step_until("first send", |c| c.sent_count() > 0);
    let sent = harness.sink.sent();

    let far = CellPos::new(40, 0);
    let moved = ConsumerView::new(far).with_distances(ViewDistances::new(1, 3, -1));
    assert!(harness.controller.update(&moved));

    assert_eq!(harness.controller.sent_count(), 0);
    let events = harness.sink.events();
    for cell in sent {
        assert!(events.contains(&SinkEvent::Unsent(cell)), "{cell} never unsent");
    }
    assert!(
        CellPos::ORIGIN
            .square(4)
            .all(|c| harness.controller.stage_of(c) == ConsumerStage::None)
    );
    assert!(harness.controller.queue_lens().load > 0);
}

#[test]
fn test_remove_releases_everything() {
    let mut harness = Harness::new(AdmissionConfig::default());
    harness.controller.add(&view(1, 3), 0);
    harness.step_until("center ticking", |c| {
        c.stage_of(CellPos::ORIGIN) == ConsumerStage::Tick
    });
    assert!(harness.scheduler.holder_count() > 0);

    harness.controller.remove();
    assert!(harness.controller.is_removed());
    assert_eq!(harness.controller.sent_count(), 0);
    assert_eq!(harness.controller.tracked().count(), 0);

    // delayed leases hold the cells for a while, then they go
    harness.scheduler.tick();
    harness.settle();
    assert!(harness.scheduler.holder_count() > 0);
    for _ in 0..110 {
        harness.scheduler.tick();
        harness.settle();
    }
    assert_eq!(harness.scheduler.holder_count(), 0);
}

#[test]
fn test_failed_cell_does_not_stall_the_queues() {
    let broken = CellPos::new(6, 6);
    let mut harness =
        Harness::with_executor(AdmissionConfig::default(), Arc::new(BrokenNoise(broken)));
    let center = CellPos::ORIGIN;
    harness.controller.add(&view(1, 6), 0);

    harness.step_until("queues drained", |c| {
        let lens = c.queue_lens();
        lens.load + lens.loading + lens.generate + lens.generating + lens.tick + lens.send == 0
    });

    assert!(harness.scheduler.failure(broken).is_some());
    assert!(harness.controller.is_parked(broken));
    assert!(harness.controller.parked_count() > 0);
    assert_eq!(harness.controller.stage_of(center), ConsumerStage::Tick);
    assert!(harness.controller.is_sent(center));
    assert!(harness.controller.is_sent(CellPos::new(-5, -5)));

    // every cell either finished or was parked with its failure
    for cell in center.square(7) {
        let failed = harness.scheduler.failure(cell).is_some();
        let generated = matches!(
            harness.controller.stage_of(cell),
            ConsumerStage::Generated | ConsumerStage::Tick
        );
        assert!(failed != generated, "{cell} neither generated nor parked");
        assert_eq!(failed, harness.controller.is_parked(cell), "{cell}");
    }
    assert!(!harness.controller.is_sent(broken));
}

#[test]
fn test_leaving_tick_radius_downgrades_after_a_delay() {
    let mut harness = Harness::new(AdmissionConfig::default());
    let old_center = CellPos::ORIGIN;
    harness.controller.add(&view(1, 3), 0);
    harness.step_until("center ticking", |c| c.stage_of(old_center) == ConsumerStage::Tick);
    assert_eq!(
        harness.scheduler.target_stage(old_center),
        Some(Stage::EntityTicking)
    );

    let moved = ConsumerView::new(CellPos::new(2, 0)).with_distances(ViewDistances::new(1, 3, -1));
    assert!(harness.controller.update(&moved));
    assert_eq!(harness.controller.stage_of(old_center), ConsumerStage::Generated);

    // the delayed lease keeps it ticking for a while
    for _ in 0..50 {
        harness.step();
        assert_eq!(
            harness.scheduler.target_stage(old_center),
            Some(Stage::EntityTicking)
        );
    }
    for _ in 0..70 {
        harness.step();
    }
    assert_eq!(harness.scheduler.target_stage(old_center), Some(Stage::Full));
    assert_eq!(harness.scheduler.current_stage(old_center), Some(Stage::Full));
    assert_eq!(harness.controller.stage_of(old_center), ConsumerStage::Generated);
}
