//! Cell generation runner
//!
//! Spins up a scheduler backed by an in-memory disk and a synthetic stage
//! executor, then walks a handful of consumers across the grid at a fixed
//! tick rate until interrupted.
//!
//! Environment:
//! - `CELLGEN_CONFIG` - admission config (JSON), reloaded when it changes
//! - `CELLGEN_CONSUMERS` - number of walking consumers (default 4)
//! - `CELLGEN_TICKS` - stop after this many ticks (default: run forever)
//! - `CELLGEN_WORKERS` - worker threads (default 4)
//! - `CELLGEN_MOVE_EVERY` - ticks between consumer steps (default 40)
//! - `TARGET_TPS` - ticks per second (default 20)

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use cellgen_admission::{
    AdmissionConfig, AdmissionController, CellSink, ConfigHandle, ConfigWatcher, ConsumerView,
};
use cellgen_exec::{RadiusAwareExecutor, TaskQueue, WorkerPool};
use cellgen_scheduler::{
    AdvanceRequest, CellData, CellScheduler, SchedulerContext, StageError, StageExecutor,
    StageRegistry,
};
use cellgen_spatial::CellPos;
use cellgen_task::{MemoryDisk, TaskContext, TracingDiagnostics};
use tracing::{debug, error, info};

/// Mixes the cell and stage into the payload; enough to tell stages apart.
struct SyntheticExecutor;

impl StageExecutor for SyntheticExecutor {
    fn advance(&self, request: &AdvanceRequest) -> Result<CellData, StageError> {
        let seed = request.cell.key() ^ (request.target as u64).wrapping_mul(0x9e37_79b9);
        let mut payload = request.data.payload.to_vec();
        payload.extend_from_slice(&seed.to_le_bytes());
        Ok(CellData::new(request.target, payload))
    }
}

#[derive(Default)]
struct SinkStats {
    sent: AtomicU64,
    unsent: AtomicU64,
}

struct CountingSink(Arc<SinkStats>);

impl CellSink for CountingSink {
    fn send(&mut self, _cell: CellPos, _data: Option<CellData>) {
        self.0.sent.fetch_add(1, Ordering::Relaxed);
    }

    fn unsend(&mut self, _cell: CellPos) {
        self.0.unsent.fetch_add(1, Ordering::Relaxed);
    }
}

/// A consumer stepping along a fixed heading.
struct Walker {
    controller: AdmissionController,
    view: ConsumerView,
    heading: (i32, i32),
}

impl Walker {
    fn step(&mut self) {
        let (dx, dz) = self.heading;
        self.view.center = self.view.center.offset(dx, dz);
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cellgen_runner=info".parse()?)
                .add_directive("cellgen_admission=info".parse()?),
        )
        .init();

    let consumers: u64 = env_or("CELLGEN_CONSUMERS", 4);
    let max_ticks: u64 = env_or("CELLGEN_TICKS", u64::MAX);
    let workers: usize = env_or("CELLGEN_WORKERS", 4);
    let move_every: u64 = env_or("CELLGEN_MOVE_EVERY", 40).max(1);
    let target_tps: f32 = env_or("TARGET_TPS", 20.0);

    info!(consumers, workers, target_tps, "Starting cell generation runner");

    let config = ConfigHandle::default();
    let watcher = match std::env::var("CELLGEN_CONFIG").map(PathBuf::from) {
        Ok(path) => {
            config.set(AdmissionConfig::load(&path)?);
            ConfigWatcher::new(&path)
                .map_err(|e| error!("Failed to watch admission config: {}", e))
                .ok()
        }
        Err(_) => None,
    };
    info!("Admission config: {:?}", config.get());

    let pool = WorkerPool::new("cellgen", workers)?;
    let tasks = TaskContext {
        pool: Arc::clone(&pool),
        main: TaskQueue::new("main"),
        disk: MemoryDisk::new(Arc::clone(&pool)),
        diagnostics: Arc::new(TracingDiagnostics),
    };
    let registry = StageRegistry::uniform(Arc::new(SyntheticExecutor));
    let ctx = SchedulerContext::new(tasks, RadiusAwareExecutor::new(pool, 2), registry);
    let scheduler = CellScheduler::new(ctx);

    let stats = Arc::new(SinkStats::default());
    let started = Instant::now();
    let headings = [(1, 0), (0, 1), (-1, 0), (0, -1)];
    let mut walkers: Vec<Walker> = (0..consumers)
        .map(|id| {
            let spread = id as i32 * 48;
            let view = ConsumerView::new(CellPos::new(spread, -spread));
            let mut controller = AdmissionController::new(
                id + 1,
                Arc::clone(&scheduler),
                config.clone(),
                Box::new(CountingSink(Arc::clone(&stats))),
            );
            controller.add(&view, 0);
            Walker {
                controller,
                view,
                heading: headings[id as usize % headings.len()],
            }
        })
        .collect();

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_clone.store(false, Ordering::SeqCst);
    })?;

    let target_delta = Duration::from_secs_f32(1.0 / target_tps);
    let mut tick: u64 = 0;

    while running.load(Ordering::SeqCst) && tick < max_ticks {
        let start = Instant::now();
        tick += 1;
        let now = started.elapsed().as_nanos() as u64;

        if let Some(watcher) = &watcher {
            if watcher.poll_reload(&config) {
                info!("Admission config reloaded: {:?}", config.get());
            }
        }

        scheduler.tick();
        for walker in &mut walkers {
            if tick % move_every == 0 {
                walker.step();
            }
            walker.controller.update(&walker.view);
            walker.controller.update_queues(now);
        }
        scheduler.run_main(1024);

        if tick % 100 == 0 {
            report(tick, &scheduler, &walkers, &stats)?;
        }

        let elapsed = start.elapsed();
        if elapsed < target_delta {
            thread::sleep(target_delta - elapsed);
        }
    }

    info!("Shutting down after {} ticks", tick);
    for walker in &mut walkers {
        walker.controller.remove();
    }
    scheduler.tick();
    report(tick, &scheduler, &walkers, &stats)?;
    debug!("Final holders: {}", scheduler.debug_json()?);

    Ok(())
}

fn report(
    tick: u64,
    scheduler: &CellScheduler,
    walkers: &[Walker],
    stats: &SinkStats,
) -> eyre::Result<()> {
    info!(
        tick,
        holders = scheduler.holder_count(),
        sent = stats.sent.load(Ordering::Relaxed),
        unsent = stats.unsent.load(Ordering::Relaxed),
        "progress"
    );
    for walker in walkers {
        let queues = serde_json::to_string(&walker.controller.queue_lens())?;
        debug!(
            owner = walker.controller.owner(),
            center = %walker.view.center,
            sent = walker.controller.sent_count(),
            queues = %queues,
            "consumer"
        );
    }
    Ok(())
}
