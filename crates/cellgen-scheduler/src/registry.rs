//! Stage executors and their registry.

use std::sync::Arc;

use cellgen_spatial::{CellPos, WriteRadius};
use hashbrown::HashMap;

use crate::{CellData, Stage, StageError};

/// State of a cell near the one being advanced, captured when the
/// transition starts running.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Neighbor {
    pub cell: CellPos,
    pub stage: Option<Stage>,
    pub data: Option<CellData>,
}

/// Everything a [`StageExecutor`] sees.
#[derive(Clone, Debug)]
pub struct AdvanceRequest {
    pub cell: CellPos,
    pub target: Stage,
    /// The cell's data at the stage just below `target`.
    pub data: CellData,
    /// Other cells within the write radius, nearest first.
    pub neighbors: Vec<Neighbor>,
}

/// Produces a cell's data for one stage.
///
/// Called on the executor chosen for the stage: the worker pool when
/// parallel-capable, the radius-aware executor otherwise, the main queue for
/// [`Stage::Full`].
pub trait StageExecutor: Send + Sync {
    /// # Errors
    ///
    /// Any failure; the cell is marked failed and reported.
    fn advance(&self, request: &AdvanceRequest) -> Result<CellData, StageError>;

    fn parallel_capable(&self, stage: Stage) -> bool {
        stage.parallel_capable()
    }

    fn write_radius(&self, stage: Stage) -> WriteRadius {
        stage.write_radius()
    }
}

/// Read access to cells around a transition.
pub trait NeighborView: Send + Sync {
    fn neighbors(&self, center: CellPos, radius: u32) -> Vec<Neighbor>;
}

/// Executors keyed by the stage they produce.
#[derive(Default, Clone)]
pub struct StageRegistry {
    executors: HashMap<Stage, Arc<dyn StageExecutor>>,
}

impl StageRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one executor for every generation stage after `Empty`.
    #[must_use]
    pub fn uniform(executor: Arc<dyn StageExecutor>) -> Self {
        let mut registry = Self::new();
        for stage in Stage::ALL {
            if stage.is_generation() && stage != Stage::Empty {
                registry.register(stage, Arc::clone(&executor));
            }
        }
        registry
    }

    pub fn register(&mut self, stage: Stage, executor: Arc<dyn StageExecutor>) -> &mut Self {
        self.executors.insert(stage, executor);
        self
    }

    /// # Errors
    ///
    /// [`StageError::NoExecutor`] if nothing produces `stage`.
    pub fn get(&self, stage: Stage) -> Result<&Arc<dyn StageExecutor>, StageError> {
        self.executors
            .get(&stage)
            .ok_or(StageError::NoExecutor(stage))
    }
}

impl core::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut stages: Vec<_> = self.executors.keys().copied().collect();
        stages.sort_unstable();
        f.debug_struct("StageRegistry").field("stages", &stages).finish()
    }
}
