//! Processing stages and the lease level table.

use cellgen_spatial::WriteRadius;
use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

/// Ordered pipeline a cell passes through.
///
/// Stages up to [`Stage::Full`] are produced by progression tasks and never
/// regress. The two ticking stages are activation levels derived from leases
/// on a full cell.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[repr(u8)]
pub enum Stage {
    #[default]
    Empty = 0,
    StructureStarts,
    StructureReferences,
    Biomes,
    Noise,
    Surface,
    Carvers,
    Features,
    InitializeLight,
    Light,
    Spawn,
    Full,
    BlockTicking,
    EntityTicking,
}

impl Stage {
    pub const ALL: [Stage; 14] = [
        Stage::Empty,
        Stage::StructureStarts,
        Stage::StructureReferences,
        Stage::Biomes,
        Stage::Noise,
        Stage::Surface,
        Stage::Carvers,
        Stage::Features,
        Stage::InitializeLight,
        Stage::Light,
        Stage::Spawn,
        Stage::Full,
        Stage::BlockTicking,
        Stage::EntityTicking,
    ];

    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        if (raw as usize) < Self::ALL.len() {
            Some(Self::ALL[raw as usize])
        } else {
            None
        }
    }

    /// The stage after this one, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        Self::from_u8(self as u8 + 1)
    }

    /// The stage before this one, if any.
    #[must_use]
    pub const fn previous(self) -> Option<Self> {
        match self {
            Stage::Empty => None,
            _ => Self::from_u8(self as u8 - 1),
        }
    }

    /// Reached by running a task rather than derived from leases.
    #[must_use]
    pub const fn is_generation(self) -> bool {
        (self as u8) <= (Stage::Full as u8)
    }

    #[must_use]
    pub const fn is_activation(self) -> bool {
        !self.is_generation()
    }

    /// Default square radius a transition into this stage may write.
    #[must_use]
    pub const fn write_radius(self) -> WriteRadius {
        match self {
            Stage::Features => WriteRadius::Bounded(1),
            Stage::Light => WriteRadius::Bounded(2),
            _ => WriteRadius::Bounded(0),
        }
    }

    /// Whether transitions into this stage may run without an area lock.
    #[must_use]
    pub const fn parallel_capable(self) -> bool {
        matches!(
            self,
            Stage::StructureStarts
                | Stage::StructureReferences
                | Stage::Biomes
                | Stage::Noise
                | Stage::Surface
                | Stage::Carvers
                | Stage::InitializeLight
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Stage::Empty => "empty",
            Stage::StructureStarts => "structure_starts",
            Stage::StructureReferences => "structure_references",
            Stage::Biomes => "biomes",
            Stage::Noise => "noise",
            Stage::Surface => "surface",
            Stage::Carvers => "carvers",
            Stage::Features => "features",
            Stage::InitializeLight => "initialize_light",
            Stage::Light => "light",
            Stage::Spawn => "spawn",
            Stage::Full => "full",
            Stage::BlockTicking => "block_ticking",
            Stage::EntityTicking => "entity_ticking",
        }
    }
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

pub const ENTITY_TICKING_LEVEL: u32 = 31;
pub const BLOCK_TICKING_LEVEL: u32 = 32;
pub const FULL_LEVEL: u32 = 33;
/// Highest level that still wants the cell loaded.
pub const MAX_LEVEL: u32 = 44;

/// Monotone map from lease level to the stage it demands.
///
/// Lower levels demand higher stages. Levels above the last threshold demand
/// nothing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelTable {
    /// `(max_level, stage)` with `max_level` rising and `stage` falling.
    thresholds: Vec<(u32, Stage)>,
}

impl LevelTable {
    /// Build a table from `(max_level, stage)` thresholds.
    ///
    /// # Errors
    ///
    /// If the thresholds are empty, or levels do not strictly rise while
    /// stages strictly fall.
    pub fn new(thresholds: impl IntoIterator<Item = (u32, Stage)>) -> SchedulerResult<Self> {
        let thresholds: Vec<_> = thresholds.into_iter().collect();
        if thresholds.is_empty() {
            return Err(SchedulerError::EmptyLevelTable);
        }
        for pair in thresholds.windows(2) {
            let ((prev_level, prev_stage), (level, stage)) = (pair[0], pair[1]);
            if level <= prev_level || stage >= prev_stage {
                return Err(SchedulerError::NonMonotoneLevels { level, stage });
            }
        }
        Ok(Self { thresholds })
    }

    #[must_use]
    pub fn stage_for(&self, level: u32) -> Option<Stage> {
        self.thresholds
            .iter()
            .find(|(max, _)| level <= *max)
            .map(|&(_, stage)| stage)
    }

    /// Highest level whose stage is at least `stage`.
    #[must_use]
    pub fn level_for(&self, stage: Stage) -> Option<u32> {
        self.thresholds
            .iter()
            .take_while(|(_, s)| *s >= stage)
            .last()
            .map(|&(max, _)| max)
    }

    #[must_use]
    pub fn max_level(&self) -> u32 {
        self.thresholds.last().map_or(0, |&(max, _)| max)
    }
}

impl Default for LevelTable {
    fn default() -> Self {
        let mut thresholds = vec![
            (ENTITY_TICKING_LEVEL, Stage::EntityTicking),
            (BLOCK_TICKING_LEVEL, Stage::BlockTicking),
            (FULL_LEVEL, Stage::Full),
        ];
        let below_full = Stage::ALL[..Stage::Full as usize].iter().rev();
        thresholds.extend((FULL_LEVEL + 1..).zip(below_full.copied()));
        Self { thresholds }
    }
}
