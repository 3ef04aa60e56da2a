//! Exclusive locks over square ranges of cells.
//!
//! The grid is divided into sections (`cell >> shift`). Locking a cell with a
//! radius takes every section overlapping the square `center ± radius`, so two
//! requests conflict exactly when their squares share a section. An unbounded
//! request takes the whole grid and conflicts with everything.
//!
//! Two ownership modes exist:
//!
//! - **thread-owned** ([`AreaLock::lock`], [`AreaLock::try_lock`]): reentrant
//!   for the acquiring thread, used around holder mutations where a callback
//!   may re-enter the same cell on the same stack.
//! - **detached** ([`AreaLock::try_lock_detached`]): never reentrant, the guard
//!   may be dropped on any thread. Used to hand a locked range to a worker.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::CellPos;

/// Square radius of cells a transition may write to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WriteRadius {
    /// Writes only within `center ± r`.
    Bounded(u32),
    /// May write anywhere; fully serialized.
    Unbounded,
}

impl WriteRadius {
    /// Negative values mean unbounded.
    #[must_use]
    pub const fn from_signed(radius: i32) -> Self {
        if radius < 0 {
            Self::Unbounded
        } else {
            Self::Bounded(radius as u32)
        }
    }

    #[must_use]
    pub const fn is_unbounded(self) -> bool {
        matches!(self, Self::Unbounded)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Owner {
    Thread(ThreadId),
    Detached,
}

impl Owner {
    /// Whether a range already held by `self` may be entered again by `other`.
    fn admits(self, other: Owner) -> bool {
        matches!((self, other), (Owner::Thread(a), Owner::Thread(b)) if a == b)
    }
}

#[derive(Debug)]
struct Hold {
    owner: Owner,
    count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Region {
    Global,
    /// Inclusive section bounds.
    Sections { min: CellPos, max: CellPos },
}

impl Region {
    fn keys(self) -> SmallVec<[u64; 16]> {
        match self {
            Region::Global => SmallVec::new(),
            Region::Sections { min, max } => {
                let mut keys = SmallVec::new();
                for z in min.z..=max.z {
                    for x in min.x..=max.x {
                        keys.push(CellPos::new(x, z).key());
                    }
                }
                keys
            }
        }
    }
}

#[derive(Default)]
struct LockState {
    sections: HashMap<u64, Hold>,
    global: Option<Hold>,
}

impl LockState {
    fn can_acquire(&self, region: Region, owner: Owner) -> bool {
        if let Some(global) = &self.global {
            if !global.owner.admits(owner) {
                return false;
            }
        }
        match region {
            Region::Global => self.sections.values().all(|hold| hold.owner.admits(owner)),
            Region::Sections { .. } => region.keys().iter().all(|key| {
                self.sections
                    .get(key)
                    .is_none_or(|hold| hold.owner.admits(owner))
            }),
        }
    }

    fn acquire(&mut self, region: Region, owner: Owner) {
        match region {
            Region::Global => match &mut self.global {
                Some(hold) => hold.count += 1,
                None => self.global = Some(Hold { owner, count: 1 }),
            },
            Region::Sections { .. } => {
                for key in region.keys() {
                    self.sections
                        .entry(key)
                        .and_modify(|hold| hold.count += 1)
                        .or_insert(Hold { owner, count: 1 });
                }
            }
        }
    }

    fn release(&mut self, region: Region) {
        match region {
            Region::Global => {
                if let Some(hold) = &mut self.global {
                    hold.count -= 1;
                    if hold.count == 0 {
                        self.global = None;
                    }
                }
            }
            Region::Sections { .. } => {
                for key in region.keys() {
                    if let Some(hold) = self.sections.get_mut(&key) {
                        hold.count -= 1;
                        if hold.count == 0 {
                            self.sections.remove(&key);
                        }
                    }
                }
            }
        }
    }
}

/// Mutual exclusion keyed by square coordinate ranges.
pub struct AreaLock {
    shift: u32,
    state: Mutex<LockState>,
    released: Condvar,
}

impl AreaLock {
    /// Create a lock whose sections are `2^shift` cells wide.
    #[must_use]
    pub fn new(shift: u32) -> Arc<Self> {
        Arc::new(Self {
            shift,
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
        })
    }

    #[must_use]
    pub fn shift(&self) -> u32 {
        self.shift
    }

    fn region(&self, center: CellPos, radius: WriteRadius) -> Region {
        match radius {
            WriteRadius::Unbounded => Region::Global,
            WriteRadius::Bounded(r) => {
                let r = i32::try_from(r).unwrap_or(i32::MAX);
                Region::Sections {
                    min: center.saturating_offset(-r, -r).section(self.shift),
                    max: center.saturating_offset(r, r).section(self.shift),
                }
            }
        }
    }

    /// Block until the range is free (or held by this thread), then take it.
    pub fn lock(self: &Arc<Self>, center: CellPos, radius: WriteRadius) -> AreaGuard {
        let region = self.region(center, radius);
        let owner = Owner::Thread(thread::current().id());
        let mut state = self.state.lock();
        while !state.can_acquire(region, owner) {
            self.released.wait(&mut state);
        }
        state.acquire(region, owner);
        drop(state);
        AreaGuard {
            lock: Arc::clone(self),
            region,
        }
    }

    /// Take the range for this thread if nobody else holds any part of it.
    pub fn try_lock(self: &Arc<Self>, center: CellPos, radius: WriteRadius) -> Option<AreaGuard> {
        self.try_acquire(center, radius, Owner::Thread(thread::current().id()))
    }

    /// Take the range without thread ownership; fails if any part is held,
    /// including by the calling thread.
    pub fn try_lock_detached(
        self: &Arc<Self>,
        center: CellPos,
        radius: WriteRadius,
    ) -> Option<AreaGuard> {
        self.try_acquire(center, radius, Owner::Detached)
    }

    fn try_acquire(
        self: &Arc<Self>,
        center: CellPos,
        radius: WriteRadius,
        owner: Owner,
    ) -> Option<AreaGuard> {
        let region = self.region(center, radius);
        let mut state = self.state.lock();
        if !state.can_acquire(region, owner) {
            return None;
        }
        state.acquire(region, owner);
        Some(AreaGuard {
            lock: Arc::clone(self),
            region,
        })
    }

    /// Whether any lock currently covers `cell`.
    #[must_use]
    pub fn is_locked(&self, cell: CellPos) -> bool {
        let state = self.state.lock();
        state.global.is_some() || state.sections.contains_key(&cell.section(self.shift).key())
    }

    /// Whether the calling thread holds the section containing `cell`.
    #[must_use]
    pub fn is_held_by_current_thread(&self, cell: CellPos) -> bool {
        let me = Owner::Thread(thread::current().id());
        let state = self.state.lock();
        let held = |hold: &Hold| hold.owner == me;
        state.global.as_ref().is_some_and(held)
            || state.sections.get(&cell.section(self.shift).key()).is_some_and(held)
    }

    /// Whether the calling thread holds any part of this lock.
    #[must_use]
    pub fn current_thread_holds_any(&self) -> bool {
        let me = Owner::Thread(thread::current().id());
        let state = self.state.lock();
        state.global.as_ref().is_some_and(|hold| hold.owner == me)
            || state.sections.values().any(|hold| hold.owner == me)
    }

    /// Number of sections currently held.
    #[must_use]
    pub fn held_sections(&self) -> usize {
        self.state.lock().sections.len()
    }
}

impl core::fmt::Debug for AreaLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AreaLock")
            .field("shift", &self.shift)
            .field("sections", &state.sections.len())
            .field("global", &state.global.is_some())
            .finish()
    }
}

/// Releases its range when dropped.
#[must_use = "the range is released as soon as the guard is dropped"]
pub struct AreaGuard {
    lock: Arc<AreaLock>,
    region: Region,
}

impl Drop for AreaGuard {
    fn drop(&mut self) {
        self.lock.state.lock().release(self.region);
        self.lock.released.notify_all();
    }
}

impl core::fmt::Debug for AreaGuard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AreaGuard").field("region", &self.region).finish()
    }
}
