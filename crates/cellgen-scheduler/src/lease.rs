//! Leases: claims that keep a cell at or above a stage.

use cellgen_spatial::CellPos;
use serde::Serialize;
use smallvec::SmallVec;

/// Kind of lease, optionally expiring a number of ticks after it is added.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct LeaseCategory {
    pub name: &'static str,
    pub timeout: Option<u32>,
}

impl LeaseCategory {
    /// Held by a consumer for cells it wants.
    pub const CONSUMER: Self = Self::new("consumer", None);
    /// Left behind when a consumer lets go, so a quick return is cheap.
    pub const CONSUMER_DELAYED: Self = Self::new("consumer_delayed", Some(5 * 20));
    /// Keeps the old level for one tick after a removal lowers it.
    pub const TRANSIENT: Self = Self::new("transient", Some(1));
    /// Held by the host for cells that must stay loaded.
    pub const FORCED: Self = Self::new("forced", None);

    #[must_use]
    pub const fn new(name: &'static str, timeout: Option<u32>) -> Self {
        Self { name, timeout }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub category: LeaseCategory,
    pub owner: u64,
    pub level: u32,
    /// Tick at which the lease is dropped.
    pub expires_at: Option<u64>,
}

/// Leases held on one cell. Identity is `(category, owner)`.
#[derive(Clone, Debug, Default)]
pub struct LeaseSet {
    leases: SmallVec<[Lease; 4]>,
}

impl LeaseSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lease> {
        self.leases.iter()
    }

    /// Lowest (most demanding) level held.
    #[must_use]
    pub fn min_level(&self) -> Option<u32> {
        self.leases.iter().map(|l| l.level).min()
    }

    #[must_use]
    pub fn has_timed(&self) -> bool {
        self.leases.iter().any(|l| l.expires_at.is_some())
    }

    /// Insert or replace the level of `(category, owner)`.
    pub fn add(&mut self, category: LeaseCategory, owner: u64, level: u32, now: u64) {
        let expires_at = category.timeout.map(|t| now + u64::from(t));
        let lease = Lease {
            category,
            owner,
            level,
            expires_at,
        };
        match self
            .leases
            .iter_mut()
            .find(|l| l.category == category && l.owner == owner)
        {
            Some(existing) => *existing = lease,
            None => self.leases.push(lease),
        }
    }

    /// Returns the removed lease's level.
    pub fn remove(&mut self, category: LeaseCategory, owner: u64) -> Option<u32> {
        let index = self
            .leases
            .iter()
            .position(|l| l.category == category && l.owner == owner)?;
        Some(self.leases.swap_remove(index).level)
    }

    /// Drop leases whose expiry has passed. Returns whether any were dropped.
    pub fn expire(&mut self, now: u64) -> bool {
        let before = self.leases.len();
        self.leases.retain(|l| l.expires_at.is_none_or(|at| at > now));
        self.leases.len() != before
    }
}

/// A lease change queued with [`crate::CellScheduler::push_ops`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseOp {
    Add {
        cell: CellPos,
        category: LeaseCategory,
        owner: u64,
        level: u32,
    },
    Remove {
        cell: CellPos,
        category: LeaseCategory,
        owner: u64,
    },
    /// Add only if the remove actually removed something.
    AddIfRemoved {
        cell: CellPos,
        add: (LeaseCategory, u64, u32),
        remove: (LeaseCategory, u64),
    },
    /// Add then remove, with no visible intermediate level.
    AddAndRemove {
        cell: CellPos,
        add: (LeaseCategory, u64, u32),
        remove: (LeaseCategory, u64),
    },
}

impl LeaseOp {
    #[must_use]
    pub const fn cell(&self) -> CellPos {
        match *self {
            LeaseOp::Add { cell, .. }
            | LeaseOp::Remove { cell, .. }
            | LeaseOp::AddIfRemoved { cell, .. }
            | LeaseOp::AddAndRemove { cell, .. } => cell,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_replaces_level() {
        let mut set = LeaseSet::default();
        set.add(LeaseCategory::CONSUMER, 1, 9, 0);
        set.add(LeaseCategory::CONSUMER, 1, 5, 0);
        set.add(LeaseCategory::FORCED, 1, 7, 0);
        assert_eq!(set.len(), 2);
        assert_eq!(set.min_level(), Some(5));
        assert_eq!(set.remove(LeaseCategory::CONSUMER, 1), Some(5));
        assert_eq!(set.remove(LeaseCategory::CONSUMER, 1), None);
        assert_eq!(set.min_level(), Some(7));
    }

    #[test]
    fn test_timed_leases_expire() {
        let mut set = LeaseSet::default();
        set.add(LeaseCategory::CONSUMER_DELAYED, 3, 33, 10);
        set.add(LeaseCategory::CONSUMER, 4, 40, 10);
        assert!(set.has_timed());
        assert!(!set.expire(109));
        assert!(set.expire(110));
        assert_eq!(set.min_level(), Some(40));
        assert!(!set.has_timed());
    }
}
