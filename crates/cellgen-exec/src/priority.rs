//! Task priorities.

/// Scheduling priority. Lower discriminant runs first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Priority {
    /// Something is spinning on this result.
    Completing = 0,
    /// The main thread is blocked on this result.
    Blocking = 1,
    Highest = 2,
    Higher = 3,
    High = 4,
    #[default]
    Normal = 5,
    Low = 6,
    Lower = 7,
    Lowest = 8,
    Idle = 9,
}

impl Priority {
    pub const ALL: [Priority; 10] = [
        Priority::Completing,
        Priority::Blocking,
        Priority::Highest,
        Priority::Higher,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Lower,
        Priority::Lowest,
        Priority::Idle,
    ];

    /// Whether `self` runs before `other`.
    #[must_use]
    pub const fn is_higher_than(self, other: Self) -> bool {
        (self as u8) < (other as u8)
    }

    /// Whether `self` runs after `other`.
    #[must_use]
    pub const fn is_lower_than(self, other: Self) -> bool {
        (self as u8) > (other as u8)
    }

    /// The more urgent of the two.
    #[must_use]
    pub const fn max_priority(self, other: Self) -> Self {
        if self.is_higher_than(other) { self } else { other }
    }

    /// The less urgent of the two.
    #[must_use]
    pub const fn min_priority(self, other: Self) -> Self {
        if self.is_lower_than(other) { self } else { other }
    }

    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        if (raw as usize) < Self::ALL.len() {
            Some(Self::ALL[raw as usize])
        } else {
            None
        }
    }
}
