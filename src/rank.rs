//! Lock ranks for deadlock-avoidance checking.

use core::fmt;

/// A monitor's position in the global lock order.
///
/// A thread must acquire monitors in strictly decreasing rank: while holding
/// a monitor of rank `r`, it may only acquire monitors of rank `< r`. Debug
/// builds check this on every acquisition and panic on a violation, since it
/// means two threads can deadlock. [`Rank::NATIVE`] and
/// [`Rank::SUSPEND_RESUME`] are exempt.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rank(u32);

impl Rank {
    /// Lowest rank; for locks taken inside park/unpark-level code.
    pub const EVENT: Self = Self(0);
    /// Locks that may be held while in states where safepoints can't be
    /// honored. Waiting while holding one of these is an error.
    pub const SPECIAL: Self = Self(Self::EVENT.0 + 32);
    /// Suspend/resume bookkeeping; exempt from order checks.
    pub const SUSPEND_RESUME: Self = Self(Self::SPECIAL.0 + 1);
    /// Leaf locks: nothing else is acquired while one is held.
    pub const LEAF: Self = Self(Self::SUSPEND_RESUME.0 + 2);
    /// The safepoint lock.
    pub const SAFEPOINT: Self = Self(Self::LEAF.0 + 10);
    /// Barrier locks.
    pub const BARRIER: Self = Self(Self::SAFEPOINT.0 + 1);
    /// The first general-purpose rank.
    pub const NONLEAF: Self = Self(Self::BARRIER.0 + 1);
    /// The last general-purpose rank.
    pub const MAX_NONLEAF: Self = Self(Self::NONLEAF.0 + 900);
    /// Monitors used by foreign code; exempt from order checks.
    pub const NATIVE: Self = Self(Self::MAX_NONLEAF.0 + 1);

    /// A rank with an explicit value.
    pub const fn new(rank: u32) -> Self {
        Self(rank)
    }

    /// The numeric value of this rank.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Whether acquisitions of a monitor of this rank skip order checks.
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    pub(crate) fn is_exempt(self) -> bool {
        self == Self::NATIVE || self == Self::SUSPEND_RESUME
    }
}

impl fmt::Debug for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::EVENT => "event",
            Self::SPECIAL => "special",
            Self::SUSPEND_RESUME => "suspend_resume",
            Self::LEAF => "leaf",
            Self::SAFEPOINT => "safepoint",
            Self::BARRIER => "barrier",
            Self::NONLEAF => "nonleaf",
            Self::MAX_NONLEAF => "max_nonleaf",
            Self::NATIVE => "native",
            _ => return write!(f, "Rank({})", self.0),
        };
        f.write_str(name)
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
