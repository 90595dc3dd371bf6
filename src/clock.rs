use std::sync::atomic::{AtomicU64, Ordering};

/// A commit-version stamp. Monotonically non-decreasing over the process
/// lifetime; `INVALID_VERSION` is reserved and never produced by a clock.
pub type Version = u64;

/// Reserved sentinel version. `VersionClock::tick` skips it on wrap-around.
pub const INVALID_VERSION: Version = u64::MAX;

/// The global version clock.
///
/// Every committing transaction with a non-empty write set draws exactly one
/// fresh version from this clock and stamps it on the vars it mutates.
/// Read-only transactions never touch it, which keeps them free of any
/// shared-memory contention.
pub struct VersionClock {
    clock: AtomicU64,
}

impl VersionClock {
    pub const fn new() -> Self {
        Self {
            clock: AtomicU64::new(0),
        }
    }

    /// Atomically advance the clock and return the new version.
    ///
    /// Never returns `INVALID_VERSION`; if a wrap lands on the sentinel the
    /// clock is advanced once more.
    pub fn tick(&self) -> Version {
        let mut version = self.clock.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        if version == INVALID_VERSION {
            version = self.clock.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        }
        version
    }

    /// Read the current version without advancing the clock.
    ///
    /// Any `tick` that happened-before this call is observed.
    pub fn current(&self) -> Version {
        self.clock.load(Ordering::Acquire)
    }
}

impl Default for VersionClock {
    fn default() -> Self {
        Self::new()
    }
}

static NEXT_VAR_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh var id. Ids are unique and strictly increasing, so the
/// ascending-id iteration of a write set is a total lock-acquisition order
/// shared by every thread.
pub(crate) fn next_var_id() -> u64 {
    NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed)
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Allocate a nonzero owner token for a transaction log. Zero marks an
/// unlocked var, so tokens start at one.
pub(crate) fn next_token() -> u64 {
    NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
}
