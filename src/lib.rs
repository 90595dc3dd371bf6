//! Optimistic software transactional memory with versioned write locks.
//!
//! # Architecture
//!
//! Transactions run speculatively against per-thread logs and publish their
//! effects through a two-phase commit.
//!
//! - **Reads**: Optimistic. The first read of a var snapshots its committed
//!   value into the log; no locks are acquired on the read path.
//! - **Writes**: Buffered locally. The write set is locked only during the
//!   commit phase, in a total order over var ids, and the read set is
//!   validated again under those locks before anything is published.
//! - **Versioning**: Every writing commit draws one stamp from a global
//!   version clock; read-only transactions never touch it.
//! - **Hooks**: Logs carry before-commit and after-commit hook vectors.
//!   Before-hooks run ahead of locking and may read, write and enlist more
//!   hooks; after-hooks run once the commit is published and all locks are
//!   released.

mod clock;
mod errors;
mod transaction;
mod var;
mod wait;

pub use clock::{Version, VersionClock, INVALID_VERSION};
pub use errors::{StmError, StmResult};
pub use transaction::Transaction;
pub use var::TVar;
pub use wait::WaitHandle;

use std::any::Any;

/// The STM engine containing global state (the version clock).
pub struct Stm {
    clock: VersionClock,
}

impl Stm {
    /// Create a new STM engine instance.
    pub const fn new() -> Self {
        Self {
            clock: VersionClock::new(),
        }
    }

    /// Open a fresh top-level transaction log.
    ///
    /// Mostly useful for drivers and tests that need to interleave logs by
    /// hand; ordinary code goes through [`atomically`](Stm::atomically).
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Create a new transactional variable.
    pub fn tvar<T: Any + Send + Sync + Clone>(&self, value: T) -> TVar<T> {
        TVar::new(value)
    }

    /// The engine clock's current version, without advancing it.
    pub fn current_version(&self) -> Version {
        self.clock.current()
    }

    pub(crate) fn clock(&self) -> &VersionClock {
        &self.clock
    }

    /// Execute a closure atomically.
    ///
    /// The closure is re-run until its commit succeeds, so it must be free
    /// of side effects other than transactional reads and writes; use
    /// [`Transaction::on_after_commit`] for effects that should happen once.
    /// A body that returns [`StmError::Retry`] blocks until one of its read
    /// vars changes, then re-runs.
    ///
    /// DANGER AHEAD: don't run IO bound operations inside the closure; they
    /// may execute multiple times.
    ///
    /// # Example
    ///
    /// ```
    /// use petek::Stm;
    /// let stm = Stm::new();
    /// let var = stm.tvar(10);
    ///
    /// stm.atomically(|tx| {
    ///     let val = tx.load(&var)?;
    ///     tx.store(&var, val + 1)?;
    ///     Ok(())
    /// });
    ///
    /// assert_eq!(var.read_atomic(), 11);
    /// ```
    pub fn atomically<F, T>(&self, mut f: F) -> T
    where
        F: FnMut(&mut Transaction) -> StmResult<T>,
    {
        loop {
            let mut tx = self.begin();
            match f(&mut tx) {
                Ok(value) => match tx.commit() {
                    Ok(true) => return value,
                    // Conflict or rerun signal: a fresh log, another run.
                    Ok(false) => {}
                    Err(err) => panic!("Transaction failed with error: {:?}", err),
                },
                Err(StmError::Rerun) => {}
                Err(StmError::Retry) => {
                    tx.wait_for_change();
                }
                Err(err) => panic!("Transaction failed with error: {:?}", err),
            }
        }
    }
}

impl Default for Stm {
    fn default() -> Self {
        Self::new()
    }
}

/// Global singleton for easier usage if preferred, though explicitly
/// passing an [`Stm`] is cleaner.
pub static STM: Stm = Stm::new();

/// Convenience helper using the global STM instance.
pub fn atomically<F, T>(f: F) -> T
where
    F: FnMut(&mut Transaction) -> StmResult<T>,
{
    STM.atomically(f)
}

/// Signal that the current transaction should block until one of its read
/// vars changes. Only meaningful inside a transaction body.
pub fn retry<T>() -> StmResult<T> {
    Err(StmError::Retry)
}
