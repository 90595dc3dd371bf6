use crate::clock::next_token;
use crate::errors::{StmError, StmResult};
use crate::var::{same_value, DynValue, TVar, VarCore};
use crate::wait::WaitHandle;
use crate::Stm;
use foldhash::fast::FixedState;
use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::Arc;
use tracing::trace;

/// Read set: var id -> first-read snapshot. Hashed by id, iteration order
/// irrelevant.
type ReadMap = HashMap<u64, ReadEntry, FixedState>;

/// Write set: var id -> pending value. A BTreeMap so the commit engine
/// locks in ascending-id order, the total order shared by every thread.
type WriteMap = BTreeMap<u64, WriteEntry>;

#[derive(Clone)]
struct ReadEntry {
    core: Arc<VarCore>,
    /// The value observed on first read; repeatable within the transaction.
    seen: DynValue,
}

#[derive(Clone)]
struct WriteEntry {
    core: Arc<VarCore>,
    pending: DynValue,
}

type BeforeHook<'stm> = Box<dyn FnOnce(&mut Transaction<'stm>) -> StmResult<()> + Send + 'stm>;
type AfterHook<'stm> = Box<dyn FnOnce(&mut Transaction<'stm>) + Send + 'stm>;

/// A transaction log: the per-transaction record of reads, writes and
/// commit hooks.
///
/// Owned by the thread that created it for its whole lifetime, so none of
/// its internals are synchronized. A log is consumed by exactly one call to
/// [`commit`](Transaction::commit) (top-level) or
/// [`commit_nested`](Transaction::commit_nested) (nested); taking `self` by
/// value is what rules a second attempt out.
pub struct Transaction<'stm> {
    stm: &'stm Stm,
    /// Nonzero owner token stored in a var's lock word while this log
    /// commits it.
    token: u64,
    reads: ReadMap,
    writes: WriteMap,
    before_commit: Vec<BeforeHook<'stm>>,
    after_commit: Vec<AfterHook<'stm>>,
    /// Vars actually mutated during write-back; drained for notification.
    changed: Vec<Arc<VarCore>>,
    parent: Option<Box<Transaction<'stm>>>,
    /// Set once write-back happened. Recording a write afterwards is a
    /// programming error.
    sealed: bool,
}

fn downcast<T: Any + Clone>(value: &DynValue) -> T {
    value
        .downcast_ref::<T>()
        .expect("type mismatch in TVar")
        .clone()
}

impl<'stm> Transaction<'stm> {
    pub(crate) fn new(stm: &'stm Stm) -> Self {
        Self {
            stm,
            token: next_token(),
            reads: HashMap::with_hasher(FixedState::default()),
            writes: BTreeMap::new(),
            before_commit: Vec::new(),
            after_commit: Vec::new(),
            changed: Vec::new(),
            parent: None,
            sealed: false,
        }
    }

    /// Read a var.
    ///
    /// Pending writes of this log win, then the first-read snapshot; only a
    /// var this transaction never touched is read from shared memory. The
    /// snapshot may already be stale by the time the body sees it. Commit
    /// re-validates, so the body only has to tolerate inconsistency, not
    /// act on it.
    pub fn load<T: Any + Send + Sync + Clone>(&mut self, var: &TVar<T>) -> StmResult<T> {
        let core = var.core();
        let id = core.id();

        if let Some(entry) = self.writes.get(&id) {
            return Ok(downcast(&entry.pending));
        }

        let value = match self.reads.entry(id) {
            Entry::Occupied(entry) => entry.get().seen.clone(),
            Entry::Vacant(slot) => {
                let value = core.value();
                slot.insert(ReadEntry {
                    core: core.clone(),
                    seen: value.clone(),
                });
                value
            }
        };
        Ok(downcast(&value))
    }

    /// Record a write. Nothing reaches shared memory before commit.
    pub fn store<T: Any + Send + Sync>(&mut self, var: &TVar<T>, value: T) -> StmResult<()> {
        assert!(!self.sealed, "transactional write on a committed log");
        let core = var.core();
        self.writes.insert(
            core.id(),
            WriteEntry {
                core: core.clone(),
                pending: Arc::new(value),
            },
        );
        Ok(())
    }

    /// Register a hook that runs at the start of commit, before any lock is
    /// taken.
    ///
    /// The hook receives the committing log and may read, write and register
    /// further hooks on it. Returning `Err(StmError::Rerun)` abandons the
    /// commit and makes it report failure to the driver.
    pub fn on_before_commit<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut Transaction<'stm>) -> StmResult<()> + Send + 'stm,
    {
        self.before_commit.push(Box::new(hook));
    }

    /// Register a hook that runs after a successful commit, with every lock
    /// released.
    ///
    /// After-commit hooks observe committed state. They must not write vars
    /// and must not read vars the transaction did not touch.
    pub fn on_after_commit<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut Transaction<'stm>) + Send + 'stm,
    {
        self.after_commit.push(Box::new(hook));
    }

    /// True if every read var still holds the exact value this log
    /// snapshotted. Consults no locks.
    pub fn is_valid(&self) -> bool {
        self.reads
            .values()
            .all(|entry| same_value(&entry.seen, &entry.core.value()))
    }

    /// Like [`is_valid`](Transaction::is_valid), and additionally no read
    /// var is mid-commit in another log. A var this log is itself committing
    /// does not count: one log may legitimately hold a var in both sets.
    ///
    /// This is the predicate the commit engine runs with write-set locks
    /// held; it closes the window in which a concurrent committer could
    /// overwrite a validated read.
    pub fn is_valid_and_unlocked(&self) -> bool {
        self.reads.values().all(|entry| {
            same_value(&entry.seen, &entry.core.value())
                && entry.core.unlocked_or_held_by(self.token)
        })
    }

    /// Commit a top-level transaction.
    ///
    /// `Ok(true)` means the writes are published. `Ok(false)` means a
    /// conflict or a rerun signal was hit and the caller must re-execute
    /// from a fresh log. `Err` carries a before-commit hook's error; the
    /// transaction is aborted.
    ///
    /// # Panics
    ///
    /// Panics when called on a nested log, or when a hook signals `Retry`;
    /// both are contract violations.
    pub fn commit(mut self) -> StmResult<bool> {
        assert!(
            self.parent.is_none(),
            "commit on a nested log; use commit_nested"
        );

        // 1. Before-commit hooks. A take-loop instead of an iterator: hooks
        // registered during the walk land in the vector and run on the next
        // round, in registration order.
        loop {
            let hooks = mem::take(&mut self.before_commit);
            if hooks.is_empty() {
                break;
            }
            for hook in hooks {
                match hook(&mut self) {
                    Ok(()) => {}
                    Err(StmError::Rerun) => {
                        trace!(token = self.token, "before-commit hook requested rerun");
                        return Ok(false);
                    }
                    Err(StmError::Retry) => panic!("retry signalled inside a commit hook"),
                    Err(err) => return Err(err),
                }
            }
        }

        // 2. Read-only fast path: nothing to lock, nothing to stamp.
        if self.writes.is_empty() {
            self.sealed = true;
            self.run_after_hooks();
            return Ok(true);
        }

        // 3. Lock the write set, ascending var id.
        let mut locked: Vec<Arc<VarCore>> = Vec::with_capacity(self.writes.len());
        for entry in self.writes.values() {
            if !entry.core.try_lock(self.token) {
                for core in locked.iter().rev() {
                    core.unlock();
                }
                trace!(
                    token = self.token,
                    var = entry.core.id(),
                    "write-set lock held elsewhere, commit aborted"
                );
                return Ok(false);
            }
            locked.push(entry.core.clone());
        }

        // 4. One clock tick per writing commit.
        let commit_version = self.stm.clock().tick();

        // 5. Re-validate the read set under the write-set locks.
        let success = self.is_valid_and_unlocked();

        // 6. Write back. A pending value that is identical to the committed
        // one publishes nothing and wakes nobody.
        if success {
            let writes = mem::take(&mut self.writes);
            for (_, write) in writes {
                if !same_value(&write.pending, &write.core.value()) {
                    write.core.publish(commit_version, write.pending);
                    self.changed.push(write.core);
                }
            }
            self.sealed = true;
        }

        // 7. Release every lock taken in step 3, on success and failure
        // alike.
        for core in locked.iter().rev() {
            core.unlock();
        }

        // 8. Notifications and after-commit hooks, outside the locks.
        if success {
            trace!(
                token = self.token,
                version = commit_version,
                changed = self.changed.len(),
                "commit published"
            );
            let changed = mem::take(&mut self.changed);
            for core in changed {
                core.wake_all();
            }
            self.run_after_hooks();
        } else {
            trace!(token = self.token, "read set invalid under locks, commit aborted");
        }
        Ok(success)
    }

    fn run_after_hooks(&mut self) {
        loop {
            let hooks = mem::take(&mut self.after_commit);
            if hooks.is_empty() {
                break;
            }
            for hook in hooks {
                hook(self);
            }
        }
    }

    /// Open a nested log on top of this one.
    ///
    /// The child starts from a copy of the parent's reads and writes and an
    /// empty hook list; the parent is held inside the child until
    /// [`commit_nested`](Transaction::commit_nested) or
    /// [`abort_nested`](Transaction::abort_nested) hands it back.
    pub fn nested(self) -> Transaction<'stm> {
        let mut child = Transaction::new(self.stm);
        child.reads = self.reads.clone();
        child.writes = self.writes.clone();
        child.parent = Some(Box::new(self));
        child
    }

    /// Fold a nested log into its parent and return the parent.
    ///
    /// The parent's reads and writes are replaced by the child's (the child
    /// inherited the parent's entries at creation, so nothing is lost), and
    /// the child's hooks are appended to the parent's in order. Nested
    /// commit is bookkeeping: it always succeeds and validates nothing.
    ///
    /// # Panics
    ///
    /// Panics when called on a top-level log.
    pub fn commit_nested(mut self) -> Transaction<'stm> {
        let mut parent = *self
            .parent
            .take()
            .expect("commit_nested on a top-level log");
        parent.reads = mem::take(&mut self.reads);
        parent.writes = mem::take(&mut self.writes);
        parent.before_commit.append(&mut self.before_commit);
        parent.after_commit.append(&mut self.after_commit);
        parent
    }

    /// Throw a nested log away and recover the untouched parent.
    pub fn abort_nested(self) -> Transaction<'stm> {
        *self.parent.expect("abort_nested on a top-level log")
    }

    fn detach_parent(mut self) -> (Transaction<'stm>, Transaction<'stm>) {
        let parent = *self.parent.take().expect("nested log has no parent");
        (parent, self)
    }

    /// Merge the read sets of two sibling logs.
    ///
    /// The log with the larger read set survives and absorbs the other's
    /// reads. Returns `None` when the two logs snapshotted different values
    /// for a shared var, in which case neither can be trusted any further.
    pub fn merge_reads(a: Transaction<'stm>, b: Transaction<'stm>) -> Option<Transaction<'stm>> {
        let (mut keep, fold) = if a.reads.len() >= b.reads.len() {
            (a, b)
        } else {
            (b, a)
        };
        if keep.absorb_reads(fold.reads) {
            Some(keep)
        } else {
            None
        }
    }

    /// Fold foreign read entries into this log's read set. `false` on an
    /// identity conflict.
    fn absorb_reads(&mut self, reads: ReadMap) -> bool {
        for (id, entry) in reads {
            match self.reads.entry(id) {
                Entry::Vacant(slot) => {
                    slot.insert(entry);
                }
                Entry::Occupied(existing) => {
                    if !same_value(&existing.get().seen, &entry.seen) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Run `first`; if it signals `Retry`, discard its recording and run
    /// `second` instead.
    ///
    /// Each alternative runs in its own nested log, so a retried branch
    /// leaves no trace in this transaction. When both branches retry, their
    /// read sets are merged into this log so a later
    /// [`wait_for_change`](Transaction::wait_for_change) watches every var
    /// either branch depended on; a merge conflict degrades to `Rerun`.
    pub fn or_else<T, F1, F2>(&mut self, first: F1, second: F2) -> StmResult<T>
    where
        F1: FnOnce(&mut Transaction<'stm>) -> StmResult<T>,
        F2: FnOnce(&mut Transaction<'stm>) -> StmResult<T>,
    {
        let stm = self.stm;
        let parent = mem::replace(self, Transaction::new(stm));
        let mut branch = parent.nested();
        match first(&mut branch) {
            Err(StmError::Retry) => {
                let (parent, first_attempt) = branch.detach_parent();
                let mut branch = parent.nested();
                match second(&mut branch) {
                    Err(StmError::Retry) => {
                        let (parent, second_attempt) = branch.detach_parent();
                        *self = parent;
                        match Transaction::merge_reads(first_attempt, second_attempt) {
                            Some(union) => {
                                if self.absorb_reads(union.reads) {
                                    Err(StmError::Retry)
                                } else {
                                    Err(StmError::Rerun)
                                }
                            }
                            None => Err(StmError::Rerun),
                        }
                    }
                    Ok(value) => {
                        *self = branch.commit_nested();
                        Ok(value)
                    }
                    err => {
                        *self = branch.abort_nested();
                        err
                    }
                }
            }
            Ok(value) => {
                *self = branch.commit_nested();
                Ok(value)
            }
            err => {
                *self = branch.abort_nested();
                err
            }
        }
    }

    /// Block until some var in the read set is committed to.
    ///
    /// Subscribes to every read var, then re-checks the snapshots: a write
    /// that already landed means there is something new to see and the call
    /// returns immediately. A log that read nothing has nothing to wake it,
    /// so this blocks indefinitely, the same caveat retry itself carries.
    pub fn wait_for_change(&self) {
        let handle = Arc::new(WaitHandle::new());
        let mut unchanged = true;
        for entry in self.reads.values() {
            entry.core.subscribe(&handle);
            if !same_value(&entry.seen, &entry.core.value()) {
                unchanged = false;
                break;
            }
        }
        if unchanged {
            trace!(
                token = self.token,
                reads = self.reads.len(),
                "retry blocked on read set"
            );
            handle.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Stm;

    #[test]
    fn test_repeatable_reads_keep_first_snapshot() {
        let stm = Stm::new();
        let var = TVar::new(1);
        let mut tx = stm.begin();
        assert_eq!(tx.load(&var).unwrap(), 1);

        // A foreign commit lands in between.
        let mut other = stm.begin();
        other.store(&var, 2).unwrap();
        assert!(other.commit().unwrap());

        // The first snapshot is what the transaction keeps seeing.
        assert_eq!(tx.load(&var).unwrap(), 1);
        assert!(!tx.is_valid());
    }

    #[test]
    fn test_validation_distinguishes_foreign_locks() {
        let stm = Stm::new();
        let var = TVar::new(3);
        let mut tx = stm.begin();
        tx.load(&var).unwrap();
        assert!(tx.is_valid());
        assert!(tx.is_valid_and_unlocked());

        // A foreign owner parks on the var: still valid, but not unlocked.
        assert!(var.core().try_lock(u64::MAX));
        assert!(tx.is_valid());
        assert!(!tx.is_valid_and_unlocked());
        var.core().unlock();

        // The log's own lock does not count against it.
        assert!(var.core().try_lock(tx.token));
        assert!(tx.is_valid_and_unlocked());
        var.core().unlock();
    }

    #[test]
    fn test_identity_equal_write_back_is_skipped() {
        let stm = Stm::new();
        let var = TVar::new(10);
        let stamped_before = var.version();

        let mut tx = stm.begin();
        let current = var.core().value();
        tx.writes.insert(
            var.core().id(),
            WriteEntry {
                core: var.core().clone(),
                pending: current,
            },
        );
        assert!(tx.commit().unwrap());

        // Nothing was published: same version, same object.
        assert_eq!(var.version(), stamped_before);
        assert_eq!(var.read_atomic(), 10);
    }

    #[test]
    fn test_identity_equal_write_does_not_wake_waiters() {
        let stm = Stm::new();
        let var = TVar::new(5);
        let handle = Arc::new(WaitHandle::new());
        var.core().subscribe(&handle);

        let mut tx = stm.begin();
        tx.writes.insert(
            var.core().id(),
            WriteEntry {
                core: var.core().clone(),
                pending: var.core().value(),
            },
        );
        assert!(tx.commit().unwrap());
        assert!(!handle.is_notified());

        // A genuine write does wake.
        let mut tx = stm.begin();
        tx.store(&var, 6).unwrap();
        assert!(tx.commit().unwrap());
        assert!(handle.is_notified());
    }

    #[test]
    fn test_commit_nested_replaces_recording_state() {
        let stm = Stm::new();
        let a = TVar::new(1);
        let b = TVar::new(2);

        let mut parent = stm.begin();
        parent.load(&a).unwrap();
        parent.on_before_commit(|_| Ok(()));

        let mut child = parent.nested();
        child.load(&b).unwrap();
        child.store(&b, 9).unwrap();
        child.on_before_commit(|_| Ok(()));
        child.on_after_commit(|_| {});

        let parent = child.commit_nested();
        assert_eq!(parent.reads.len(), 2);
        assert_eq!(parent.writes.len(), 1);
        assert_eq!(parent.before_commit.len(), 2);
        assert_eq!(parent.after_commit.len(), 1);
    }

    #[test]
    fn test_merge_reads_agreeing_sets() {
        let stm = Stm::new();
        let shared = TVar::new(7);
        let extra = TVar::new(1);

        let mut t1 = stm.begin();
        t1.load(&shared).unwrap();
        t1.load(&extra).unwrap();
        let mut t2 = stm.begin();
        t2.load(&shared).unwrap();

        let merged = Transaction::merge_reads(t1, t2).expect("agreeing read sets merge");
        assert_eq!(merged.reads.len(), 2);
    }

    #[test]
    fn test_merge_reads_empty_side_is_trivial() {
        let stm = Stm::new();
        let var = TVar::new(7);
        let mut t1 = stm.begin();
        t1.load(&var).unwrap();
        let t2 = stm.begin();

        let merged = Transaction::merge_reads(t1, t2).expect("empty side always merges");
        assert_eq!(merged.reads.len(), 1);
    }

    #[test]
    fn test_merge_reads_identity_conflict() {
        let stm = Stm::new();
        let shared = TVar::new(7);

        let mut t1 = stm.begin();
        t1.load(&shared).unwrap();

        let mut writer = stm.begin();
        writer.store(&shared, 8).unwrap();
        assert!(writer.commit().unwrap());

        let mut t2 = stm.begin();
        t2.load(&shared).unwrap();

        assert!(Transaction::merge_reads(t1, t2).is_none());
    }

    #[test]
    #[should_panic(expected = "commit on a nested log")]
    fn test_commit_on_nested_log_panics() {
        let stm = Stm::new();
        let child = stm.begin().nested();
        let _ = child.commit();
    }

    #[test]
    #[should_panic(expected = "commit_nested on a top-level log")]
    fn test_commit_nested_on_top_level_panics() {
        let stm = Stm::new();
        let _ = stm.begin().commit_nested();
    }
}
