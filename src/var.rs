use crate::clock::{next_var_id, Version};
use crate::wait::WaitHandle;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Committed values are held behind an opaque shared handle; the STM only
/// ever compares them by identity, never by content.
pub(crate) type DynValue = Arc<dyn Any + Send + Sync>;

/// Identity equality of two committed values.
///
/// Compares allocation addresses as thin pointers, so two handles are equal
/// exactly when they refer to the same stored object.
pub(crate) fn same_value(a: &DynValue, b: &DynValue) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// The (version, value) pair a var publishes. Always replaced as a unit, so
/// no reader can observe a fresh version with a stale value.
struct Snapshot {
    version: Version,
    value: DynValue,
}

/// The untyped core of a transactional variable.
///
/// Shared by all threads. The `owner` word is the commit lock: zero when
/// free, otherwise the token of the transaction log that is mid-commit on
/// this var. Only the commit engine takes it, and only for vars in a write
/// set.
pub(crate) struct VarCore {
    id: u64,
    owner: AtomicU64,
    cell: RwLock<Snapshot>,
    waiters: Mutex<Vec<Weak<WaitHandle>>>,
}

impl VarCore {
    pub(crate) fn new(value: DynValue) -> Arc<Self> {
        Arc::new(Self {
            id: next_var_id(),
            owner: AtomicU64::new(0),
            cell: RwLock::new(Snapshot { version: 0, value }),
            waiters: Mutex::new(Vec::new()),
        })
    }

    /// Unique creation-ordered id; the total order for lock acquisition.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// The currently committed value.
    ///
    /// May race with a concurrent committer and return either its old or
    /// its new value; the commit engine re-validates under locks before
    /// trusting anything read here.
    pub(crate) fn value(&self) -> DynValue {
        self.cell.read().value.clone()
    }

    /// Version stamp of the last committed write.
    pub(crate) fn version(&self) -> Version {
        self.cell.read().version
    }

    /// Try to take the commit lock for `token`. Non-blocking.
    pub(crate) fn try_lock(&self, token: u64) -> bool {
        self.owner
            .compare_exchange(0, token, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the commit lock. The caller must hold it.
    pub(crate) fn unlock(&self) {
        self.owner.store(0, Ordering::Release);
    }

    /// True if no one holds the commit lock, or the holder is `token`
    /// itself. A var can sit in both the read and the write set of one log,
    /// so read-set re-validation must not trip over its own lock.
    pub(crate) fn unlocked_or_held_by(&self, token: u64) -> bool {
        let owner = self.owner.load(Ordering::Acquire);
        owner == 0 || owner == token
    }

    /// Publish a new (version, value) pair.
    ///
    /// Must only be called while holding this var's commit lock.
    pub(crate) fn publish(&self, version: Version, value: DynValue) {
        debug_assert_ne!(self.owner.load(Ordering::Relaxed), 0);
        let mut cell = self.cell.write();
        cell.version = version;
        cell.value = value;
    }

    /// Register a retry-waiter. Weak, so an abandoned waiter never keeps a
    /// log alive through the var.
    pub(crate) fn subscribe(&self, handle: &Arc<WaitHandle>) {
        self.waiters.lock().push(Arc::downgrade(handle));
    }

    /// Wake every retry-waiter of this var and forget them.
    ///
    /// Idempotent, and does not require the commit lock: a spurious wake-up
    /// only makes a waiter re-check its read set.
    pub(crate) fn wake_all(&self) {
        let waiters = {
            let mut guard = self.waiters.lock();
            mem::take(&mut *guard)
        };
        for waiter in waiters {
            if let Some(handle) = waiter.upgrade() {
                handle.notify();
            }
        }
    }
}

/// A transactional variable holding a value of type `T`.
///
/// Cloning the handle aliases the same shared var. Reads and writes inside
/// a transaction go through [`Transaction::load`](crate::Transaction::load)
/// and [`Transaction::store`](crate::Transaction::store); `read_atomic`
/// peeks at the committed value without entering a transaction.
pub struct TVar<T> {
    core: Arc<VarCore>,
    _marker: PhantomData<T>,
}

impl<T: Any + Send + Sync> TVar<T> {
    pub fn new(value: T) -> Self {
        Self {
            core: VarCore::new(Arc::new(value)),
            _marker: PhantomData,
        }
    }

    /// Version stamp of the last committed write to this var.
    pub fn version(&self) -> Version {
        self.core.version()
    }

    /// Wake every transaction currently retry-blocked on this var.
    pub fn wake_all(&self) {
        self.core.wake_all();
    }

    pub(crate) fn core(&self) -> &Arc<VarCore> {
        &self.core
    }
}

impl<T: Any + Send + Sync + Clone> TVar<T> {
    /// Read the committed value outside of any transaction.
    pub fn read_atomic(&self) -> T {
        let value = self.core.value();
        value
            .downcast_ref::<T>()
            .expect("type mismatch in TVar")
            .clone()
    }
}

impl<T> Clone for TVar<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _marker: PhantomData,
        }
    }
}
