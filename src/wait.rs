use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

/// A one-shot wake-up point for a transaction blocked in retry.
///
/// The blocked thread parks on the condvar; any committing writer that
/// mutates one of the transaction's read vars flips the flag and wakes it.
/// The flag lives outside the mutex so a writer releasing several vars never
/// blocks on a parked reader, and so a notification that arrives before
/// `wait` is not lost.
pub struct WaitHandle {
    notified: AtomicBool,
    lock: Mutex<()>,
    cvar: Condvar,
}

impl WaitHandle {
    pub fn new() -> Self {
        Self {
            notified: AtomicBool::new(false),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    /// Inform the handle that a watched var has changed.
    ///
    /// Safe to call from any thread, any number of times.
    pub fn notify(&self) {
        self.notified.store(true, Ordering::SeqCst);
        self.cvar.notify_one();
    }

    /// Block until `notify` has been called.
    ///
    /// Returns immediately if the notification already happened.
    pub fn wait(&self) {
        let mut guard = self.lock.lock();
        while !self.notified.load(Ordering::SeqCst) {
            self.cvar.wait(&mut guard);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_notified(&self) -> bool {
        self.notified.load(Ordering::SeqCst)
    }
}

impl Default for WaitHandle {
    fn default() -> Self {
        Self::new()
    }
}
