//! Whole-namespace lock
//!
//! Coarse reader/writer lock above every lock domain. Both workers run under
//! the shared side; teardown paths (`purge_container`, `shutdown`) take the
//! exclusive side. The exclusive owner is recorded so the cache can check
//! that `run_down(.., forced = true)` and `enqueue_deref` are used correctly.

use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Reader/writer lock that knows its exclusive owner
#[derive(Debug, Default)]
pub struct NamespaceLock {
    lock: RwLock<()>,
    exclusive_owner: Mutex<Option<ThreadId>>,
}

/// Exclusive hold on the namespace
#[must_use = "the namespace lock is released when the guard is dropped"]
pub struct NamespaceExclusiveGuard<'a> {
    owner: &'a Mutex<Option<ThreadId>>,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl Drop for NamespaceExclusiveGuard<'_> {
    fn drop(&mut self) {
        // runs before the write guard field is dropped
        *self.owner.lock() = None;
    }
}

impl NamespaceLock {
    /// Unlocked namespace
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared hold
    pub fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// Exclusive hold
    pub fn write(&self) -> NamespaceExclusiveGuard<'_> {
        let guard = self.lock.write();
        *self.exclusive_owner.lock() = Some(thread::current().id());
        NamespaceExclusiveGuard {
            owner: &self.exclusive_owner,
            _guard: guard,
        }
    }

    /// Whether the calling thread holds the exclusive side
    pub fn is_exclusive_by_current_thread(&self) -> bool {
        *self.exclusive_owner.lock() == Some(thread::current().id())
    }
}
