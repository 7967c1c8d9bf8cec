//! Delayed-close table and its eviction worker
//!
//! Idle objects are kept warm in an LRU list. When the table grows past its
//! capacity the close worker is armed; each pass evicts from the tail within a
//! budget of `capacity / 4` attempts.
//!
//! Eviction is optimistic: the worker peeks the tail's lock domains under the
//! table lock, drops the table lock, acquires the domains, then re-locks the
//! table and checks that the tail still belongs to those domains. A client may
//! re-reference or remove the peeked object in between; the re-check catches it.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};

use crate::domain::{DomainSet, acquire_set, release_all};
use crate::error::{CacheResult, ensure};
use crate::lru::LruList;
use crate::manager::CacheManager;
use crate::object::CachedObject;
use crate::stats::CacheMetrics;

/// A cached object and the domains it was cached under
pub(crate) struct CacheEntry<T> {
    pub(crate) object: Arc<CachedObject<T>>,
    pub(crate) domains: DomainSet,
}

/// Close worker state
///
/// At most one firing is pending, and only the pass that owns it, or a
/// direct pass started while idle, may schedule the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseState {
    /// Nothing scheduled
    Idle,
    /// A firing is pending
    Armed,
    /// An owning pass is running
    Running,
}

pub(crate) struct DelayCloseTable<T> {
    pub(crate) list: LruList<CacheEntry<T>>,
    pub(crate) close_state: CloseState,
}

impl<T> DelayCloseTable<T> {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            list: LruList::with_limit(max_entries),
            close_state: CloseState::Idle,
        }
    }
}

/// Result of one close-worker pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClosePass {
    /// Objects destroyed
    pub evicted: u32,
    /// Entries put back at the head because the object was referenced
    pub reinserted: u32,
    /// Attempts lost to a race or a busy domain
    pub abandoned: u32,
    /// Budget ran out while still over capacity
    pub rearmed: bool,
}

enum Eviction {
    /// At or below capacity, or nothing left to evict
    Done,
    Evicted,
    Reinserted,
    Abandoned,
}

impl<T: Send + Sync + 'static> CacheManager<T> {
    /// Keep an idle object warm
    ///
    /// The caller holds the object's domains and the object has no
    /// references. If no entry can be allocated the object is destroyed
    /// instead. Going over capacity arms the close worker.
    pub fn add(&self, object: &Arc<CachedObject<T>>) -> CacheResult<()> {
        let key = object.key().0;
        ensure(!object.is_destroyed(), || {
            format!("destroyed object {key:#x} added to the delayed-close table")
        })?;
        ensure(object.ref_count() == 0, || {
            format!("object {key:#x} added with {} references", object.ref_count())
        })?;
        ensure(!object.is_cached(), || format!("object {key:#x} added twice"))?;
        self.debug_assert_locked(object, "add");

        let domains = self.domains_of(object);
        let mut table = self.table.lock();
        let inserted = table.list.insert_head(CacheEntry {
            object: Arc::clone(object),
            domains,
        });
        let slot = match inserted {
            Ok(slot) => slot,
            Err(e) => {
                drop(table);
                log::warn!("{e}; destroying object {key:#x} instead of caching it");
                CacheMetrics::bump(&self.metrics.immediate_destroys);
                return self.destroy(object);
            }
        };
        object.set_member(slot);
        let size = self.current_size.fetch_add(1, Ordering::Relaxed) + 1;
        let arm = size > self.capacity && table.close_state == CloseState::Idle;
        if arm {
            table.close_state = CloseState::Armed;
        }
        drop(table);

        CacheMetrics::bump(&self.metrics.adds);
        if arm {
            log::debug!("delayed-close table at {size}/{}, arming close worker", self.capacity);
            self.schedule_close_worker();
        }
        Ok(())
    }

    /// Take an object out of the table without destroying it
    ///
    /// The caller holds the object's domains, or the namespace exclusively.
    pub fn remove(&self, object: &Arc<CachedObject<T>>) -> CacheResult<()> {
        self.debug_assert_locked(object, "remove");
        let key = object.key().0;
        let entry = {
            let mut table = self.table.lock();
            let slot = object.entry().filter(|_| object.is_cached());
            let owned = slot.is_some_and(|slot| {
                table
                    .list
                    .get(slot)
                    .is_some_and(|entry| Arc::ptr_eq(&entry.object, object))
            });
            ensure(owned, || format!("object {key:#x} removed but not cached"))?;
            let entry = slot.and_then(|slot| table.list.free(slot));
            self.current_size.fetch_sub(1, Ordering::Relaxed);
            object.clear_member();
            entry
        };
        CacheMetrics::bump(&self.metrics.removes);
        drop(entry);
        Ok(())
    }

    /// Schedule a close-worker pass unless one is pending
    ///
    /// Returns whether this call armed the worker.
    pub fn arm_close_worker(&self) -> bool {
        {
            let mut table = self.table.lock();
            if table.close_state != CloseState::Idle {
                return false;
            }
            table.close_state = CloseState::Armed;
        }
        log::debug!("arming close worker");
        self.schedule_close_worker();
        true
    }

    pub(crate) fn schedule_close_worker(&self) {
        let manager = self.me.clone();
        self.scheduler.schedule(
            self.config.rearm_interval(),
            Box::new(move || {
                if let Some(manager) = manager.upgrade() {
                    manager.run_scheduled_close_worker();
                }
            }),
        );
    }

    /// One close-worker pass: trim the table toward capacity
    ///
    /// Runs under the shared namespace lock with no domain held on entry.
    /// Started while the worker is idle, the pass owns the worker and re-arms
    /// it if the budget runs out over capacity. Started while a firing is
    /// pending, it only evicts and leaves any re-arm to that firing. Started
    /// while an owning pass runs, it does nothing.
    pub fn run_close_worker(&self) -> ClosePass {
        let _namespace = self.namespace.read();
        let owner = {
            let mut table = self.table.lock();
            match table.close_state {
                CloseState::Idle => {
                    table.close_state = CloseState::Running;
                    true
                }
                CloseState::Armed => false,
                CloseState::Running => return ClosePass::default(),
            }
        };
        self.close_pass(owner)
    }

    /// The firing scheduled by an arm
    fn run_scheduled_close_worker(&self) -> ClosePass {
        let _namespace = self.namespace.read();
        {
            let mut table = self.table.lock();
            if table.close_state != CloseState::Armed {
                return ClosePass::default();
            }
            table.close_state = CloseState::Running;
        }
        self.close_pass(true)
    }

    fn close_pass(&self, owner: bool) -> ClosePass {
        CacheMetrics::bump(&self.metrics.close_worker_runs);
        let mut pass = ClosePass::default();

        if !self.is_shut_down() {
            for _ in 0..self.config.eviction_budget() {
                match self.evict_one() {
                    Eviction::Done => break,
                    Eviction::Evicted => pass.evicted += 1,
                    Eviction::Reinserted => pass.reinserted += 1,
                    Eviction::Abandoned => pass.abandoned += 1,
                }
            }
        }
        if !owner {
            log::debug!("close worker pass (firing pending): {pass:?}");
            return pass;
        }

        // adds test the state under this lock, so none is missed
        let rearm = {
            let mut table = self.table.lock();
            let over = !self.is_shut_down() && self.current_size() > self.capacity;
            table.close_state = if over { CloseState::Armed } else { CloseState::Idle };
            over
        };
        if rearm {
            pass.rearmed = true;
            CacheMetrics::bump(&self.metrics.rearms);
            log::debug!(
                "close worker budget spent at {}/{}, re-arming",
                self.current_size(),
                self.capacity
            );
            self.schedule_close_worker();
        } else {
            log::debug!("close worker done: {pass:?}");
        }
        pass
    }

    fn evict_one(&self) -> Eviction {
        let peeked = {
            let mut table = self.table.lock();
            let tail = table.list.peek_tail().map(|(_, entry)| entry.domains);
            match tail {
                Some(domains) if self.current_size() > self.capacity => domains,
                _ => return Eviction::Done,
            }
        };

        // table lock released: blocking on the first domain is allowed
        let held = match acquire_set(self.domains.as_ref(), peeked, &[]) {
            Ok(held) => held,
            Err(e) => {
                log::trace!("eviction attempt abandoned: {e}");
                CacheMetrics::bump(&self.metrics.abandoned_attempts);
                return Eviction::Abandoned;
            }
        };
        let outcome = self.evict_tail_locked(peeked);
        release_all(self.domains.as_ref(), &held);
        outcome
    }

    /// Second phase of an eviction, with the peeked domains held
    fn evict_tail_locked(&self, expected: DomainSet) -> Eviction {
        let (slot, object) = {
            let mut table = self.table.lock();
            if self.current_size() <= self.capacity {
                return Eviction::Done;
            }
            let Some((slot, entry)) = table.list.peek_tail() else {
                return Eviction::Done;
            };
            if entry.domains != expected {
                log::trace!("tail changed under the close worker, retrying");
                CacheMetrics::bump(&self.metrics.abandoned_attempts);
                return Eviction::Abandoned;
            }
            let object = Arc::clone(&entry.object);
            table.list.detach(slot);
            self.current_size.fetch_sub(1, Ordering::Relaxed);
            (slot, object)
        };

        if object.ref_count() == 0 {
            let entry = {
                let mut table = self.table.lock();
                object.clear_member();
                table.list.free(slot)
            };
            drop(entry);
            log::trace!("evicting object {:#x}", object.key().0);
            if self.destroy(&object).is_ok() {
                CacheMetrics::bump(&self.metrics.evictions);
            }
            Eviction::Evicted
        } else {
            {
                let mut table = self.table.lock();
                table.list.attach_head(slot);
                self.current_size.fetch_add(1, Ordering::Relaxed);
            }
            log::trace!(
                "object {:#x} referenced during eviction, reinserted",
                object.key().0
            );
            CacheMetrics::bump(&self.metrics.reinsertions);
            Eviction::Reinserted
        }
    }
}
