//! Deferred dereference
//!
//! A client that cannot take an object's lock domains right now can hand its
//! last reference to the queue instead of releasing it. The drain worker later
//! takes the domains and performs the release, which may cache or destroy the
//! object.
//!
//! Worker states: `Idle` → `Armed` (first enqueue schedules a firing) →
//! `Draining` → `Idle` when the queue empties, or back to `Armed` when a
//! domain is busy and the pass stops early.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{DomainId, DomainSet, acquire_set, release_all};
use crate::manager::CacheManager;
use crate::object::{CachedObject, ContainerId, ObjectKey};
use crate::stats::CacheMetrics;

/// Deferred-dereference worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DerefState {
    /// Nothing scheduled
    Idle,
    /// A firing is pending
    Armed,
    /// A worker pass is running
    Draining,
}

/// How a drain pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The queue was emptied
    Drained {
        /// Items processed in this pass
        processed: usize,
    },
    /// A lock domain was busy; the item went back to the head
    Interrupted {
        /// Items processed before the interruption
        processed: usize,
    },
}

impl DrainOutcome {
    /// Items processed in the pass
    pub fn processed(&self) -> usize {
        match *self {
            Self::Drained { processed } | Self::Interrupted { processed } => processed,
        }
    }
}

pub(crate) struct PendingDeref<T> {
    object: Arc<CachedObject<T>>,
    domains: DomainSet,
}

pub(crate) struct DerefQueue<T> {
    pub(crate) items: VecDeque<PendingDeref<T>>,
    pub(crate) state: DerefState,
}

impl<T> DerefQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: VecDeque::new(),
            state: DerefState::Idle,
        }
    }
}

/// `Worker` owns the state machine; a `Client` drain never clears it
#[derive(Clone, Copy, PartialEq, Eq)]
enum Drainer {
    Worker,
    Client,
}

impl<T: Send + Sync + 'static> CacheManager<T> {
    /// Release a reference without taking the object's lock domains
    ///
    /// If other references remain the count drops inline. Otherwise the
    /// release is queued for the drain worker. A full queue leaks the
    /// reference. Callers holding the namespace exclusively must use
    /// [`Self::run_down`] instead.
    pub fn enqueue_deref(&self, object: &Arc<CachedObject<T>>) {
        if object.try_decrement_above_one() {
            CacheMetrics::bump(&self.metrics.inline_derefs);
            log::trace!("deferred dereference of {:#x} done inline", object.key().0);
            return;
        }
        debug_assert!(
            !self.namespace.is_exclusive_by_current_thread(),
            "enqueue_deref with the namespace held exclusively; use run_down"
        );

        let domains = self.domains_of(object);
        let arm = {
            let mut queue = self.deref_queue.lock();
            if queue.items.len() >= self.config.max_pending_derefs as usize
                || queue.items.try_reserve(1).is_err()
            {
                drop(queue);
                CacheMetrics::bump(&self.metrics.leaked_references);
                log::warn!(
                    "deferred dereference queue full, leaking a reference on {:#x}",
                    object.key().0
                );
                return;
            }
            queue.items.push_back(PendingDeref {
                object: Arc::clone(object),
                domains,
            });
            let arm = queue.state == DerefState::Idle;
            if arm {
                queue.state = DerefState::Armed;
            }
            arm
        };

        CacheMetrics::bump(&self.metrics.queued_derefs);
        if arm {
            log::debug!("arming deferred dereference worker");
            self.schedule_deref_worker();
        }
    }

    /// Schedule a drain pass if the worker is idle
    ///
    /// Returns whether this call armed the worker.
    pub fn arm_deref_worker(&self) -> bool {
        {
            let mut queue = self.deref_queue.lock();
            if queue.state != DerefState::Idle {
                return false;
            }
            queue.state = DerefState::Armed;
        }
        self.schedule_deref_worker();
        true
    }

    fn schedule_deref_worker(&self) {
        let manager = self.me.clone();
        self.scheduler.schedule(
            self.config.rearm_interval(),
            Box::new(move || {
                if let Some(manager) = manager.upgrade() {
                    manager.run_scheduled_deref_worker();
                }
            }),
        );
    }

    /// One worker pass over the queue
    ///
    /// Runs under the shared namespace lock and holds no domain between
    /// items, so the first domain of each item may be waited for. A busy
    /// second domain stops the pass. Started while idle, the pass owns the
    /// worker and re-arms it on interruption; started while a firing is
    /// pending, it leaves the state to that firing. Does nothing while
    /// another pass is draining.
    pub fn run_deref_worker(&self) -> DrainOutcome {
        let _namespace = self.namespace.read();
        let drainer = {
            let mut queue = self.deref_queue.lock();
            match queue.state {
                DerefState::Idle => {
                    queue.state = DerefState::Draining;
                    Drainer::Worker
                }
                DerefState::Armed => Drainer::Client,
                DerefState::Draining => return DrainOutcome::Drained { processed: 0 },
            }
        };
        self.worker_pass(drainer)
    }

    /// The firing scheduled by an arm
    fn run_scheduled_deref_worker(&self) -> DrainOutcome {
        let _namespace = self.namespace.read();
        {
            let mut queue = self.deref_queue.lock();
            if queue.state != DerefState::Armed {
                return DrainOutcome::Drained { processed: 0 };
            }
            queue.state = DerefState::Draining;
        }
        self.worker_pass(Drainer::Worker)
    }

    fn worker_pass(&self, drainer: Drainer) -> DrainOutcome {
        CacheMetrics::bump(&self.metrics.deref_worker_runs);
        let outcome = self.drain(&[], drainer);
        log::debug!("deferred dereference worker: {outcome:?}");
        outcome
    }

    /// Drain the queue from a client that already holds some domains
    ///
    /// Items whose domains are all in `held_keys`' domains are processed
    /// inline; any other domain is only tried, never waited for. The first
    /// busy domain ends the pass with the item back at the head.
    pub fn drain_deref_queue(&self, held_keys: &[ObjectKey]) -> DrainOutcome {
        let held = self.domain_ids(held_keys);
        self.drain(&held, Drainer::Client)
    }

    fn drain(&self, held: &[DomainId], drainer: Drainer) -> DrainOutcome {
        let mut processed = 0;
        loop {
            let item = {
                let mut queue = self.deref_queue.lock();
                match queue.items.pop_front() {
                    Some(item) => item,
                    None => {
                        if drainer == Drainer::Worker {
                            queue.state = DerefState::Idle;
                        }
                        return DrainOutcome::Drained { processed };
                    }
                }
            };

            let acquired = match acquire_set(self.domains.as_ref(), item.domains, held) {
                Ok(acquired) => acquired,
                Err(e) => {
                    log::debug!("deferred dereference of {:#x} requeued: {e}", item.object.key().0);
                    let arm = {
                        let mut queue = self.deref_queue.lock();
                        queue.items.push_front(item);
                        match drainer {
                            Drainer::Worker => {
                                queue.state = DerefState::Armed;
                                true
                            }
                            Drainer::Client if queue.state == DerefState::Idle => {
                                queue.state = DerefState::Armed;
                                true
                            }
                            Drainer::Client => false,
                        }
                    };
                    CacheMetrics::bump(&self.metrics.requeued_derefs);
                    if arm {
                        CacheMetrics::bump(&self.metrics.rearms);
                        self.schedule_deref_worker();
                    }
                    return DrainOutcome::Interrupted { processed };
                }
            };

            let pending_unload = self.process_deref(&item.object);
            release_all(self.domains.as_ref(), &acquired);
            self.notify_unload(pending_unload);
            processed += 1;
        }
    }

    /// Process queued dereferences synchronously
    ///
    /// Handles every item whose domains are all among the domains of
    /// `held_keys`, which the caller holds. With `forced` the caller holds
    /// the namespace exclusively and every other item is processed too,
    /// acquiring its missing domains. Without it the remaining items keep
    /// their order. Returns the number of items processed.
    pub fn run_down(&self, held_keys: &[ObjectKey], forced: bool) -> usize {
        debug_assert!(
            !forced || self.namespace.is_exclusive_by_current_thread(),
            "forced run_down requires the namespace held exclusively"
        );
        let held = self.domain_ids(held_keys);
        let batch: Vec<PendingDeref<T>> = {
            let mut queue = self.deref_queue.lock();
            if forced {
                queue.items.drain(..).collect()
            } else {
                let (covered, kept): (VecDeque<_>, VecDeque<_>) = queue
                    .items
                    .drain(..)
                    .partition(|item| item.domains.is_covered_by(&held));
                queue.items = kept;
                Vec::from(covered)
            }
        };

        let processed = batch.len();
        for item in batch {
            // only reachable when forced: nothing else can hold these
            let missing: Vec<DomainId> = item
                .domains
                .as_slice()
                .iter()
                .copied()
                .filter(|d| !held.contains(d))
                .collect();
            for &domain in &missing {
                self.domains.acquire(domain);
            }
            let pending_unload = self.process_deref(&item.object);
            release_all(self.domains.as_ref(), &missing);
            self.notify_unload(pending_unload);
        }
        if processed > 0 {
            log::debug!("ran down {processed} deferred dereferences");
        }
        processed
    }

    /// Release with the object's domains held; returns its container if
    /// that container is waiting to unload
    fn process_deref(&self, object: &Arc<CachedObject<T>>) -> Option<ContainerId> {
        CacheMetrics::bump(&self.metrics.processed_derefs);
        if let Err(e) = self.release_with_lock(object) {
            log::warn!("deferred dereference of {:#x} failed: {e}", object.key().0);
        }
        object
            .container()
            .filter(|container| self.lifecycle.is_pending_unload(*container))
    }

    fn notify_unload(&self, container: Option<ContainerId>) {
        if let Some(container) = container {
            log::debug!("container {} may now unload", container.0);
            self.lifecycle.notify_container_may_unload(container);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::domain::HashedLockDomains;
    use crate::object::ObjectDesc;
    use crate::timer::ManualScheduler;

    fn setup(config: CacheConfig) -> (Arc<CacheManager<()>>, Arc<ManualScheduler>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let cache = CacheManager::builder(config)
            .domains(Arc::new(HashedLockDomains::direct(16)))
            .scheduler(scheduler.clone())
            .build()
            .unwrap();
        (cache, scheduler)
    }

    #[test]
    fn test_inline_when_references_remain() {
        let (cache, scheduler) = setup(CacheConfig::with_capacity(8));
        let obj = cache.create_object(ObjectDesc::new(ObjectKey(1)), ()).unwrap();
        cache.reference(&obj).unwrap();
        cache.enqueue_deref(&obj);
        assert_eq!(obj.ref_count(), 1);
        assert_eq!(cache.pending_derefs(), 0);
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(cache.deref_state(), DerefState::Idle);
        assert_eq!(cache.stats().inline_derefs, 1);
    }

    #[test]
    fn test_last_reference_queued_and_drained() {
        let (cache, scheduler) = setup(CacheConfig::with_capacity(8));
        let obj = cache.create_object(ObjectDesc::new(ObjectKey(1)), ()).unwrap();
        cache.enqueue_deref(&obj);
        assert_eq!(obj.ref_count(), 1);
        assert_eq!(cache.pending_derefs(), 1);
        assert_eq!(cache.deref_state(), DerefState::Armed);

        assert_eq!(scheduler.fire_all(), 1);
        assert_eq!(cache.pending_derefs(), 0);
        assert_eq!(cache.deref_state(), DerefState::Idle);
        assert_eq!(obj.ref_count(), 0);
        assert!(obj.is_cached());
    }

    #[test]
    fn test_single_arm_for_many_enqueues() {
        let (cache, scheduler) = setup(CacheConfig::with_capacity(8));
        let objects: Vec<_> = (0..5)
            .map(|k| cache.create_object(ObjectDesc::new(ObjectKey(k)), ()).unwrap())
            .collect();
        for obj in &objects {
            cache.enqueue_deref(obj);
        }
        assert_eq!(scheduler.pending(), 1);
        assert!(!cache.arm_deref_worker());
        assert_eq!(cache.run_deref_worker(), DrainOutcome::Drained { processed: 5 });
    }

    #[test]
    fn test_full_queue_leaks_reference() {
        let config = CacheConfig {
            max_pending_derefs: 1,
            ..CacheConfig::with_capacity(8)
        };
        let (cache, _) = setup(config);
        let first = cache.create_object(ObjectDesc::new(ObjectKey(1)), ()).unwrap();
        let second = cache.create_object(ObjectDesc::new(ObjectKey(2)), ()).unwrap();
        cache.enqueue_deref(&first);
        cache.enqueue_deref(&second);
        assert_eq!(cache.pending_derefs(), 1);
        assert_eq!(second.ref_count(), 1);
        assert_eq!(cache.stats().leaked_references, 1);
    }

    #[test]
    fn test_run_down_keeps_uncovered_order() {
        let (cache, _) = setup(CacheConfig::with_capacity(8));
        let objects: Vec<_> = [3, 5, 4, 5]
            .iter()
            .enumerate()
            .map(|(i, d)| {
                // key i*16 + d maps to domain d
                let key = ObjectKey(i as u32 * 16 + d);
                cache.create_object(ObjectDesc::new(key), ()).unwrap()
            })
            .collect();
        for obj in &objects {
            cache.enqueue_deref(obj);
        }

        let _guard = cache.lock_domains(&[ObjectKey(5)]);
        assert_eq!(cache.run_down(&[ObjectKey(5)], false), 2);
        assert!(objects[1].is_cached() && objects[3].is_cached());
        assert_eq!(cache.pending_derefs(), 2);
        let queued: Vec<_> = cache
            .deref_queue
            .lock()
            .items
            .iter()
            .map(|item| item.object.key())
            .collect();
        assert_eq!(queued, vec![objects[0].key(), objects[2].key()]);
    }

    #[test]
    fn test_outcome_processed() {
        assert_eq!(DrainOutcome::Drained { processed: 3 }.processed(), 3);
        assert_eq!(DrainOutcome::Interrupted { processed: 1 }.processed(), 1);
    }
}
