//! Cache manager
//!
//! [`CacheManager`] is the single context holding the delayed-close table,
//! the deferred-dereference queue, both workers' arming state and the
//! collaborators. It is always shared as `Arc<CacheManager<T>>`; scheduled
//! worker jobs keep only a weak reference, so dropping the last strong handle
//! turns pending firings into no-ops.
//!
//! Lock order: namespace, then lock domains in ascending order, then the
//! table or queue mutex. The table and queue mutexes are leaves; no callback
//! runs while either is held.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLockReadGuard};

use crate::config::CacheConfig;
use crate::delay_close::{CloseState, DelayCloseTable};
use crate::delay_deref::{DerefQueue, DerefState};
use crate::domain::{DomainGuard, DomainId, DomainSet, HashedLockDomains, LockDomainProvider};
use crate::error::{CacheError, CacheResult, ensure};
use crate::namespace::{NamespaceExclusiveGuard, NamespaceLock};
use crate::object::{CachedObject, ContainerId, ObjectDesc, ObjectKey};
use crate::stats::{CacheMetrics, CacheStats};
use crate::timer::{Scheduler, TokioScheduler};
use crate::traits::{ContainerLifecycle, DropReclaimer, NoContainers, ObjectReclaimer};

/// Delayed-close cache and deferred-dereference engine
pub struct CacheManager<T> {
    pub(crate) me: Weak<Self>,
    pub(crate) config: CacheConfig,
    pub(crate) capacity: u32,
    pub(crate) domains: Arc<dyn LockDomainProvider>,
    pub(crate) reclaimer: Arc<dyn ObjectReclaimer<T>>,
    pub(crate) lifecycle: Arc<dyn ContainerLifecycle>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) namespace: NamespaceLock,
    pub(crate) table: Mutex<DelayCloseTable<T>>,
    /// Mutated only with `table` locked
    pub(crate) current_size: AtomicU32,
    pub(crate) deref_queue: Mutex<DerefQueue<T>>,
    delay_close_enabled: AtomicBool,
    shut_down: AtomicBool,
    pub(crate) metrics: CacheMetrics,
}

/// Builder for [`CacheManager`]
///
/// Every collaborator is optional: domains default to
/// [`HashedLockDomains`] sized from the config, objects are reclaimed by
/// dropping them, there are no containers, and workers run on the tokio
/// runtime of the calling context.
pub struct CacheManagerBuilder<T> {
    config: CacheConfig,
    domains: Option<Arc<dyn LockDomainProvider>>,
    reclaimer: Option<Arc<dyn ObjectReclaimer<T>>>,
    lifecycle: Option<Arc<dyn ContainerLifecycle>>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl<T: Send + Sync + 'static> CacheManagerBuilder<T> {
    /// Lock-domain provider
    pub fn domains(mut self, domains: Arc<dyn LockDomainProvider>) -> Self {
        self.domains = Some(domains);
        self
    }

    /// Final reclamation callback
    pub fn reclaimer(mut self, reclaimer: Arc<dyn ObjectReclaimer<T>>) -> Self {
        self.reclaimer = Some(reclaimer);
        self
    }

    /// Container unload collaborator
    pub fn lifecycle(mut self, lifecycle: Arc<dyn ContainerLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Worker scheduler
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Validate the configuration and create the manager
    ///
    /// # Errors
    ///
    /// `Config` for an invalid configuration, `InvalidConfig` when no
    /// scheduler was given and there is no tokio runtime to default to.
    pub fn build(self) -> CacheResult<Arc<CacheManager<T>>> {
        self.config.validate()?;
        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::current()?),
        };
        let domains: Arc<dyn LockDomainProvider> = match self.domains {
            Some(domains) => domains,
            None => Arc::new(HashedLockDomains::new(self.config.domain_buckets)),
        };
        let reclaimer = self.reclaimer.unwrap_or_else(|| Arc::new(DropReclaimer));
        let lifecycle = self.lifecycle.unwrap_or_else(|| Arc::new(NoContainers));
        let config = self.config;

        log::debug!(
            "cache manager: capacity {}, {} entries, rearm every {:?}",
            config.capacity,
            config.max_entries(),
            config.rearm_interval()
        );

        Ok(Arc::new_cyclic(|me| CacheManager {
            me: me.clone(),
            capacity: config.capacity,
            domains,
            reclaimer,
            lifecycle,
            scheduler,
            namespace: NamespaceLock::new(),
            table: Mutex::new(DelayCloseTable::new(config.max_entries() as usize)),
            current_size: AtomicU32::new(0),
            deref_queue: Mutex::new(DerefQueue::new()),
            delay_close_enabled: AtomicBool::new(config.delay_close_enabled),
            shut_down: AtomicBool::new(false),
            metrics: CacheMetrics::default(),
            config,
        }))
    }
}

impl<T: Send + Sync + 'static> CacheManager<T> {
    /// Start building a manager
    pub fn builder(config: CacheConfig) -> CacheManagerBuilder<T> {
        CacheManagerBuilder {
            config,
            domains: None,
            reclaimer: None,
            lifecycle: None,
            scheduler: None,
        }
    }

    // ---- object lifecycle ----

    /// Create an object holding one reference
    ///
    /// # Errors
    ///
    /// `ShutDown` once [`Self::shutdown`] has run
    pub fn create_object(&self, desc: ObjectDesc, payload: T) -> CacheResult<Arc<CachedObject<T>>> {
        if self.is_shut_down() {
            return Err(CacheError::ShutDown);
        }
        // capacity <= MAX_CAPACITY, so it fits the membership field
        Ok(Arc::new(CachedObject::new(desc, self.capacity as u16, payload)))
    }

    /// Take a reference, locking the object's domains only if the count is zero
    ///
    /// # Errors
    ///
    /// `RefCountOverflow` if the count is saturated
    pub fn reference(&self, object: &Arc<CachedObject<T>>) -> CacheResult<()> {
        if object.try_increment_live()? {
            return Ok(());
        }
        let _guard = self.lock_object(object);
        self.reference_with_lock(object)
    }

    /// Take a reference with the object's domains already held
    ///
    /// The first reference on an idle object takes it out of the
    /// delayed-close table.
    pub fn reference_with_lock(&self, object: &Arc<CachedObject<T>>) -> CacheResult<()> {
        self.debug_assert_locked(object, "reference");
        ensure(!object.is_destroyed(), || {
            format!("object {:#x} referenced after destruction", object.key().0)
        })?;
        if object.ref_count() == 0 && object.is_cached() {
            self.remove(object)?;
        }
        match object.increment() {
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("{e}");
                Err(e)
            }
        }
    }

    /// Drop a reference, locking the object's domains only for the last one
    pub fn release(&self, object: &Arc<CachedObject<T>>) -> CacheResult<()> {
        if object.try_decrement_above_one() {
            return Ok(());
        }
        let _guard = self.lock_object(object);
        self.release_with_lock(object)
    }

    /// Drop a reference with the object's domains already held
    ///
    /// On the last release the object is either kept warm in the
    /// delayed-close table or destroyed right away.
    pub fn release_with_lock(&self, object: &Arc<CachedObject<T>>) -> CacheResult<()> {
        self.debug_assert_locked(object, "release");
        if object.decrement()? == 0 {
            self.retire(object)?;
        }
        Ok(())
    }

    /// Flag the object as removed from the namespace
    ///
    /// An idle cached object is destroyed immediately; a referenced one is
    /// destroyed on its last release instead of being cached.
    pub fn mark_deleted(&self, object: &Arc<CachedObject<T>>) -> CacheResult<()> {
        self.debug_assert_locked(object, "mark_deleted");
        object.set_deleted();
        if object.ref_count() == 0 && object.is_cached() {
            self.remove(object)?;
            self.destroy(object)?;
        }
        Ok(())
    }

    /// Last reference gone: cache or destroy
    pub(crate) fn retire(&self, object: &Arc<CachedObject<T>>) -> CacheResult<()> {
        if !self.delay_close_enabled()
            || object.is_no_delay_close()
            || object.is_deleted()
            || self.is_shut_down()
        {
            return self.destroy(object);
        }
        self.add(object)
    }

    pub(crate) fn destroy(&self, object: &Arc<CachedObject<T>>) -> CacheResult<()> {
        ensure(object.set_destroyed(), || {
            format!("object {:#x} destroyed twice", object.key().0)
        })?;
        CacheMetrics::bump(&self.metrics.destroyed);
        log::trace!("destroying object {:#x}", object.key().0);
        self.reclaimer.destroy(object);
        Ok(())
    }

    // ---- teardown ----

    /// Destroy every idle cached object of a container
    ///
    /// The caller holds the namespace exclusively. All pending deferred
    /// dereferences are run down first so that none of them can bring an
    /// object of the container back. Returns the number of objects destroyed.
    pub fn purge_container(&self, container: ContainerId) -> usize {
        debug_assert!(
            self.namespace.is_exclusive_by_current_thread(),
            "purge_container requires the namespace held exclusively"
        );
        let derefs = self.run_down(&[], true);
        let purged = self.purge_where(|object| object.container() == Some(container));
        log::info!(
            "purged container {}: {} cached objects destroyed, {} deferred dereferences run down",
            container.0,
            purged,
            derefs
        );
        purged
    }

    /// Stop caching and reclaim everything
    ///
    /// Takes the namespace exclusively, runs down the deferred-dereference
    /// queue and destroys every cached object. Later last releases destroy
    /// immediately and [`Self::create_object`] fails. Returns the number of
    /// cached objects destroyed; a second call does nothing.
    pub fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let _namespace = self.namespace.write();
        let derefs = self.run_down(&[], true);
        let purged = self.purge_where(|_| true);
        log::info!(
            "cache shut down: {} cached objects destroyed, {} deferred dereferences run down",
            purged,
            derefs
        );
        purged
    }

    /// Take matching entries out of the table and destroy them
    ///
    /// Repeats until no entry matches: a destroyed object may release its
    /// parent into the table.
    fn purge_where(&self, mut pred: impl FnMut(&CachedObject<T>) -> bool) -> usize {
        let mut purged = 0;
        loop {
            let batch = {
                let mut table = self.table.lock();
                let batch = table.list.drain_matching(|entry| pred(entry.object.as_ref()));
                self.current_size
                    .fetch_sub(batch.len() as u32, Ordering::Relaxed);
                for entry in &batch {
                    entry.object.clear_member();
                }
                batch
            };
            if batch.is_empty() {
                return purged;
            }
            for entry in batch {
                CacheMetrics::bump(&self.metrics.removes);
                if self.destroy(&entry.object).is_ok() {
                    purged += 1;
                }
            }
        }
    }

    // ---- locking ----

    /// Lock the domains of the given keys in ascending order
    pub fn lock_domains(&self, keys: &[ObjectKey]) -> DomainGuard {
        DomainGuard::lock(Arc::clone(&self.domains), keys)
    }

    /// Lock every domain the object belongs to
    pub fn lock_object(&self, object: &CachedObject<T>) -> DomainGuard {
        DomainGuard::lock_set(Arc::clone(&self.domains), self.domains_of(object))
    }

    /// Hold the whole namespace exclusively
    pub fn lock_namespace_exclusive(&self) -> NamespaceExclusiveGuard<'_> {
        self.namespace.write()
    }

    /// Hold the whole namespace shared
    pub fn lock_namespace_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.namespace.read()
    }

    /// Domains guarding the object
    pub fn domains_of(&self, object: &CachedObject<T>) -> DomainSet {
        DomainSet::for_keys(self.domains.as_ref(), object.key(), object.parent_key())
    }

    pub(crate) fn domain_ids(&self, keys: &[ObjectKey]) -> Vec<DomainId> {
        let mut ids: Vec<DomainId> = keys.iter().map(|k| self.domains.domain_of(*k)).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub(crate) fn holds_domains(&self, set: DomainSet) -> bool {
        set.as_slice()
            .iter()
            .all(|d| self.domains.is_held_by_current_thread(*d))
    }

    #[track_caller]
    pub(crate) fn debug_assert_locked(&self, object: &CachedObject<T>, op: &str) {
        debug_assert!(
            self.holds_domains(self.domains_of(object))
                || self.namespace.is_exclusive_by_current_thread(),
            "{op} on object {:#x} without its lock domain",
            object.key().0
        );
    }

    // ---- configuration & introspection ----

    /// Turn caching on or off; when off, last releases destroy immediately
    pub fn set_delay_close_enabled(&self, enabled: bool) {
        self.delay_close_enabled.store(enabled, Ordering::Release);
    }

    /// Whether last releases keep objects warm
    pub fn delay_close_enabled(&self) -> bool {
        self.delay_close_enabled.load(Ordering::Acquire)
    }

    /// Whether [`Self::shutdown`] has run
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Active configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Objects in the delayed-close table
    pub fn current_size(&self) -> u32 {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Table capacity
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Keys of cached objects, eviction candidate first
    pub fn lru_keys(&self) -> Vec<ObjectKey> {
        self.table
            .lock()
            .list
            .iter_from_tail()
            .map(|(_, entry)| entry.object.key())
            .collect()
    }

    /// Whether a close-worker firing is pending or running
    pub fn is_close_worker_armed(&self) -> bool {
        self.close_state() != CloseState::Idle
    }

    /// Close worker state
    pub fn close_state(&self) -> CloseState {
        self.table.lock().close_state
    }

    /// Queued deferred dereferences
    pub fn pending_derefs(&self) -> usize {
        self.deref_queue.lock().items.len()
    }

    /// Deferred-dereference worker state
    pub fn deref_state(&self) -> DerefState {
        self.deref_queue.lock().state
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> CacheStats {
        let pending = self.pending_derefs() as u64;
        self.metrics
            .snapshot(self.current_size(), self.capacity, pending)
    }

    /// Verify the table against its members
    ///
    /// Meant for quiescent points (no worker mid-pass): every linked entry's
    /// object must be idle, flagged as a member and point back at its slot,
    /// and the list length must equal the current size.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` describing the first mismatch
    pub fn check_consistency(&self) -> CacheResult<()> {
        let table = self.table.lock();
        let mut linked = 0usize;
        for (slot, entry) in table.list.iter_from_tail() {
            let object = &entry.object;
            let key = object.key().0;
            if object.ref_count() != 0 {
                return Err(CacheError::invariant(format!(
                    "cached object {key:#x} has {} references",
                    object.ref_count()
                )));
            }
            if !object.is_cached() || !object.in_delay_close() {
                return Err(CacheError::invariant(format!(
                    "cached object {key:#x} not flagged as a member"
                )));
            }
            if object.entry() != Some(slot) {
                return Err(CacheError::invariant(format!(
                    "cached object {key:#x} points at entry {:?}, linked at {slot}",
                    object.entry()
                )));
            }
            if object.is_destroyed() {
                return Err(CacheError::invariant(format!(
                    "destroyed object {key:#x} still cached"
                )));
            }
            linked += 1;
        }
        let size = self.current_size() as usize;
        if table.list.allocated() != linked {
            return Err(CacheError::invariant(format!(
                "{} entries allocated, {linked} linked",
                table.list.allocated()
            )));
        }
        if linked != size || table.list.len() != size {
            return Err(CacheError::invariant(format!(
                "table holds {linked} entries, current size is {size}"
            )));
        }
        Ok(())
    }
}

impl<T> std::fmt::Debug for CacheManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("capacity", &self.capacity)
            .field("current_size", &self.current_size.load(Ordering::Relaxed))
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
