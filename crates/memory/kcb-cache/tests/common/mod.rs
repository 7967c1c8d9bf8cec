//! Common test utilities for kcb-cache integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::Sender;

use parking_lot::Mutex;

use kcb_cache::{
    CacheConfig, CacheManager, CachedObject, ContainerId, ContainerLifecycle, DomainId,
    HashedLockDomains, LockDomainProvider, ManualScheduler, ObjectDesc, ObjectKey,
    ObjectReclaimer,
};

// ============================================================================
// Collaborators
// ============================================================================

/// Reclaimer recording destroyed keys in order
#[derive(Default)]
pub struct Recorder {
    destroyed: Mutex<Vec<ObjectKey>>,
}

impl Recorder {
    pub fn destroyed(&self) -> Vec<ObjectKey> {
        self.destroyed.lock().clone()
    }
}

impl<T> ObjectReclaimer<T> for Recorder {
    fn destroy(&self, object: &Arc<CachedObject<T>>) {
        self.destroyed.lock().push(object.key());
    }
}

/// Containers that can be flagged as pending unload
#[derive(Default)]
pub struct Containers {
    pending: Mutex<HashSet<ContainerId>>,
    notified: Mutex<Vec<ContainerId>>,
}

impl Containers {
    pub fn set_pending(&self, container: ContainerId) {
        self.pending.lock().insert(container);
    }

    pub fn notified(&self) -> Vec<ContainerId> {
        self.notified.lock().clone()
    }
}

impl ContainerLifecycle for Containers {
    fn is_pending_unload(&self, container: ContainerId) -> bool {
        self.pending.lock().contains(&container)
    }

    fn notify_container_may_unload(&self, container: ContainerId) {
        self.notified.lock().push(container);
    }
}

/// Direct-mapped domains where some domains always refuse `try_acquire`
pub struct FlakyDomains {
    inner: HashedLockDomains,
    refuse: Vec<DomainId>,
}

impl FlakyDomains {
    pub fn refusing(buckets: u32, refuse: &[DomainId]) -> Self {
        Self {
            inner: HashedLockDomains::direct(buckets),
            refuse: refuse.to_vec(),
        }
    }
}

impl LockDomainProvider for FlakyDomains {
    fn domain_of(&self, key: ObjectKey) -> DomainId {
        self.inner.domain_of(key)
    }

    fn acquire(&self, domain: DomainId) {
        self.inner.acquire(domain)
    }

    fn try_acquire(&self, domain: DomainId) -> bool {
        !self.refuse.contains(&domain) && self.inner.try_acquire(domain)
    }

    fn release(&self, domain: DomainId) {
        self.inner.release(domain)
    }

    fn is_held_by_current_thread(&self, domain: DomainId) -> bool {
        self.inner.is_held_by_current_thread(domain)
    }
}

/// Direct-mapped domains that report a blocking `acquire` before it waits
pub struct SignallingDomains {
    inner: HashedLockDomains,
    waiting: Sender<DomainId>,
}

impl SignallingDomains {
    pub fn direct(buckets: u32, waiting: Sender<DomainId>) -> Self {
        Self {
            inner: HashedLockDomains::direct(buckets),
            waiting,
        }
    }
}

impl LockDomainProvider for SignallingDomains {
    fn domain_of(&self, key: ObjectKey) -> DomainId {
        self.inner.domain_of(key)
    }

    fn acquire(&self, domain: DomainId) {
        if self.inner.try_acquire(domain) {
            return;
        }
        let _ = self.waiting.send(domain);
        self.inner.acquire(domain)
    }

    fn try_acquire(&self, domain: DomainId) -> bool {
        self.inner.try_acquire(domain)
    }

    fn release(&self, domain: DomainId) {
        self.inner.release(domain)
    }

    fn is_held_by_current_thread(&self, domain: DomainId) -> bool {
        self.inner.is_held_by_current_thread(domain)
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub struct Harness {
    pub cache: Arc<CacheManager<u32>>,
    pub scheduler: Arc<ManualScheduler>,
    pub recorder: Arc<Recorder>,
    pub containers: Arc<Containers>,
}

impl Harness {
    /// Manual scheduling over 16 direct-mapped domains: key `k` is domain `k % 16`
    pub fn new(capacity: u32) -> Self {
        Self::with_config(CacheConfig::with_capacity(capacity))
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self::with_domains(config, Arc::new(HashedLockDomains::direct(16)))
    }

    pub fn with_domains(config: CacheConfig, domains: Arc<dyn LockDomainProvider>) -> Self {
        let scheduler = Arc::new(ManualScheduler::new());
        let recorder = Arc::new(Recorder::default());
        let containers = Arc::new(Containers::default());
        let cache = CacheManager::builder(config)
            .domains(domains)
            .reclaimer(recorder.clone())
            .lifecycle(containers.clone())
            .scheduler(scheduler.clone())
            .build()
            .expect("valid test configuration");
        Self {
            cache,
            scheduler,
            recorder,
            containers,
        }
    }

    pub fn object(&self, key: u32) -> Arc<CachedObject<u32>> {
        self.cache
            .create_object(ObjectDesc::new(ObjectKey(key)), key)
            .expect("cache is running")
    }

    pub fn object_in(&self, key: u32, container: ContainerId) -> Arc<CachedObject<u32>> {
        self.cache
            .create_object(ObjectDesc::new(ObjectKey(key)).in_container(container), key)
            .expect("cache is running")
    }

    /// Create an object and drop its only reference, leaving it cached
    pub fn idle(&self, key: u32) -> Arc<CachedObject<u32>> {
        let object = self.object(key);
        self.cache.release(&object).expect("release");
        object
    }
}

pub fn keys(raw: &[u32]) -> Vec<ObjectKey> {
    raw.iter().copied().map(ObjectKey).collect()
}
