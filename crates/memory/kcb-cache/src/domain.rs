//! Lock domains
//!
//! A lock domain is the unit of mutual exclusion below the whole-namespace
//! lock. Objects map to domains through their key; linked objects also belong
//! to their parent's domain. Domains are totally ordered by [`DomainId`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::error::{CacheError, CacheResult};
use crate::object::ObjectKey;

/// Scrambling constant applied to keys before bucketing
const HASH_MULTIPLIER: u64 = 314_159_269;

/// Prime modulus used for scrambling
const HASH_PRIME: u64 = 1_000_000_007;

/// Identity of a lock domain; the order of ids is the global lock order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub u32);

/// Per-object mutual exclusion, keyed by object identity
///
/// Implementations must be exclusive locks that can be released by the
/// thread that acquired them. No recursion is required.
pub trait LockDomainProvider: Send + Sync {
    /// Domain guarding the object with this key
    fn domain_of(&self, key: ObjectKey) -> DomainId;

    /// Block until the domain is held exclusively
    fn acquire(&self, domain: DomainId);

    /// Take the domain only if it is free
    fn try_acquire(&self, domain: DomainId) -> bool;

    /// Release a domain held by the calling thread
    fn release(&self, domain: DomainId);

    /// Whether the calling thread holds the domain
    fn is_held_by_current_thread(&self, domain: DomainId) -> bool;
}

/// The domains one object needs: its own, plus its parent's when linked
///
/// Always sorted ascending and free of duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainSet {
    ids: [DomainId; 2],
    len: u8,
}

impl DomainSet {
    /// A single domain
    pub fn single(domain: DomainId) -> Self {
        Self {
            ids: [domain, domain],
            len: 1,
        }
    }

    /// Two domains, normalized
    pub fn pair(a: DomainId, b: DomainId) -> Self {
        match a.cmp(&b) {
            std::cmp::Ordering::Equal => Self::single(a),
            std::cmp::Ordering::Less => Self { ids: [a, b], len: 2 },
            std::cmp::Ordering::Greater => Self { ids: [b, a], len: 2 },
        }
    }

    /// Domains of an object key and optional parent key
    pub fn for_keys(
        provider: &dyn LockDomainProvider,
        key: ObjectKey,
        parent: Option<ObjectKey>,
    ) -> Self {
        let own = provider.domain_of(key);
        match parent {
            Some(parent) => Self::pair(own, provider.domain_of(parent)),
            None => Self::single(own),
        }
    }

    /// Domains in ascending order
    pub fn as_slice(&self) -> &[DomainId] {
        &self.ids[..self.len as usize]
    }

    /// Whether `domain` is part of the set
    pub fn contains(&self, domain: DomainId) -> bool {
        self.as_slice().contains(&domain)
    }

    /// Whether every domain of the set is in `held`
    pub fn is_covered_by(&self, held: &[DomainId]) -> bool {
        self.as_slice().iter().all(|d| held.contains(d))
    }
}

/// Take every domain of `set` not already in `held`, in ascending order.
///
/// The first domain is acquired blocking only when nothing at all is held;
/// every other acquisition is non-blocking. On failure everything taken here
/// is released again and `LockDeferred` names the busy domain.
pub(crate) fn acquire_set(
    provider: &dyn LockDomainProvider,
    set: DomainSet,
    held: &[DomainId],
) -> CacheResult<Vec<DomainId>> {
    let mut acquired = Vec::with_capacity(2);
    for &domain in set.as_slice() {
        if held.contains(&domain) {
            continue;
        }
        if held.is_empty() && acquired.is_empty() {
            provider.acquire(domain);
        } else if !provider.try_acquire(domain) {
            release_all(provider, &acquired);
            return Err(CacheError::LockDeferred { domain: domain.0 });
        }
        acquired.push(domain);
    }
    Ok(acquired)
}

/// Release domains in reverse acquisition order
pub(crate) fn release_all(provider: &dyn LockDomainProvider, domains: &[DomainId]) {
    for &domain in domains.iter().rev() {
        provider.release(domain);
    }
}

/// How keys are spread over buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHashing {
    /// Multiplicative scrambling, then modulo
    Scrambled,
    /// Key modulo bucket count
    Direct,
}

#[derive(Debug, Default)]
struct DomainLock {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

/// Default provider: a fixed array of exclusive bucket locks
///
/// Each bucket records its owning thread, which lets the cache assert its
/// locking preconditions. The domain order is the bucket index.
#[derive(Debug)]
pub struct HashedLockDomains {
    buckets: Box<[DomainLock]>,
    hashing: KeyHashing,
    contended: AtomicU64,
}

impl HashedLockDomains {
    /// Provider with scrambled key hashing
    pub fn new(buckets: u32) -> Self {
        Self::with_hashing(buckets, KeyHashing::Scrambled)
    }

    /// Provider mapping key `k` to domain `k % buckets`
    pub fn direct(buckets: u32) -> Self {
        Self::with_hashing(buckets, KeyHashing::Direct)
    }

    /// Provider with explicit hashing
    pub fn with_hashing(buckets: u32, hashing: KeyHashing) -> Self {
        let buckets = buckets.max(1) as usize;
        Self {
            buckets: (0..buckets).map(|_| DomainLock::default()).collect(),
            hashing,
            contended: AtomicU64::new(0),
        }
    }

    /// Number of domains
    pub fn bucket_count(&self) -> u32 {
        self.buckets.len() as u32
    }

    /// Blocking acquires that had to wait
    pub fn contended_acquires(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }

    fn bucket(&self, domain: DomainId) -> &DomainLock {
        &self.buckets[domain.0 as usize % self.buckets.len()]
    }
}

impl LockDomainProvider for HashedLockDomains {
    fn domain_of(&self, key: ObjectKey) -> DomainId {
        let buckets = self.buckets.len() as u64;
        let index = match self.hashing {
            KeyHashing::Scrambled => (HASH_MULTIPLIER * u64::from(key.0)) % HASH_PRIME % buckets,
            KeyHashing::Direct => u64::from(key.0) % buckets,
        };
        DomainId(index as u32)
    }

    fn acquire(&self, domain: DomainId) {
        let me = thread::current().id();
        let lock = self.bucket(domain);
        let mut owner = lock.owner.lock();
        debug_assert_ne!(*owner, Some(me), "lock domain {} acquired recursively", domain.0);
        if owner.is_some() {
            self.contended.fetch_add(1, Ordering::Relaxed);
            while owner.is_some() {
                lock.released.wait(&mut owner);
            }
        }
        *owner = Some(me);
    }

    fn try_acquire(&self, domain: DomainId) -> bool {
        let mut owner = self.bucket(domain).owner.lock();
        if owner.is_some() {
            return false;
        }
        *owner = Some(thread::current().id());
        true
    }

    fn release(&self, domain: DomainId) {
        let lock = self.bucket(domain);
        let mut owner = lock.owner.lock();
        debug_assert_eq!(
            *owner,
            Some(thread::current().id()),
            "lock domain {} released by a thread that does not hold it",
            domain.0
        );
        *owner = None;
        drop(owner);
        lock.released.notify_one();
    }

    fn is_held_by_current_thread(&self, domain: DomainId) -> bool {
        *self.bucket(domain).owner.lock() == Some(thread::current().id())
    }
}

/// Domains held by a client; released on drop
#[must_use = "the domains are released when the guard is dropped"]
pub struct DomainGuard {
    provider: Arc<dyn LockDomainProvider>,
    held: Vec<DomainId>,
}

impl DomainGuard {
    /// Acquire the domains of `keys` in ascending order, blocking
    pub fn lock(provider: Arc<dyn LockDomainProvider>, keys: &[ObjectKey]) -> Self {
        let mut held: Vec<DomainId> = keys.iter().map(|k| provider.domain_of(*k)).collect();
        held.sort_unstable();
        held.dedup();
        for &domain in &held {
            provider.acquire(domain);
        }
        Self { provider, held }
    }

    /// Acquire every domain of `set` in ascending order, blocking
    pub fn lock_set(provider: Arc<dyn LockDomainProvider>, set: DomainSet) -> Self {
        for &domain in set.as_slice() {
            provider.acquire(domain);
        }
        Self {
            provider,
            held: set.as_slice().to_vec(),
        }
    }

    /// Domains held by this guard, ascending
    pub fn domains(&self) -> &[DomainId] {
        &self.held
    }
}

impl Drop for DomainGuard {
    fn drop(&mut self) {
        release_all(self.provider.as_ref(), &self.held);
    }
}

impl std::fmt::Debug for DomainGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainGuard").field("held", &self.held).finish()
    }
}
