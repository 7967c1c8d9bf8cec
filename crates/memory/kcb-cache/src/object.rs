//! Cached object representation
//!
//! A [`CachedObject`] packs its 16-bit reference count and the debug-only
//! `in_delay_close` bit into one atomic word, so every count transition is a
//! single compare-and-swap that leaves the flag intact.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult, ensure};
use crate::lru::SlotId;

/// Low bits of the ref word holding the reference count
pub(crate) const REFCOUNT_MASK: u32 = 0xFFFF;

/// Ref word bit set while the object sits in the delayed-close table
pub(crate) const IN_DELAY_CLOSE: u32 = 1 << 31;

/// Back-pointer value for "no entry"
pub(crate) const NO_ENTRY: u32 = u32::MAX;

/// Object flag bits
pub mod flags {
    /// Never cache; destroy on the last release
    pub const NO_DELAY_CLOSE: u8 = 0x01;
    /// Removed from the namespace; never cache
    pub const DELETED: u8 = 0x02;
    /// Reclaimed by the cache; must not be added again
    pub const DESTROYED: u8 = 0x04;
}

/// Identity an object's lock domain is derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey(pub u32);

/// Identity of a container grouping cached objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub u32);

/// Description of an object to create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectDesc {
    /// Own identity
    pub key: ObjectKey,
    /// Parent identity, for linked lock domains
    pub parent_key: Option<ObjectKey>,
    /// Owning container
    pub container: Option<ContainerId>,
    /// Initial flag bits (see [`flags`])
    pub flags: u8,
}

impl ObjectDesc {
    /// Unlinked object with no container
    pub fn new(key: ObjectKey) -> Self {
        Self {
            key,
            parent_key: None,
            container: None,
            flags: 0,
        }
    }

    /// Link the object to its parent's lock domain
    pub fn with_parent(mut self, parent: ObjectKey) -> Self {
        self.parent_key = Some(parent);
        self
    }

    /// Place the object in a container
    pub fn in_container(mut self, container: ContainerId) -> Self {
        self.container = Some(container);
        self
    }

    /// Never keep the object warm after its last release
    pub fn no_delay_close(mut self) -> Self {
        self.flags |= flags::NO_DELAY_CLOSE;
        self
    }
}

/// A reusable reference-counted object
///
/// Objects are created by [`crate::CacheManager::create_object`] holding one
/// reference and are shared as `Arc<CachedObject<T>>`.
pub struct CachedObject<T> {
    key: ObjectKey,
    parent_key: Option<ObjectKey>,
    container: Option<ContainerId>,
    /// Reference count (low 16 bits) and `IN_DELAY_CLOSE`
    ref_word: AtomicU32,
    /// `0` while a member, `sentinel` otherwise
    membership: AtomicU16,
    sentinel: u16,
    /// Slot of the table entry, `NO_ENTRY` when not a member
    entry: AtomicU32,
    flags: AtomicU8,
    payload: T,
}

impl<T> CachedObject<T> {
    pub(crate) fn new(desc: ObjectDesc, sentinel: u16, payload: T) -> Self {
        Self {
            key: desc.key,
            parent_key: desc.parent_key,
            container: desc.container,
            ref_word: AtomicU32::new(1),
            membership: AtomicU16::new(sentinel),
            sentinel,
            entry: AtomicU32::new(NO_ENTRY),
            flags: AtomicU8::new(desc.flags & !flags::DESTROYED),
            payload,
        }
    }

    /// Own identity
    pub fn key(&self) -> ObjectKey {
        self.key
    }

    /// Parent identity, if linked
    pub fn parent_key(&self) -> Option<ObjectKey> {
        self.parent_key
    }

    /// Owning container
    pub fn container(&self) -> Option<ContainerId> {
        self.container
    }

    /// Caller data
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Current reference count
    pub fn ref_count(&self) -> u32 {
        self.ref_word.load(Ordering::Acquire) & REFCOUNT_MASK
    }

    /// Debug sanity bit mirroring table membership
    pub fn in_delay_close(&self) -> bool {
        self.ref_word.load(Ordering::Acquire) & IN_DELAY_CLOSE != 0
    }

    /// Raw membership index
    pub fn membership_index(&self) -> u16 {
        self.membership.load(Ordering::Acquire)
    }

    /// "Not a member" value of [`Self::membership_index`]
    pub fn membership_sentinel(&self) -> u16 {
        self.sentinel
    }

    /// Whether the object is in the delayed-close table
    pub fn is_cached(&self) -> bool {
        self.membership_index() != self.sentinel
    }

    /// Whether the object was removed from the namespace
    pub fn is_deleted(&self) -> bool {
        self.has_flag(flags::DELETED)
    }

    /// Whether the object opts out of caching
    pub fn is_no_delay_close(&self) -> bool {
        self.has_flag(flags::NO_DELAY_CLOSE)
    }

    /// Whether the object has been reclaimed
    pub fn is_destroyed(&self) -> bool {
        self.has_flag(flags::DESTROYED)
    }

    fn has_flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    pub(crate) fn set_deleted(&self) {
        self.flags.fetch_or(flags::DELETED, Ordering::AcqRel);
    }

    /// Returns false if the object was already destroyed
    pub(crate) fn set_destroyed(&self) -> bool {
        self.flags.fetch_or(flags::DESTROYED, Ordering::AcqRel) & flags::DESTROYED == 0
    }

    /// Take a reference only if one is already held.
    ///
    /// Returns `Ok(false)` when the count is zero: the caller must then take
    /// the object's lock domain.
    pub(crate) fn try_increment_live(&self) -> CacheResult<bool> {
        let mut word = self.ref_word.load(Ordering::Acquire);
        loop {
            let count = word & REFCOUNT_MASK;
            if count == 0 {
                return Ok(false);
            }
            if count == REFCOUNT_MASK {
                return Err(CacheError::RefCountOverflow { key: self.key.0 });
            }
            match self.ref_word.compare_exchange_weak(
                word,
                word + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(true),
                Err(actual) => word = actual,
            }
        }
    }

    /// Take a reference, returning the new count
    pub(crate) fn increment(&self) -> CacheResult<u32> {
        let mut word = self.ref_word.load(Ordering::Acquire);
        loop {
            let count = word & REFCOUNT_MASK;
            if count == REFCOUNT_MASK {
                return Err(CacheError::RefCountOverflow { key: self.key.0 });
            }
            match self.ref_word.compare_exchange_weak(
                word,
                word + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(count + 1),
                Err(actual) => word = actual,
            }
        }
    }

    /// Drop a reference only if others remain
    pub(crate) fn try_decrement_above_one(&self) -> bool {
        let mut word = self.ref_word.load(Ordering::Acquire);
        loop {
            if word & REFCOUNT_MASK <= 1 {
                return false;
            }
            match self.ref_word.compare_exchange_weak(
                word,
                word - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => word = actual,
            }
        }
    }

    /// Drop a reference, returning the remaining count
    pub(crate) fn decrement(&self) -> CacheResult<u32> {
        let mut word = self.ref_word.load(Ordering::Acquire);
        loop {
            let count = word & REFCOUNT_MASK;
            ensure(count > 0, || {
                format!("reference count underflow on object {:#x}", self.key.0)
            })?;
            match self.ref_word.compare_exchange_weak(
                word,
                word - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(count - 1),
                Err(actual) => word = actual,
            }
        }
    }

    pub(crate) fn entry(&self) -> Option<SlotId> {
        match self.entry.load(Ordering::Acquire) {
            NO_ENTRY => None,
            slot => Some(slot),
        }
    }

    /// Record table membership. Table lock held.
    pub(crate) fn set_member(&self, slot: SlotId) {
        self.entry.store(slot, Ordering::Release);
        self.membership.store(0, Ordering::Release);
        self.ref_word.fetch_or(IN_DELAY_CLOSE, Ordering::AcqRel);
    }

    /// Clear table membership. Table lock held.
    pub(crate) fn clear_member(&self) {
        self.ref_word.fetch_and(!IN_DELAY_CLOSE, Ordering::AcqRel);
        self.membership.store(self.sentinel, Ordering::Release);
        self.entry.store(NO_ENTRY, Ordering::Release);
    }
}

impl<T> fmt::Debug for CachedObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedObject")
            .field("key", &self.key)
            .field("parent_key", &self.parent_key)
            .field("container", &self.container)
            .field("ref_count", &self.ref_count())
            .field("in_delay_close", &self.in_delay_close())
            .field("membership_index", &self.membership_index())
            .field("flags", &self.flags.load(Ordering::Acquire))
            .finish()
    }
}
