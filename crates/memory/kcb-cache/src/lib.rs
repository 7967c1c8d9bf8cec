//! # KCB Cache Crate
//!
//! Lifecycle management for the reference-counted control blocks of a
//! hierarchical namespace: a bounded delayed-close cache that keeps idle
//! objects warm, and a deferred-dereference engine for releases that cannot
//! take their lock domain inline.
//!
//! ## Architecture
//!
//! ```text
//!   namespace lock (RwLock)
//!          ↓
//!   lock domains, ascending ──→ LockDomainProvider
//!          ↓
//!   delayed-close table  ←── close worker  ─┐
//!   deferred-deref queue ←── deref worker  ─┴─ Scheduler (tokio / manual)
//! ```
//!
//! ## Features
//!
//! - **delay_close**: LRU table of idle objects with budgeted eviction
//! - **delay_deref**: queued releases with ordered, non-blocking drain
//! - **domain**: hashed lock domains and linked (parent/child) domain sets
//! - **stats**: counters for every cache and queue event
//! - **config**: TOML / JSON / environment configuration
//!
//! ## Usage
//!
//! ```ignore
//! use kcb_cache::{CacheConfig, CacheManager, ObjectDesc, ObjectKey};
//!
//! let cache = CacheManager::builder(CacheConfig::default()).build()?;
//!
//! let obj = cache.create_object(ObjectDesc::new(ObjectKey(42)), "payload")?;
//! cache.reference(&obj)?;
//! cache.release(&obj)?;
//!
//! // last release: the object stays warm in the delayed-close table
//! cache.release(&obj)?;
//! assert!(obj.is_cached());
//! ```

#![warn(missing_docs)]
#![warn(unused_extern_crates)]
#![warn(unused_imports)]

pub mod config;
pub mod delay_close;
pub mod delay_deref;
pub mod domain;
pub mod error;
mod lru;
pub mod manager;
pub mod namespace;
pub mod object;
pub mod stats;
pub mod timer;
pub mod traits;

// Re-export common types
pub use config::{CacheConfig, CacheConfigLayer, ConfigError, MAX_CAPACITY};
pub use error::{CacheError, CacheResult};
pub use stats::CacheStats;

// Re-export object and lock types
pub use domain::{DomainGuard, DomainId, DomainSet, HashedLockDomains, KeyHashing, LockDomainProvider};
pub use namespace::{NamespaceExclusiveGuard, NamespaceLock};
pub use object::{CachedObject, ContainerId, ObjectDesc, ObjectKey, flags};

// Re-export engine types
pub use delay_close::{ClosePass, CloseState};
pub use delay_deref::{DerefState, DrainOutcome};
pub use manager::{CacheManager, CacheManagerBuilder};
pub use timer::{Job, ManualScheduler, Scheduler, TokioScheduler};
pub use traits::{ContainerLifecycle, DropReclaimer, NoContainers, ObjectReclaimer};
