//! Error types for the delayed-close cache
//!
//! None of these errors reach callers of `add` or `enqueue_deref`: resource
//! exhaustion and deferred locks are recovered where they occur, and only
//! configuration, reference overflow and shutdown are reported to clients.

use crate::config::ConfigError;

/// Cache operation result type
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur while managing cached objects
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Invalid configuration
    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// Entry or queue item could not be allocated
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A lock domain could not be taken without blocking
    #[error("Lock domain {domain} busy, work deferred")]
    LockDeferred {
        /// Domain that refused the non-blocking acquire
        domain: u32,
    },

    /// A collaborator broke the reference-counting contract
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Taking another reference would wrap the 16-bit count
    #[error("Reference count overflow on object {key:#x}")]
    RefCountOverflow {
        /// Key of the saturated object
        key: u32,
    },

    /// The manager has been shut down
    #[error("Cache manager is shut down")]
    ShutDown,

    /// Configuration loading failed
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CacheError {
    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Whether the error is recovered locally by requeueing or re-arming
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LockDeferred { .. } | Self::ResourceExhausted(_))
    }
}

/// Check a collaborator contract.
///
/// Debug builds halt on a violation. Release builds log it and hand back an
/// error so the caller can leave state untouched.
#[track_caller]
pub(crate) fn ensure(cond: bool, violation: impl FnOnce() -> String) -> CacheResult<()> {
    if cond {
        return Ok(());
    }
    let msg = violation();
    debug_assert!(false, "invariant violation: {msg}");
    log::error!("invariant violation: {msg}");
    Err(CacheError::InvariantViolation(msg))
}
