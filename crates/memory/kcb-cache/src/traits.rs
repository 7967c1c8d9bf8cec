//! Collaborator traits
//!
//! The cache decides *when* an object dies and when a container may be
//! reconsidered for unload; what that means is up to the surrounding namespace.

use std::sync::Arc;

use crate::object::{CachedObject, ContainerId};

/// Final reclamation of an object
///
/// Called with the object's lock domains held and no cache-internal lock held,
/// so implementations may release references on other objects whose domains
/// they also hold (e.g. the parent, via `release_with_lock`).
pub trait ObjectReclaimer<T>: Send + Sync {
    /// Tear down the object; the cache will never hand it out again
    fn destroy(&self, object: &Arc<CachedObject<T>>);
}

/// Reclaimer that leaves teardown to `Drop` of the last `Arc`
#[derive(Debug, Clone, Copy, Default)]
pub struct DropReclaimer;

impl<T> ObjectReclaimer<T> for DropReclaimer {
    fn destroy(&self, _object: &Arc<CachedObject<T>>) {}
}

/// External manager of container lifetimes
pub trait ContainerLifecycle: Send + Sync {
    /// Whether the container is waiting for its objects to go idle
    fn is_pending_unload(&self, container: ContainerId) -> bool;

    /// A deferred dereference finished inside a pending container
    fn notify_container_may_unload(&self, container: ContainerId);
}

/// Lifecycle for namespaces without unloadable containers
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContainers;

impl ContainerLifecycle for NoContainers {
    fn is_pending_unload(&self, _container: ContainerId) -> bool {
        false
    }

    fn notify_container_may_unload(&self, _container: ContainerId) {}
}
