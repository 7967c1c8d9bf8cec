//! End-to-end cache scenarios
//!
//! Keys map to domains directly (`k % 16`) and workers only run when the
//! manual scheduler fires them.

mod common;

use std::sync::Arc;

use common::{FlakyDomains, Harness, keys};
use kcb_cache::{CacheConfig, DerefState, DomainId, DrainOutcome, ObjectDesc, ObjectKey};

const A: u32 = 1;
const B: u32 = 2;
const C: u32 = 3;
const D: u32 = 4;
const E: u32 = 5;

#[test]
fn test_tail_evicted_first() {
    let h = Harness::new(4);
    let objects: Vec<_> = [A, B, C, D, E].iter().map(|&k| h.idle(k)).collect();
    assert_eq!(h.cache.current_size(), 5);
    assert!(h.cache.is_close_worker_armed());
    assert_eq!(h.scheduler.pending(), 1);

    assert_eq!(h.scheduler.fire_all(), 1);

    assert_eq!(h.recorder.destroyed(), keys(&[A]));
    assert!(objects[0].is_destroyed());
    assert!(!objects[0].is_cached());
    assert_eq!(h.cache.current_size(), 4);
    assert_eq!(h.cache.lru_keys(), keys(&[B, C, D, E]));
    assert!(!h.cache.is_close_worker_armed());
    h.cache.check_consistency().unwrap();
}

#[test]
fn test_rereferenced_object_skipped_by_eviction() {
    let h = Harness::new(4);
    let objects: Vec<_> = [A, B, C, D, E].iter().map(|&k| h.idle(k)).collect();

    // a client looks A up again before the worker fires
    h.cache.reference(&objects[0]).unwrap();
    assert_eq!(h.cache.current_size(), 4);

    h.scheduler.fire_all();
    assert!(h.recorder.destroyed().is_empty());
    assert_eq!(h.cache.lru_keys(), keys(&[B, C, D, E]));
    assert_eq!(objects[0].ref_count(), 1);
    assert!(!objects[0].is_cached());
}

#[test]
fn test_rereferenced_object_with_smaller_capacity() {
    let h = Harness::new(3);
    let objects: Vec<_> = [A, B, C, D, E].iter().map(|&k| h.idle(k)).collect();

    h.cache.reference(&objects[0]).unwrap();
    h.scheduler.fire_all();

    assert_eq!(h.recorder.destroyed(), keys(&[B]));
    assert_eq!(h.cache.lru_keys(), keys(&[C, D, E]));
    assert_eq!(h.cache.current_size(), 3);
    assert!(!objects[0].is_destroyed());
}

#[test]
fn test_run_down_processes_item_under_held_domain() {
    let h = Harness::new(8);
    let object = h.object(7);

    let guard = h.cache.lock_domains(&[ObjectKey(7)]);
    h.cache.enqueue_deref(&object);
    assert_eq!(h.cache.pending_derefs(), 1);

    assert_eq!(h.cache.run_down(&[ObjectKey(7)], false), 1);
    drop(guard);

    assert_eq!(h.cache.pending_derefs(), 0);
    assert_eq!(object.ref_count(), 0);
    assert!(object.is_cached());
    assert_eq!(h.cache.stats().processed_derefs, 1);
}

#[test]
fn test_busy_domain_requeued_without_blocking() {
    let h = Harness::with_domains(
        CacheConfig::with_capacity(8),
        Arc::new(FlakyDomains::refusing(16, &[DomainId(2)])),
    );
    let first = h.object(1);
    let second = h.object(2);
    h.cache.enqueue_deref(&first);
    h.cache.enqueue_deref(&second);
    assert_eq!(h.cache.deref_state(), DerefState::Armed);

    let guard = h.cache.lock_domains(&[ObjectKey(1)]);
    let outcome = h.cache.drain_deref_queue(&[ObjectKey(1)]);
    drop(guard);

    assert_eq!(outcome, DrainOutcome::Interrupted { processed: 1 });
    assert!(first.is_cached());
    assert_eq!(second.ref_count(), 1);
    assert_eq!(h.cache.pending_derefs(), 1);
    assert_eq!(h.cache.stats().requeued_derefs, 1);
    // the worker was already armed by the enqueue; no second firing
    assert_eq!(h.scheduler.pending(), 1);

    // the worker holds nothing, so it may wait for domain 2
    assert_eq!(h.scheduler.fire_all(), 1);
    assert!(second.is_cached());
    assert_eq!(h.cache.deref_state(), DerefState::Idle);
}

#[test]
fn test_busy_head_item_stops_pass_immediately() {
    let h = Harness::with_domains(
        CacheConfig::with_capacity(8),
        Arc::new(FlakyDomains::refusing(16, &[DomainId(2)])),
    );
    let second = h.object(2);
    let first = h.object(1);
    h.cache.enqueue_deref(&second);
    h.cache.enqueue_deref(&first);

    let guard = h.cache.lock_domains(&[ObjectKey(1)]);
    let outcome = h.cache.drain_deref_queue(&[ObjectKey(1)]);
    drop(guard);

    assert_eq!(outcome, DrainOutcome::Interrupted { processed: 0 });
    assert_eq!(h.cache.pending_derefs(), 2);
    assert_eq!(first.ref_count(), 1);
}

#[test]
fn test_linked_item_requeued_by_worker() {
    let h = Harness::with_domains(
        CacheConfig::with_capacity(8),
        Arc::new(FlakyDomains::refusing(16, &[DomainId(2)])),
    );
    let child = h
        .cache
        .create_object(ObjectDesc::new(ObjectKey(17)).with_parent(ObjectKey(2)), 17)
        .unwrap();
    h.cache.enqueue_deref(&child);

    assert_eq!(h.scheduler.pending(), 1);

    // domain 1 is taken blocking, domain 2 only tried; the pending firing
    // stays the only one
    assert_eq!(
        h.cache.run_deref_worker(),
        DrainOutcome::Interrupted { processed: 0 }
    );
    assert_eq!(h.cache.deref_state(), DerefState::Armed);
    assert_eq!(h.cache.pending_derefs(), 1);
    assert_eq!(child.ref_count(), 1);
    assert_eq!(h.scheduler.pending(), 1);

    // the firing owns the worker and re-arms it once
    assert!(h.scheduler.fire_next());
    assert_eq!(h.cache.deref_state(), DerefState::Armed);
    assert_eq!(h.scheduler.pending(), 1);
    assert_eq!(h.cache.stats().rearms, 1);
    assert_eq!(h.cache.pending_derefs(), 1);
}
