//! kcb-cache property tests
//!
//! Random single-threaded traffic driven through the manual scheduler, with
//! the table checked against its members after every step.

mod common;

use common::Harness;
use kcb_cache::{CacheConfig, ObjectKey};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Reference(usize),
    Release(usize),
    EnqueueDeref(usize),
    FireNext,
    ArmCloseWorker,
    RunCloseWorker,
    RunDerefWorker,
}

fn op_strategy(objects: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..objects).prop_map(Op::Reference),
        3 => (0..objects).prop_map(Op::Release),
        2 => (0..objects).prop_map(Op::EnqueueDeref),
        2 => Just(Op::FireNext),
        1 => Just(Op::ArmCloseWorker),
        1 => Just(Op::RunCloseWorker),
        1 => Just(Op::RunDerefWorker),
    ]
}

fn fire_until_quiet(h: &Harness) {
    while h.scheduler.fire_all() > 0 {}
}

// ============================================================================
// Table invariants under random traffic
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_random_traffic_keeps_table_consistent(
        capacity in 1u32..8,
        ops in prop::collection::vec(op_strategy(12), 1..200),
    ) {
        let h = Harness::new(capacity);
        let objects: Vec<_> = (0..12u32).map(|k| h.object(k)).collect();
        // references owned by the test, per object
        let mut held = vec![1u32; objects.len()];

        for op in ops {
            match op {
                Op::Reference(i) => {
                    if !objects[i].is_destroyed() {
                        h.cache.reference(&objects[i]).unwrap();
                        held[i] += 1;
                    }
                }
                Op::Release(i) => {
                    if held[i] > 0 {
                        h.cache.release(&objects[i]).unwrap();
                        held[i] -= 1;
                    }
                }
                Op::EnqueueDeref(i) => {
                    if held[i] > 0 {
                        h.cache.enqueue_deref(&objects[i]);
                        held[i] -= 1;
                    }
                }
                Op::FireNext => {
                    h.scheduler.fire_next();
                }
                Op::ArmCloseWorker => {
                    h.cache.arm_close_worker();
                }
                Op::RunCloseWorker => {
                    h.cache.run_close_worker();
                }
                Op::RunDerefWorker => {
                    h.cache.run_deref_worker();
                }
            }

            // at most one pending firing per worker
            prop_assert!(h.scheduler.pending() <= 2);
            prop_assert!(h.cache.check_consistency().is_ok());
            for (object, &mine) in objects.iter().zip(&held) {
                prop_assert!(object.ref_count() >= mine);
                prop_assert!(!(object.is_cached() && object.ref_count() > 0));
                prop_assert_eq!(object.is_cached(), object.in_delay_close());
            }
        }

        fire_until_quiet(&h);

        prop_assert_eq!(h.cache.pending_derefs(), 0);
        prop_assert!(h.cache.current_size() <= capacity);
        prop_assert!(h.cache.check_consistency().is_ok());
        for (object, &mine) in objects.iter().zip(&held) {
            prop_assert_eq!(object.ref_count(), mine);
            if object.is_destroyed() {
                prop_assert_eq!(mine, 0);
                prop_assert!(!object.is_cached());
            }
            if mine == 0 && !object.is_destroyed() {
                prop_assert!(object.is_cached());
            }
        }
        let stats = h.cache.stats();
        prop_assert_eq!(stats.destroyed as usize, h.recorder.destroyed().len());
        prop_assert_eq!(stats.leaked_references, 0);
    }

    #[test]
    fn test_sequential_adds_trimmed_to_capacity(capacity in 1u32..16, extra in 1u32..24) {
        let total = capacity + extra;
        let h = Harness::with_config(CacheConfig {
            max_entries: Some(total + 1),
            ..CacheConfig::with_capacity(capacity)
        });
        let _objects: Vec<_> = (0..total).map(|k| h.idle(k)).collect();
        prop_assert_eq!(h.cache.current_size(), total);

        fire_until_quiet(&h);

        prop_assert_eq!(h.cache.current_size(), capacity);
        let oldest: Vec<ObjectKey> = (0..extra).map(ObjectKey).collect();
        prop_assert_eq!(h.recorder.destroyed(), oldest);
        let newest: Vec<ObjectKey> = (extra..total).map(ObjectKey).collect();
        prop_assert_eq!(h.cache.lru_keys(), newest);
    }

    #[test]
    fn test_repeated_arm_single_firing(arms in 1usize..32) {
        let h = Harness::new(4);
        let armed = (0..arms).filter(|_| h.cache.arm_close_worker()).count();
        let deref_armed = (0..arms).filter(|_| h.cache.arm_deref_worker()).count();
        prop_assert_eq!(armed, 1);
        prop_assert_eq!(deref_armed, 1);
        prop_assert_eq!(h.scheduler.pending(), 2);
    }

    #[test]
    fn test_enqueue_above_one_never_queues(extra in 1u32..64) {
        let h = Harness::new(4);
        let object = h.object(1);
        for _ in 0..extra {
            h.cache.reference(&object).unwrap();
        }
        for _ in 0..extra {
            h.cache.enqueue_deref(&object);
        }
        prop_assert_eq!(h.cache.pending_derefs(), 0);
        prop_assert_eq!(h.scheduler.pending(), 0);
        prop_assert_eq!(object.ref_count(), 1);
        prop_assert_eq!(h.cache.stats().inline_derefs, u64::from(extra));
    }

    #[test]
    fn test_config_env_capacity(capacity in 1u32..=kcb_cache::MAX_CAPACITY) {
        let value = capacity.to_string();
        let config = CacheConfig::default()
            .with_overrides("KCB", [("KCB_CAPACITY", value.as_str())])
            .unwrap();
        prop_assert_eq!(config.capacity, capacity);
        prop_assert!(config.validate().is_ok());
    }
}
