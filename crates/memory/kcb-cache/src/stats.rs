//! Cache statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time view of the cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Objects currently in the delayed-close table
    pub current_size: u32,
    /// Configured capacity
    pub capacity: u32,
    /// Deferred dereferences waiting in the queue
    pub pending_derefs: u64,

    /// Objects added to the table
    pub adds: u64,
    /// Objects removed by clients (re-acquired, deleted, purged)
    pub removes: u64,
    /// Objects evicted and destroyed by the close worker
    pub evictions: u64,
    /// Evicted entries put back because the object was referenced again
    pub reinsertions: u64,
    /// Eviction attempts abandoned after losing a race or a lock
    pub abandoned_attempts: u64,
    /// Objects destroyed without caching because no entry was available
    pub immediate_destroys: u64,
    /// Objects destroyed in total
    pub destroyed: u64,

    /// Deferred dereferences completed inline
    pub inline_derefs: u64,
    /// Deferred dereferences queued
    pub queued_derefs: u64,
    /// Queued dereferences processed
    pub processed_derefs: u64,
    /// Items pushed back to the queue head after a lock conflict
    pub requeued_derefs: u64,
    /// References leaked because the queue was full
    pub leaked_references: u64,

    /// Close worker passes
    pub close_worker_runs: u64,
    /// Deref worker passes
    pub deref_worker_runs: u64,
    /// Timer re-arms after an unfinished pass
    pub rearms: u64,
}

impl CacheStats {
    /// How far over capacity the table is
    pub fn overflow(&self) -> u32 {
        self.current_size.saturating_sub(self.capacity)
    }

    /// Share of eviction attempts that succeeded
    pub fn eviction_success_rate(&self) -> f64 {
        let attempts = self.evictions + self.reinsertions + self.abandoned_attempts;
        if attempts == 0 {
            return 0.0;
        }
        self.evictions as f64 / attempts as f64
    }

    /// Share of deferred dereferences that never touched the queue
    pub fn inline_deref_rate(&self) -> f64 {
        let total = self.inline_derefs + self.queued_derefs + self.leaked_references;
        if total == 0 {
            return 0.0;
        }
        self.inline_derefs as f64 / total as f64
    }
}

/// Live counters shared by clients and workers
#[derive(Debug, Default)]
pub(crate) struct CacheMetrics {
    pub(crate) adds: AtomicU64,
    pub(crate) removes: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) reinsertions: AtomicU64,
    pub(crate) abandoned_attempts: AtomicU64,
    pub(crate) immediate_destroys: AtomicU64,
    pub(crate) destroyed: AtomicU64,
    pub(crate) inline_derefs: AtomicU64,
    pub(crate) queued_derefs: AtomicU64,
    pub(crate) processed_derefs: AtomicU64,
    pub(crate) requeued_derefs: AtomicU64,
    pub(crate) leaked_references: AtomicU64,
    pub(crate) close_worker_runs: AtomicU64,
    pub(crate) deref_worker_runs: AtomicU64,
    pub(crate) rearms: AtomicU64,
}

impl CacheMetrics {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, current_size: u32, capacity: u32, pending_derefs: u64) -> CacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            current_size,
            capacity,
            pending_derefs,
            adds: load(&self.adds),
            removes: load(&self.removes),
            evictions: load(&self.evictions),
            reinsertions: load(&self.reinsertions),
            abandoned_attempts: load(&self.abandoned_attempts),
            immediate_destroys: load(&self.immediate_destroys),
            destroyed: load(&self.destroyed),
            inline_derefs: load(&self.inline_derefs),
            queued_derefs: load(&self.queued_derefs),
            processed_derefs: load(&self.processed_derefs),
            requeued_derefs: load(&self.requeued_derefs),
            leaked_references: load(&self.leaked_references),
            close_worker_runs: load(&self.close_worker_runs),
            deref_worker_runs: load(&self.deref_worker_runs),
            rearms: load(&self.rearms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.eviction_success_rate(), 0.0);
        assert_eq!(stats.inline_deref_rate(), 0.0);
    }

    #[test]
    fn test_snapshot_reads_counters() {
        let metrics = CacheMetrics::default();
        CacheMetrics::bump(&metrics.evictions);
        CacheMetrics::bump(&metrics.evictions);
        CacheMetrics::bump(&metrics.abandoned_attempts);
        let stats = metrics.snapshot(10, 8, 3);
        assert_eq!(stats.evictions, 2);
        assert_eq!(stats.overflow(), 2);
        assert_eq!(stats.pending_derefs, 3);
        assert!((stats.eviction_success_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = CacheStats {
            adds: 5,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"adds\":5"));
    }
}
