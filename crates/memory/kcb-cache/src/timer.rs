//! Worker scheduling
//!
//! Each worker is armed through a single-shot timer. When the timer fires the
//! job is handed to a general-purpose worker; it never runs on the timer's own
//! context. Arming is idempotent at the manager level (worker states), so a
//! scheduler only needs to run each job it is given once.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::error::{CacheError, CacheResult};

/// Deferred unit of work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs after a delay
pub trait Scheduler: Send + Sync {
    /// Run `job` once, no earlier than `delay` from now
    fn schedule(&self, delay: Duration, job: Job);
}

/// Scheduler backed by a tokio runtime
///
/// The delay is a `tokio::time::sleep`; the job then runs on the blocking
/// pool since workers take lock domains that may block.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Scheduler on an explicit runtime
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler on the runtime of the calling context
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when called outside a tokio runtime
    pub fn current() -> CacheResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| CacheError::invalid_config(format!("no tokio runtime for the default scheduler: {e}")))
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, job: Job) {
        let handle = self.handle.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = handle.spawn_blocking(job).await {
                log::error!("cache worker job failed: {e}");
            }
        });
    }
}

/// Scheduler that only runs jobs when told to
///
/// Tests and embedders that drive maintenance from their own loop fire the
/// pending jobs explicitly.
#[derive(Default)]
pub struct ManualScheduler {
    pending: Mutex<VecDeque<(Duration, Job)>>,
    last_delay: Mutex<Option<Duration>>,
}

impl ManualScheduler {
    /// Scheduler with nothing pending
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs scheduled and not yet fired
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Delay requested by the most recent `schedule` call
    pub fn last_delay(&self) -> Option<Duration> {
        *self.last_delay.lock()
    }

    /// Run the oldest pending job on the calling thread
    pub fn fire_next(&self) -> bool {
        // popped before running: the job may schedule again
        let next = self.pending.lock().pop_front();
        match next {
            Some((_, job)) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run the jobs pending right now; returns how many ran
    ///
    /// Jobs scheduled by those jobs stay pending.
    pub fn fire_all(&self) -> usize {
        let batch: Vec<_> = self.pending.lock().drain(..).collect();
        let fired = batch.len();
        for (_, job) in batch {
            job();
        }
        fired
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, job: Job) {
        *self.last_delay.lock() = Some(delay);
        self.pending.lock().push_back((delay, job));
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending())
            .field("last_delay", &self.last_delay())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_manual_fires_in_order() {
        let scheduler = ManualScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            scheduler.schedule(Duration::from_millis(i), Box::new(move || log.lock().push(i)));
        }
        assert_eq!(scheduler.pending(), 3);
        assert_eq!(scheduler.last_delay(), Some(Duration::from_millis(2)));
        assert!(scheduler.fire_next());
        assert_eq!(scheduler.fire_all(), 2);
        assert!(!scheduler.fire_next());
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_fire_all_leaves_rescheduled_jobs() {
        let scheduler = Arc::new(ManualScheduler::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let job = {
            let scheduler = Arc::clone(&scheduler);
            let runs = Arc::clone(&runs);
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
                let runs = Arc::clone(&runs);
                scheduler.schedule(
                    Duration::ZERO,
                    Box::new(move || {
                        runs.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }
        };
        scheduler.schedule(Duration::ZERO, Box::new(job));
        assert_eq!(scheduler.fire_all(), 1);
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.fire_all(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_current_outside_runtime() {
        assert!(matches!(TokioScheduler::current(), Err(CacheError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_tokio_scheduler_runs_job() {
        let scheduler = TokioScheduler::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler.schedule(
            Duration::from_millis(5),
            Box::new(move || {
                let _ = tx.send(std::thread::current().id());
            }),
        );
        let worker = rx.await.unwrap();
        assert_ne!(worker, std::thread::current().id());
    }
}
