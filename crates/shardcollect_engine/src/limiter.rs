//! Capacity-bounded submission onto the shared worker pool.
//!
//! Capacity is recomputed at every decision point from the pool's idle
//! workers and the processor count. When there is no capacity, or the pool
//! rejects the task, the work runs on the calling thread: overload degrades
//! to serialized execution instead of failing the query.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use shardcollect_common::config::WorkerConfig;
use shardcollect_common::error::CollectResult;

use crate::load::{task, TaskHandle};
use crate::worker_pool::{Task, WorkerPool};

/// Snapshot of limiter counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimiterMetrics {
    /// Units of work handed to `submit`.
    pub submitted: u64,
    /// Units that ran on the calling thread (no capacity or rejected).
    pub executed_inline: u64,
    /// Units the pool refused because its queue was full.
    pub rejected: u64,
}

pub struct ConcurrencyLimiter {
    pool: Option<Arc<WorkerPool>>,
    processors: usize,
    submitted: AtomicU64,
    executed_inline: AtomicU64,
    rejected: AtomicU64,
}

impl ConcurrencyLimiter {
    pub fn new(pool: Arc<WorkerPool>, processors: usize) -> Self {
        Self {
            pool: Some(pool),
            processors: processors.max(1),
            submitted: AtomicU64::new(0),
            executed_inline: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// A limiter without a pool: capacity is always 0 and every unit of work
    /// runs on the caller's thread.
    pub fn direct() -> Self {
        Self {
            pool: None,
            processors: 1,
            submitted: AtomicU64::new(0),
            executed_inline: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Build the shared pool described by `config` and wrap it.
    pub fn from_config(config: &WorkerConfig) -> CollectResult<Self> {
        let pool = WorkerPool::new("collect-worker", config.threads, config.queue_capacity)?;
        Ok(Self::new(pool, config.effective_processors()))
    }

    pub fn pool(&self) -> Option<&Arc<WorkerPool>> {
        self.pool.as_ref()
    }

    /// Number of units that may run concurrently right now. Never cached.
    pub fn available_capacity(&self) -> usize {
        match &self.pool {
            // Work submitted from a worker would wait on its own pool.
            Some(pool) if !pool.is_worker_thread() => pool.idle_workers().min(self.processors),
            _ => 0,
        }
    }

    /// Run `work` on the pool, or inline when there is no capacity or the
    /// pool rejects it. The returned handle completes with its result.
    pub fn submit<T, F>(&self, work: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> CollectResult<T> + Send + 'static,
    {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        let (completer, handle) = task();
        let job: Task = Box::new(move || completer.complete(work()));

        let pool = match &self.pool {
            Some(pool) if self.available_capacity() > 0 => pool,
            _ => {
                self.executed_inline.fetch_add(1, Ordering::Relaxed);
                job();
                return handle;
            }
        };
        if let Err(job) = pool.try_submit(job) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            self.executed_inline.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                pool = pool.name(),
                queued = pool.queued_tasks(),
                "worker pool rejected load, executing on caller thread"
            );
            job();
        }
        handle
    }

    pub fn metrics(&self) -> LimiterMetrics {
        LimiterMetrics {
            submitted: self.submitted.load(Ordering::Relaxed),
            executed_inline: self.executed_inline.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("pool", &self.pool)
            .field("processors", &self.processors)
            .finish()
    }
}
