//! Fixed-size worker pool with a bounded queue.
//!
//! The pool is shared by every query running on the node; the collect engine
//! submits per-source loads to it but never owns it. A full queue rejects the
//! submission and hands the task back so the caller can run it itself.

use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use shardcollect_common::error::{CollectError, CollectResult};

/// Unit of work accepted by the pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Id of the pool owning the current thread; 0 for foreign threads.
    static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

struct PoolInner {
    id: usize,
    queue: Mutex<VecDeque<Task>>,
    cv: Condvar,
    capacity: usize,
    /// Workers not currently running a task.
    idle: AtomicUsize,
    shutdown: AtomicBool,
}

pub struct WorkerPool {
    name: String,
    threads: usize,
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `threads` named workers. A `queue_capacity` of 0 makes every
    /// submission a rejection.
    pub fn new(name: &str, threads: usize, queue_capacity: usize) -> CollectResult<Arc<Self>> {
        if threads == 0 {
            return Err(CollectError::InvalidArgument(format!(
                "worker pool '{name}' needs at least one thread"
            )));
        }
        let inner = Arc::new(PoolInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            queue: Mutex::new(VecDeque::with_capacity(queue_capacity.min(1024))),
            cv: Condvar::new(),
            capacity: queue_capacity,
            idle: AtomicUsize::new(threads),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let worker_inner = Arc::clone(&inner);
            let spawned = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(worker_inner));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    inner.shutdown.store(true, Ordering::Release);
                    inner.cv.notify_all();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(CollectError::Internal(format!(
                        "failed to spawn worker '{name}-{i}': {e}"
                    )));
                }
            }
        }

        tracing::debug!(pool = name, threads, queue_capacity, "worker pool started");
        Ok(Arc::new(Self {
            name: name.to_owned(),
            threads,
            inner,
            workers: Mutex::new(workers),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Enqueue `task`, or hand it back when the queue is full or the pool
    /// is shutting down.
    pub fn try_submit(&self, task: Task) -> Result<(), Task> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(task);
        }
        let mut queue = self.inner.queue.lock();
        if queue.len() >= self.inner.capacity {
            return Err(task);
        }
        queue.push_back(task);
        drop(queue);
        self.inner.cv.notify_one();
        Ok(())
    }

    /// Workers that could pick up a new task right now: idle workers not
    /// already spoken for by queued tasks.
    pub fn idle_workers(&self) -> usize {
        let queued = self.inner.queue.lock().len();
        self.inner.idle.load(Ordering::Acquire).saturating_sub(queued)
    }

    pub fn queued_tasks(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Whether the calling thread is one of this pool's workers.
    pub fn is_worker_thread(&self) -> bool {
        CURRENT_POOL.with(|id| id.get() == self.inner.id)
    }

    /// Stop accepting work, drop queued tasks and join the workers.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped: Vec<Task> = self.inner.queue.lock().drain(..).collect();
        self.inner.cv.notify_all();
        if !dropped.is_empty() {
            tracing::debug!(pool = %self.name, dropped = dropped.len(), "dropping queued tasks on shutdown");
        }
        drop(dropped);

        let handles = std::mem::take(&mut *self.workers.lock());
        if self.is_worker_thread() {
            // A worker cannot join itself; the threads exit on their own.
            return;
        }
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("threads", &self.threads)
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    CURRENT_POOL.with(|id| id.set(inner.id));
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(task) = queue.pop_front() {
                    inner.idle.fetch_sub(1, Ordering::AcqRel);
                    break task;
                }
                inner.cv.wait(&mut queue);
            }
        };
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::warn!("worker task panicked");
        }
        inner.idle.fetch_add(1, Ordering::AcqRel);
    }
}
