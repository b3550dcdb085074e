//! Completion handles for asynchronous batch loads.
//!
//! A `TaskHandle<T>` is the consumer side of one unit of work: it is pending
//! until the producing `TaskCompleter<T>` delivers a result, then it is either
//! succeeded or failed. Handles never block a worker thread: callers either
//! `wait()` on their own thread or register a completion callback.
//!
//! Cancellation is "discard on arrival": `discard()` drops the value as soon
//! as it exists instead of interrupting whoever produces it.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use shardcollect_common::error::{CollectError, CollectResult};

// ── Handles ─────────────────────────────────────────────────────────────────

/// Completion signal of `BatchIterator::load_next_batch`.
pub type BatchLoad = TaskHandle<()>;

type Callback = Box<dyn FnOnce(CollectResult<()>) + Send>;

/// Externally observable state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Succeeded,
    Failed,
}

struct Inner<T> {
    /// `Some` once completed, until taken or discarded.
    value: Option<CollectResult<T>>,
    /// Unit outcome, kept after the value itself is taken.
    outcome: Option<CollectResult<()>>,
    discarded: bool,
    callbacks: Vec<Callback>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    done: Condvar,
}

/// Consumer side of a unit of work.
pub struct TaskHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Producer side of a unit of work. Dropping it without completing fails the
/// handle, so a panicking task still releases its waiters.
pub struct TaskCompleter<T> {
    shared: Option<Arc<Shared<T>>>,
}

/// Create a connected completer/handle pair.
pub fn task<T>() -> (TaskCompleter<T>, TaskHandle<T>) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            value: None,
            outcome: None,
            discarded: false,
            callbacks: Vec::new(),
        }),
        done: Condvar::new(),
    });
    (
        TaskCompleter {
            shared: Some(Arc::clone(&shared)),
        },
        TaskHandle { shared },
    )
}

// ── Completion ──────────────────────────────────────────────────────────────

fn unit_outcome<T>(result: &CollectResult<T>) -> CollectResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) => Err(e.clone()),
    }
}

impl<T> TaskCompleter<T> {
    pub fn complete(mut self, result: CollectResult<T>) {
        if let Some(shared) = self.shared.take() {
            deliver(&shared, result);
        }
    }
}

impl<T> Drop for TaskCompleter<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            deliver(
                &shared,
                Err(CollectError::internal_bug(
                    "E-TASK-001",
                    "task dropped before completing",
                    "the producing closure panicked or was discarded by its executor",
                )),
            );
        }
    }
}

fn deliver<T>(shared: &Shared<T>, result: CollectResult<T>) {
    let outcome = unit_outcome(&result);
    let callbacks = {
        let mut inner = shared.inner.lock();
        inner.outcome = Some(outcome.clone());
        if !inner.discarded {
            inner.value = Some(result);
        }
        std::mem::take(&mut inner.callbacks)
    };
    shared.done.notify_all();
    for callback in callbacks {
        callback(outcome.clone());
    }
}

// ── Waiting and callbacks ───────────────────────────────────────────────────

impl<T> TaskHandle<T> {
    /// A handle that is already complete.
    pub fn ready(result: CollectResult<T>) -> Self {
        let (completer, handle) = task();
        completer.complete(result);
        handle
    }

    pub fn status(&self) -> TaskStatus {
        match &self.shared.inner.lock().outcome {
            None => TaskStatus::Pending,
            Some(Ok(())) => TaskStatus::Succeeded,
            Some(Err(_)) => TaskStatus::Failed,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status() != TaskStatus::Pending
    }

    /// Block the calling thread until the task completes.
    pub fn wait(&self) -> CollectResult<()> {
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(outcome) = &inner.outcome {
                return outcome.clone();
            }
            self.shared.done.wait(&mut inner);
        }
    }

    /// Take the produced value. `None` while pending, after a previous take,
    /// or after `discard()`.
    pub fn take(&self) -> Option<CollectResult<T>> {
        self.shared.inner.lock().value.take()
    }

    /// Wait for completion and take the value.
    pub fn join(&self) -> CollectResult<T> {
        self.wait()?;
        self.take().unwrap_or_else(|| {
            Err(CollectError::internal_bug(
                "E-TASK-002",
                "task result already taken",
                "join() called on a handle whose value was consumed or discarded",
            ))
        })
    }

    /// Drop the result now if it already arrived, otherwise as soon as it does.
    pub fn discard(&self) {
        let value = {
            let mut inner = self.shared.inner.lock();
            inner.discarded = true;
            inner.value.take()
        };
        drop(value);
    }

    /// Run `callback` with the unit outcome once the task completes. Runs
    /// immediately on the calling thread when already complete.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(CollectResult<()>) + Send + 'static,
    {
        let outcome = {
            let mut inner = self.shared.inner.lock();
            match &inner.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    inner.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(outcome);
    }

    /// A unit signal that completes together with this task.
    pub fn signal(&self) -> BatchLoad
    where
        T: Send + 'static,
    {
        let (completer, signal) = task();
        self.on_complete(move |outcome| completer.complete(outcome));
        signal
    }
}

// ── Batch loads ─────────────────────────────────────────────────────────────

impl TaskHandle<()> {
    pub fn completed() -> Self {
        Self::ready(Ok(()))
    }

    pub fn failed(err: CollectError) -> Self {
        Self::ready(Err(err))
    }

    /// Completes once every input completes; the first failure fails the
    /// composite immediately.
    pub fn all(loads: Vec<BatchLoad>) -> BatchLoad {
        if loads.is_empty() {
            return Self::completed();
        }
        let (completer, composite) = task();
        let state = Arc::new(Mutex::new((loads.len(), Some(completer))));
        for load in loads {
            let state = Arc::clone(&state);
            load.on_complete(move |outcome| {
                let finished = {
                    let mut guard = state.lock();
                    match outcome {
                        Err(e) => guard.1.take().map(|c| (c, Err(e))),
                        Ok(()) => {
                            guard.0 -= 1;
                            if guard.0 == 0 {
                                guard.1.take().map(|c| (c, Ok(())))
                            } else {
                                None
                            }
                        }
                    }
                };
                if let Some((completer, result)) = finished {
                    completer.complete(result);
                }
            });
        }
        composite
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_ready_handle_states() {
        assert_eq!(BatchLoad::completed().status(), TaskStatus::Succeeded);
        let failed = BatchLoad::failed(CollectError::Internal("x".into()));
        assert_eq!(failed.status(), TaskStatus::Failed);
        assert!(failed.wait().is_err());
    }

    #[test]
    fn test_wait_blocks_until_completed_on_other_thread() {
        let (completer, handle) = task::<u32>();
        assert_eq!(handle.status(), TaskStatus::Pending);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            completer.complete(Ok(7));
        });
        assert_eq!(handle.join().unwrap(), 7);
        t.join().unwrap();
        assert!(handle.take().is_none(), "value is taken only once");
    }

    #[test]
    fn test_dropped_completer_fails_handle() {
        let (completer, handle) = task::<u32>();
        drop(completer);
        let err = handle.wait().unwrap_err();
        assert!(err.is_internal_bug());
    }

    #[test]
    fn test_discard_drops_value_on_arrival() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let drops = Arc::new(AtomicUsize::new(0));
        let (completer, handle) = task::<Tracked>();
        handle.discard();
        completer.complete(Ok(Tracked(Arc::clone(&drops))));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(handle.is_done());
        assert!(handle.take().is_none());
    }

    #[test]
    fn test_callbacks_run_on_completion_and_immediately_when_done() {
        let hits = Arc::new(AtomicUsize::new(0));
        let (completer, handle) = task::<()>();
        let h = Arc::clone(&hits);
        handle.on_complete(move |r| {
            assert!(r.is_ok());
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        completer.complete(Ok(()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = Arc::clone(&hits);
        handle.on_complete(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_all_waits_for_every_input() {
        let (c1, h1) = task::<()>();
        let (c2, h2) = task::<()>();
        let all = BatchLoad::all(vec![h1, h2]);
        c1.complete(Ok(()));
        assert!(!all.is_done());
        c2.complete(Ok(()));
        assert_eq!(all.status(), TaskStatus::Succeeded);
    }

    #[test]
    fn test_all_short_circuits_on_first_failure() {
        let (c1, h1) = task::<()>();
        let (_c2, h2) = task::<()>();
        let all = BatchLoad::all(vec![h1, h2]);
        c1.complete(Err(CollectError::Internal("shard gone".into())));
        assert_eq!(all.status(), TaskStatus::Failed);
        assert!(all.wait().unwrap_err().to_string().contains("shard gone"));
    }

    #[test]
    fn test_signal_mirrors_outcome_without_taking_value() {
        let (completer, handle) = task::<Vec<u8>>();
        let signal = handle.signal();
        completer.complete(Ok(vec![1, 2]));
        assert!(signal.wait().is_ok());
        assert_eq!(handle.take().unwrap().unwrap(), vec![1, 2]);
    }
}
