//! A bounded thread pool of per-worker FIFO queues.
//!
//! Unlike a work-stealing pool, tasks are *placed* by the caller: `add`
//! and `add_or_run` pick a queue by round-robin probing and either
//! enqueue there or fall through to neighbouring queues a bounded number
//! of times. There is no stealing once a task is queued — a worker only
//! ever drains its own queue. This trades load balance for a much
//! simpler (and cheaper to reason about) locking scheme: each queue has
//! its own mutex, so workers rarely contend with each other, only with
//! whichever producer is currently probing them.

use crate::atomic::AtomicCounter;
use crate::error::TaskError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    idle: bool,
    tasks: VecDeque<Task>,
}

struct Queue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

struct Inner {
    queues: Vec<Queue>,
    shutdown: AtomicBool,
    current_idx: AtomicCounter,
    num_workers: usize,
    max_retries: usize,
    queue_limit: usize,
    exceptions: Vec<Mutex<Option<TaskError>>>,
}

impl Inner {
    fn try_add(&self, idx: usize, mut task: Task, honor_limit: bool) -> Option<Task> {
        let end = idx + self.num_workers * (1 + self.max_retries);
        for i in idx..end {
            if self.shutdown.load(Ordering::SeqCst) {
                return Some(task);
            }
            let queue = &self.queues[i % self.num_workers];
            match queue.state.try_lock() {
                Ok(mut state) => {
                    if !honor_limit || state.tasks.len() < self.queue_limit {
                        state.tasks.push_back(task);
                        queue.cv.notify_all();
                        return None;
                    }
                }
                Err(_) => {}
            }
        }
        Some(task)
    }

    fn add(&self, task: Task) {
        let idx = self.current_idx.get_and_inc(1) as usize;
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.try_add(idx, task, false) {
            let queue = &self.queues[idx % self.num_workers];
            let mut state = queue.state.lock().unwrap();
            state.tasks.push_back(task);
            queue.cv.notify_all();
        }
    }

    fn add_or_run(&self, task: Task) {
        let idx = self.current_idx.get_and_inc(1) as usize;
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.try_add(idx, task, true) {
            task();
        }
    }

    fn finish(&self) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let cur_idx = self.current_idx.get_and_inc(1) as usize;
            let cur_queue = &self.queues[cur_idx % self.num_workers];
            let shutdown = &self.shutdown;
            let state = cur_queue.state.lock().unwrap();
            let state = cur_queue
                .cv
                .wait_while(state, |s| {
                    !(shutdown.load(Ordering::SeqCst) || (s.idle && s.tasks.is_empty()))
                })
                .unwrap();
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            let mut all_finished = true;
            let mut acquired: Vec<MutexGuard<'_, QueueState>> = Vec::new();
            for i in (cur_idx + 1)..(cur_idx + self.num_workers) {
                let q = &self.queues[i % self.num_workers];
                match q.state.try_lock() {
                    Ok(s) => {
                        let ready = s.idle && s.tasks.is_empty();
                        acquired.push(s);
                        if !ready {
                            all_finished = false;
                            break;
                        }
                    }
                    Err(_) => {
                        all_finished = false;
                        break;
                    }
                }
            }
            drop(acquired);
            drop(state);
            if all_finished {
                return;
            }
        }
    }
}

fn worker_loop(inner: Arc<Inner>, idx: usize) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let queue = &inner.queues[idx];
        let mut state = queue.state.lock().unwrap();
        if state.tasks.is_empty() {
            state.idle = true;
            queue.cv.notify_all();
            state = queue
                .cv
                .wait_while(state, |s| {
                    s.tasks.is_empty() && !inner.shutdown.load(Ordering::SeqCst)
                })
                .unwrap();
        }
        let task = if state.tasks.is_empty() {
            None
        } else {
            state.idle = false;
            let task = state.tasks.pop_front();
            queue.cv.notify_all();
            task
        };
        drop(state);
        if let Some(task) = task {
            task();
        }
    }));

    if let Err(payload) = result {
        let message = panic_message(&payload);
        *inner.exceptions[idx].lock().unwrap() = Some(TaskError {
            worker: idx,
            message,
        });
        inner.shutdown.store(true, Ordering::SeqCst);
    }

    // Wake anyone waiting in `finish()` on this queue so a crashed worker
    // doesn't wedge the caller forever.
    let queue = &inner.queues[idx];
    let _state = queue.state.lock().unwrap();
    queue.cv.notify_all();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked with a non-string payload".to_owned()
    }
}

/// A cheaply-cloneable reference to a running [`TaskSystem`].
///
/// Tasks that need to spawn further tasks (e.g. a directory task
/// spawning one task per child) capture a clone of this handle rather
/// than borrowing the `TaskSystem` itself, since tasks must be `'static`
/// to be queued.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<Inner>,
}

impl TaskHandle {
    /// Enqueues `task` unconditionally. Probes up to
    /// `num_workers * (1 + max_retries)` queues before forcing a blocking
    /// append to the originally selected queue. Never drops `task` unless
    /// shutdown has already been requested.
    pub fn add(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.add(Box::new(task));
    }

    /// Enqueues `task` if a queue with fewer than `queue_limit` pending
    /// tasks is found within the probe bound; otherwise runs `task`
    /// synchronously on the calling thread. Used for recursive fan-out
    /// where running inline rather than blocking is preferable to
    /// unbounded queue growth.
    pub fn add_or_run(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.add_or_run(Box::new(task));
    }
}

/// A bounded pool of worker threads draining per-worker FIFO queues.
///
/// Construct with [`TaskSystem::new`], submit work via a cloned
/// [`TaskHandle`] (see [`TaskSystem::handle`]), call [`TaskSystem::finish`]
/// once all producers are done to wait for the queues to drain, then
/// consume with [`TaskSystem::join`] to stop the workers and propagate
/// any worker panic. If the `TaskSystem` is dropped without an explicit
/// `join`, the same sequence runs anyway so workers never leak, but any
/// panic is swallowed (this only happens when the caller is already
/// unwinding from its own error).
pub struct TaskSystem {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskSystem {
    /// Spawns `num_workers` worker threads, each backed by its own FIFO
    /// queue. `max_retries` bounds how many neighbouring queues `add`/
    /// `add_or_run` will probe before giving up; `queue_limit` bounds how
    /// many pending tasks `add_or_run` will tolerate in a queue before
    /// running inline instead.
    #[must_use]
    pub fn new(num_workers: usize, max_retries: usize, queue_limit: usize) -> Self {
        let num_workers = num_workers.max(1);
        let queues = (0..num_workers)
            .map(|_| Queue {
                state: Mutex::new(QueueState {
                    idle: true,
                    tasks: VecDeque::new(),
                }),
                cv: Condvar::new(),
            })
            .collect();
        let exceptions = (0..num_workers).map(|_| Mutex::new(None)).collect();
        let inner = Arc::new(Inner {
            queues,
            shutdown: AtomicBool::new(false),
            current_idx: AtomicCounter::new(),
            num_workers,
            max_retries,
            queue_limit,
            exceptions,
        });

        let workers = (0..num_workers)
            .map(|idx| {
                let inner = Arc::clone(&inner);
                std::thread::spawn(move || worker_loop(inner, idx))
            })
            .collect();

        Self { inner, workers }
    }

    /// Returns a cloneable handle that tasks can use to submit further
    /// work to this same pool.
    #[must_use]
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Enqueues `task`. Equivalent to `self.handle().add(task)`.
    pub fn add(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.add(Box::new(task));
    }

    /// Enqueues or runs `task` inline. Equivalent to
    /// `self.handle().add_or_run(task)`.
    pub fn add_or_run(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.add_or_run(Box::new(task));
    }

    /// Blocks until every queue is simultaneously empty and its worker
    /// idle. Returns immediately if shutdown has already been requested
    /// (e.g. by a worker panic). Producers must not submit further tasks
    /// concurrently with a call to `finish` expecting them to be waited
    /// on — `finish` only observes a snapshot, it does not freeze the
    /// queues.
    pub fn finish(&self) {
        self.inner.finish();
    }

    /// True if at least one worker thread is still running.
    #[must_use]
    pub fn running(&self) -> bool {
        self.workers.iter().any(|w| !w.is_finished())
    }

    /// Requests shutdown, joins every worker, and returns the first
    /// captured worker panic (in worker-index order) if any occurred.
    /// Idempotent: safe to call more than once, or to let `Drop` call it
    /// after an explicit call already ran.
    fn shutdown(&mut self) -> Result<(), TaskError> {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        for queue in &self.inner.queues {
            let _state = queue.state.lock().unwrap();
            queue.cv.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        for slot in &self.inner.exceptions {
            if let Some(err) = slot.lock().unwrap().take() {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Waits for the queues to drain ([`TaskSystem::finish`]), then stops
    /// the pool and propagates the first worker panic, if any. This is
    /// the normal way to retire a `TaskSystem` at the end of a phase.
    pub fn join(mut self) -> Result<(), TaskError> {
        self.finish();
        self.shutdown()
    }
}

impl Drop for TaskSystem {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.finish();
            let _ = self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TaskSystem;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn all_tasks_run_exactly_once() {
        let ts = TaskSystem::new(4, 4, 32);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..500 {
            let counter = Arc::clone(&counter);
            ts.add(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        ts.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 500);
    }

    #[test]
    fn recursive_fan_out_via_handle() {
        let ts = TaskSystem::new(4, 4, 32);
        let counter = Arc::new(AtomicUsize::new(0));

        fn spawn_children(handle: super::TaskHandle, counter: Arc<AtomicUsize>, depth: usize) {
            counter.fetch_add(1, Ordering::SeqCst);
            if depth == 0 {
                return;
            }
            for _ in 0..3 {
                let handle2 = handle.clone();
                let counter2 = Arc::clone(&counter);
                handle.add_or_run(move || spawn_children(handle2, counter2, depth - 1));
            }
        }

        spawn_children(ts.handle(), Arc::clone(&counter), 3);
        ts.join().unwrap();
        // 1 + 3 + 9 + 27
        assert_eq!(counter.load(Ordering::SeqCst), 40);
    }

    #[test]
    fn finish_returns_when_queues_drain_then_pool_can_be_reused() {
        let ts = TaskSystem::new(2, 2, 8);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            ts.add(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        ts.finish();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            ts.add(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        ts.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 40);
    }

    #[test]
    fn panicking_task_is_propagated_from_join() {
        let ts = TaskSystem::new(2, 2, 8);
        ts.add(|| panic!("boom"));
        let result = ts.join();
        assert!(result.is_err());
        assert!(result.unwrap_err().message.contains("boom"));
    }

    #[test]
    fn add_or_run_runs_inline_under_heavy_backlog() {
        let ts = TaskSystem::new(1, 0, 1);
        let counter = Arc::new(AtomicUsize::new(0));
        // Single worker, zero retries, queue_limit 1: quickly saturates,
        // forcing later submissions to run synchronously on this thread.
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            ts.add_or_run(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        ts.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }
}
