//! Elastic worker pool for blocking task bodies.
//!
//! The pool runs the bodies handed to [`Task::run_in_thread`] and its
//! variants. It keeps a small base of workers and, when every one of them
//! is stuck on a long-running body, lets a manager thread raise the ceiling
//! so queued work still makes progress — one extra thread at a time, with
//! an exponentially growing patience interval so a burst of genuinely slow
//! work does not balloon the thread count. Overflow workers retire after
//! their task when the pool is over its base size again.
//!
//! Queue order is not plain FIFO: tasks submitted from inside a worker
//! (which could otherwise deadlock the pool) run first, then tasks whose
//! token already fired (so they fail fast), then by priority, FIFO within a
//! priority. Cancelling a running-or-queued task's token moves it to the
//! front.
//!
//! # Shutdown
//!
//! Dropping the owning [`ThreadPool`] shuts the pool down: queued tasks
//! that never started are completed as-is (their propagate will report the
//! submission failure or cancellation), and workers exit once idle.
//! Submissions after shutdown are refused.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::task::Task;

/// Tuning knobs for a [`ThreadPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers kept warm; the pool never shrinks below this.
    pub base_size: usize,
    /// Hard ceiling the elastic growth will not cross.
    pub max_pool_size: usize,
    /// Initial patience before concluding the pool is saturated.
    pub wait_time_base: Duration,
    /// Patience growth factor applied per task admitted over base load.
    pub wait_time_multiplier: f64,
    /// Prefix for worker thread names.
    pub thread_name_prefix: &'static str,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_size: 10,
            max_pool_size: 330,
            wait_time_base: Duration::from_millis(100),
            wait_time_multiplier: 1.03,
            thread_name_prefix: "cotask",
        }
    }
}

struct QueuedTask {
    task: Task,
    /// Ordering captured at submission; later flag changes do not re-sort
    /// (a cancelled token instead moves the entry to the front).
    key: SortKey,
}

/// Ascending sort key; smaller runs first. Recursive submissions first,
/// then already-cancelled tasks, then priority, then submission order.
type SortKey = (bool, bool, i32, u64);

fn sort_key(task: &Task, seq: u64) -> SortKey {
    let (blocking, cancelled, priority) = task.pool_sort_key();
    (!blocking, !cancelled, priority, seq)
}

struct PoolShared {
    queue: VecDeque<QueuedTask>,
    /// Threads alive (idle or busy).
    live_threads: usize,
    /// Task bodies currently executing.
    running: usize,
    /// Current allowed thread count; starts at base, raised by the
    /// manager under saturation, lowered back as overflow tasks retire.
    ceiling: usize,
    /// Current saturation patience.
    wait_time: Duration,
    /// When armed, the instant after which the manager declares
    /// saturation and raises the ceiling.
    saturation_deadline: Option<Instant>,
    shutdown: bool,
    next_seq: u64,
}

struct PoolInner {
    config: PoolConfig,
    shared: Mutex<PoolShared>,
    /// Wakes idle workers.
    work_cond: Condvar,
    /// Wakes the manager (deadline re-arm, shutdown).
    mgr_cond: Condvar,
    join_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable submission handle; does not keep the pool alive for shutdown
/// purposes.
#[derive(Clone)]
pub struct PoolHandle {
    inner: Arc<PoolInner>,
}

/// Owning side of a worker pool. Dropping it shuts the pool down and waits
/// briefly for workers to drain.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

thread_local! {
    static IS_POOL_WORKER: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// True when called from a pool worker thread (any pool).
#[must_use]
pub(crate) fn is_pool_thread() -> bool {
    IS_POOL_WORKER.with(std::cell::Cell::get)
}

static GLOBAL_POOL: OnceLock<ThreadPool> = OnceLock::new();

impl ThreadPool {
    /// Creates a pool with the given configuration. Workers are spawned
    /// lazily as work arrives.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        assert!(config.base_size >= 1, "pool base size must be at least 1");
        assert!(
            config.max_pool_size >= config.base_size,
            "pool max size must be at least the base size"
        );
        assert!(
            config.wait_time_multiplier >= 1.0,
            "wait time multiplier must not shrink the wait"
        );
        let inner = Arc::new(PoolInner {
            shared: Mutex::new(PoolShared {
                queue: VecDeque::new(),
                live_threads: 0,
                running: 0,
                ceiling: config.base_size,
                wait_time: config.wait_time_base,
                saturation_deadline: None,
                shutdown: false,
                next_seq: 0,
            }),
            work_cond: Condvar::new(),
            mgr_cond: Condvar::new(),
            join_handles: Mutex::new(Vec::new()),
            config,
        });
        let pool = Self { inner };
        pool.spawn_manager();
        pool
    }

    /// The process-wide pool used by [`Task::run_in_thread`]. Created on
    /// first use with the default configuration; never shut down.
    pub fn global() -> &'static Self {
        GLOBAL_POOL.get_or_init(|| Self::new(PoolConfig::default()))
    }

    /// A cloneable submission handle.
    #[must_use]
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Tasks queued but not yet started.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.shared.lock().queue.len()
    }

    /// Task bodies currently executing.
    #[must_use]
    pub fn running(&self) -> usize {
        self.inner.shared.lock().running
    }

    /// Threads currently alive.
    #[must_use]
    pub fn live_threads(&self) -> usize {
        self.inner.shared.lock().live_threads
    }

    /// The current thread-count ceiling.
    #[must_use]
    pub fn ceiling(&self) -> usize {
        self.inner.shared.lock().ceiling
    }

    /// Refuses further submissions and wakes everyone. Idempotent.
    pub fn shutdown(&self) {
        let mut shared = self.inner.shared.lock();
        if shared.shutdown {
            return;
        }
        shared.shutdown = true;
        tracing::debug!(queued = shared.queue.len(), "worker pool shutting down");
        drop(shared);
        self.inner.work_cond.notify_all();
        self.inner.mgr_cond.notify_all();
    }

    /// Shuts down and waits up to `timeout` for all threads to exit.
    /// Returns false if some thread was still running at the deadline.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();

        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.shared.lock().live_threads == 0 {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!("worker pool shutdown timed out with threads still running");
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }

        let handles = std::mem::take(&mut *self.inner.join_handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        true
    }

    fn spawn_manager(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(format!("{}-manager", self.inner.config.thread_name_prefix))
            .spawn(move || manager_loop(&inner))
            .expect("failed to spawn pool manager thread");
        self.inner.join_handles.lock().push(handle);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // The global pool lives as a static and is never dropped.
        self.shutdown_and_wait(Duration::from_secs(5));
    }
}

impl PoolHandle {
    /// Enqueues `task` for execution. Returns false if the pool has shut
    /// down (the caller then completes the task itself).
    pub(crate) fn submit(&self, task: Task) -> bool {
        let mut shared = self.inner.shared.lock();
        if shared.shutdown {
            return false;
        }

        let seq = shared.next_seq;
        shared.next_seq += 1;
        let key = sort_key(&task, seq);
        let at = shared.queue.partition_point(|q| q.key <= key);
        tracing::trace!(
            task = task.id(),
            position = at,
            queued = shared.queue.len() + 1,
            "task submitted to pool"
        );
        shared.queue.insert(at, QueuedTask { task, key });

        // Work queued behind a saturated pool starts the patience clock if
        // no worker armed it already.
        if shared.running >= self.inner.config.base_size && shared.saturation_deadline.is_none() {
            shared.saturation_deadline = Some(Instant::now() + shared.wait_time);
            self.inner.mgr_cond.notify_all();
        }

        let idle = shared.live_threads - shared.running;
        if shared.live_threads < shared.ceiling && idle < shared.queue.len() {
            self.spawn_worker(&mut shared);
        }
        drop(shared);
        self.inner.work_cond.notify_one();
        true
    }

    /// Moves `task_id`, if still queued, to the front of the queue.
    pub(crate) fn move_to_front(&self, task_id: u64) {
        let mut shared = self.inner.shared.lock();
        if let Some(at) = shared.queue.iter().position(|q| q.task.id() == task_id) {
            let entry = shared.queue.remove(at).unwrap();
            shared.queue.push_front(entry);
            tracing::trace!(task = task_id, "cancelled task moved to queue front");
            drop(shared);
            self.inner.work_cond.notify_one();
        }
    }

    fn spawn_worker(&self, shared: &mut PoolShared) {
        shared.live_threads += 1;
        let inner = Arc::clone(&self.inner);
        let name = format!(
            "{}-worker-{}",
            self.inner.config.thread_name_prefix, shared.live_threads
        );
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(&inner))
            .expect("failed to spawn pool worker thread");
        self.inner.join_handles.lock().push(handle);
    }
}

fn worker_loop(inner: &Arc<PoolInner>) {
    IS_POOL_WORKER.with(|flag| flag.set(true));
    let config = &inner.config;

    let mut shared = inner.shared.lock();
    loop {
        if let Some(entry) = shared.queue.pop_front() {
            shared.running += 1;

            // Patience bookkeeping for the elastic manager: the more
            // tasks are admitted past base load, the longer the manager
            // waits before adding yet another thread.
            if shared.running == config.base_size {
                shared.wait_time = config.wait_time_base;
            } else if shared.running > config.base_size
                && shared.running < config.max_pool_size
            {
                shared.wait_time = shared.wait_time.mul_f64(config.wait_time_multiplier);
            }
            if shared.running >= config.base_size {
                shared.saturation_deadline = Some(Instant::now() + shared.wait_time);
                inner.mgr_cond.notify_all();
            }

            drop(shared);
            tracing::trace!(task = entry.task.id(), "worker picked up task");
            entry.task.execute_pooled();
            shared = inner.shared.lock();

            if shared.running > config.base_size {
                // Overflow capacity is one-task-scoped: hand back the
                // slot the manager granted.
                shared.ceiling -= 1;
            } else if shared.running + shared.queue.len() < config.base_size {
                shared.saturation_deadline = None;
            }
            if shared.running > config.base_size && shared.running < config.max_pool_size {
                shared.wait_time = shared.wait_time.div_f64(config.wait_time_multiplier);
            }
            shared.running -= 1;

            if shared.live_threads > shared.ceiling {
                break;
            }
            continue;
        }

        // Queue drained: a ceiling grant nothing is left to consume (a
        // base worker beat the overflow thread to the task) is revoked,
        // and the surplus thread retires below instead of idling forever.
        let floor = config.base_size.max(shared.running);
        if shared.ceiling > floor {
            tracing::trace!(
                ceiling = shared.ceiling,
                floor,
                "revoking unconsumed overflow grant"
            );
            shared.ceiling = floor;
        }

        if shared.shutdown || shared.live_threads > shared.ceiling {
            break;
        }
        inner.work_cond.wait(&mut shared);
    }
    shared.live_threads -= 1;
    drop(shared);
    tracing::trace!("pool worker exiting");
}

fn manager_loop(inner: &Arc<PoolInner>) {
    let config = &inner.config;
    let mut shared = inner.shared.lock();
    loop {
        if shared.shutdown {
            break;
        }
        match shared.saturation_deadline {
            None => {
                inner.mgr_cond.wait(&mut shared);
            }
            Some(deadline) => {
                let timed_out = inner.mgr_cond.wait_until(&mut shared, deadline).timed_out();
                if !timed_out {
                    continue;
                }
                if shared.saturation_deadline != Some(deadline) {
                    // Re-armed while we slept; wait for the new deadline.
                    continue;
                }
                // Still saturated at the deadline: everything admitted is
                // running and more is waiting. Allow one extra thread.
                if shared.running >= shared.ceiling && !shared.queue.is_empty() {
                    shared.ceiling = (shared.running + 1).min(config.max_pool_size);
                    shared.saturation_deadline = None;
                    tracing::debug!(
                        ceiling = shared.ceiling,
                        running = shared.running,
                        queued = shared.queue.len(),
                        "pool saturated, raising thread ceiling"
                    );
                    if shared.live_threads < shared.ceiling {
                        let handle = PoolHandle {
                            inner: Arc::clone(inner),
                        };
                        handle.spawn_worker(&mut shared);
                        inner.work_cond.notify_one();
                    }
                } else {
                    shared.saturation_deadline = None;
                }
            }
        }
    }
    drop(shared);
    tracing::trace!("pool manager exiting");
}
