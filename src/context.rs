//! The single-threaded cooperative execution context.
//!
//! A [`Context`] owns the completion side of every task created under it:
//! whatever thread produced a task's result, the completion callback runs
//! while that context is the thread default, during one of its iterations.
//!
//! This module deliberately implements only the three capabilities the
//! task core needs from an event loop:
//!
//! - schedule a closure to run in a future iteration ([`Context::invoke`])
//! - report whether the calling thread is currently inside an iteration of
//!   this context, and at which logical time ([`Context::dispatch_time`])
//! - expose a monotonic per-iteration timestamp ([`Context::time`])
//!
//! The context is poll-driven: callers (typically the application's event
//! loop, or a test) call [`Context::iterate`] to drain the work queued so
//! far. Work queued during an iteration runs in a later iteration.

use core::fmt;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// A monotonic logical timestamp, one tick per context iteration.
///
/// `Time::ZERO` means "not inside any iteration": a task created outside
/// the loop may complete synchronously during any iteration, while a task
/// created inside iteration N may only complete synchronously from
/// iteration N+1 onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(u64);

impl Time {
    /// The zero timestamp, earlier than every iteration.
    pub const ZERO: Self = Self(0);
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

struct Deferred {
    priority: i32,
    seq: u64,
    name: Option<String>,
    run: Box<dyn FnOnce() + Send>,
}

struct ContextInner {
    id: u64,
    /// Kept sorted: ascending priority, FIFO within equal priority.
    queue: Mutex<Vec<Deferred>>,
    queue_cond: Condvar,
    next_seq: AtomicU64,
    /// Completed iterations; iteration N runs at logical time N (1-based).
    tick: AtomicU64,
}

thread_local! {
    static THREAD_DEFAULT: RefCell<Vec<Context>> = const { RefCell::new(Vec::new()) };
    static DISPATCHING: RefCell<Vec<(u64, Time)>> = const { RefCell::new(Vec::new()) };
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);
static GLOBAL: OnceLock<Context> = OnceLock::new();

/// A single-threaded cooperative scheduler.
///
/// Cloning shares the underlying queue. Any thread may queue work with
/// [`Context::invoke`]; one thread at a time drains it with
/// [`Context::iterate`].
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a new context with an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                queue: Mutex::new(Vec::new()),
                queue_cond: Condvar::new(),
                next_seq: AtomicU64::new(0),
                tick: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the process-global default context.
    ///
    /// Used as the owner for tasks created on threads with no thread-default
    /// context pushed.
    #[must_use]
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(Self::new)
    }

    /// Returns the top of the calling thread's thread-default stack.
    #[must_use]
    pub fn thread_default() -> Option<Self> {
        THREAD_DEFAULT.with(|stack| stack.borrow().last().cloned())
    }

    /// Returns the thread-default context, falling back to the global one.
    ///
    /// This is what task creation captures as the owning context.
    #[must_use]
    pub fn current() -> Self {
        Self::thread_default().unwrap_or_else(|| Self::global().clone())
    }

    /// A stable identifier for this context's shared state.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns true if `other` shares this context's state.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Pushes this context onto the calling thread's thread-default stack.
    ///
    /// The context is popped when the returned guard drops. Completion
    /// callbacks run with their task's owning context pushed this way, so
    /// tasks created inside a callback are owned by the same context.
    #[must_use]
    pub fn push_thread_default(&self) -> ThreadDefaultGuard {
        THREAD_DEFAULT.with(|stack| stack.borrow_mut().push(self.clone()));
        ThreadDefaultGuard {
            context: self.clone(),
            _not_send: PhantomData,
        }
    }

    /// Queues `run` to execute in a future iteration of this context.
    ///
    /// Entries dispatch in ascending `priority` order (lower runs sooner),
    /// FIFO within equal priority. `name` is a diagnostic label surfaced in
    /// trace output.
    pub fn invoke(&self, name: Option<String>, priority: i32, run: impl FnOnce() + Send + 'static) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = Deferred {
            priority,
            seq,
            name,
            run: Box::new(run),
        };
        let mut queue = self.inner.queue.lock();
        let at = queue.partition_point(|d| d.priority <= priority);
        queue.insert(at, entry);
        self.inner.queue_cond.notify_all();
    }

    /// Returns the number of entries currently queued.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Blocks until at least one entry is queued, or `timeout` elapses.
    ///
    /// Returns true if work is available. The poll-driven analogue of an
    /// event loop going to sleep between iterations.
    pub fn wait_pending(&self, timeout: Duration) -> bool {
        let mut queue = self.inner.queue.lock();
        if !queue.is_empty() {
            return true;
        }
        self.inner.queue_cond.wait_for(&mut queue, timeout);
        !queue.is_empty()
    }

    /// Runs one iteration: drains everything queued before this call.
    ///
    /// Entries run with this context pushed as the thread default and with
    /// [`Context::dispatch_time`] reporting this iteration's timestamp.
    /// Entries queued while iterating are left for the next iteration.
    /// Returns the number of entries dispatched.
    pub fn iterate(&self) -> usize {
        let tick = Time(self.inner.tick.fetch_add(1, Ordering::Relaxed) + 1);
        let batch = std::mem::take(&mut *self.inner.queue.lock());
        if batch.is_empty() {
            return 0;
        }

        let _default = self.push_thread_default();
        DISPATCHING.with(|stack| stack.borrow_mut().push((self.inner.id, tick)));
        let dispatched = batch.len();
        for entry in batch {
            tracing::trace!(
                context = self.inner.id,
                time = %tick,
                name = entry.name.as_deref().unwrap_or("(unnamed)"),
                seq = entry.seq,
                "dispatching deferred entry"
            );
            (entry.run)();
        }
        DISPATCHING.with(|stack| {
            stack.borrow_mut().pop();
        });
        dispatched
    }

    /// The logical time of the most recent iteration (zero before the first).
    #[must_use]
    pub fn time(&self) -> Time {
        Time(self.inner.tick.load(Ordering::Relaxed))
    }

    /// If the calling thread is currently inside an iteration of this
    /// context, returns that iteration's logical time.
    #[must_use]
    pub fn dispatch_time(&self) -> Option<Time> {
        DISPATCHING.with(|stack| {
            stack
                .borrow()
                .last()
                .filter(|(id, _)| *id == self.inner.id)
                .map(|(_, time)| *time)
        })
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("pending", &self.pending())
            .field("time", &self.time())
            .finish()
    }
}

/// Pops the pushed context from the thread-default stack on drop.
pub struct ThreadDefaultGuard {
    context: Context,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ThreadDefaultGuard {
    fn drop(&mut self) {
        THREAD_DEFAULT.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert!(
                popped.is_some_and(|c| c.ptr_eq(&self.context)),
                "thread-default stack popped out of order"
            );
        });
    }
}
