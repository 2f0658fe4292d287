//! The cancellable unit-of-work/result handle.
//!
//! A [`Task`] represents one asynchronous operation: it carries the
//! operation's outcome (a tagged value or an error), the [`CancelToken`]
//! observed on its behalf, task-local data, and the completion callback.
//! Whatever thread produces the result, the callback runs inside the
//! [`Context`] that was current when the task was created.
//!
//! # Protocol
//!
//! The producing side calls exactly one `return_*` function; the consuming
//! side calls exactly one `propagate_*` function. Violating either is a
//! contract violation and panics. Cancellation is checked one final time at
//! propagation: with `check_cancellable` (the default), a fired token wins
//! over whatever was returned — even a success produced before the token
//! fired, as long as it has not been propagated yet.
//!
//! # Completion ordering
//!
//! A `return_*` call completes the task synchronously on the calling stack
//! only when all three hold: the caller is inside an iteration of the
//! task's owning context; that iteration is strictly later than the one
//! that created the task; and the token has not fired. Otherwise the
//! callback is deferred to a future iteration of the owning context.
//! Thread-executed tasks always defer; their callbacks never run on the
//! worker thread. Synchronous completions can chain: a callback that
//! returns another same-context task recurses on the same stack, which is
//! accepted behavior, not a bug.
//!
//! # Threaded execution
//!
//! [`Task::run_in_thread`] runs a blocking body on the worker pool and
//! hands completion back to the owning context;
//! [`Task::run_in_thread_sync`] blocks the caller until the body (or a
//! forced cancellation-triggered completion) finishes. With
//! [`Task::set_return_on_cancel`], cancelling the token completes the task
//! immediately while the body keeps running in the background — the body
//! must then re-check the flag (via the `set_return_on_cancel` return
//! value) before touching externally visible state.

pub mod result_box;

use core::fmt;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::cancel::{CancelHandle, CancelToken};
use crate::context::{Context, Time};
use crate::error::{Error, Result};
use crate::pool::{self, PoolHandle, ThreadPool};

pub use result_box::TaskValue;
use result_box::ResultBox;

/// The object an operation is performed on, shared with the task.
pub type SourceRef = Arc<dyn Any + Send + Sync>;

/// Task-local data set by the operation implementation.
pub type TaskData = Arc<dyn Any + Send + Sync>;

/// The completion callback, invoked exactly once inside the owning context.
pub type CompletionCallback = Box<dyn FnOnce(&Task) + Send>;

/// A blocking task body run on a pool worker.
///
/// Receives the task, its source object, its task data, and its token, per
/// the external interface contract.
pub type ThreadBody =
    Box<dyn FnOnce(&Task, Option<SourceRef>, Option<TaskData>, Option<CancelToken>) + Send>;

/// Identifies the "start" operation that produced a result, checked at the
/// "finish" boundary.
///
/// A typed replacement for the C convention of comparing raw function
/// pointers: operations declare a tag constant and stamp their tasks with
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceTag(&'static str);

impl SourceTag {
    /// Creates a tag. Conventionally named after the start operation.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The tag's label.
    #[must_use]
    pub const fn name(self) -> &'static str {
        self.0
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum ReturnKind {
    Success,
    Error,
    FromThread,
}

struct TaskState {
    result: ResultBox,
    callback: Option<CompletionCallback>,
    task_data: Option<TaskData>,
    name: Option<String>,
    source_tag: Option<SourceTag>,
    priority: i32,
    check_cancellable: bool,
    return_on_cancel: bool,
    synchronous: bool,
    blocking_other_task: bool,
    threaded: bool,
    thread_complete: bool,
    thread_cancelled: bool,
    cancel_handle: Option<CancelHandle>,
    pool: Option<PoolHandle>,
    body: Option<ThreadBody>,
}

struct TaskInner {
    id: u64,
    context: Context,
    creation_time: Time,
    source: Option<SourceRef>,
    token: Option<CancelToken>,
    completed: AtomicBool,
    state: Mutex<TaskState>,
    /// Signalled on thread-complete; waited on by `run_in_thread_sync`.
    cond: Condvar,
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// The cancellable unit-of-work/result handle. See the module docs.
///
/// Cloning shares the task: clones are held by the issuing code, the
/// worker pool while the body runs, the owning context while a completion
/// is queued, and the cancel listener.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

/// Configures and creates a [`Task`].
///
/// Creation always succeeds; the owning context and creation time are
/// captured from the calling thread.
#[must_use]
pub struct TaskBuilder {
    source: Option<SourceRef>,
    token: Option<CancelToken>,
    callback: Option<CompletionCallback>,
}

impl TaskBuilder {
    /// Sets the source object the operation acts on.
    pub fn source(mut self, source: SourceRef) -> Self {
        self.source = Some(source);
        self
    }

    /// Sets the cancellation token observed on the task's behalf.
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Sets the completion callback, invoked exactly once inside the
    /// owning context after a `return_*` call completes the task.
    pub fn callback(mut self, callback: impl FnOnce(&Task) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Creates the task, capturing the current thread-default context as
    /// owner and the current iteration's logical time (if any) as the
    /// creation time.
    pub fn build(self) -> Task {
        let context = Context::current();
        let creation_time = context.dispatch_time().unwrap_or(Time::ZERO);
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(task = id, context = context.id(), time = %creation_time, "task created");
        Task {
            inner: Arc::new(TaskInner {
                id,
                context,
                creation_time,
                source: self.source,
                token: self.token,
                completed: AtomicBool::new(false),
                state: Mutex::new(TaskState {
                    result: ResultBox::default(),
                    callback: self.callback,
                    task_data: None,
                    name: None,
                    source_tag: None,
                    priority: 0,
                    check_cancellable: true,
                    return_on_cancel: false,
                    synchronous: false,
                    blocking_other_task: false,
                    threaded: false,
                    thread_complete: false,
                    thread_cancelled: false,
                    cancel_handle: None,
                    pool: None,
                    body: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

impl Task {
    /// Starts building a task.
    #[must_use]
    pub fn builder() -> TaskBuilder {
        TaskBuilder {
            source: None,
            token: None,
            callback: None,
        }
    }

    /// Creates a bare task with no source, token, or callback.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a task and immediately fails it with `error`.
    ///
    /// For wrapper functions that detect a bad argument before starting
    /// the real operation: the finish side can check the tag with
    /// [`Task::is_tagged`] to recognize such reports.
    pub fn report_error(
        source: Option<SourceRef>,
        tag: SourceTag,
        callback: impl FnOnce(&Task) + Send + 'static,
        error: Error,
    ) -> Self {
        let mut builder = Self::builder().callback(callback);
        if let Some(source) = source {
            builder = builder.source(source);
        }
        let task = builder.build();
        task.set_source_tag(tag);
        task.return_error(error);
        task
    }

    /// A stable identifier, unique within the process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The context that owns this task's completion.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// The task's cancellation token, if any.
    #[must_use]
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.inner.token.clone()
    }

    /// The source object, if any.
    #[must_use]
    pub fn source_object(&self) -> Option<SourceRef> {
        self.inner.source.clone()
    }

    /// Checks that `task` belongs to `source` (both `None` also matches).
    ///
    /// Side-effect-free and repeatable; meant for finish-function argument
    /// checking.
    #[must_use]
    pub fn is_valid(task: &Self, source: Option<&SourceRef>) -> bool {
        match (&task.inner.source, source) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// True if the task carries the given source tag.
    #[must_use]
    pub fn is_tagged(&self, tag: SourceTag) -> bool {
        self.inner.state.lock().source_tag == Some(tag)
    }

    // === configuration (pre-sharing) ==================================

    /// Replaces the task-local data, dropping any previous value.
    ///
    /// Like the other configuration setters, call this before the task is
    /// handed to a worker thread.
    pub fn set_task_data(&self, data: TaskData) {
        self.inner.state.lock().task_data = Some(data);
    }

    /// The current task-local data, if any.
    #[must_use]
    pub fn task_data(&self) -> Option<TaskData> {
        self.inner.state.lock().task_data.clone()
    }

    /// Sets the task's priority (lower = higher priority). Affects worker
    /// pool scheduling and the order deferred completions dispatch in.
    pub fn set_priority(&self, priority: i32) {
        self.inner.state.lock().priority = priority;
    }

    /// The task's priority.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.inner.state.lock().priority
    }

    /// Sets the human-readable name used in diagnostics.
    pub fn set_name(&self, name: impl Into<String>) {
        self.inner.state.lock().name = Some(name.into());
    }

    /// The task's name, if set.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.inner.state.lock().name.clone()
    }

    /// Stamps the task with the tag of the operation that started it. As a
    /// convenience the tag label also becomes the task name, unless one
    /// was set already.
    pub fn set_source_tag(&self, tag: SourceTag) {
        let mut state = self.inner.state.lock();
        state.source_tag = Some(tag);
        if state.name.is_none() {
            state.name = Some(tag.name().to_string());
        }
    }

    /// The task's source tag, if set.
    #[must_use]
    pub fn source_tag(&self) -> Option<SourceTag> {
        self.inner.state.lock().source_tag
    }

    /// Sets or clears cancellable-checking (default on).
    ///
    /// When on, `propagate_*` and `had_error` consult the token first and
    /// report cancellation regardless of any stored result. When off, the
    /// task never checks the token itself.
    ///
    /// # Panics
    ///
    /// Turning this off while `return_on_cancel` is set would silently
    /// disable the cancellation safety net, and panics.
    pub fn set_check_cancellable(&self, check_cancellable: bool) {
        let mut state = self.inner.state.lock();
        assert!(
            check_cancellable || !state.return_on_cancel,
            "check_cancellable must stay enabled while return_on_cancel is set"
        );
        state.check_cancellable = check_cancellable;
    }

    /// The cancellable-checking flag.
    #[must_use]
    pub fn check_cancellable(&self) -> bool {
        self.inner.state.lock().check_cancellable
    }

    /// Sets or clears the return-on-cancel flag; only meaningful for
    /// thread-executed tasks.
    ///
    /// When set, cancelling the token completes the task immediately with
    /// a cancellation error, without waiting for the body — the body keeps
    /// running in the background and must not touch externally visible
    /// state afterward. To make changes safely, the body clears the flag,
    /// mutates, and sets it again; if the token fired while the flag was
    /// clear, the re-set call returns false, the task completes at that
    /// point, and the body knows its changes were the last.
    ///
    /// Returns true if the flag was changed to the requested value; false
    /// if the task was already cancelled (in which case requesting `true`
    /// forces completion now).
    ///
    /// # Panics
    ///
    /// Panics if `return_on_cancel` is requested while cancellable-checking
    /// is disabled.
    pub fn set_return_on_cancel(&self, return_on_cancel: bool) -> bool {
        let mut state = self.inner.state.lock();
        assert!(
            state.check_cancellable || !return_on_cancel,
            "return_on_cancel requires check_cancellable"
        );

        if !state.threaded {
            state.return_on_cancel = return_on_cancel;
            return true;
        }

        if state.thread_cancelled {
            let force = return_on_cancel && !state.return_on_cancel;
            drop(state);
            if force {
                self.thread_complete();
            }
            return false;
        }

        state.return_on_cancel = return_on_cancel;
        true
    }

    /// The return-on-cancel flag.
    #[must_use]
    pub fn return_on_cancel(&self) -> bool {
        self.inner.state.lock().return_on_cancel
    }

    // === queries ======================================================

    /// True once the completion callback has been invoked (or, for
    /// `run_in_thread_sync`, once the body finished). Reads false from
    /// inside the callback itself.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// True if the task has a thread body installed.
    #[must_use]
    pub fn is_threaded(&self) -> bool {
        self.inner.state.lock().threaded
    }

    /// Non-consuming error check: true if an error is stored, a previous
    /// propagate consumed one, or (with cancellable-checking) the token
    /// has fired. Repeatable, no side effects.
    #[must_use]
    pub fn had_error(&self) -> bool {
        let state = self.inner.state.lock();
        if state.result.error_present() || state.result.had_error {
            return true;
        }
        state.check_cancellable && self.inner.token.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    // === return family ================================================

    /// Stores a success value and completes the task.
    ///
    /// # Panics
    ///
    /// Panics if a `return_*` call already happened on this task.
    pub fn return_value(&self, value: TaskValue) {
        {
            let mut state = self.inner.state.lock();
            state.result.check_unreturned();
            state.result.store_value(value);
        }
        tracing::trace!(task = self.inner.id, "task returned a value");
        self.finish_return(ReturnKind::Success);
    }

    /// Stores a boolean result and completes the task.
    pub fn return_bool(&self, result: bool) {
        self.return_value(TaskValue::Bool(result));
    }

    /// Stores a signed size result and completes the task.
    pub fn return_int(&self, result: isize) {
        self.return_value(TaskValue::Int(result));
    }

    /// Stores an owned value result and completes the task. The value is
    /// dropped if it is never propagated.
    pub fn return_boxed<T: Any + Send>(&self, result: T) {
        self.return_value(TaskValue::Boxed(Box::new(result)));
    }

    /// Stores `error` (taking ownership) and completes the task as failed.
    ///
    /// # Panics
    ///
    /// Panics if a `return_*` call already happened on this task.
    pub fn return_error(&self, error: Error) {
        {
            let mut state = self.inner.state.lock();
            state.result.check_unreturned();
            state.result.store_error(error);
        }
        tracing::trace!(task = self.inner.id, "task returned an error");
        self.finish_return(ReturnKind::Error);
    }

    /// If the token has fired, fails the task with a cancellation error
    /// and returns true. Lets task bodies short-circuit:
    /// `if task.return_error_if_cancelled() { return; }`.
    ///
    /// Works even with cancellable-checking disabled (the error is stored
    /// explicitly).
    pub fn return_error_if_cancelled(&self) -> bool {
        let Some(error) = self
            .inner
            .token
            .as_ref()
            .and_then(CancelToken::error_if_cancelled)
        else {
            return false;
        };
        self.return_error(error);
        true
    }

    // === propagate family =============================================

    /// Consumes the stored error, or synthesizes the cancellation error.
    /// Caller holds the state lock.
    fn propagate_error_locked(&self, state: &mut TaskState) -> Option<Error> {
        if state.check_cancellable {
            if let Some(error) = self
                .inner
                .token
                .as_ref()
                .and_then(CancelToken::error_if_cancelled)
            {
                return Some(error);
            }
        }
        state.result.take_error()
    }

    /// Retrieves the task's outcome as a tagged value, transferring
    /// ownership to the caller.
    ///
    /// Returns the cancellation error if the token fired (and checking is
    /// enabled), or the stored error. May be called at most once per
    /// produced result.
    ///
    /// # Panics
    ///
    /// Panics if no result was produced, or it was already propagated.
    pub fn propagate_value(&self) -> Result<TaskValue> {
        let mut state = self.inner.state.lock();
        if let Some(error) = self.propagate_error_locked(&mut state) {
            return Err(error);
        }
        Ok(state.result.take_value())
    }

    /// Retrieves a boolean outcome. See [`Task::propagate_value`].
    ///
    /// # Panics
    ///
    /// Additionally panics if the stored value is not a boolean.
    pub fn propagate_bool(&self) -> Result<bool> {
        match self.propagate_value()? {
            TaskValue::Bool(value) => Ok(value),
            other => panic!(
                "task result type mismatch: expected bool, found {}",
                other.variant_name()
            ),
        }
    }

    /// Retrieves a signed size outcome. See [`Task::propagate_value`].
    ///
    /// # Panics
    ///
    /// Additionally panics if the stored value is not an int.
    pub fn propagate_int(&self) -> Result<isize> {
        match self.propagate_value()? {
            TaskValue::Int(value) => Ok(value),
            other => panic!(
                "task result type mismatch: expected int, found {}",
                other.variant_name()
            ),
        }
    }

    /// Retrieves an owned value outcome, downcast to `T`. See
    /// [`Task::propagate_value`].
    ///
    /// # Panics
    ///
    /// Additionally panics if the stored value is not a boxed value of
    /// type `T`.
    pub fn propagate_boxed<T: Any>(&self) -> Result<Box<T>> {
        match self.propagate_value()? {
            TaskValue::Boxed(value) => Ok(value
                .downcast::<T>()
                .unwrap_or_else(|_| panic!("task result type mismatch: wrong boxed type"))),
            other => panic!(
                "task result type mismatch: expected boxed, found {}",
                other.variant_name()
            ),
        }
    }

    // === completion dispatch ==========================================

    /// Decides how the completion callback fires after a result-producing
    /// step. `kind` distinguishes the body-finished path
    /// (`ReturnKind::FromThread`) from direct `return_*` calls.
    fn finish_return(&self, kind: ReturnKind) {
        let (synchronous, threaded) = {
            let state = self.inner.state.lock();
            (state.synchronous, state.threaded)
        };

        // Blocking run-and-wait: the caller thread detects completion
        // itself via the condvar.
        if synchronous {
            return;
        }

        // A return_* from inside a thread body completes only once the
        // body finishes, via the thread-complete transition.
        if threaded && kind != ReturnKind::FromThread {
            return;
        }

        if kind != ReturnKind::FromThread {
            if let Some(now) = self.inner.context.dispatch_time() {
                let same_turn = now <= self.inner.creation_time;
                let cancelled = self
                    .inner
                    .token
                    .as_ref()
                    .is_some_and(CancelToken::is_cancelled);
                // Synchronous completion only from a later iteration of
                // the owning context, and never from inside a
                // cancellation handler.
                if !same_turn && !cancelled {
                    tracing::trace!(task = self.inner.id, "completing synchronously");
                    self.invoke_callback_now();
                    return;
                }
            }
        }

        self.schedule_completion();
    }

    /// Queues the completion callback on the owning context.
    fn schedule_completion(&self) {
        let (name, priority) = {
            let state = self.inner.state.lock();
            (state.name.clone(), state.priority)
        };
        let label = format!("{} complete", name.as_deref().unwrap_or("(unnamed)"));
        tracing::trace!(task = self.inner.id, label = %label, "deferring completion");
        let task = self.clone();
        self.inner
            .context
            .invoke(Some(label), priority, move || task.invoke_callback_now());
    }

    /// Invokes the completion callback with the owning context pushed as
    /// thread default, then marks the task completed.
    fn invoke_callback_now(&self) {
        let callback = self.inner.state.lock().callback.take();
        let _default = self.inner.context.push_thread_default();
        if let Some(callback) = callback {
            callback(self);
        }
        self.inner.completed.store(true, Ordering::Release);
        tracing::trace!(task = self.inner.id, "task completed");
    }

    // === threaded execution ===========================================

    /// Runs `body` on the global worker pool. When the body returns (or a
    /// `return_on_cancel` cancellation forces completion first), the
    /// completion callback is dispatched to the owning context.
    pub fn run_in_thread(
        &self,
        body: impl FnOnce(&Self, Option<SourceRef>, Option<TaskData>, Option<CancelToken>)
            + Send
            + 'static,
    ) {
        self.run_in_thread_on(&ThreadPool::global().handle(), body);
    }

    /// As [`Task::run_in_thread`], on an explicit pool.
    pub fn run_in_thread_on(
        &self,
        pool: &PoolHandle,
        body: impl FnOnce(&Self, Option<SourceRef>, Option<TaskData>, Option<CancelToken>)
            + Send
            + 'static,
    ) {
        let already_complete = self.start_task_thread(pool, Box::new(body), false);
        if already_complete {
            // Pre-cancelled (or submission refused): the result state is
            // final, dispatch now.
            self.finish_return(ReturnKind::FromThread);
        }
    }

    /// Runs `body` on the global worker pool and blocks the calling thread
    /// until the body finishes or a `return_on_cancel` cancellation forces
    /// completion. No callback is invoked; inspect the result with
    /// `propagate_*` afterward.
    pub fn run_in_thread_sync(
        &self,
        body: impl FnOnce(&Self, Option<SourceRef>, Option<TaskData>, Option<CancelToken>)
            + Send
            + 'static,
    ) {
        self.run_in_thread_sync_on(&ThreadPool::global().handle(), body);
    }

    /// As [`Task::run_in_thread_sync`], on an explicit pool.
    pub fn run_in_thread_sync_on(
        &self,
        pool: &PoolHandle,
        body: impl FnOnce(&Self, Option<SourceRef>, Option<TaskData>, Option<CancelToken>)
            + Send
            + 'static,
    ) {
        let _ = self.start_task_thread(pool, Box::new(body), true);

        let mut state = self.inner.state.lock();
        while !state.thread_complete {
            self.inner.cond.wait(&mut state);
        }
        drop(state);

        // Completion is observed on this thread; the callback (if any) is
        // deliberately not invoked.
        self.inner.completed.store(true, Ordering::Release);
        tracing::trace!(task = self.inner.id, "task completed (synchronous)");
    }

    /// Installs the thread body and submits the task to `pool`.
    ///
    /// Returns true if the task is already thread-complete (pre-cancelled
    /// with return-on-cancel, or the pool refused the submission) and the
    /// caller must dispatch completion itself.
    ///
    /// # Panics
    ///
    /// Panics if the task already has a thread body.
    fn start_task_thread(&self, pool: &PoolHandle, body: ThreadBody, synchronous: bool) -> bool {
        {
            let mut state = self.inner.state.lock();
            assert!(!state.threaded, "task is already running in a thread");
            state.threaded = true;
            state.synchronous = synchronous;
            state.body = Some(body);
            state.pool = Some(pool.clone());

            if let Some(token) = &self.inner.token {
                if state.return_on_cancel {
                    if let Some(error) = token.error_if_cancelled() {
                        // Already cancelled: synthesize the cancellation
                        // error and complete without running the body. The
                        // task is still enqueued so pool accounting stays
                        // symmetric with the normal path.
                        state.result.store_error_direct(error);
                        state.thread_cancelled = true;
                        state.thread_complete = true;
                        state.blocking_other_task = pool::is_pool_thread();
                        drop(state);
                        let _ = pool.submit(self.clone());
                        return true;
                    }
                }
            }

            if pool::is_pool_thread() {
                // Submitted from inside a pool worker: schedule ahead of
                // ordinary tasks so nested submission cannot starve.
                state.blocking_other_task = true;
            }
        }

        // Connect outside the state lock: a racing cancel may fire the
        // listener on this very call.
        if let Some(token) = &self.inner.token {
            let task = self.clone();
            let handle = token.connect(move || task.on_token_cancelled());
            let mut state = self.inner.state.lock();
            if state.thread_complete {
                drop(state);
                token.disconnect(handle);
            } else {
                state.cancel_handle = Some(handle);
            }
        }

        if pool.submit(self.clone()) {
            false
        } else {
            // Pool shut down: treat as already completed with whatever
            // result state exists.
            let handle = {
                let mut state = self.inner.state.lock();
                state
                    .result
                    .store_error_direct(Error::new(crate::error::ErrorKind::SubmissionFailed));
                state.thread_complete = true;
                state.cancel_handle.take()
            };
            if let (Some(token), Some(handle)) = (self.inner.token.as_ref(), handle) {
                token.disconnect(handle);
            }
            if synchronous {
                self.inner.cond.notify_all();
            }
            true
        }
    }

    /// Cancel-listener body for thread-executed tasks.
    fn on_token_cancelled(&self) {
        let (pool, force) = {
            let mut state = self.inner.state.lock();
            if state.thread_cancelled {
                return;
            }
            state.thread_cancelled = true;
            (state.pool.clone(), state.return_on_cancel)
        };
        tracing::trace!(task = self.inner.id, force, "thread task cancelled");
        // Let the cancelled task fail fast: jump the queue.
        if let Some(pool) = pool {
            pool.move_to_front(self.inner.id);
        }
        if force {
            self.thread_complete();
        }
    }

    /// The thread-complete transition: first caller wins, later calls are
    /// no-ops. Unregisters the cancel listener, then either wakes a
    /// synchronous waiter or dispatches completion to the owning context.
    pub(crate) fn thread_complete(&self) {
        let (synchronous, handle) = {
            let mut state = self.inner.state.lock();
            if state.thread_complete {
                // Belated completion after cancellation already finished
                // the task (or vice versa).
                return;
            }
            state.thread_complete = true;
            (state.synchronous, state.cancel_handle.take())
        };
        tracing::trace!(task = self.inner.id, "thread complete");

        if let (Some(token), Some(handle)) = (self.inner.token.as_ref(), handle) {
            token.disconnect(handle);
        }

        if synchronous {
            self.inner.cond.notify_all();
        } else {
            self.finish_return(ReturnKind::FromThread);
        }
    }

    /// Executes the installed body on the current (worker) thread. Called
    /// by the pool. Skips the body if completion was already forced while
    /// the task was still queued.
    pub(crate) fn execute_pooled(&self) {
        let body = {
            let mut state = self.inner.state.lock();
            if state.thread_complete {
                None
            } else {
                state.body.take()
            }
        };
        if let Some(body) = body {
            body(
                self,
                self.source_object(),
                self.task_data(),
                self.cancel_token(),
            );
        }
        self.thread_complete();
    }

    /// Queue-ordering inputs for the pool: (blocking-other-task,
    /// cancelled-at-submit, priority).
    pub(crate) fn pool_sort_key(&self) -> (bool, bool, i32) {
        let state = self.inner.state.lock();
        let cancelled = state.check_cancellable
            && self.inner.token.as_ref().is_some_and(CancelToken::is_cancelled);
        (state.blocking_other_task, cancelled, state.priority)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &state.name)
            .field("priority", &state.priority)
            .field("threaded", &state.threaded)
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}
