//! Cotask: cancellable task/result core for asynchronous I/O libraries.
//!
//! # Overview
//!
//! Cotask provides the machinery an async I/O library needs behind its
//! start/finish operation pairs: a [`Task`] that carries one operation's
//! result back to the context that started it, a [`CancelToken`] the
//! operation observes, a single-threaded [`Context`] that serializes
//! completions, and an elastic [`ThreadPool`] for blocking bodies.
//!
//! # Core Guarantees
//!
//! - **Context affinity**: a task's completion callback runs inside the
//!   context that was current when the task was created, never on a worker
//!   thread.
//! - **Ordering**: a completion never runs on the same context iteration
//!   that created the task, so callers always see their start call return
//!   first.
//! - **Cancel-correctness**: with cancellable-checking on (the default), a
//!   fired token wins over any stored result at propagation time, and
//!   `return_on_cancel` lets cancellation complete a task without waiting
//!   for its thread body.
//! - **Single return, single propagate**: the produce/consume protocol is
//!   enforced; violations panic rather than corrupt state.
//!
//! # Module Structure
//!
//! - [`task`]: The task handle, return/propagate protocol, threaded execution
//! - [`cancel`]: Cancellation tokens and listeners
//! - [`context`]: Single-threaded dispatch contexts and logical time
//! - [`pool`]: The elastic worker pool
//! - [`error`]: Error types
//! - [`test_utils`]: Logging and assertion helpers shared by the tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::significant_drop_tightening)]

pub mod cancel;
pub mod context;
pub mod error;
pub mod pool;
pub mod task;
pub mod test_utils;

// Re-exports for convenient access to core types
pub use cancel::{CancelHandle, CancelListener, CancelToken};
pub use context::{Context, ThreadDefaultGuard, Time};
pub use error::{Error, ErrorKind, Result};
pub use pool::{PoolConfig, PoolHandle, ThreadPool};
pub use task::{
    CompletionCallback, SourceRef, SourceTag, Task, TaskBuilder, TaskData, TaskValue, ThreadBody,
};
