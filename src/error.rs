//! Error types for the task core.
//!
//! The task machinery distinguishes three classes of failure:
//!
//! - **Cancellation**: the operation's [`CancelToken`](crate::cancel::CancelToken)
//!   fired. Always wins over a stored success or error at propagation time
//!   (unless cancellable-checking was disabled on the task).
//! - **Operation errors**: produced by the code built on top of `Task` and
//!   carried opaquely. The task core never inspects their content, only
//!   their presence.
//! - **Pool submission failures**: the thread pool refused new work (only
//!   possible after shutdown). Treated as equivalent to the task having
//!   already completed.
//!
//! Precondition violations (returning twice, propagating without a result)
//! are contract violations by the caller, not runtime conditions: they
//! panic rather than producing an `Error`.

use core::fmt;
use std::sync::Arc;

/// Convenience alias for results carrying [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The operation was cancelled via its token.
    Cancelled,
    /// The thread pool refused the submission (pool shut down).
    SubmissionFailed,
    /// Opaque error produced by the operation implementation.
    User,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::SubmissionFailed => write!(f, "submission failed"),
            Self::User => write!(f, "user"),
        }
    }
}

/// The error type carried by a task.
///
/// Ownership transfers fully to the caller on `propagate_*`; an error left
/// unconsumed is dropped with the task.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled).with_message("operation was cancelled")
    }

    /// Creates an opaque operation error from any error value.
    #[must_use]
    pub fn operation(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::new(ErrorKind::User).with_source(source)
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        if let (None, Some(source)) = (&self.message, &self.source) {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}
