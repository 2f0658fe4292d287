//! Tagged storage for a task's single outcome.
//!
//! A task produces exactly one of {value, error}; the value is one of the
//! tagged variants of [`TaskValue`]. The box tracks the three flags that
//! enforce the return/propagate protocol: `ever_returned` (a
//! result-producing call happened), `result_set` (a value is held and not
//! yet consumed), and `had_error` (a stored error was consumed).
//!
//! An unconsumed boxed value or error is dropped with the box; `Drop` is
//! the destructor the C-era API took as a function pointer.

use core::fmt;
use std::any::Any;

/// The tagged success value of a task.
pub enum TaskValue {
    /// An owned, type-erased value (the pointer-with-destructor variant).
    Boxed(Box<dyn Any + Send>),
    /// A signed size result (byte counts, offsets).
    Int(isize),
    /// A boolean result.
    Bool(bool),
}

impl TaskValue {
    /// The variant name, for diagnostics and mismatch panics.
    #[must_use]
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::Boxed(_) => "boxed",
            Self::Int(_) => "int",
            Self::Bool(_) => "bool",
        }
    }
}

impl fmt::Debug for TaskValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boxed(_) => f.write_str("TaskValue::Boxed(..)"),
            Self::Int(v) => write!(f, "TaskValue::Int({v})"),
            Self::Bool(v) => write!(f, "TaskValue::Bool({v})"),
        }
    }
}

use crate::error::Error;

/// The minimal result state a task holds.
#[derive(Debug, Default)]
pub(crate) struct ResultBox {
    value: Option<TaskValue>,
    error: Option<Error>,
    /// A value is currently held and not yet consumed.
    pub(crate) result_set: bool,
    /// A result-producing call has happened; guards "return exactly once".
    pub(crate) ever_returned: bool,
    /// A stored error was moved out by a propagate call.
    pub(crate) had_error: bool,
}

impl ResultBox {
    /// Panics if a result-producing call already happened.
    pub(crate) fn check_unreturned(&self) {
        assert!(
            !self.ever_returned,
            "task already returned a result; return_* may be called at most once"
        );
    }

    /// Stores a success value and marks the result produced.
    pub(crate) fn store_value(&mut self, value: TaskValue) {
        self.value = Some(value);
        self.ever_returned = true;
        self.result_set = true;
    }

    /// Stores an error and marks the result produced.
    pub(crate) fn store_error(&mut self, error: Error) {
        self.error = Some(error);
        self.ever_returned = true;
    }

    /// Stores an error without marking the result produced.
    ///
    /// Used by the pre-cancelled `run_in_thread` path, where the error is
    /// synthesized by the machinery rather than returned by the task body.
    pub(crate) fn store_error_direct(&mut self, error: Error) {
        self.error = Some(error);
    }

    /// Returns true if an error is currently stored.
    pub(crate) const fn error_present(&self) -> bool {
        self.error.is_some()
    }

    /// Moves a stored error out, recording that the task ended in error.
    pub(crate) fn take_error(&mut self) -> Option<Error> {
        let error = self.error.take();
        if error.is_some() {
            self.had_error = true;
        }
        error
    }

    /// Consumes the stored value; panics if none has been produced or it
    /// was already consumed.
    pub(crate) fn take_value(&mut self) -> TaskValue {
        assert!(
            self.result_set,
            "task result has not been set, or was already propagated"
        );
        self.result_set = false;
        self.value
            .take()
            .unwrap_or_else(|| unreachable!("result_set without a stored value"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn store_and_take_value() {
        let mut result = ResultBox::default();
        result.check_unreturned();
        result.store_value(TaskValue::Int(42));
        assert!(result.ever_returned);
        assert!(result.result_set);

        match result.take_value() {
            TaskValue::Int(v) => assert_eq!(v, 42),
            other => unreachable!("expected int, got {other:?}"),
        }
        assert!(!result.result_set);
    }

    #[test]
    #[should_panic(expected = "already returned a result")]
    fn double_return_panics() {
        let mut result = ResultBox::default();
        result.store_value(TaskValue::Bool(true));
        result.check_unreturned();
    }

    #[test]
    #[should_panic(expected = "has not been set")]
    fn take_without_store_panics() {
        let mut result = ResultBox::default();
        let _ = result.take_value();
    }

    #[test]
    fn take_error_records_had_error() {
        let mut result = ResultBox::default();
        result.store_error(Error::new(ErrorKind::User));
        assert!(result.error_present());
        assert!(!result.had_error);

        let taken = result.take_error();
        assert!(taken.is_some());
        assert!(result.had_error);
        assert!(!result.error_present());
        assert!(result.take_error().is_none());
    }

    #[test]
    fn direct_error_does_not_mark_returned() {
        let mut result = ResultBox::default();
        result.store_error_direct(Error::cancelled());
        assert!(!result.ever_returned);
        assert!(result.error_present());
        result.check_unreturned();
    }

    #[test]
    fn boxed_value_preserves_identity() {
        let mut result = ResultBox::default();
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("hello"));
        let raw = std::ptr::from_ref::<dyn std::any::Any>(payload.as_ref()).cast::<()>();
        result.store_value(TaskValue::Boxed(payload));

        match result.take_value() {
            TaskValue::Boxed(b) => {
                let back = std::ptr::from_ref::<dyn std::any::Any>(b.as_ref()).cast::<()>();
                assert_eq!(raw, back, "boxed result must round-trip by identity");
                assert_eq!(b.downcast::<String>().expect("type").as_str(), "hello");
            }
            other => unreachable!("expected boxed, got {other:?}"),
        }
    }
}
