//! Test utilities for cotask.
//!
//! This module provides shared helpers for unit and integration tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - Deadline-polling helpers for cross-thread assertions
//! - Result assertion macros
//!
//! # Example
//! ```
//! use cotask::test_utils::init_test_logging;
//!
//! fn my_test() {
//!     init_test_logging();
//!     // test code
//! }
//! ```

use std::sync::Once;
use std::time::{Duration, Instant};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Polls `check` until it returns true or `deadline` elapses; returns the
/// final check result. For asserting on state another thread will reach.
pub fn poll_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}

/// Polls `check` until true or panics with `description` after `deadline`.
pub fn assert_reaches(deadline: Duration, description: &str, check: impl FnMut() -> bool) {
    assert!(
        poll_until(deadline, check),
        "condition '{description}' not reached within {deadline:?}"
    );
    tracing::debug!(
        description = %description,
        deadline_ms = deadline.as_millis(),
        "condition reached within deadline"
    );
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

/// Assert that a propagate result is Ok with a specific value.
#[macro_export]
macro_rules! assert_propagated_ok {
    ($result:expr, $expected:expr) => {
        match $result {
            Ok(v) => assert_eq!(v, $expected),
            Err(e) => unreachable!("expected Ok({:?}), got error: {e}", $expected),
        }
    };
}

/// Assert that a propagate result is the cancellation error.
#[macro_export]
macro_rules! assert_propagated_cancelled {
    ($result:expr) => {
        match $result {
            Err(e) if e.is_cancelled() => {}
            Err(e) => unreachable!("expected cancellation error, got: {e}"),
            Ok(v) => unreachable!("expected cancellation error, got Ok({v:?})"),
        }
    };
}
