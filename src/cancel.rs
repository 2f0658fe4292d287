//! Cooperative cancellation tokens.
//!
//! A [`CancelToken`] is a shareable flag observed by tasks and their thread
//! bodies. Cancellation is cooperative and advisory for running code (a
//! body must check the token itself, there is no preemption), but
//! authoritative for result propagation: once a task's token has fired,
//! `propagate_*` reports a cancellation error regardless of what the body
//! returned, unless cancellable-checking was disabled on the task.
//!
//! Listeners registered with [`CancelToken::connect`] fire exactly once,
//! on the thread that calls [`CancelToken::cancel`] — or immediately on
//! the connecting thread when the token has already fired.

use core::fmt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Error;

/// A listener invoked when a token is cancelled.
///
/// Blanket-implemented for `FnOnce() + Send`, so closures can be passed
/// directly to [`CancelToken::connect`].
pub trait CancelListener: Send {
    /// Called exactly once when cancellation is requested.
    fn on_cancel(self: Box<Self>);
}

impl<F> CancelListener for F
where
    F: FnOnce() + Send,
{
    fn on_cancel(self: Box<Self>) {
        self();
    }
}

/// Identifies a registered listener for later [`CancelToken::disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelHandle(u64);

struct TokenState {
    cancelled: AtomicBool,
    next_handle: AtomicU64,
    listeners: Mutex<Vec<(u64, Box<dyn CancelListener>)>>,
}

/// A shareable cooperative-cancellation flag.
///
/// Cloning shares the underlying state: cancelling any clone cancels all.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<TokenState>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Creates a new, un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                next_handle: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Requests cancellation.
    ///
    /// Idempotent: only the first call fires listeners. Listeners run on
    /// the calling thread, in registration order, with the listener table
    /// unlocked (a listener may connect or disconnect freely).
    pub fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::trace!("cancel token fired");
        let fired = std::mem::take(&mut *self.state.listeners.lock());
        for (_, listener) in fired {
            listener.on_cancel();
        }
    }

    /// Registers a one-shot cancellation listener.
    ///
    /// If the token is already cancelled, the listener is invoked
    /// immediately on the calling thread and the returned handle refers to
    /// nothing.
    pub fn connect(&self, listener: impl CancelListener + 'static) -> CancelHandle {
        let handle = self.state.next_handle.fetch_add(1, Ordering::Relaxed);
        {
            let mut listeners = self.state.listeners.lock();
            if !self.is_cancelled() {
                listeners.push((handle, Box::new(listener)));
                return CancelHandle(handle);
            }
        }
        // Raced with (or followed) cancel: fire on this thread.
        Box::new(listener).on_cancel();
        CancelHandle(handle)
    }

    /// Unregisters a listener. No-op if it already fired or was removed.
    pub fn disconnect(&self, handle: CancelHandle) {
        let mut listeners = self.state.listeners.lock();
        listeners.retain(|(id, _)| *id != handle.0);
    }

    /// Returns a cancellation error if the token has fired.
    ///
    /// The "query-and-set error" primitive used throughout the propagation
    /// paths.
    #[must_use]
    pub fn error_if_cancelled(&self) -> Option<Error> {
        if self.is_cancelled() {
            Some(Error::cancelled())
        } else {
            None
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("listeners", &self.state.listeners.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.error_if_cancelled().is_none());
    }

    #[test]
    fn cancel_is_idempotent() {
        let token = CancelToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        token.connect(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(token.error_if_cancelled().is_some());
    }

    #[test]
    fn connect_after_cancel_fires_immediately() {
        let token = CancelToken::new();
        token.cancel();

        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        token.connect(move || {
            f.store(true, Ordering::SeqCst);
        });
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn disconnect_suppresses_listener() {
        let token = CancelToken::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        let handle = token.connect(move || {
            f.store(true, Ordering::SeqCst);
        });

        token.disconnect(handle);
        token.cancel();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let token = CancelToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let o = Arc::clone(&order);
            token.connect(move || o.lock().push(i));
        }
        token.cancel();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn cancel_from_other_thread_observed() {
        let token = CancelToken::new();
        let clone = token.clone();
        let join = std::thread::spawn(move || clone.cancel());
        join.join().expect("cancel thread panicked");
        assert!(token.is_cancelled());
    }
}
