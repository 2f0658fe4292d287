//! End-to-end tests for cancellation semantics: token plumbing,
//! propagation-time overrides, and return-on-cancel forced completion.
//!
//! This test suite covers:
//! - Token listener registration and immediate-fire behavior
//! - Cancellation overriding stored results at propagation
//! - check_cancellable opting out of the override
//! - return_on_cancel completing a thread task while its body runs on
//! - The set_return_on_cancel(false)/mutate/set(true) safety protocol
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test cancellation -- --nocapture
//! ```

use cotask::test_utils::{assert_reaches, init_test_logging};
use cotask::{
    assert_propagated_cancelled, test_complete, test_phase, test_section, CancelToken, Context,
    PoolConfig, Task, ThreadPool,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

fn test_pool() -> ThreadPool {
    ThreadPool::new(PoolConfig {
        base_size: 2,
        max_pool_size: 8,
        wait_time_base: Duration::from_millis(20),
        ..PoolConfig::default()
    })
}

// ============================================================================
// Token behavior
// ============================================================================

#[test]
fn listeners_fire_once_and_immediately_when_late() {
    init_test_logging();
    test_phase!("listeners_fire_once_and_immediately_when_late");

    let token = CancelToken::new();
    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = Arc::clone(&fired);
        token.connect(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }

    token.cancel();
    token.cancel();
    assert_eq!(fired.load(Ordering::SeqCst), 1, "cancel is idempotent");

    test_section!("late connect fires on the connecting thread");
    let late = Arc::new(AtomicUsize::new(0));
    {
        let late = Arc::clone(&late);
        token.connect(move || {
            late.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(late.load(Ordering::SeqCst), 1);

    test_complete!("listeners_fire_once_and_immediately_when_late");
}

// ============================================================================
// Propagation-time overrides
// ============================================================================

#[test]
fn cancellation_after_success_wins_at_propagation() {
    init_test_logging();
    test_phase!("cancellation_after_success_wins_at_propagation");

    let ctx = Context::new();
    let _guard = ctx.push_thread_default();
    let token = CancelToken::new();
    let task = Task::builder().cancel_token(token.clone()).build();

    task.return_bool(true);
    token.cancel();

    // The stored success is unreachable; the consumer sees cancellation.
    assert!(task.had_error());
    assert_propagated_cancelled!(task.propagate_bool());

    test_complete!("cancellation_after_success_wins_at_propagation");
}

#[test]
fn check_cancellable_disabled_surfaces_the_real_result() {
    init_test_logging();
    test_phase!("check_cancellable_disabled_surfaces_the_real_result");

    let token = CancelToken::new();
    let task = Task::builder().cancel_token(token.clone()).build();
    task.set_check_cancellable(false);

    task.return_int(99);
    token.cancel();

    assert!(!task.had_error());
    assert_eq!(task.propagate_int().expect("real result"), 99);

    test_complete!("check_cancellable_disabled_surfaces_the_real_result");
}

#[test]
fn cancelled_completion_is_always_deferred() {
    init_test_logging();
    test_phase!("cancelled_completion_is_always_deferred");

    let ctx = Context::new();
    let _guard = ctx.push_thread_default();
    let token = CancelToken::new();
    let completed = Arc::new(AtomicBool::new(false));

    // Create in iteration 1 so iteration 2 would normally complete
    // synchronously.
    let created = Arc::new(std::sync::Mutex::new(None::<Task>));
    {
        let created = Arc::clone(&created);
        let completed = Arc::clone(&completed);
        let token = token.clone();
        ctx.invoke(None, 0, move || {
            let task = Task::builder()
                .cancel_token(token)
                .callback(move |_| completed.store(true, Ordering::SeqCst))
                .build();
            *created.lock().unwrap() = Some(task);
        });
    }
    ctx.iterate();
    let task = created.lock().unwrap().take().expect("created");

    token.cancel();
    let observed_inline = Arc::new(AtomicBool::new(false));
    {
        let completed = Arc::clone(&completed);
        let observed_inline = Arc::clone(&observed_inline);
        ctx.invoke(None, 0, move || {
            task.return_bool(true);
            // A fired token suppresses synchronous completion even from a
            // later iteration.
            observed_inline.store(completed.load(Ordering::SeqCst), Ordering::SeqCst);
        });
    }
    ctx.iterate();
    assert!(!observed_inline.load(Ordering::SeqCst));
    ctx.iterate();
    assert!(completed.load(Ordering::SeqCst));

    test_complete!("cancelled_completion_is_always_deferred");
}

// ============================================================================
// return_on_cancel
// ============================================================================

#[test]
fn return_on_cancel_completes_without_waiting_for_body() {
    init_test_logging();
    test_phase!("return_on_cancel_completes_without_waiting_for_body");

    let pool = test_pool();
    let ctx = Context::new();
    let _guard = ctx.push_thread_default();
    let token = CancelToken::new();
    let completed = Arc::new(AtomicBool::new(false));
    let body_finished = Arc::new(AtomicBool::new(false));
    let (body_started_tx, body_started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let task = {
        let completed = Arc::clone(&completed);
        Task::builder()
            .cancel_token(token.clone())
            .callback(move |task| {
                assert_propagated_cancelled!(task.propagate_bool());
                completed.store(true, Ordering::SeqCst);
            })
            .build()
    };
    task.set_return_on_cancel(true);

    {
        let body_finished = Arc::clone(&body_finished);
        task.run_in_thread_on(&pool.handle(), move |task, _, _, _| {
            body_started_tx.send(()).unwrap();
            // Body stalls well past the cancellation below.
            let _ = release_rx.recv_timeout(Duration::from_secs(10));
            body_finished.store(true, Ordering::SeqCst);
            // Ignored: cancellation already produced the result.
            task.return_bool(true);
        });
    }
    body_started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("body starts");

    test_section!("cancel completes the task while the body is stuck");
    token.cancel();
    assert_reaches(Duration::from_secs(5), "completion queued", || {
        ctx.iterate();
        completed.load(Ordering::SeqCst)
    });
    assert!(
        !body_finished.load(Ordering::SeqCst),
        "completion must not wait for the body"
    );

    test_section!("the abandoned body finishes without effect");
    release_tx.send(()).unwrap();
    assert_reaches(Duration::from_secs(5), "body unblocked", || {
        body_finished.load(Ordering::SeqCst)
    });
    // No second completion is delivered.
    assert!(!ctx.wait_pending(Duration::from_millis(100)));

    test_complete!("return_on_cancel_completes_without_waiting_for_body");
}

#[test]
fn set_return_on_cancel_reports_missed_cancellation() {
    init_test_logging();
    test_phase!("set_return_on_cancel_reports_missed_cancellation");

    let pool = test_pool();
    let ctx = Context::new();
    let _guard = ctx.push_thread_default();
    let token = CancelToken::new();
    let committed = Arc::new(AtomicBool::new(false));
    let reacquired = Arc::new(AtomicBool::new(true));
    let (in_critical_tx, in_critical_rx) = mpsc::channel();
    let (cancel_done_tx, cancel_done_rx) = mpsc::channel::<()>();

    let task = Task::builder().cancel_token(token.clone()).build();
    task.set_return_on_cancel(true);

    {
        let committed = Arc::clone(&committed);
        let reacquired = Arc::clone(&reacquired);
        task.run_in_thread_on(&pool.handle(), move |task, _, _, _| {
            // Enter the no-cancel window to mutate shared state.
            assert!(task.set_return_on_cancel(false));
            in_critical_tx.send(()).unwrap();
            cancel_done_rx
                .recv_timeout(Duration::from_secs(10))
                .unwrap();
            committed.store(true, Ordering::SeqCst);
            // The token fired during the window: re-arming fails and the
            // task completes here, taking our committed state as final.
            reacquired.store(task.set_return_on_cancel(true), Ordering::SeqCst);
        });
    }

    in_critical_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("body reaches critical section");
    token.cancel();
    cancel_done_tx.send(()).unwrap();

    assert_reaches(Duration::from_secs(5), "body commits", || {
        committed.load(Ordering::SeqCst)
    });
    assert_reaches(Duration::from_secs(5), "re-arm observed", || {
        !reacquired.load(Ordering::SeqCst)
    });
    assert_reaches(Duration::from_secs(5), "completion delivered", || {
        ctx.iterate();
        task.is_completed()
    });
    assert_propagated_cancelled!(task.propagate_bool());

    test_complete!("set_return_on_cancel_reports_missed_cancellation");
}

#[test]
fn sync_caller_unblocks_on_forced_completion() {
    init_test_logging();
    test_phase!("sync_caller_unblocks_on_forced_completion");

    let pool = test_pool();
    let token = CancelToken::new();
    let body_finished = Arc::new(AtomicBool::new(false));
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    // Cancel from another thread once the body is stuck.
    let canceller = {
        let token = token.clone();
        std::thread::spawn(move || {
            started_rx.recv_timeout(Duration::from_secs(10)).unwrap();
            token.cancel();
        })
    };

    let task = Task::builder().cancel_token(token).build();
    task.set_return_on_cancel(true);
    {
        let body_finished = Arc::clone(&body_finished);
        task.run_in_thread_sync_on(&pool.handle(), move |task, _, _, _| {
            started_tx.send(()).unwrap();
            // Body stalls well past the cancellation above.
            let _ = release_rx.recv_timeout(Duration::from_secs(10));
            body_finished.store(true, Ordering::SeqCst);
            // Ignored: cancellation already produced the result.
            task.return_bool(true);
        });
    }

    // The blocked caller resumed on the forced completion, not on the
    // body finishing.
    assert!(
        !body_finished.load(Ordering::SeqCst),
        "caller must not wait for the body"
    );
    assert!(task.is_completed());
    assert_propagated_cancelled!(task.propagate_bool());

    test_section!("the abandoned body finishes without effect");
    release_tx.send(()).unwrap();
    assert_reaches(Duration::from_secs(5), "body unblocked", || {
        body_finished.load(Ordering::SeqCst)
    });
    canceller.join().expect("canceller thread panicked");

    test_complete!("sync_caller_unblocks_on_forced_completion");
}

#[test]
fn pre_cancelled_return_on_cancel_skips_the_body() {
    init_test_logging();
    test_phase!("pre_cancelled_return_on_cancel_skips_the_body");

    let pool = test_pool();
    let ctx = Context::new();
    let _guard = ctx.push_thread_default();
    let token = CancelToken::new();
    token.cancel();

    let body_ran = Arc::new(AtomicBool::new(false));
    let task = Task::builder().cancel_token(token).build();
    task.set_return_on_cancel(true);
    {
        let body_ran = Arc::clone(&body_ran);
        task.run_in_thread_on(&pool.handle(), move |task, _, _, _| {
            body_ran.store(true, Ordering::SeqCst);
            task.return_bool(true);
        });
    }

    assert_reaches(Duration::from_secs(5), "completion delivered", || {
        ctx.iterate();
        task.is_completed()
    });
    assert!(!body_ran.load(Ordering::SeqCst), "body must not start");
    assert_propagated_cancelled!(task.propagate_bool());

    test_complete!("pre_cancelled_return_on_cancel_skips_the_body");
}

#[test]
fn return_error_if_cancelled_inside_body() {
    init_test_logging();
    test_phase!("return_error_if_cancelled_inside_body");

    let pool = test_pool();
    let ctx = Context::new();
    let _guard = ctx.push_thread_default();
    let token = CancelToken::new();
    token.cancel();

    let task = Task::builder().cancel_token(token).build();
    task.run_in_thread_on(&pool.handle(), move |task, _, _, token| {
        assert!(token.expect("token forwarded to body").is_cancelled());
        if task.return_error_if_cancelled() {
            return;
        }
        task.return_bool(true);
    });

    assert_reaches(Duration::from_secs(5), "completion delivered", || {
        ctx.iterate();
        task.is_completed()
    });
    assert_propagated_cancelled!(task.propagate_bool());

    test_complete!("return_error_if_cancelled_inside_body");
}
