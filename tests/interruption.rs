//! Interruption semantics: latching, masked regions, and fiber
//! transparency.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use undercurrent::prelude::*;
use undercurrent::testing::run_virtual;
use undercurrent::{assert_interrupted, assert_success, run_callback};

// ============================================================================
// Basic interruption
// ============================================================================

#[test]
fn interrupting_a_parked_fiber_settles_it_interrupted() {
    let step = never::<i32, String>()
        .fork()
        .and_then(|fiber| fiber.interrupt());
    match run_virtual(step) {
        Exit::Success(child_exit) => assert_interrupted!(child_exit),
        other => panic!("race scaffold failed: {:?}", other),
    }
}

#[test]
fn interrupting_a_terminal_fiber_is_a_no_op() {
    let step = pure::<_, String>(5)
        .fork()
        .and_then(|fiber| fiber.join().zip(pure(fiber)))
        .and_then(|(value, fiber)| fiber.interrupt().map(move |exit| (value, exit)));
    match run_virtual(step) {
        Exit::Success((value, exit)) => {
            assert_eq!(value, 5);
            assert_eq!(exit, Exit::Success(5), "exit must be the original one");
        }
        other => panic!("unexpected exit: {:?}", other),
    }
}

// ============================================================================
// Masked regions
// ============================================================================

#[test]
fn uninterruptible_region_finishes_before_the_interrupt_lands() {
    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    let child = uninterruptible_mask::<_, String, _>(move |_| {
        after(Duration::from_millis(10)).and_then(move |()| {
            sync(move || {
                flag.store(true, Ordering::SeqCst);
            })
        })
    });

    // Yield once so the child is parked inside the mask before the
    // interrupt is signalled.
    let step = child
        .fork()
        .and_then(|fiber| shift::<String>().and_then(move |()| fiber.interrupt()));
    match run_virtual(step) {
        Exit::Success(child_exit) => assert_interrupted!(child_exit),
        other => panic!("unexpected exit: {:?}", other),
    }
    assert!(
        finished.load(Ordering::SeqCst),
        "masked work must complete before interruption takes effect"
    );
}

#[test]
fn interrupt_lands_at_the_mask_boundary_before_the_next_continuation() {
    let continued = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&continued);

    let child = uninterruptible_mask::<_, String, _>(|_| {
        after(Duration::from_millis(10)).map(|()| 5)
    })
    .and_then(move |n| {
        sync(move || {
            flag.store(true, Ordering::SeqCst);
            n
        })
    });

    let step = child
        .fork()
        .and_then(|fiber| shift::<String>().and_then(move |()| fiber.interrupt()));
    match run_virtual(step) {
        Exit::Success(child_exit) => assert_interrupted!(child_exit),
        other => panic!("unexpected exit: {:?}", other),
    }
    assert!(
        !continued.load(Ordering::SeqCst),
        "the masked value must be abandoned once the region reopens"
    );
}

#[test]
fn latched_interrupt_merges_with_a_relifted_failure() {
    let child = uninterruptible_mask::<_, String, _>(|restore| {
        after(Duration::from_millis(10)).and_then(move |()| {
            restore.restore(complete(Exit::<String, i32>::failed("inner".to_string())))
        })
    });

    let step = child
        .fork()
        .and_then(|fiber| shift::<String>().and_then(move |()| fiber.interrupt()));
    match run_virtual(step) {
        Exit::Success(child_exit) => assert_eq!(
            child_exit,
            Exit::Failure(
                Cause::Interrupted.and(Cause::Failed("inner".to_string()))
            ),
            "neither the interrupt nor the typed failure may be dropped"
        ),
        other => panic!("unexpected exit: {:?}", other),
    }
}

#[test]
fn restore_reopens_an_interruptible_window() {
    let reached_after_window = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&reached_after_window);

    let child = uninterruptible_mask::<_, String, _>(move |restore| {
        restore
            .restore(never::<(), String>())
            .and_then(move |()| {
                sync(move || {
                    flag.store(true, Ordering::SeqCst);
                })
            })
    });

    let step = child
        .fork()
        .and_then(|fiber| shift::<String>().and_then(move |()| fiber.interrupt()));
    match run_virtual(step) {
        Exit::Success(child_exit) => assert_interrupted!(child_exit),
        other => panic!("unexpected exit: {:?}", other),
    }
    assert!(
        !reached_after_window.load(Ordering::SeqCst),
        "interruption in the restored window must skip the rest of the mask"
    );
}

#[test]
fn on_interrupted_cleanup_runs_only_for_interruption() {
    let cleanups = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&cleanups);
    let interrupted_path = never::<i32, String>()
        .on_interrupted(sync(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .fork()
        .and_then(|fiber| shift::<String>().and_then(move |()| fiber.interrupt()));
    match run_virtual(interrupted_path) {
        Exit::Success(child_exit) => assert_interrupted!(child_exit),
        other => panic!("unexpected exit: {:?}", other),
    }
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);

    let counter = Arc::clone(&cleanups);
    let failing_path = fail::<i32, _>("plain failure".to_string()).on_interrupted(sync(
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    ));
    assert_eq!(
        run_virtual(failing_path),
        Exit::failed("plain failure".to_string())
    );
    assert_eq!(
        cleanups.load(Ordering::SeqCst),
        1,
        "a typed failure is not interruption"
    );
}

// ============================================================================
// Fork/join transparency
// ============================================================================

#[test]
fn join_is_transparent_for_values_and_failures() {
    let value_inline = run_virtual(pure::<_, String>(3).delay(Duration::from_millis(10)));
    let value_forked = run_virtual(
        pure::<_, String>(3)
            .delay(Duration::from_millis(10))
            .fork()
            .and_then(|fiber| fiber.join()),
    );
    assert_eq!(value_inline, value_forked);

    let failure_inline = run_virtual(fail::<i32, _>("boom".to_string()));
    let failure_forked = run_virtual(
        fail::<i32, _>("boom".to_string())
            .fork()
            .and_then(|fiber| fiber.join()),
    );
    assert_eq!(failure_inline, failure_forked);
}

#[test]
fn joining_an_interrupted_fiber_reraises_interruption() {
    let step = never::<i32, String>()
        .fork()
        .and_then(|fiber| {
            let handle = fiber.clone();
            fiber.interrupt().and_then(move |_| handle.join())
        })
        .result::<String>()
        .uninterruptible();
    match run_virtual(step) {
        Exit::Success(joined) => assert_interrupted!(joined),
        other => panic!("unexpected exit: {:?}", other),
    }
}

// ============================================================================
// Top-level interrupt handle (real runtime)
// ============================================================================

#[test]
fn interrupt_handle_cancels_a_running_effect() {
    let (tx, rx) = std::sync::mpsc::channel();
    let handle = run_callback(
        never::<i32, String>(),
        RuntimeHandle::trampoline(),
        move |exit| {
            let _ = tx.send(exit);
        },
    );
    handle.interrupt();
    let exit = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("interrupted effect must settle");
    assert_interrupted!(exit);
}

#[test]
fn run_callback_delivers_success_without_blocking() {
    let (tx, rx) = std::sync::mpsc::channel();
    let _handle = run_callback(
        pure::<_, String>(11).delay(Duration::from_millis(5)),
        RuntimeHandle::trampoline(),
        move |exit| {
            let _ = tx.send(exit);
        },
    );
    let exit = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("timer-backed effect must settle");
    assert_success!(exit);
    assert_eq!(exit, Exit::Success(11));
}
