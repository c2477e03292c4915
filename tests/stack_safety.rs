//! Stack safety: deep compositions must run in constant native stack.

use undercurrent::prelude::*;
use undercurrent::testing::run_virtual;

const DEPTH: u32 = 100_000;

#[test]
fn deep_and_then_chain_completes() {
    let mut step = pure::<_, String>(0u32);
    for _ in 0..DEPTH {
        step = step.and_then(|n| pure(n + 1));
    }
    assert_eq!(run_virtual(step), Exit::Success(DEPTH));
}

#[test]
fn deep_map_chain_completes() {
    let mut step = pure::<_, String>(0u64);
    for _ in 0..DEPTH {
        step = step.map(|n| n + 1);
    }
    assert_eq!(run_virtual(step), Exit::Success(u64::from(DEPTH)));
}

#[test]
fn deep_suspend_recursion_completes() {
    fn countdown(n: u32) -> Step<String, u32> {
        if n == 0 {
            pure(0)
        } else {
            suspend(move || countdown(n - 1).map(|acc| acc + 1))
        }
    }
    assert_eq!(run_virtual(countdown(DEPTH)), Exit::Success(DEPTH));
}

#[test]
fn deep_unwinding_skips_binds_without_recursion() {
    let mut step = fail::<u32, _>("bottom".to_string());
    for _ in 0..DEPTH {
        step = step.and_then(|n| pure(n + 1));
    }
    assert_eq!(run_virtual(step), Exit::failed("bottom".to_string()));
}

#[test]
fn deep_or_else_tower_recovers() {
    let mut step = fail::<u32, String>("seed".to_string());
    for _ in 0..10_000 {
        step = step.or_else(|e: String| fail::<u32, String>(e));
    }
    let recovered = step.or_else(|_| pure::<_, String>(7u32));
    assert_eq!(run_virtual(recovered), Exit::Success(7));
}

#[test]
fn deep_chain_across_suspension_points_completes() {
    let mut step = pure::<_, String>(0u32);
    for _ in 0..10_000 {
        step = step.and_then(|n| shift::<String>().map(move |()| n + 1));
    }
    assert_eq!(run_virtual(step), Exit::Success(10_000));
}
