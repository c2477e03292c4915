//! Bridging executions into async Rust with `run_future`.

use std::time::Duration;

use undercurrent::prelude::*;
use undercurrent::{run_future, RuntimeHandle};

#[tokio::test]
async fn run_future_resolves_with_the_success_value() {
    let step = pure::<_, String>(6).map(|n| n * 7);
    let result = run_future(step, RuntimeHandle::trampoline()).await;
    assert_eq!(result, Ok(42));
}

#[tokio::test]
async fn run_future_surfaces_the_full_cause() {
    let step = fail::<i32, _>("wire down".to_string());
    let result = run_future(step, RuntimeHandle::trampoline()).await;
    assert_eq!(result, Err(Cause::Failed("wire down".to_string())));
}

#[tokio::test]
async fn run_future_waits_for_real_timers() {
    let step = pure::<_, String>("slept").delay(Duration::from_millis(20));
    let result = run_future(step, RuntimeHandle::trampoline()).await;
    assert_eq!(result, Ok("slept"));
}

#[tokio::test]
async fn run_future_reports_interruption_distinctly() {
    let step = never::<i32, String>()
        .fork()
        .and_then(|fiber| fiber.interrupt())
        .and_then(|child_exit| complete(child_exit));
    let result = run_future(step, RuntimeHandle::trampoline()).await;
    assert_eq!(result, Err(Cause::Interrupted));
}
