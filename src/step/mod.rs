//! Inert effect descriptions.
//!
//! A [`Step<E, A>`] describes a computation that, when executed by a
//! driver, either produces an `A`, fails with a typed `E`, aborts with a
//! defect, or is interrupted. Building a step performs no work: `map`,
//! `and_then`, `fold` and friends only grow the description, and nothing
//! runs until the step is handed to [`run`](crate::run),
//! [`run_callback`](crate::run_callback), [`run_future`](crate::run_future)
//! or forked into a [`Fiber`](crate::fiber::Fiber).
//!
//! Combinators are stack-safe by construction: the driver interprets the
//! description iteratively, so a chain of a million `and_then`s runs in
//! constant native stack.
//!
//! # Example
//!
//! ```
//! use undercurrent::prelude::*;
//!
//! let step = pure::<_, String>(2)
//!     .and_then(|n| pure(n * 3))
//!     .map(|n| n + 1);
//! assert_eq!(undercurrent::run(step), Exit::Success(7));
//! ```
//!
//! Typed failures travel on their own channel and are recovered with
//! [`Step::fold`] or captured with [`Step::attempt`]:
//!
//! ```
//! use undercurrent::prelude::*;
//!
//! let step = fail::<i32, _>("boom").attempt::<String>();
//! assert_eq!(undercurrent::run(step), Exit::Success(Err("boom")));
//! ```

use std::marker::PhantomData;
use std::time::Duration;

use crate::cause::Cause;
use crate::exit::Exit;

pub mod constructors;
pub(crate) mod raw;

pub use constructors::{
    abort, after, async_op, check_interruptible, complete, fail, fail_cause, never, pure,
    runtime, shift, suspend, sync, try_sync, AsyncResume, Restore,
};
pub use constructors::{interruptible_mask, uninterruptible_mask};

use raw::{
    bind_typed, map_failed_leaves, reify_cause, take_primary_failure, AnyValue, RawStep,
};

/// An inert description of an effectful computation producing `A` or
/// failing with `E`. See the [module documentation](self).
pub struct Step<E, A> {
    raw: RawStep,
    _types: PhantomData<fn() -> (E, A)>,
}

impl<E, A> Step<E, A> {
    pub(crate) fn from_raw(raw: RawStep) -> Self {
        Step {
            raw,
            _types: PhantomData,
        }
    }

    pub(crate) fn into_raw(self) -> RawStep {
        self.raw
    }
}

impl<E, A> std::fmt::Debug for Step<E, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step").field("op", &self.raw.tag()).finish()
    }
}

impl<E, A> Step<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    /// Transform the success value.
    pub fn map<B, F>(self, f: F) -> Step<E, B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        Step::from_raw(RawStep::Chain(
            Box::new(self.raw),
            bind_typed::<A, _>(move |a| RawStep::Succeed(Box::new(f(a)) as AnyValue)),
        ))
    }

    /// Sequence another step after this one's success.
    pub fn and_then<B, F>(self, f: F) -> Step<E, B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Step<E, B> + Send + 'static,
    {
        Step::from_raw(RawStep::Chain(
            Box::new(self.raw),
            bind_typed::<A, _>(move |a| f(a).into_raw()),
        ))
    }

    /// Transform the typed error, everywhere it appears in the cause.
    ///
    /// This is a pure transformation, not a recovery: it applies even to
    /// causes the interrupt rules keep away from [`fold`](Step::fold),
    /// such as a typed failure suppressed onto an interrupt.
    pub fn map_err<E2, F>(self, mut f: F) -> Step<E2, A>
    where
        E2: Send + 'static,
        F: FnMut(E) -> E2 + Send + 'static,
    {
        Step::from_raw(RawStep::TransformCause(
            Box::new(self.raw),
            Box::new(move |cause| {
                map_failed_leaves(cause, &mut |any| match any.downcast::<E>() {
                    Ok(error) => Box::new(f(*error)) as AnyValue,
                    Err(other) => other,
                })
            }),
        ))
    }

    /// Branch on the outcome of the typed channel.
    ///
    /// `on_failure` sees the typed error when the primary cause is a
    /// typed failure; recovering discards anything suppressed onto that
    /// failure. Defects and interrupts are not observed here and keep
    /// propagating; use [`fold_cause`](Step::fold_cause) for those.
    pub fn fold<E2, B, FS, FF>(self, on_success: FS, on_failure: FF) -> Step<E2, B>
    where
        E2: Send + 'static,
        B: Send + 'static,
        FS: FnOnce(A) -> Step<E2, B> + Send + 'static,
        FF: FnOnce(E) -> Step<E2, B> + Send + 'static,
    {
        Step::from_raw(RawStep::Fold(
            Box::new(self.raw),
            bind_typed::<A, _>(move |a| on_success(a).into_raw()),
            Box::new(move |cause| match take_primary_failure(cause) {
                Ok(any) => match any.downcast::<E>() {
                    Ok(error) => on_failure(*error).into_raw(),
                    Err(_) => RawStep::Caused(Cause::Aborted(raw::type_confusion(
                        "typed recovery",
                    ))),
                },
                Err(rest) => RawStep::Caused(rest),
            }),
        ))
    }

    /// Branch on the outcome with full cause visibility.
    ///
    /// `on_failure` observes typed failures and defects unconditionally.
    /// Interrupt-bearing causes reach it only while the surrounding
    /// region is uninterruptible; while interruptible, interruption wins
    /// and keeps unwinding.
    pub fn fold_cause<E2, B, FS, FC>(self, on_success: FS, on_failure: FC) -> Step<E2, B>
    where
        E2: Send + 'static,
        B: Send + 'static,
        FS: FnOnce(A) -> Step<E2, B> + Send + 'static,
        FC: FnOnce(Cause<E>) -> Step<E2, B> + Send + 'static,
    {
        Step::from_raw(RawStep::Fold(
            Box::new(self.raw),
            bind_typed::<A, _>(move |a| on_success(a).into_raw()),
            Box::new(move |cause| on_failure(reify_cause::<E>(cause)).into_raw()),
        ))
    }

    /// Recover from a typed failure with a fallback step.
    pub fn or_else<E2, F>(self, f: F) -> Step<E2, A>
    where
        E2: Send + 'static,
        F: FnOnce(E) -> Step<E2, A> + Send + 'static,
    {
        self.fold(pure, f)
    }

    /// Move the typed error into the success channel.
    ///
    /// Defects and interruption still propagate; only the typed channel
    /// is surfaced as a `Result`.
    pub fn attempt<E2>(self) -> Step<E2, Result<A, E>>
    where
        E2: Send + 'static,
    {
        self.fold(|a| pure(Ok(a)), |e| pure(Err(e)))
    }

    /// Capture the full outcome, cause and all, into the success channel.
    ///
    /// Subject to the interrupt rules of [`fold_cause`](Step::fold_cause):
    /// while interruptible, an interrupt is not captured.
    pub fn result<E2>(self) -> Step<E2, Exit<E, A>>
    where
        E2: Send + 'static,
    {
        self.fold_cause(
            |a| pure(Exit::Success(a)),
            |cause| pure(Exit::Failure(cause)),
        )
    }

    /// Sequence two steps, keeping both values.
    pub fn zip<B>(self, other: Step<E, B>) -> Step<E, (A, B)>
    where
        B: Send + 'static,
    {
        self.and_then(move |a| other.map(move |b| (a, b)))
    }

    /// Mark this step interruptible, restoring the enclosing region
    /// afterwards.
    pub fn interruptible(self) -> Step<E, A> {
        Step::from_raw(RawStep::InterruptibleRegion(Box::new(self.raw), true))
    }

    /// Mark this step uninterruptible, restoring the enclosing region
    /// afterwards. An interrupt arriving inside is latched and takes
    /// effect as soon as the fiber becomes interruptible again.
    pub fn uninterruptible(self) -> Step<E, A> {
        Step::from_raw(RawStep::InterruptibleRegion(Box::new(self.raw), false))
    }

    /// Run this step after a timer delay.
    pub fn delay(self, delay: Duration) -> Step<E, A> {
        after::<E>(delay).and_then(move |()| self)
    }
}

impl<E, A> Step<E, A>
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    /// Start this step on a new fiber sharing the current runtime.
    ///
    /// The fork itself is immediate; the child begins executing on the
    /// dispatcher independently of the parent. `Clone` bounds exist
    /// because the child's exit may be observed by any number of joiners.
    pub fn fork(self) -> Step<E, crate::fiber::Fiber<E, A>> {
        crate::fiber::fork_as::<E, E, A>(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run;

    #[test]
    fn map_and_then_compose() {
        let step = pure::<_, String>(10).and_then(|n| pure(n - 3)).map(|n| n * 2);
        assert_eq!(run(step), Exit::Success(14));
    }

    #[test]
    fn fold_recovers_typed_failures_only() {
        let recovered = fail::<i32, _>("nope".to_string()).fold(
            |n| pure::<_, String>(n),
            |e| pure(e.len() as i32),
        );
        assert_eq!(run(recovered), Exit::Success(4));

        let defect = abort::<i32, String>(crate::cause::Defect::message("broken"))
            .fold(pure::<i32, String>, |_| pure(0));
        assert!(matches!(
            run(defect),
            Exit::Failure(Cause::Aborted(ref d)) if d.as_message() == Some("broken")
        ));
    }

    #[test]
    fn map_err_reaches_suppressed_leaves() {
        let cause = Cause::Failed(1u8).and(Cause::Failed(2u8));
        let step = fail_cause::<(), u8>(cause).map_err(|n| u32::from(n) * 100);
        assert_eq!(
            run(step),
            Exit::Failure(Cause::Failed(100u32).and(Cause::Failed(200u32)))
        );
    }

    #[test]
    fn attempt_captures_and_result_captures_cause() {
        let attempted = fail::<(), _>("e").attempt::<String>();
        assert_eq!(run(attempted), Exit::Success(Err("e")));

        let captured = fail::<(), _>("e").result::<String>();
        assert_eq!(run(captured), Exit::Success(Exit::failed("e")));
    }

    #[test]
    fn zip_keeps_declaration_order() {
        let step = pure::<_, String>(1).zip(pure(2));
        assert_eq!(run(step), Exit::Success((1, 2)));
    }

    #[test]
    fn panic_in_continuation_becomes_defect() {
        let step = pure::<_, String>(()).map(|()| -> i32 { panic!("kaboom") });
        match run(step) {
            Exit::Failure(Cause::Aborted(defect)) => {
                assert_eq!(defect.as_message(), Some("kaboom"));
            }
            other => panic!("unexpected exit: {:?}", other),
        }
    }

    #[test]
    fn sync_defers_until_run() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let step = sync::<_, String, _>(move || {
            flag.store(true, Ordering::SeqCst);
            5
        });
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(run(step), Exit::Success(5));
        assert!(ran.load(Ordering::SeqCst));
    }
}
