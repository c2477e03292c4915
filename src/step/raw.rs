//! Interpreter-facing representation of effect descriptions.
//!
//! The public [`Step`](super::Step) type erases its value and error types
//! into `Box<dyn Any + Send>` so the driver can interpret one closed enum
//! regardless of what flows through it. The typed layer guarantees every
//! erased value is re-typed by the continuation that consumes it, so the
//! downcasts here only fail if the crate itself has a bug, in which case
//! the failure surfaces as an `Aborted` defect rather than a panic.

use std::any::Any;

use crate::cause::{Cause, Defect};
use crate::driver::RawResume;
use crate::exit::Exit;

/// A type-erased success value or error value.
pub(crate) type AnyValue = Box<dyn Any + Send>;

/// A cause whose typed errors have been erased.
pub(crate) type AnyCause = Cause<AnyValue>;

/// An exit whose value and errors have been erased.
pub(crate) type AnyExit = Exit<AnyValue, AnyValue>;

/// Continuation applied to a success value.
pub(crate) type BindFn = Box<dyn FnOnce(AnyValue) -> RawStep + Send>;

/// Recovery applied to a propagating cause.
pub(crate) type RecoverFn = Box<dyn FnOnce(AnyCause) -> RawStep + Send>;

/// Deferred synchronous computation.
pub(crate) type SuspendFn = Box<dyn FnOnce() -> RawStep + Send>;

/// Cancellation action returned by an asynchronous registration.
pub(crate) type CancelFn = Box<dyn FnOnce() + Send>;

/// Asynchronous registration: receives the resume handle, returns the
/// cancellation action.
pub(crate) type RegisterFn = Box<dyn FnOnce(RawResume) -> CancelFn + Send>;

/// Pure cause transformation applied during unwinding. Unlike a
/// [`RecoverFn`] it cannot swallow the cause, so the driver applies it
/// unconditionally, interrupt or not.
pub(crate) type TransformFn = Box<dyn FnOnce(AnyCause) -> AnyCause + Send>;

/// The effect description the driver interprets.
///
/// Persistent and shared-by-reference at the typed layer; each variant is
/// consumed exactly once by the driver that reduces it.
pub(crate) enum RawStep {
    /// Produce a value.
    Succeed(AnyValue),
    /// Terminate with a cause.
    Caused(AnyCause),
    /// Re-lift an existing exit.
    Complete(AnyExit),
    /// Defer a synchronous side effect; panics become `Aborted`.
    Suspend(SuspendFn),
    /// Suspend on an external callback.
    Async(RegisterFn),
    /// Sequence: run left, feed its value to the continuation.
    Chain(Box<RawStep>, BindFn),
    /// Run left; on success continue, on failure recover (when permitted).
    Fold(Box<RawStep>, BindFn, RecoverFn),
    /// Run left; transform any propagating cause without recovering.
    TransformCause(Box<RawStep>, TransformFn),
    /// Demarcate an interruptible (`true`) or uninterruptible (`false`)
    /// region around the inner step.
    InterruptibleRegion(Box<RawStep>, bool),
    /// Query driver-local platform state.
    Platform(PlatformRequest),
}

/// What a `Platform` step asks the driver for.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PlatformRequest {
    /// The runtime handle this fiber was started with.
    Runtime,
    /// Whether the fiber is currently interruptible.
    Interruptible,
}

impl RawStep {
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            RawStep::Succeed(_) => "Succeed",
            RawStep::Caused(_) => "Caused",
            RawStep::Complete(_) => "Complete",
            RawStep::Suspend(_) => "Suspend",
            RawStep::Async(_) => "Async",
            RawStep::Chain(..) => "Chain",
            RawStep::Fold(..) => "Fold",
            RawStep::TransformCause(..) => "TransformCause",
            RawStep::InterruptibleRegion(..) => "InterruptibleRegion",
            RawStep::Platform(_) => "Platform",
        }
    }
}

pub(crate) fn type_confusion(context: &str) -> Defect {
    Defect::message(format!(
        "value of unexpected type reached a {} continuation",
        context
    ))
}

pub(crate) fn erase_cause<E: Send + 'static>(cause: Cause<E>) -> AnyCause {
    cause.map(|e| Box::new(e) as AnyValue)
}

pub(crate) fn reify_cause<E: Send + 'static>(cause: AnyCause) -> Cause<E> {
    match cause {
        Cause::Failed(any) => match any.downcast::<E>() {
            Ok(error) => Cause::Failed(*error),
            Err(_) => Cause::Aborted(type_confusion("typed error")),
        },
        Cause::Aborted(defect) => Cause::Aborted(defect),
        Cause::Interrupted => Cause::Interrupted,
        Cause::Suppressed(primary, secondary) => Cause::Suppressed(
            Box::new(reify_cause::<E>(*primary)),
            Box::new(reify_cause::<E>(*secondary)),
        ),
    }
}

pub(crate) fn erase_exit<E: Send + 'static, A: Send + 'static>(exit: Exit<E, A>) -> AnyExit {
    match exit {
        Exit::Success(value) => Exit::Success(Box::new(value) as AnyValue),
        Exit::Failure(cause) => Exit::Failure(erase_cause(cause)),
    }
}

pub(crate) fn reify_exit<E: Send + 'static, A: Send + 'static>(exit: AnyExit) -> Exit<E, A> {
    match exit {
        Exit::Success(any) => match any.downcast::<A>() {
            Ok(value) => Exit::Success(*value),
            Err(_) => Exit::Failure(Cause::Aborted(type_confusion("success value"))),
        },
        Exit::Failure(cause) => Exit::Failure(reify_cause::<E>(cause)),
    }
}

/// Split the primary typed failure off an erased cause. `Ok` carries the
/// leftmost `Failed` leaf's value with whatever was suppressed onto it
/// discarded (recovering from a failure handles it, suppressed
/// bookkeeping and all); `Err` returns the cause untouched.
pub(crate) fn take_primary_failure(cause: AnyCause) -> Result<AnyValue, AnyCause> {
    match cause {
        Cause::Failed(value) => Ok(value),
        Cause::Suppressed(primary, secondary) => match take_primary_failure(*primary) {
            Ok(value) => Ok(value),
            Err(primary) => Err(Cause::Suppressed(Box::new(primary), secondary)),
        },
        other => Err(other),
    }
}

/// Rewrite every `Failed` leaf of an erased cause, leaving the rest of
/// the tree untouched. Leaves the transformer declines (by returning the
/// value unchanged) are preserved as-is rather than demoted.
pub(crate) fn map_failed_leaves<F>(cause: AnyCause, f: &mut F) -> AnyCause
where
    F: FnMut(AnyValue) -> AnyValue,
{
    match cause {
        Cause::Failed(value) => Cause::Failed(f(value)),
        Cause::Aborted(defect) => Cause::Aborted(defect),
        Cause::Interrupted => Cause::Interrupted,
        Cause::Suppressed(primary, secondary) => Cause::Suppressed(
            Box::new(map_failed_leaves(*primary, f)),
            Box::new(map_failed_leaves(*secondary, f)),
        ),
    }
}

/// Typed wrapper for [`BindFn`]: downcasts the erased value back to `A`
/// before applying the user's continuation.
pub(crate) fn bind_typed<A, F>(f: F) -> BindFn
where
    A: Send + 'static,
    F: FnOnce(A) -> RawStep + Send + 'static,
{
    Box::new(move |any| match any.downcast::<A>() {
        Ok(value) => f(*value),
        Err(_) => RawStep::Caused(Cause::Aborted(type_confusion("bind"))),
    })
}
