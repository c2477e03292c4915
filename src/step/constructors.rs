//! Ways to introduce a [`Step`].
//!
//! Every constructor is inert: `sync`, `suspend` and `async_op` capture
//! their closures without calling them, and nothing happens until a
//! driver interprets the description.
//!
//! Generic order is value type first, so the common partially-inferred
//! turbofish reads naturally: `pure::<_, MyError>(42)`.

use std::marker::PhantomData;
use std::time::Duration;

use crate::cause::{Cause, Defect};
use crate::driver::RawResume;
use crate::exit::Exit;
use crate::runtime::RuntimeHandle;
use crate::step::raw::{erase_cause, erase_exit, AnyValue, CancelFn, PlatformRequest, RawStep};
use crate::step::Step;

/// Lift a value into an always-successful step.
///
/// ```
/// use undercurrent::prelude::*;
///
/// assert_eq!(undercurrent::run(pure::<_, String>(1)), Exit::Success(1));
/// ```
pub fn pure<A, E>(value: A) -> Step<E, A>
where
    A: Send + 'static,
    E: Send + 'static,
{
    Step::from_raw(RawStep::Succeed(Box::new(value) as AnyValue))
}

/// A step that fails on the typed channel.
pub fn fail<A, E>(error: E) -> Step<E, A>
where
    A: Send + 'static,
    E: Send + 'static,
{
    Step::from_raw(RawStep::Caused(Cause::Failed(Box::new(error) as AnyValue)))
}

/// A step that terminates with an arbitrary cause.
pub fn fail_cause<A, E>(cause: Cause<E>) -> Step<E, A>
where
    A: Send + 'static,
    E: Send + 'static,
{
    Step::from_raw(RawStep::Caused(erase_cause(cause)))
}

/// A step that aborts with a defect, bypassing the typed channel.
pub fn abort<A, E>(defect: Defect) -> Step<E, A>
where
    A: Send + 'static,
    E: Send + 'static,
{
    Step::from_raw(RawStep::Caused(Cause::Aborted(defect)))
}

/// Re-lift a previously observed exit into a step.
pub fn complete<E, A>(exit: Exit<E, A>) -> Step<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    Step::from_raw(RawStep::Complete(erase_exit(exit)))
}

/// Defer the construction of a step until execution time.
pub fn suspend<A, E, F>(f: F) -> Step<E, A>
where
    A: Send + 'static,
    E: Send + 'static,
    F: FnOnce() -> Step<E, A> + Send + 'static,
{
    Step::from_raw(RawStep::Suspend(Box::new(move || f().into_raw())))
}

/// Defer a synchronous side effect. A panic in the closure becomes an
/// `Aborted` defect rather than unwinding through the driver.
pub fn sync<A, E, F>(f: F) -> Step<E, A>
where
    A: Send + 'static,
    E: Send + 'static,
    F: FnOnce() -> A + Send + 'static,
{
    Step::from_raw(RawStep::Suspend(Box::new(move || {
        RawStep::Succeed(Box::new(f()) as AnyValue)
    })))
}

/// Defer a fallible synchronous side effect; `Err` lands on the typed
/// channel.
pub fn try_sync<A, E, F>(f: F) -> Step<E, A>
where
    A: Send + 'static,
    E: Send + 'static,
    F: FnOnce() -> Result<A, E> + Send + 'static,
{
    Step::from_raw(RawStep::Suspend(Box::new(move || match f() {
        Ok(value) => RawStep::Succeed(Box::new(value) as AnyValue),
        Err(error) => RawStep::Caused(Cause::Failed(Box::new(error) as AnyValue)),
    })))
}

/// Fused resume handle for an asynchronous registration.
///
/// Consuming it completes the suspended effect; a handle whose
/// suspension was already resumed or cancelled delivers into the void.
pub struct AsyncResume<E, A> {
    raw: RawResume,
    _types: PhantomData<fn(E, A)>,
}

impl<E, A> AsyncResume<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    /// Resume with a success value.
    pub fn succeed(self, value: A) {
        self.complete(Exit::Success(value));
    }

    /// Resume with a typed failure.
    pub fn fail(self, error: E) {
        self.complete(Exit::failed(error));
    }

    /// Resume with a full exit.
    pub fn complete(self, exit: Exit<E, A>) {
        self.raw.resume(erase_exit(exit));
    }
}

impl<E, A> std::fmt::Debug for AsyncResume<E, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResume").finish_non_exhaustive()
    }
}

/// Suspend on an external callback.
///
/// `register` receives the resume handle and returns the cancellation
/// action the driver runs if the fiber is interrupted while suspended.
/// The handle may be consumed before `register` even returns (a
/// synchronously-completing operation); the cancellation action is then
/// run immediately instead of stored.
///
/// ```
/// use undercurrent::prelude::*;
///
/// let step = async_op::<i32, String, _, _>(|resume| {
///     resume.succeed(9);
///     || ()
/// });
/// assert_eq!(undercurrent::run(step), Exit::Success(9));
/// ```
pub fn async_op<A, E, F, C>(register: F) -> Step<E, A>
where
    A: Send + 'static,
    E: Send + 'static,
    F: FnOnce(AsyncResume<E, A>) -> C + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    Step::from_raw(RawStep::Async(Box::new(move |raw| {
        let cancel = register(AsyncResume {
            raw,
            _types: PhantomData,
        });
        Box::new(cancel) as CancelFn
    })))
}

/// A step that never completes. Interruptible, so it exits cleanly when
/// its fiber is interrupted.
pub fn never<A, E>() -> Step<E, A>
where
    A: Send + 'static,
    E: Send + 'static,
{
    async_op(|_resume| || ())
}

/// The runtime handle this fiber was started with.
pub fn runtime<E>() -> Step<E, RuntimeHandle>
where
    E: Send + 'static,
{
    Step::from_raw(RawStep::Platform(PlatformRequest::Runtime))
}

/// Whether the fiber is currently interruptible.
pub fn check_interruptible<E>() -> Step<E, bool>
where
    E: Send + 'static,
{
    Step::from_raw(RawStep::Platform(PlatformRequest::Interruptible))
}

/// Complete after a timer delay on the fiber's runtime. Interrupting the
/// fiber while it sleeps cancels the timer.
pub fn after<E>(delay: Duration) -> Step<E, ()>
where
    E: Send + 'static,
{
    runtime::<E>().and_then(move |rt| {
        async_op(move |resume: AsyncResume<E, ()>| {
            let timer = rt.dispatch_later(Box::new(move || resume.succeed(())), delay);
            move || timer.cancel()
        })
    })
}

/// Yield to the dispatcher, letting other queued work run before this
/// fiber continues.
pub fn shift<E>() -> Step<E, ()>
where
    E: Send + 'static,
{
    runtime::<E>().and_then(|rt| {
        async_op(move |resume: AsyncResume<E, ()>| {
            rt.dispatch(Box::new(move || resume.succeed(())));
            || ()
        })
    })
}

/// Capability to restore the interrupt region that was current when a
/// mask was entered. Handed to the closure of
/// [`uninterruptible_mask`]/[`interruptible_mask`].
#[derive(Debug, Clone, Copy)]
pub struct Restore {
    outer: bool,
}

impl Restore {
    /// Run `step` under the region that enclosed the mask.
    pub fn restore<E, A>(&self, step: Step<E, A>) -> Step<E, A>
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        Step::from_raw(RawStep::InterruptibleRegion(
            Box::new(step.into_raw()),
            self.outer,
        ))
    }
}

/// Run `f`'s step uninterruptibly, giving it a [`Restore`] capability to
/// punch interruptible windows back open.
///
/// This is the shape resource-safe operators are built from: acquisition
/// and release stay masked while the use of the resource is restored to
/// the caller's region.
pub fn uninterruptible_mask<A, E, F>(f: F) -> Step<E, A>
where
    A: Send + 'static,
    E: Send + 'static,
    F: FnOnce(Restore) -> Step<E, A> + Send + 'static,
{
    check_interruptible::<E>()
        .and_then(move |outer| f(Restore { outer }).uninterruptible())
}

/// Run `f`'s step interruptibly, giving it a [`Restore`] capability for
/// the enclosing region.
pub fn interruptible_mask<A, E, F>(f: F) -> Step<E, A>
where
    A: Send + 'static,
    E: Send + 'static,
    F: FnOnce(Restore) -> Step<E, A> + Send + 'static,
{
    check_interruptible::<E>().and_then(move |outer| f(Restore { outer }).interruptible())
}
