//! Lightweight concurrency: forked fibers and their handles.
//!
//! A [`Fiber`] is a handle to an effect running on its own driver,
//! sharing the parent's runtime. Forking is immediate (the child is
//! queued on the dispatcher and the parent keeps going), and the child's
//! terminal [`Exit`] is latched so any number of observers can `wait`,
//! `poll` or `join` it, before or after it completes.
//!
//! Joining is transparent: `join` re-raises the child's cause in the
//! parent exactly as if the child's effect had run inline, including
//! interruption.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use undercurrent::prelude::*;
//!
//! let step = pure::<_, String>(20)
//!     .delay(Duration::from_millis(5))
//!     .fork()
//!     .and_then(|fiber| fiber.join())
//!     .map(|n| n + 1);
//! assert_eq!(undercurrent::run(step), Exit::Success(21));
//! ```

use std::sync::Arc;

use crate::driver::Driver;
use crate::exit::Exit;
use crate::oneshot::OneShot;
use crate::runtime::RuntimeHandle;
use crate::step::raw::reify_exit;
use crate::step::{complete, runtime, suspend, sync, Step};

/// Handle to an effect running on its own driver.
///
/// `Clone` bounds on `E` and `A` exist because the latched exit is
/// cloned out to every observer.
pub struct Fiber<E, A> {
    driver: Arc<Driver>,
    cell: Arc<OneShot<Exit<E, A>>>,
}

impl<E, A> Clone for Fiber<E, A> {
    fn clone(&self) -> Self {
        Fiber {
            driver: Arc::clone(&self.driver),
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<E, A> std::fmt::Debug for Fiber<E, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("cell", &self.cell)
            .finish_non_exhaustive()
    }
}

/// Fork `step` onto a new driver using the current fiber's runtime.
///
/// The error type of the returned step is independent of the child's:
/// forking itself cannot fail.
pub(crate) fn fork_as<EF, E, A>(step: Step<E, A>) -> Step<EF, Fiber<E, A>>
where
    EF: Send + 'static,
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    runtime::<EF>().map(move |rt| Fiber::start(rt, step))
}

impl<E, A> Fiber<E, A>
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    /// Start `step` on its own driver immediately.
    pub fn start(runtime: RuntimeHandle, step: Step<E, A>) -> Fiber<E, A> {
        let cell = Arc::new(OneShot::new());
        let latch = Arc::clone(&cell);
        let driver = Driver::new(
            runtime,
            Box::new(move |exit| latch.complete(reify_exit::<E, A>(exit))),
        );
        Driver::start(&driver, step.into_raw());
        Fiber { driver, cell }
    }

    /// Suspend until the fiber terminates, yielding its full exit.
    ///
    /// Never fails on the caller's typed channel; an interrupted or
    /// failed child shows up inside the `Exit`.
    pub fn wait<EF>(&self) -> Step<EF, Exit<E, A>>
    where
        EF: Send + 'static,
    {
        Arc::clone(&self.cell).wait()
    }

    /// The fiber's exit if it has already terminated.
    pub fn poll<EF>(&self) -> Step<EF, Option<Exit<E, A>>>
    where
        EF: Send + 'static,
    {
        let cell = Arc::clone(&self.cell);
        sync(move || cell.poll())
    }

    /// Suspend until the fiber terminates, re-raising its outcome in the
    /// caller: the child's value, failure, defect or interruption become
    /// the caller's own.
    pub fn join(&self) -> Step<E, A> {
        self.wait::<E>().and_then(complete)
    }

    /// Signal interruption and wait for the fiber to settle, yielding
    /// its final exit.
    ///
    /// The exit is not necessarily `Interrupted`: a fiber that wins the
    /// race by completing normally, or one inside an uninterruptible
    /// region that converts the interrupt, reports whatever it actually
    /// exited with. Interrupting a terminal fiber just returns its exit.
    pub fn interrupt<EF>(&self) -> Step<EF, Exit<E, A>>
    where
        EF: Send + 'static,
    {
        let handle = self.clone();
        suspend(move || {
            Driver::interrupt(&handle.driver);
            handle.wait()
        })
    }
}
