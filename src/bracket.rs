//! Resource safety: acquire, use, release.
//!
//! [`Step::bracket_exit`] is the primitive. Acquisition and release run
//! uninterruptibly; the use of the resource is restored to the caller's
//! interrupt region. Release runs exactly once per successful
//! acquisition, whatever the use does: succeed, fail, abort or get
//! interrupted. If acquisition itself fails, there is nothing to
//! release and release does not run.
//!
//! When both the use and the release fail, neither cause is discarded:
//! the release's cause is suppressed onto the use's
//! (see [`combine_finalizer_exit`]).
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use undercurrent::prelude::*;
//!
//! let released = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&released);
//!
//! let step = sync::<_, String, _>(|| "handle").bracket(
//!     |h| pure(h.len()),
//!     move |_h| sync(move || {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!     }),
//! );
//! assert_eq!(undercurrent::run(step), Exit::Success(6));
//! assert_eq!(released.load(Ordering::SeqCst), 1);
//! ```

use crate::exit::Exit;
use crate::step::{complete, pure, uninterruptible_mask, Step};

impl<E, A> Step<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    /// Acquire a resource with `self`, use it, release it with full
    /// knowledge of how the use ended.
    ///
    /// `release` receives the resource and the use's [`Exit`]; its own
    /// failure is combined with the use's outcome by
    /// [`combine_finalizer_exit`]. The resource is `Clone` because both
    /// the use and the release need it.
    pub fn bracket_exit<B, U, R>(self, use_fn: U, release: R) -> Step<E, B>
    where
        A: Clone,
        B: Send + 'static,
        U: FnOnce(A) -> Step<E, B> + Send + 'static,
        R: FnOnce(A, &Exit<E, B>) -> Step<E, ()> + Send + 'static,
    {
        uninterruptible_mask(move |restore| {
            self.and_then(move |resource| {
                let for_release = resource.clone();
                restore
                    .restore(use_fn(resource))
                    .result::<E>()
                    .and_then(move |use_exit| {
                        let release_step = release(for_release, &use_exit);
                        release_step.result::<E>().and_then(move |release_exit| {
                            complete(combine_finalizer_exit(use_exit, release_exit))
                        })
                    })
            })
        })
    }

    /// [`bracket_exit`](Step::bracket_exit) for releases that do not
    /// care how the use ended.
    pub fn bracket<B, U, R>(self, use_fn: U, release: R) -> Step<E, B>
    where
        A: Clone,
        B: Send + 'static,
        U: FnOnce(A) -> Step<E, B> + Send + 'static,
        R: FnOnce(A) -> Step<E, ()> + Send + 'static,
    {
        self.bracket_exit(use_fn, move |resource, _exit| release(resource))
    }

    /// Run `finalizer` after `self`, whatever its outcome. The finalizer
    /// is uninterruptible; its failure is combined with `self`'s outcome
    /// by [`combine_finalizer_exit`].
    pub fn on_complete(self, finalizer: Step<E, ()>) -> Step<E, A> {
        pure::<(), E>(()).bracket_exit(move |()| self, move |(), _exit| finalizer)
    }

    /// Run `cleanup` after `self` only if it was interrupted.
    pub fn on_interrupted(self, cleanup: Step<E, ()>) -> Step<E, A> {
        pure::<(), E>(()).bracket_exit(move |()| self, move |(), exit| {
            if exit.is_interrupted() {
                cleanup
            } else {
                pure(())
            }
        })
    }
}

/// Combine the use's outcome with the finalizer's.
///
/// The use's exit wins whenever the finalizer succeeds; a failing
/// finalizer replaces a successful use's value with its cause; when both
/// fail, the finalizer's cause is suppressed onto the use's so the
/// primary cause stays the one that unwound first.
pub fn combine_finalizer_exit<E, B>(
    use_exit: Exit<E, B>,
    finalizer_exit: Exit<E, ()>,
) -> Exit<E, B> {
    match (use_exit, finalizer_exit) {
        (use_exit, Exit::Success(())) => use_exit,
        (Exit::Success(_), Exit::Failure(cause)) => Exit::Failure(cause),
        (Exit::Failure(primary), Exit::Failure(secondary)) => {
            Exit::Failure(primary.and(secondary))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::Cause;
    use crate::run;
    use crate::step::{fail, sync};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn combine_keeps_primary_on_double_failure() {
        let combined = combine_finalizer_exit::<_, i32>(
            Exit::failed("use"),
            Exit::failed("release"),
        );
        assert_eq!(
            combined,
            Exit::Failure(Cause::Failed("use").and(Cause::Failed("release")))
        );
    }

    #[test]
    fn combine_surfaces_lone_finalizer_failure() {
        let combined = combine_finalizer_exit(Exit::<&str, _>::Success(5), Exit::failed("r"));
        assert_eq!(combined, Exit::failed("r"));
    }

    #[test]
    fn release_runs_on_use_failure() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let step = sync::<_, String, _>(|| 7).bracket(
            |_| fail::<i32, _>("use blew up".to_string()),
            move |_| {
                let counter = Arc::clone(&counter);
                sync(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            },
        );
        assert_eq!(run(step), Exit::failed("use blew up".to_string()));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_skipped_when_acquire_fails() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let step = fail::<i32, _>("no resource".to_string()).bracket(
            |n| pure(n),
            move |_| {
                let counter = Arc::clone(&counter);
                sync(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            },
        );
        assert_eq!(run(step), Exit::failed("no resource".to_string()));
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn nested_brackets_release_inner_first() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let outer_log = Arc::clone(&order);
        let inner_log = Arc::clone(&order);
        let step = pure::<_, String>("outer").bracket(
            move |_| {
                let inner_log = Arc::clone(&inner_log);
                pure("inner").bracket(
                    |_| pure(0),
                    move |_| {
                        sync(move || {
                            inner_log.lock().unwrap().push("inner");
                        })
                    },
                )
            },
            move |_| {
                sync(move || {
                    outer_log.lock().unwrap().push("outer");
                })
            },
        );
        assert_eq!(run(step), Exit::Success(0));
        assert_eq!(*order.lock().unwrap(), vec!["inner", "outer"]);
    }
}
