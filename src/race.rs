//! Racing: first-to-settle composition of two effects.
//!
//! [`race_fold`] is the primitive. Both competitors are forked; the
//! first to reach a terminal exit has its policy closure invoked with
//! that exit and a handle to the still-running loser. The policy decides
//! everything else: interrupt the loser ([`Step::race`]), join it
//! ([`Step::zip_par`]), or ignore it. Exactly one policy runs, however
//! close the finish.
//!
//! The racing scaffold itself is uninterruptible; only the wait for a
//! winner is restored to the caller's region, and an interrupt arriving
//! there interrupts both competitors before propagating.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::exit::Exit;
use crate::fiber::{fork_as, Fiber};
use crate::step::{
    after, async_op, complete, fail_cause, uninterruptible_mask, AsyncResume, Step,
};

type Waiter<T> = Box<dyn FnOnce(T) + Send>;

enum RaceState<T> {
    /// No winner yet; at most one fiber is parked waiting for one.
    Pending { waiter: Option<Waiter<T>> },
    /// A winner arrived before anyone was waiting.
    Won(T),
    /// The winner has been delivered (or the wait was abandoned).
    Finished,
}

/// First-writer-wins latch carrying the winning policy's continuation.
struct RaceCell<T> {
    state: Mutex<RaceState<T>>,
}

impl<T> RaceCell<T>
where
    T: Send + 'static,
{
    fn new() -> Self {
        RaceCell {
            state: Mutex::new(RaceState::Pending { waiter: None }),
        }
    }

    /// Claim the win. `produce` runs under the lock, so at most one
    /// caller's policy is ever invoked; losers return `false` without
    /// running theirs.
    fn try_win_with<F>(&self, produce: F) -> bool
    where
        F: FnOnce() -> T,
    {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut *state, RaceState::Finished) {
            RaceState::Pending { waiter } => {
                let value = produce();
                match waiter {
                    Some(waiter) => {
                        drop(state);
                        waiter(value);
                    }
                    None => {
                        *state = RaceState::Won(value);
                    }
                }
                true
            }
            won @ RaceState::Won(_) => {
                *state = won;
                false
            }
            RaceState::Finished => false,
        }
    }

    /// Suspend until a winner is claimed. Interrupting the waiting fiber
    /// clears the parked continuation.
    fn wait<E>(self: Arc<Self>) -> Step<E, T>
    where
        E: Send + 'static,
    {
        async_op(move |resume: AsyncResume<E, T>| {
            let for_cancel = Arc::clone(&self);
            let immediate = {
                let mut state = self.state.lock().unwrap();
                match std::mem::replace(&mut *state, RaceState::Finished) {
                    RaceState::Won(value) => Some((value, resume)),
                    RaceState::Pending { .. } => {
                        *state = RaceState::Pending {
                            waiter: Some(Box::new(move |value| resume.succeed(value))),
                        };
                        None
                    }
                    RaceState::Finished => None,
                }
            };
            if let Some((value, resume)) = immediate {
                resume.succeed(value);
            }
            move || {
                let mut state = for_cancel.state.lock().unwrap();
                if let RaceState::Pending { waiter } = &mut *state {
                    *waiter = None;
                }
            }
        })
    }
}

/// Race two effects and fold over whichever settles first.
///
/// `on_left` runs if `left` settles first, receiving `left`'s exit and
/// the handle to the still-running `right` fiber; `on_right` is the
/// mirror image. The chosen policy's step then runs on the calling
/// fiber, in the caller's interrupt region.
pub fn race_fold<A, E1, B, E2, C, E3, FL, FR>(
    left: Step<E1, A>,
    right: Step<E2, B>,
    on_left: FL,
    on_right: FR,
) -> Step<E3, C>
where
    A: Clone + Send + 'static,
    E1: Clone + Send + 'static,
    B: Clone + Send + 'static,
    E2: Clone + Send + 'static,
    C: Send + 'static,
    E3: Send + 'static,
    FL: FnOnce(Exit<E1, A>, Fiber<E2, B>) -> Step<E3, C> + Send + 'static,
    FR: FnOnce(Exit<E2, B>, Fiber<E1, A>) -> Step<E3, C> + Send + 'static,
{
    uninterruptible_mask(move |restore| {
        fork_as::<E3, E1, A>(left)
            .zip(fork_as::<E3, E2, B>(right))
            .and_then(move |(left_fiber, right_fiber)| {
                let cell = Arc::new(RaceCell::new());

                let left_cell = Arc::clone(&cell);
                let loser_of_left = right_fiber.clone();
                let left_watch = left_fiber.wait::<Infallible>().map(move |exit| {
                    left_cell.try_win_with(move || on_left(exit, loser_of_left));
                });

                let right_cell = Arc::clone(&cell);
                let loser_of_right = left_fiber.clone();
                let right_watch = right_fiber.wait::<Infallible>().map(move |exit| {
                    right_cell.try_win_with(move || on_right(exit, loser_of_right));
                });

                let interrupt_both = left_fiber
                    .interrupt::<E3>()
                    .zip(right_fiber.interrupt::<E3>())
                    .map(|_| ());

                fork_as::<E3, Infallible, ()>(left_watch)
                    .zip(fork_as::<E3, Infallible, ()>(right_watch))
                    .and_then(move |_watchers| {
                        restore
                            .restore(cell.wait::<E3>().and_then(|winner| winner))
                            .on_interrupted(interrupt_both)
                    })
            })
    })
}

impl<E, A> Step<E, A>
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    /// First exit wins: the loser is interrupted and the winner's exit,
    /// success or not, becomes this step's outcome.
    pub fn race(self, other: Step<E, A>) -> Step<E, A> {
        race_fold(
            self,
            other,
            |exit, loser| loser.interrupt::<E>().and_then(move |_| complete(exit)),
            |exit, loser| loser.interrupt::<E>().and_then(move |_| complete(exit)),
        )
    }

    /// Run both effects concurrently and pair the results in declaration
    /// order. The first failure interrupts the other side and wins.
    pub fn zip_par<B>(self, other: Step<E, B>) -> Step<E, (A, B)>
    where
        B: Clone + Send + 'static,
    {
        race_fold(
            self,
            other,
            |exit, right| match exit {
                Exit::Success(a) => right.join().map(move |b| (a, b)),
                Exit::Failure(cause) => right
                    .interrupt::<E>()
                    .and_then(move |_| fail_cause(cause)),
            },
            |exit, left| match exit {
                Exit::Success(b) => left.join().map(move |a| (a, b)),
                Exit::Failure(cause) => left
                    .interrupt::<E>()
                    .and_then(move |_| fail_cause(cause)),
            },
        )
    }

    /// Race this step against the clock. Completing first yields
    /// `Some(value)` (or re-raises the failure); hitting the deadline
    /// interrupts the step and yields `None`.
    pub fn timeout(self, deadline: Duration) -> Step<E, Option<A>> {
        race_fold(
            self,
            after::<E>(deadline),
            |exit, timer| {
                timer
                    .interrupt::<E>()
                    .and_then(move |_| complete(exit.map(Some)))
            },
            |_deadline, fiber| fiber.interrupt::<E>().map(|_| None),
        )
    }
}
