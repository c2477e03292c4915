//! Deterministic test support.
//!
//! [`VirtualRuntime`] implements [`Dispatcher`] against a clock that only
//! moves when told to, so timer-driven effects (`delay`, `timeout`,
//! races) run instantly and deterministically in tests. [`run_virtual`]
//! is the one-liner most tests want: run a step to completion, advancing
//! virtual time past every timer it sets.
//!
//! The module also provides exit assertion macros and, behind the
//! `proptest` feature, `Arbitrary` instances for [`Cause`] and [`Exit`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use undercurrent::prelude::*;
//! use undercurrent::testing::run_virtual;
//!
//! let step = pure::<_, String>("late").delay(Duration::from_secs(3600));
//! assert_eq!(run_virtual(step), Exit::Success("late"));
//! ```

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::exit::Exit;
use crate::runtime::{run_callback, Dispatcher, RuntimeHandle, Thunk, TimerHandle};
use crate::step::Step;

#[cfg(feature = "proptest")]
use crate::cause::{Cause, Defect};
#[cfg(feature = "proptest")]
use proptest::prelude::*;

struct VirtualEntry {
    deadline: Duration,
    seq: u64,
    thunk: Thunk,
    handle: TimerHandle,
}

impl PartialEq for VirtualEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for VirtualEntry {}

impl PartialOrd for VirtualEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VirtualEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct VirtualState {
    queue: VecDeque<Thunk>,
    draining: bool,
    timers: BinaryHeap<Reverse<VirtualEntry>>,
    now: Duration,
    next_seq: u64,
}

struct VirtualInner {
    state: Mutex<VirtualState>,
}

impl VirtualInner {
    fn drain(&self) {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.draining {
                    return;
                }
                state.draining = true;
            }
            loop {
                let next = self.state.lock().unwrap().queue.pop_front();
                match next {
                    Some(thunk) => thunk(),
                    None => break,
                }
            }
            let mut state = self.state.lock().unwrap();
            state.draining = false;
            if state.queue.is_empty() {
                return;
            }
        }
    }
}

impl Dispatcher for VirtualInner {
    fn dispatch(&self, thunk: Thunk) {
        self.state.lock().unwrap().queue.push_back(thunk);
        self.drain();
    }

    fn dispatch_later(&self, thunk: Thunk, delay: Duration) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut state = self.state.lock().unwrap();
        let deadline = state.now + delay;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.timers.push(Reverse(VirtualEntry {
            deadline,
            seq,
            thunk,
            handle: handle.clone(),
        }));
        handle
    }
}

/// A dispatcher whose clock moves only when the test says so.
pub struct VirtualRuntime {
    inner: Arc<VirtualInner>,
}

impl VirtualRuntime {
    /// A fresh runtime at virtual time zero.
    pub fn new() -> Self {
        VirtualRuntime {
            inner: Arc::new(VirtualInner {
                state: Mutex::new(VirtualState {
                    queue: VecDeque::new(),
                    draining: false,
                    timers: BinaryHeap::new(),
                    now: Duration::ZERO,
                    next_seq: 0,
                }),
            }),
        }
    }

    /// Handle to pass to [`run_callback`] or
    /// [`Fiber::start`](crate::fiber::Fiber::start).
    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle::new(Arc::clone(&self.inner) as Arc<dyn Dispatcher>)
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.inner.state.lock().unwrap().now
    }

    /// Advance the clock by `delta`, firing every timer that comes due,
    /// in deadline order, and draining the work each one unleashes.
    pub fn advance(&self, delta: Duration) {
        let target = self.inner.state.lock().unwrap().now + delta;
        self.inner.drain();
        loop {
            let entry = {
                let mut state = self.inner.state.lock().unwrap();
                let due = state
                    .timers
                    .peek()
                    .map(|Reverse(entry)| entry.deadline <= target)
                    .unwrap_or(false);
                if !due {
                    state.now = target;
                    break;
                }
                match state.timers.pop() {
                    Some(Reverse(entry)) => {
                        state.now = entry.deadline;
                        entry
                    }
                    None => {
                        state.now = target;
                        break;
                    }
                }
            };
            if !entry.handle.is_cancelled() {
                self.inner.dispatch(entry.thunk);
            }
        }
    }

    /// Keep advancing until no timers remain, then return the final
    /// virtual time.
    pub fn advance_until_idle(&self) -> Duration {
        self.inner.drain();
        loop {
            let entry = {
                let mut state = self.inner.state.lock().unwrap();
                match state.timers.pop() {
                    Some(Reverse(entry)) => {
                        state.now = entry.deadline;
                        entry
                    }
                    None => return state.now,
                }
            };
            if !entry.handle.is_cancelled() {
                self.inner.dispatch(entry.thunk);
            }
        }
    }
}

impl Default for VirtualRuntime {
    fn default() -> Self {
        VirtualRuntime::new()
    }
}

impl std::fmt::Debug for VirtualRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualRuntime")
            .field("now", &self.now())
            .finish()
    }
}

/// Run `step` to completion on a fresh [`VirtualRuntime`], advancing
/// past every timer it sets.
///
/// # Panics
///
/// Panics if the step does not complete once virtual time is exhausted,
/// for example because it waits on an external callback no one fires.
pub fn run_virtual<E, A>(step: Step<E, A>) -> Exit<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    let runtime = VirtualRuntime::new();
    let slot = Arc::new(Mutex::new(None));
    let out = Arc::clone(&slot);
    let _handle = run_callback(step, runtime.handle(), move |exit| {
        *out.lock().unwrap() = Some(exit);
    });
    runtime.advance_until_idle();
    let exit = slot.lock().unwrap().take();
    match exit {
        Some(exit) => exit,
        None => panic!("effect did not complete under the virtual clock"),
    }
}

/// Assert that an [`Exit`] is a success.
///
/// # Example
///
/// ```
/// use undercurrent::{assert_success, Exit};
///
/// let exit: Exit<String, i32> = Exit::Success(42);
/// assert_success!(exit);
/// ```
#[macro_export]
macro_rules! assert_success {
    ($exit:expr) => {
        match $exit {
            $crate::Exit::Success(_) => {}
            $crate::Exit::Failure(ref cause) => {
                panic!("Expected Success, got Failure: {:?}", cause);
            }
        }
    };
}

/// Assert that an [`Exit`] is a failure (of any cause).
#[macro_export]
macro_rules! assert_failure {
    ($exit:expr) => {
        match $exit {
            $crate::Exit::Failure(_) => {}
            $crate::Exit::Success(ref value) => {
                panic!("Expected Failure, got Success: {:?}", value);
            }
        }
    };
}

/// Assert that an [`Exit`] records interruption.
#[macro_export]
macro_rules! assert_interrupted {
    ($exit:expr) => {{
        let exit = &$exit;
        if !exit.is_interrupted() {
            panic!("Expected an interrupted exit, got: {:?}", exit);
        }
    }};
}

#[cfg(feature = "proptest")]
impl<E> Arbitrary for Cause<E>
where
    E: Arbitrary + Clone + 'static,
{
    type Parameters = E::Parameters;
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(args: Self::Parameters) -> Self::Strategy {
        let leaf = prop_oneof![
            any_with::<E>(args).prop_map(Cause::Failed),
            "[a-z]{1,8}".prop_map(|msg| Cause::Aborted(Defect::message(msg))),
            Just(Cause::Interrupted),
        ]
        .boxed();
        (leaf.clone(), proptest::option::of(leaf))
            .prop_map(|(primary, secondary)| match secondary {
                Some(secondary) => primary.and(secondary),
                None => primary,
            })
            .boxed()
    }
}

#[cfg(feature = "proptest")]
impl<E, A> Arbitrary for Exit<E, A>
where
    E: Arbitrary + Clone + 'static,
    A: Arbitrary + 'static,
{
    type Parameters = (E::Parameters, A::Parameters);
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(args: Self::Parameters) -> Self::Strategy {
        let (e_params, a_params) = args;
        prop_oneof![
            any_with::<A>(a_params).prop_map(Exit::Success),
            any_with::<Cause<E>>(e_params).prop_map(Exit::Failure),
        ]
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{never, pure};

    #[test]
    fn virtual_time_only_moves_on_demand() {
        let runtime = VirtualRuntime::new();
        assert_eq!(runtime.now(), Duration::ZERO);
        runtime.advance(Duration::from_secs(5));
        assert_eq!(runtime.now(), Duration::from_secs(5));
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let runtime = VirtualRuntime::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, ms) in [("b", 20u64), ("a", 10), ("c", 30)] {
            let log = Arc::clone(&order);
            runtime.handle().dispatch_later(
                Box::new(move || log.lock().unwrap().push(label)),
                Duration::from_millis(ms),
            );
        }
        runtime.advance(Duration::from_millis(25));
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
        runtime.advance_until_idle();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn run_virtual_crosses_long_delays() {
        let step = pure::<_, String>(1).delay(Duration::from_secs(86_400));
        assert_eq!(run_virtual(step), Exit::Success(1));
    }

    #[test]
    #[should_panic(expected = "did not complete under the virtual clock")]
    fn run_virtual_rejects_stuck_effects() {
        let _ = run_virtual(never::<i32, String>());
    }

    #[test]
    fn assertion_macros_accept_matching_exits() {
        assert_success!(Exit::<String, _>::Success(1));
        assert_failure!(Exit::<_, i32>::failed("e"));
        assert_interrupted!(Exit::<String, i32>::interrupted());
    }

    #[cfg(feature = "proptest")]
    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn generated_causes_classify_consistently(
                cause in any::<Cause<i32>>()
            ) {
                let primary_is_leaf = !matches!(cause.primary(), Cause::Suppressed(..));
                prop_assert!(primary_is_leaf);
                if cause.failure().is_some() {
                    prop_assert!(matches!(cause.primary(), Cause::Failed(_)));
                }
            }
        }
    }
}
