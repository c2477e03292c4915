//! Dispatcher abstraction, the default trampoline, and top-level entry
//! points.
//!
//! The interpreter is written against one narrow collaborator, the
//! [`Dispatcher`]: `dispatch` runs a thunk now (trampolined, so nested
//! dispatches flatten into a FIFO queue instead of growing the native
//! stack) and `dispatch_later` schedules a thunk on a timer, returning an
//! idempotent cancellation handle.
//!
//! A [`RuntimeHandle`] is threaded explicitly into every driver at
//! construction. There is no ambient global, so independent runtimes can
//! coexist and tests can substitute a deterministic virtual-time
//! dispatcher (see [`crate::testing`]).
//!
//! # Example
//!
//! ```
//! use undercurrent::prelude::*;
//!
//! let exit = undercurrent::run(pure::<_, String>(21).map(|n| n * 2));
//! assert_eq!(exit, Exit::Success(42));
//! ```

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::cause::{Cause, Defect};
use crate::driver::Driver;
use crate::exit::Exit;
use crate::step::raw::reify_exit;
use crate::step::Step;

/// A unit of work handed to a dispatcher.
pub type Thunk = Box<dyn FnOnce() + Send>;

/// The scheduler primitive the interpreter runs against.
///
/// Implementations must guarantee that `dispatch` never blocks on the
/// dispatched thunk's completion and is safe to call from within a thunk
/// it is currently running.
pub trait Dispatcher: Send + Sync {
    /// Run `thunk` now if no dispatch is in progress, otherwise enqueue
    /// it FIFO for the current trampoline pass.
    fn dispatch(&self, thunk: Thunk);

    /// Schedule `thunk` to run after `delay`. The returned handle cancels
    /// the timer; cancellation is idempotent and a no-op once fired.
    fn dispatch_later(&self, thunk: Thunk, delay: Duration) -> TimerHandle;
}

/// Cancellation handle for a scheduled timer.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Create a live (not yet cancelled) handle.
    pub fn new() -> Self {
        TimerHandle::default()
    }

    /// Cancel the timer. Safe to call any number of times, from any
    /// thread, before or after the timer fires.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once [`cancel`](TimerHandle::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Cheap clonable handle to a [`Dispatcher`], threaded into every driver.
#[derive(Clone)]
pub struct RuntimeHandle {
    dispatcher: Arc<dyn Dispatcher>,
}

impl RuntimeHandle {
    /// Wrap a dispatcher.
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        RuntimeHandle { dispatcher }
    }

    /// A fresh default runtime backed by a [`Trampoline`].
    pub fn trampoline() -> Self {
        RuntimeHandle::new(Arc::new(Trampoline::new()))
    }

    /// See [`Dispatcher::dispatch`].
    pub fn dispatch(&self, thunk: Thunk) {
        self.dispatcher.dispatch(thunk);
    }

    /// See [`Dispatcher::dispatch_later`].
    pub fn dispatch_later(&self, thunk: Thunk, delay: Duration) -> TimerHandle {
        self.dispatcher.dispatch_later(thunk, delay)
    }
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle").finish_non_exhaustive()
    }
}

// ============================================================================
// Trampoline: the default dispatcher
// ============================================================================

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    thunk: Thunk,
    handle: TimerHandle,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    next_seq: u64,
    shutdown: bool,
}

struct TrampolineInner {
    queue: Mutex<VecDeque<Thunk>>,
    draining: AtomicBool,
    timers: Mutex<TimerQueue>,
    timer_wake: Condvar,
}

impl TrampolineInner {
    fn dispatch(&self, thunk: Thunk) {
        self.queue.lock().unwrap().push_back(thunk);
        self.drain();
    }

    // One thread at a time flattens the queue. A caller that loses the
    // swap leaves immediately: its thunk is already queued and the
    // draining thread will pick it up, re-checking emptiness after it
    // releases the flag so nothing is stranded.
    fn drain(&self) {
        while !self.draining.swap(true, Ordering::AcqRel) {
            loop {
                let next = self.queue.lock().unwrap().pop_front();
                match next {
                    Some(thunk) => thunk(),
                    None => break,
                }
            }
            self.draining.store(false, Ordering::Release);
            if self.queue.lock().unwrap().is_empty() {
                break;
            }
        }
    }

    fn timer_loop(self: Arc<Self>) {
        let mut timers = self.timers.lock().unwrap();
        loop {
            if timers.shutdown {
                return;
            }
            let now = Instant::now();
            let mut due = Vec::new();
            while timers
                .heap
                .peek()
                .map(|Reverse(entry)| entry.deadline <= now)
                .unwrap_or(false)
            {
                if let Some(Reverse(entry)) = timers.heap.pop() {
                    due.push(entry);
                }
            }
            if !due.is_empty() {
                drop(timers);
                for entry in due {
                    if !entry.handle.is_cancelled() {
                        self.dispatch(entry.thunk);
                    }
                }
                timers = self.timers.lock().unwrap();
                continue;
            }
            match timers.heap.peek() {
                None => {
                    timers = self.timer_wake.wait(timers).unwrap();
                }
                Some(Reverse(entry)) => {
                    let wait = entry.deadline.saturating_duration_since(now);
                    let (guard, _timed_out) =
                        self.timer_wake.wait_timeout(timers, wait).unwrap();
                    timers = guard;
                }
            }
        }
    }
}

/// The default dispatcher: an iterative FIFO trampoline plus a dedicated
/// timer thread.
///
/// The trampoline flattens synchronous re-entrancy: a `dispatch` issued
/// from within a running thunk enqueues instead of recursing, which is
/// what keeps arbitrarily deep effect chains off the native stack. Timers
/// fire on a background thread that re-enters the same trampoline, so
/// resumed fibers observe identical scheduling semantics either way.
pub struct Trampoline {
    inner: Arc<TrampolineInner>,
}

impl Trampoline {
    /// Create a dispatcher and spawn its timer thread.
    pub fn new() -> Self {
        let inner = Arc::new(TrampolineInner {
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            timers: Mutex::new(TimerQueue {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            timer_wake: Condvar::new(),
        });
        let for_thread = Arc::clone(&inner);
        std::thread::Builder::new()
            .name("undercurrent-timer".to_string())
            .spawn(move || for_thread.timer_loop())
            .ok();
        Trampoline { inner }
    }
}

impl Default for Trampoline {
    fn default() -> Self {
        Trampoline::new()
    }
}

impl std::fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trampoline").finish_non_exhaustive()
    }
}

impl Dispatcher for Trampoline {
    fn dispatch(&self, thunk: Thunk) {
        self.inner.dispatch(thunk);
    }

    fn dispatch_later(&self, thunk: Thunk, delay: Duration) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut timers = self.inner.timers.lock().unwrap();
        let seq = timers.next_seq;
        timers.next_seq += 1;
        timers.heap.push(Reverse(TimerEntry {
            deadline: Instant::now() + delay,
            seq,
            thunk,
            handle: handle.clone(),
        }));
        self.inner.timer_wake.notify_one();
        handle
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        self.inner.timers.lock().unwrap().shutdown = true;
        self.inner.timer_wake.notify_one();
    }
}

// ============================================================================
// Top-level entry points
// ============================================================================

/// Interrupt handle for a top-level execution.
///
/// Cloneable; interrupting an already-terminal fiber is a no-op.
#[derive(Clone)]
pub struct InterruptHandle {
    driver: Arc<Driver>,
}

impl InterruptHandle {
    /// Signal interruption to the running fiber.
    pub fn interrupt(&self) {
        Driver::interrupt(&self.driver);
    }
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandle").finish_non_exhaustive()
    }
}

/// Start `step` on `runtime`, delivering its terminal [`Exit`] to
/// `on_exit`, and return an [`InterruptHandle`].
///
/// This never blocks beyond the synchronous portion of the effect: the
/// driver starts inside a `dispatch` and suspends whenever the effect
/// does.
pub fn run_callback<E, A, F>(step: Step<E, A>, runtime: RuntimeHandle, on_exit: F) -> InterruptHandle
where
    E: Send + 'static,
    A: Send + 'static,
    F: FnOnce(Exit<E, A>) + Send + 'static,
{
    let driver = Driver::new(
        runtime,
        Box::new(move |exit| on_exit(reify_exit::<E, A>(exit))),
    );
    Driver::start(&driver, step.into_raw());
    InterruptHandle { driver }
}

/// Execute `step` on a fresh default runtime and block the calling thread
/// until its terminal [`Exit`].
///
/// An effect that never completes (for example [`never`](crate::step::never))
/// blocks forever; use [`run_callback`] or a timeout when that matters.
pub fn run<E, A>(step: Step<E, A>) -> Exit<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    let (tx, rx) = std::sync::mpsc::channel();
    let _handle = run_callback(step, RuntimeHandle::trampoline(), move |exit| {
        let _ = tx.send(exit);
    });
    match rx.recv() {
        Ok(exit) => exit,
        Err(_) => Exit::Failure(Cause::Aborted(Defect::message(
            "runtime terminated before the effect completed",
        ))),
    }
}

/// Execute `step` on `runtime` and expose the outcome as a `Future`, the
/// promise-like entry point.
///
/// `Failed` and `Aborted` surface as `Err` with the full cause;
/// interruption surfaces as the distinguished `Err(Cause::Interrupted)`.
/// An effect that never completes yields a future that never resolves.
/// Dropping the future detaches the fiber rather than interrupting it.
pub fn run_future<E, A>(
    step: Step<E, A>,
    runtime: RuntimeHandle,
) -> impl Future<Output = Result<A, Cause<E>>>
where
    E: Send + 'static,
    A: Send + 'static,
{
    let (tx, rx) = futures::channel::oneshot::channel();
    let handle = run_callback(step, runtime, move |exit| {
        let _ = tx.send(exit);
    });
    async move {
        let _keep_alive = handle;
        match rx.await {
            Ok(exit) => exit.into_result(),
            // The runtime was torn down mid-flight; indistinguishable
            // from cancellation as far as the caller is concerned.
            Err(_cancelled) => Err(Cause::Interrupted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn nested_dispatch_runs_fifo() {
        let tramp = Trampoline::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        let inner_order = Arc::clone(&order);
        let tramp_inner = Arc::new(tramp);
        let tramp_clone = Arc::clone(&tramp_inner);
        tramp_inner.dispatch(Box::new(move || {
            o1.lock().unwrap().push(1);
            let o2 = Arc::clone(&inner_order);
            tramp_clone.dispatch(Box::new(move || {
                o2.lock().unwrap().push(3);
            }));
            inner_order.lock().unwrap().push(2);
        }));

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn timer_fires_after_delay() {
        let tramp = Trampoline::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        tramp.dispatch_later(
            Box::new(move || flag.store(true, Ordering::SeqCst)),
            Duration::from_millis(20),
        );
        assert!(!fired.load(Ordering::SeqCst));
        std::thread::sleep(Duration::from_millis(120));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let tramp = Trampoline::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handle = tramp.dispatch_later(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(30),
        );
        handle.cancel();
        handle.cancel();
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(handle.is_cancelled());
    }

    #[test]
    fn run_surfaces_success() {
        let exit = run(crate::step::pure::<_, String>(7));
        assert_eq!(exit, Exit::Success(7));
    }

    #[test]
    fn run_surfaces_typed_failure() {
        let exit = run(crate::step::fail::<i32, _>("bad".to_string()));
        assert_eq!(exit, Exit::failed("bad".to_string()));
    }
}
