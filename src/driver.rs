//! The trampolined interpreter that reduces one fiber's effect tree.
//!
//! A `Driver` owns everything one fiber needs: the continuation stack,
//! the interrupt-region stack, the suspension bookkeeping for in-flight
//! asynchronous operations, and the latched interrupt flag. It never
//! recurses into sub-effects; `Chain`/`Fold` push a frame and the loop
//! continues with the inner step, so arbitrarily deep effect trees run in
//! constant native stack.
//!
//! All mutable state sits behind one `Mutex`, and user closures are
//! always invoked with that lock released. Races between resumption,
//! cancellation, and interruption are settled by an epoch counter: every
//! transition out of `Suspended` bumps the epoch, and a resume carrying a
//! stale epoch is discarded.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::cause::{Cause, Defect};
use crate::exit::Exit;
use crate::runtime::RuntimeHandle;
use crate::step::raw::{
    AnyCause, AnyExit, AnyValue, BindFn, CancelFn, PlatformRequest, RawStep, RecoverFn,
    RegisterFn, TransformFn,
};

/// Continuation stack entry.
enum Frame {
    /// Success continuation; skipped during unwinding.
    Bind(BindFn),
    /// Success continuation plus recovery; the recovery observes any
    /// cause the interrupt rules allow it to.
    Fold(BindFn, RecoverFn),
    /// Cause transformation; applied during unwinding regardless of the
    /// interrupt rules, skipped on success.
    Transform(TransformFn),
    /// Sentinel restoring the enclosing interrupt region on the way out,
    /// whether the region is left by value or by cause.
    Interrupt,
}

enum Phase {
    /// The loop is executing or queued on the dispatcher.
    Running,
    /// Parked on an asynchronous registration.
    Suspended {
        cancel: Option<CancelFn>,
        interruptible: bool,
    },
    /// Terminal; the exit has been delivered.
    Done,
}

struct DriverState {
    phase: Phase,
    /// Latched by [`Driver::interrupt`]; never cleared.
    interrupted: bool,
    frames: Vec<Frame>,
    /// Innermost interrupt region last; empty means interruptible.
    regions: Vec<bool>,
    /// Bumped on every transition out of `Suspended`.
    epoch: u64,
    on_exit: Option<Box<dyn FnOnce(AnyExit) + Send>>,
}

/// Per-fiber interpreter state. See the [module docs](self).
pub(crate) struct Driver {
    state: Mutex<DriverState>,
    runtime: RuntimeHandle,
}

/// Resume handle passed to an asynchronous registration.
///
/// Consuming it delivers the operation's exit to the parked fiber; a
/// delivery whose suspension has already been resumed or cancelled is
/// silently discarded.
pub(crate) struct RawResume {
    driver: Arc<Driver>,
    epoch: u64,
}

impl RawResume {
    pub(crate) fn resume(self, exit: AnyExit) {
        Driver::resume_with(&self.driver, self.epoch, exit);
    }
}

impl Driver {
    pub(crate) fn new(
        runtime: RuntimeHandle,
        on_exit: Box<dyn FnOnce(AnyExit) + Send>,
    ) -> Arc<Driver> {
        Arc::new(Driver {
            state: Mutex::new(DriverState {
                phase: Phase::Running,
                interrupted: false,
                frames: Vec::new(),
                regions: Vec::new(),
                epoch: 0,
                on_exit: Some(on_exit),
            }),
            runtime,
        })
    }

    /// Queue the fiber's first loop pass on the dispatcher.
    pub(crate) fn start(this: &Arc<Driver>, step: RawStep) {
        #[cfg(feature = "tracing")]
        tracing::trace!("fiber started");
        let driver = Arc::clone(this);
        this.runtime
            .dispatch(Box::new(move || Driver::run_loop(&driver, step)));
    }

    /// Latch interruption. Terminal fibers ignore it; a fiber parked in
    /// an interruptible suspension is cancelled and resumed with
    /// `Interrupted` immediately; everything else is preempted at the
    /// loop's next evaluation step once it becomes interruptible.
    pub(crate) fn interrupt(this: &Arc<Driver>) {
        let cancel = {
            let mut state = this.state.lock().unwrap();
            if matches!(state.phase, Phase::Done) {
                return;
            }
            state.interrupted = true;
            #[cfg(feature = "tracing")]
            tracing::trace!("fiber interrupt requested");
            match state.phase {
                Phase::Suspended {
                    interruptible: true,
                    ..
                } => {
                    state.epoch += 1;
                    match std::mem::replace(&mut state.phase, Phase::Running) {
                        Phase::Suspended { cancel, .. } => cancel,
                        _ => None,
                    }
                }
                _ => return,
            }
        };
        if let Some(cancel) = cancel {
            // A panicking canceller must not take the interrupter down.
            let _ = catch_unwind(AssertUnwindSafe(cancel));
        }
        let driver = Arc::clone(this);
        this.runtime.dispatch(Box::new(move || {
            Driver::run_loop(&driver, RawStep::Caused(Cause::Interrupted));
        }));
    }

    fn interruptible_now(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.regions.last().copied().unwrap_or(true)
    }

    /// One trampoline pass: reduce `step` until the fiber completes or
    /// parks on an asynchronous registration.
    fn run_loop(this: &Arc<Driver>, mut step: RawStep) {
        loop {
            if let Some(preempted) = this.preempt(step) {
                step = preempted;
            } else {
                return;
            }
            step = match step {
                RawStep::Succeed(value) => match this.next(value) {
                    Some(next) => next,
                    None => return,
                },
                RawStep::Caused(cause) => match this.unwind(cause) {
                    Some(next) => next,
                    None => return,
                },
                RawStep::Complete(exit) => match exit {
                    Exit::Success(value) => RawStep::Succeed(value),
                    Exit::Failure(cause) => RawStep::Caused(cause),
                },
                RawStep::Suspend(thunk) => guard_suspend(thunk),
                RawStep::Async(register) => {
                    Driver::suspend_async(this, register);
                    return;
                }
                RawStep::Chain(inner, bind) => {
                    this.state.lock().unwrap().frames.push(Frame::Bind(bind));
                    *inner
                }
                RawStep::Fold(inner, bind, recover) => {
                    this.state
                        .lock()
                        .unwrap()
                        .frames
                        .push(Frame::Fold(bind, recover));
                    *inner
                }
                RawStep::TransformCause(inner, transform) => {
                    this.state
                        .lock()
                        .unwrap()
                        .frames
                        .push(Frame::Transform(transform));
                    *inner
                }
                RawStep::InterruptibleRegion(inner, interruptible) => {
                    let mut state = this.state.lock().unwrap();
                    state.regions.push(interruptible);
                    state.frames.push(Frame::Interrupt);
                    drop(state);
                    *inner
                }
                RawStep::Platform(request) => RawStep::Succeed(this.answer(request)),
            };
        }
    }

    /// Merge a pending interrupt into the current step when the fiber is
    /// interruptible. A cause that already carries an interrupt is left
    /// alone; a cause that does not yet carry one keeps propagating with
    /// the interrupt attached, so neither signal is lost. Returns `None`
    /// only if the fiber is no longer running (interrupt already won the
    /// race and re-dispatched the loop).
    fn preempt(&self, step: RawStep) -> Option<RawStep> {
        let state = self.state.lock().unwrap();
        if !state.interrupted || !state.regions.last().copied().unwrap_or(true) {
            return Some(step);
        }
        if !matches!(state.phase, Phase::Running) {
            return None;
        }
        drop(state);
        Some(match step {
            // A re-lifted failing exit is a propagating cause too.
            RawStep::Caused(cause) | RawStep::Complete(Exit::Failure(cause)) => {
                if cause.is_interrupted() {
                    RawStep::Caused(cause)
                } else {
                    RawStep::Caused(Cause::Interrupted.and(cause))
                }
            }
            _ => RawStep::Caused(Cause::Interrupted),
        })
    }

    fn answer(&self, request: PlatformRequest) -> AnyValue {
        match request {
            PlatformRequest::Runtime => Box::new(self.runtime.clone()),
            PlatformRequest::Interruptible => Box::new(self.interruptible_now()),
        }
    }

    /// Pop frames until a success continuation consumes `value`. Region
    /// sentinels restore their enclosing region on the way; restoring
    /// into an interruptible region with the latch set abandons the
    /// value and raises the pending interrupt, so a mask that ends at
    /// the tail of the effect cannot outrun it.
    fn next(&self, value: AnyValue) -> Option<RawStep> {
        loop {
            let frame = {
                let mut state = self.state.lock().unwrap();
                match state.frames.pop() {
                    Some(Frame::Interrupt) => {
                        state.regions.pop();
                        if state.interrupted
                            && state.regions.last().copied().unwrap_or(true)
                        {
                            return Some(RawStep::Caused(Cause::Interrupted));
                        }
                        continue;
                    }
                    Some(Frame::Transform(_)) => continue,
                    other => other,
                }
            };
            return match frame {
                None => {
                    self.complete(Exit::Success(value));
                    None
                }
                Some(Frame::Bind(bind)) | Some(Frame::Fold(bind, _)) => {
                    Some(guard_bind(bind, value))
                }
                Some(_) => unreachable!("handled under the lock"),
            };
        }
    }

    /// Pop frames until a recovery is permitted to observe `cause`.
    /// Plain binds are skipped; region sentinels restore their region,
    /// attaching a latched interrupt to the cause when the restored
    /// region is interruptible; a recovery observes failures and defects
    /// unconditionally but an interrupt-bearing cause only while the
    /// fiber is uninterruptible. An empty stack completes the fiber with
    /// the cause.
    fn unwind(&self, mut cause: AnyCause) -> Option<RawStep> {
        enum Popped {
            Empty,
            Skip,
            MergeInterrupt,
            Transform(TransformFn),
            Recover(RecoverFn),
        }
        loop {
            let popped = {
                let mut state = self.state.lock().unwrap();
                match state.frames.pop() {
                    None => Popped::Empty,
                    Some(Frame::Bind(_)) => Popped::Skip,
                    Some(Frame::Interrupt) => {
                        state.regions.pop();
                        if state.interrupted
                            && state.regions.last().copied().unwrap_or(true)
                            && !cause.is_interrupted()
                        {
                            Popped::MergeInterrupt
                        } else {
                            Popped::Skip
                        }
                    }
                    Some(Frame::Transform(transform)) => Popped::Transform(transform),
                    Some(Frame::Fold(_, recover)) => {
                        let interruptible = state.regions.last().copied().unwrap_or(true);
                        if cause.is_interrupted() && interruptible {
                            Popped::Skip
                        } else {
                            Popped::Recover(recover)
                        }
                    }
                }
            };
            match popped {
                Popped::Empty => {
                    self.complete(Exit::Failure(cause));
                    return None;
                }
                Popped::Skip => continue,
                Popped::MergeInterrupt => {
                    cause = Cause::Interrupted.and(cause);
                }
                Popped::Transform(transform) => {
                    cause = guard_transform(transform, cause);
                }
                Popped::Recover(recover) => return Some(guard_recover(recover, cause)),
            }
        }
    }

    /// Deliver the terminal exit exactly once.
    fn complete(&self, exit: AnyExit) {
        let on_exit = {
            let mut state = self.state.lock().unwrap();
            if matches!(state.phase, Phase::Done) {
                panic!("fiber completed twice; this is a bug in the interpreter");
            }
            state.phase = Phase::Done;
            state.frames.clear();
            state.on_exit.take()
        };
        #[cfg(feature = "tracing")]
        tracing::trace!(success = exit.is_success(), "fiber completed");
        if let Some(on_exit) = on_exit {
            on_exit(exit);
        }
    }

    /// Park the fiber and hand the registration a fused resume handle.
    ///
    /// The registration runs with the lock released, so its callback may
    /// legally resume the fiber before the registration even returns; the
    /// epoch check below makes the late-arriving canceller harmless in
    /// that case by running it instead of storing it.
    fn suspend_async(this: &Arc<Driver>, register: RegisterFn) {
        let epoch = {
            let mut state = this.state.lock().unwrap();
            state.epoch += 1;
            let interruptible = state.regions.last().copied().unwrap_or(true);
            state.phase = Phase::Suspended {
                cancel: None,
                interruptible,
            };
            state.epoch
        };
        let resume = RawResume {
            driver: Arc::clone(this),
            epoch,
        };
        match catch_unwind(AssertUnwindSafe(move || register(resume))) {
            Ok(cancel) => {
                let stale = {
                    let mut state = this.state.lock().unwrap();
                    if state.epoch == epoch {
                        if let Phase::Suspended {
                            cancel: ref mut slot,
                            ..
                        } = state.phase
                        {
                            *slot = Some(cancel);
                            None
                        } else {
                            Some(cancel)
                        }
                    } else {
                        Some(cancel)
                    }
                };
                if let Some(cancel) = stale {
                    let _ = catch_unwind(AssertUnwindSafe(cancel));
                }
            }
            Err(payload) => {
                Driver::resume_with(
                    this,
                    epoch,
                    Exit::Failure(Cause::Aborted(Defect::from_panic(payload))),
                );
            }
        }
    }

    /// Resume a parked fiber with `exit`, unless the suspension it
    /// belongs to has already been resumed or cancelled.
    fn resume_with(this: &Arc<Driver>, epoch: u64, exit: AnyExit) {
        {
            let mut state = this.state.lock().unwrap();
            let live = state.epoch == epoch && matches!(state.phase, Phase::Suspended { .. });
            if !live {
                #[cfg(feature = "tracing")]
                tracing::warn!("stale resume discarded");
                return;
            }
            state.epoch += 1;
            state.phase = Phase::Running;
        }
        let driver = Arc::clone(this);
        this.runtime.dispatch(Box::new(move || {
            Driver::run_loop(&driver, RawStep::Complete(exit));
        }));
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver").finish_non_exhaustive()
    }
}

fn guard_bind(bind: BindFn, value: AnyValue) -> RawStep {
    match catch_unwind(AssertUnwindSafe(move || bind(value))) {
        Ok(step) => step,
        Err(payload) => RawStep::Caused(Cause::Aborted(Defect::from_panic(payload))),
    }
}

// A panicking transformer consumes the cause it was given; the panic
// defect continues unwinding in its place.
fn guard_transform(transform: TransformFn, cause: AnyCause) -> AnyCause {
    match catch_unwind(AssertUnwindSafe(move || transform(cause))) {
        Ok(cause) => cause,
        Err(payload) => Cause::Aborted(Defect::from_panic(payload)),
    }
}

fn guard_recover(recover: RecoverFn, cause: AnyCause) -> RawStep {
    match catch_unwind(AssertUnwindSafe(move || recover(cause))) {
        Ok(step) => step,
        Err(payload) => RawStep::Caused(Cause::Aborted(Defect::from_panic(payload))),
    }
}

fn guard_suspend(thunk: crate::step::raw::SuspendFn) -> RawStep {
    match catch_unwind(AssertUnwindSafe(thunk)) {
        Ok(step) => step,
        Err(payload) => RawStep::Caused(Cause::Aborted(Defect::from_panic(payload))),
    }
}
