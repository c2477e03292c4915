//! # Undercurrent
//!
//! > *"The surface is calm; the work happens underneath"*
//!
//! A Rust library for describable, interruptible effects.
//!
//! ## Philosophy
//!
//! **Undercurrent** separates describing work from doing it:
//! - **Steps** are inert values. Building, mapping, and composing them
//!   performs nothing.
//! - **Drivers** interpret a step iteratively on a dispatcher, so deeply
//!   nested compositions never grow the native stack.
//!
//! On top of that split sit typed failures alongside untyped defects,
//! cooperative interruption with maskable regions, bracket-style resource
//! safety, and fibers with fork/join/race.
//!
//! ## Quick Example
//!
//! ```rust
//! use std::time::Duration;
//! use undercurrent::prelude::*;
//!
//! // Nothing runs while the description is built.
//! let step = sync::<_, String, _>(|| 6)
//!     .and_then(|n| pure(n * 7))
//!     .delay(Duration::from_millis(1))
//!     .timeout(Duration::from_secs(1));
//!
//! // Execution happens here.
//! match undercurrent::run(step) {
//!     Exit::Success(Some(n)) => println!("computed {}", n),
//!     Exit::Success(None) => println!("timed out"),
//!     Exit::Failure(cause) => println!("did not finish: {}", cause),
//! }
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod bracket;
pub mod cause;
mod driver;
pub mod exit;
pub mod fiber;
pub mod oneshot;
pub mod race;
pub mod runtime;
pub mod step;
pub mod testing;

// Re-exports
pub use bracket::combine_finalizer_exit;
pub use cause::{Cause, Defect};
pub use exit::Exit;
pub use fiber::Fiber;
pub use oneshot::OneShot;
pub use race::race_fold;
pub use runtime::{
    run, run_callback, run_future, Dispatcher, InterruptHandle, RuntimeHandle, TimerHandle,
    Trampoline,
};
pub use step::Step;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cause::{Cause, Defect};
    pub use crate::exit::Exit;
    pub use crate::fiber::Fiber;
    pub use crate::oneshot::OneShot;
    pub use crate::race::race_fold;
    pub use crate::runtime::{Dispatcher, RuntimeHandle};
    pub use crate::step::{
        abort, after, async_op, check_interruptible, complete, fail, fail_cause,
        interruptible_mask, never, pure, runtime, shift, suspend, sync, try_sync,
        uninterruptible_mask, AsyncResume, Restore, Step,
    };
}
