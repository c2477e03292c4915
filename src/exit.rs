//! Terminal outcome of a fiber.
//!
//! An [`Exit`] is produced exactly once per driver: either a success
//! value or a [`Cause`] explaining why no value was produced. Exits are
//! plain data: they can be stored, cloned, compared, and re-lifted into
//! an effect with [`complete`](crate::step::complete).
//!
//! # Example
//!
//! ```
//! use undercurrent::{Cause, Exit};
//!
//! let ok: Exit<String, i32> = Exit::Success(42);
//! assert_eq!(ok.into_result(), Ok(42));
//!
//! let no: Exit<String, i32> = Exit::interrupted();
//! assert!(no.is_interrupted());
//! ```

use crate::cause::Cause;

/// Terminal outcome of an effect: a value or a cause.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit<E, A> {
    /// The effect produced a value.
    Success(A),
    /// The effect terminated without a value.
    Failure(Cause<E>),
}

impl<E, A> Exit<E, A> {
    /// An exit carrying a typed failure.
    pub fn failed(error: E) -> Self {
        Exit::Failure(Cause::Failed(error))
    }

    /// An exit recording cancellation.
    pub fn interrupted() -> Self {
        Exit::Failure(Cause::Interrupted)
    }

    /// Lift a `Result` into an exit.
    pub fn from_result(result: Result<A, E>) -> Self {
        match result {
            Ok(value) => Exit::Success(value),
            Err(error) => Exit::failed(error),
        }
    }

    /// True if this exit carries a value.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// True if this exit records cancellation (anywhere in the cause).
    pub fn is_interrupted(&self) -> bool {
        match self {
            Exit::Success(_) => false,
            Exit::Failure(cause) => cause.is_interrupted(),
        }
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(value) => Some(value),
            Exit::Failure(_) => None,
        }
    }

    /// The cause, if the effect did not produce a value.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(cause) => Some(cause),
        }
    }

    /// Transform the success value.
    pub fn map<B, F>(self, f: F) -> Exit<E, B>
    where
        F: FnOnce(A) -> B,
    {
        match self {
            Exit::Success(value) => Exit::Success(f(value)),
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Transform the cause.
    pub fn map_cause<E2, F>(self, f: F) -> Exit<E2, A>
    where
        F: FnOnce(Cause<E>) -> Cause<E2>,
    {
        match self {
            Exit::Success(value) => Exit::Success(value),
            Exit::Failure(cause) => Exit::Failure(f(cause)),
        }
    }

    /// Collapse into a `Result`, keeping the full cause on the error side.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(value) => Ok(value),
            Exit::Failure(cause) => Err(cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_result_round_trips() {
        assert_eq!(Exit::<String, _>::from_result(Ok(1)).into_result(), Ok(1));
        assert_eq!(
            Exit::<_, i32>::from_result(Err("e")).into_result(),
            Err(Cause::Failed("e"))
        );
    }

    #[test]
    fn map_leaves_failures_alone() {
        let exit: Exit<&str, i32> = Exit::failed("nope");
        assert_eq!(exit.map(|n| n + 1), Exit::failed("nope"));
    }

    #[test]
    fn interrupted_detection_sees_suppressed() {
        let exit: Exit<&str, ()> =
            Exit::Failure(Cause::Interrupted.and(Cause::Failed("cleanup")));
        assert!(exit.is_interrupted());
    }
}
