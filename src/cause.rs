//! Why an effect did not produce a value.
//!
//! A [`Cause`] is the closed set of reasons a fiber can terminate without
//! a success value:
//!
//! - [`Cause::Failed`]: an expected, typed error declared by the caller
//!   and recoverable through `fold`/`or_else`.
//! - [`Cause::Aborted`]: an unexpected, untyped [`Defect`]: a panic, a
//!   violated invariant, or an explicit `abort`. Typed recovery does not
//!   see defects; only `fold_cause` can inspect them.
//! - [`Cause::Interrupted`]: cancellation. Recoverable only from within
//!   an uninterruptible region.
//! - [`Cause::Suppressed`]: a primary cause joined with a secondary one
//!   raised while the primary was already propagating (typically a
//!   finalizer that itself failed). Both causes are preserved.
//!
//! # Example
//!
//! ```
//! use undercurrent::Cause;
//!
//! let cause: Cause<String> = Cause::Failed("boom".to_string());
//! assert!(!cause.is_interrupted());
//! assert_eq!(cause.failure(), Some(&"boom".to_string()));
//! ```

use std::any::Any;
use std::sync::Arc;

/// An unexpected, untyped failure: a panic payload, a violated invariant,
/// or a value passed to `abort`.
///
/// Defects are cheap to clone and safe to share across threads, because a
/// fiber's terminal exit may be observed by any number of joiners.
#[derive(Clone)]
pub enum Defect {
    /// A human-readable description. Panics with `&str`/`String` payloads
    /// land here with the payload preserved.
    Message(String),
    /// An arbitrary shared payload for callers that abort with structured
    /// data.
    Shared(Arc<dyn Any + Send + Sync>),
}

impl Defect {
    /// Create a defect from a message.
    pub fn message(msg: impl Into<String>) -> Self {
        Defect::Message(msg.into())
    }

    /// Create a defect from an arbitrary shared payload.
    pub fn shared(payload: Arc<dyn Any + Send + Sync>) -> Self {
        Defect::Shared(payload)
    }

    /// Convert a caught panic payload into a defect.
    ///
    /// String-like payloads (the overwhelmingly common case) are
    /// preserved verbatim; anything else is summarized, since panic
    /// payloads are not required to be `Sync` and cannot be shared as-is.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        match payload.downcast::<String>() {
            Ok(msg) => Defect::Message(*msg),
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(msg) => Defect::Message((*msg).to_string()),
                Err(_) => Defect::Message("panic with non-string payload".to_string()),
            },
        }
    }

    /// The message, if this defect carries one.
    pub fn as_message(&self) -> Option<&str> {
        match self {
            Defect::Message(msg) => Some(msg),
            Defect::Shared(_) => None,
        }
    }

    /// Downcast a shared payload to a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Defect::Message(_) => None,
            Defect::Shared(payload) => payload.downcast_ref::<T>(),
        }
    }
}

impl std::fmt::Debug for Defect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Defect::Message(msg) => f.debug_tuple("Defect").field(msg).finish(),
            Defect::Shared(_) => f.debug_tuple("Defect").field(&"<shared payload>").finish(),
        }
    }
}

impl std::fmt::Display for Defect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Defect::Message(msg) => write!(f, "{}", msg),
            Defect::Shared(_) => write!(f, "opaque defect payload"),
        }
    }
}

// Shared payloads compare by identity: two defects are equal when they
// carry the same allocation, not structurally-equal payloads.
impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Defect::Message(a), Defect::Message(b)) => a == b,
            (Defect::Shared(a), Defect::Shared(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::error::Error for Defect {}

/// Why an effect did not produce a value.
///
/// See the [module documentation](self) for the taxonomy.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause<E> {
    /// An expected, typed error.
    Failed(E),
    /// An unexpected defect.
    Aborted(Defect),
    /// Cancellation.
    Interrupted,
    /// A primary cause plus a secondary cause raised while the primary
    /// was already propagating.
    Suppressed(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
    /// Join this cause with a secondary cause raised while this one was
    /// propagating. `self` stays primary.
    pub fn and(self, secondary: Cause<E>) -> Cause<E> {
        Cause::Suppressed(Box::new(self), Box::new(secondary))
    }

    /// Transform the typed error everywhere it appears in the cause tree.
    pub fn map<E2, F>(self, mut f: F) -> Cause<E2>
    where
        F: FnMut(E) -> E2,
    {
        self.map_inner(&mut f)
    }

    fn map_inner<E2, F>(self, f: &mut F) -> Cause<E2>
    where
        F: FnMut(E) -> E2,
    {
        match self {
            Cause::Failed(e) => Cause::Failed(f(e)),
            Cause::Aborted(defect) => Cause::Aborted(defect),
            Cause::Interrupted => Cause::Interrupted,
            Cause::Suppressed(primary, secondary) => Cause::Suppressed(
                Box::new(primary.map_inner(f)),
                Box::new(secondary.map_inner(f)),
            ),
        }
    }

    /// The primary cause: the leftmost leaf of the tree.
    pub fn primary(&self) -> &Cause<E> {
        let mut cause = self;
        while let Cause::Suppressed(primary, _) = cause {
            cause = primary;
        }
        cause
    }

    /// True if interruption appears anywhere in the cause tree.
    ///
    /// A cause carrying an interrupt anywhere stays non-recoverable by
    /// typed folds while the fiber is interruptible, even when a
    /// finalizer failure has been suppressed onto it.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Cause::Interrupted => true,
            Cause::Failed(_) | Cause::Aborted(_) => false,
            Cause::Suppressed(primary, secondary) => {
                primary.is_interrupted() || secondary.is_interrupted()
            }
        }
    }

    /// The typed error, when the primary cause is a failure.
    pub fn failure(&self) -> Option<&E> {
        match self.primary() {
            Cause::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Consume the cause, extracting the typed error when the primary
    /// cause is a failure. Anything suppressed onto it is discarded.
    pub fn into_failed(self) -> Option<E> {
        match self {
            Cause::Failed(e) => Some(e),
            Cause::Suppressed(primary, _) => primary.into_failed(),
            Cause::Aborted(_) | Cause::Interrupted => None,
        }
    }

    /// The defect, when the primary cause is an abort.
    pub fn defect(&self) -> Option<&Defect> {
        match self.primary() {
            Cause::Aborted(d) => Some(d),
            _ => None,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cause::Failed(e) => write!(f, "{}", e),
            Cause::Aborted(defect) => write!(f, "aborted: {}", defect),
            Cause::Interrupted => write!(f, "interrupted"),
            Cause::Suppressed(primary, secondary) => {
                write!(f, "{}; suppressed: {}", primary, secondary)
            }
        }
    }
}

impl<E> std::error::Error for Cause<E> where E: std::error::Error + 'static {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_reaches_suppressed_leaves() {
        let cause = Cause::Failed(1).and(Cause::Failed(2));
        let mapped = cause.map(|n| n * 10);
        assert_eq!(
            mapped,
            Cause::Suppressed(Box::new(Cause::Failed(10)), Box::new(Cause::Failed(20)))
        );
    }

    #[test]
    fn primary_follows_leftmost_leaf() {
        let cause = Cause::Interrupted
            .and(Cause::Failed("release"))
            .and(Cause::Failed("later"));
        assert_eq!(cause.primary(), &Cause::Interrupted);
        assert!(cause.is_interrupted());
    }

    #[test]
    fn interrupt_detected_in_either_branch() {
        let cause = Cause::Failed("use").and(Cause::Interrupted);
        assert!(cause.is_interrupted());
        assert_eq!(cause.failure(), Some(&"use"));
        assert_eq!(cause.into_failed(), Some("use"));
        assert_eq!(Cause::<&str>::Interrupted.into_failed(), None);
    }

    #[test]
    fn defect_from_panic_preserves_strings() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(Defect::from_panic(payload).as_message(), Some("boom"));

        let payload: Box<dyn std::any::Any + Send> = Box::new("owned".to_string());
        assert_eq!(Defect::from_panic(payload).as_message(), Some("owned"));

        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(
            Defect::from_panic(payload).as_message(),
            Some("panic with non-string payload")
        );
    }

    #[test]
    fn shared_defects_compare_by_identity() {
        let payload: Arc<dyn std::any::Any + Send + Sync> = Arc::new(7i32);
        let a = Defect::shared(payload.clone());
        let b = Defect::shared(payload);
        let c = Defect::shared(Arc::new(7i32));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn display_includes_suppressed() {
        let cause = Cause::Failed("use failed").and(Cause::Failed("release failed"));
        assert_eq!(cause.to_string(), "use failed; suppressed: release failed");
    }
}
