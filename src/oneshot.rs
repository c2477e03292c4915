//! Single-assignment completion cell.
//!
//! A [`OneShot`] is written at most once and read any number of times;
//! every listener registered before completion receives a clone of the
//! value, and listeners registered afterwards receive it immediately.
//! Fibers use one internally to fan their terminal exit out to joiners,
//! and it is exposed because it is the natural building block for
//! promise-shaped coordination on top of [`async_op`](crate::step::async_op).
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use undercurrent::prelude::*;
//!
//! let cell = Arc::new(OneShot::new());
//! cell.complete(41);
//! assert_eq!(undercurrent::run(cell.wait::<String>().map(|n| n + 1)), Exit::Success(42));
//! ```

use std::sync::Mutex;

use crate::step::{async_op, Step};

type Listener<T> = Box<dyn FnOnce(T) + Send>;

enum OneShotState<T> {
    Empty(Vec<Listener<T>>),
    Full(T),
}

/// A cell completed at most once. See the [module docs](self).
pub struct OneShot<T> {
    state: Mutex<OneShotState<T>>,
}

impl<T> OneShot<T>
where
    T: Clone + Send + 'static,
{
    /// An empty cell.
    pub fn new() -> Self {
        OneShot {
            state: Mutex::new(OneShotState::Empty(Vec::new())),
        }
    }

    /// Complete the cell, delivering `value` to every registered
    /// listener.
    ///
    /// # Panics
    ///
    /// Panics if the cell is already complete. Completing twice means
    /// two writers believe they own the cell, which is not a recoverable
    /// condition; use [`try_complete`](OneShot::try_complete) for
    /// races that are expected.
    pub fn complete(&self, value: T) {
        if !self.try_complete(value) {
            panic!("one-shot cell completed twice");
        }
    }

    /// Complete the cell if it is still empty. Returns `false`, and
    /// drops `value`, if another writer got there first.
    pub fn try_complete(&self, value: T) -> bool {
        let listeners = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                OneShotState::Full(_) => return false,
                OneShotState::Empty(listeners) => {
                    let listeners = std::mem::take(listeners);
                    *state = OneShotState::Full(value.clone());
                    listeners
                }
            }
        };
        for listener in listeners {
            listener(value.clone());
        }
        true
    }

    /// Register a listener. Runs immediately (on the calling thread) if
    /// the cell is already complete.
    pub fn listen<F>(&self, f: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let immediate = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                OneShotState::Full(value) => Some((f, value.clone())),
                OneShotState::Empty(listeners) => {
                    listeners.push(Box::new(f));
                    None
                }
            }
        };
        if let Some((f, value)) = immediate {
            f(value);
        }
    }

    /// The value, if the cell is complete.
    pub fn poll(&self) -> Option<T> {
        match &*self.state.lock().unwrap() {
            OneShotState::Full(value) => Some(value.clone()),
            OneShotState::Empty(_) => None,
        }
    }

    /// True once the cell is complete.
    pub fn is_complete(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), OneShotState::Full(_))
    }

    /// An effect that completes with the cell's value.
    ///
    /// Interrupting the waiting fiber abandons the wait; the listener
    /// left behind delivers into a fused resume and is discarded.
    pub fn wait<E>(self: std::sync::Arc<Self>) -> Step<E, T>
    where
        E: Send + 'static,
    {
        async_op(move |resume| {
            self.listen(move |value| resume.succeed(value));
            || ()
        })
    }
}

impl<T> Default for OneShot<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        OneShot::new()
    }
}

impl<T> std::fmt::Debug for OneShot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let complete = match self.state.lock() {
            Ok(state) => matches!(&*state, OneShotState::Full(_)),
            Err(_) => true,
        };
        f.debug_struct("OneShot").field("complete", &complete).finish()
    }
}
