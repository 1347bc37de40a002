//! Single-assignment asynchronous result cell.
//!
//! A [`Completion`] is shared between the caller that issued a request
//! and whichever reactor-side path observes its terminal event first
//! (response arrival, slot timeout, scheduler deadline, or connection
//! failure). The transition to a terminal state happens exactly once;
//! blocked waiters and registered callbacks are both delivered from the
//! thread that wins the transition race.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::error::DriverError;

/// Returned when `set_result`/`set_error` is called on an already
/// terminal completion. A programming-contract violation, signaled
/// rather than silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("completion is already in a terminal state")]
pub struct AlreadyCompleted;

type Callback<T> = Box<dyn FnOnce(&Result<T, DriverError>) + Send>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Done(Result<T, DriverError>),
}

/// Tri-state result cell: pending, succeeded, or failed.
pub struct Completion<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending(Vec::new())),
            cond: Condvar::new(),
        }
    }

    /// Attempts the terminal transition. Returns `false` when the cell
    /// was already terminal, leaving the first outcome intact.
    ///
    /// This is the racy-path entry point: response arrival, timeouts,
    /// and defunct fan-out all funnel through here, and losing the race
    /// is normal for them.
    pub fn try_complete(&self, result: Result<T, DriverError>) -> bool {
        let callbacks = {
            let mut state = self.state.lock().expect("completion lock");
            match &mut *state {
                State::Done(_) => return false,
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Done(result.clone());
                    callbacks
                }
            }
        };
        self.cond.notify_all();
        for callback in callbacks {
            callback(&result);
        }
        true
    }

    /// Fulfills the completion with a value. At most once.
    pub fn set_result(&self, value: T) -> Result<(), AlreadyCompleted> {
        if self.try_complete(Ok(value)) {
            Ok(())
        } else {
            Err(AlreadyCompleted)
        }
    }

    /// Fails the completion with an error. At most once.
    pub fn set_error(&self, error: DriverError) -> Result<(), AlreadyCompleted> {
        if self.try_complete(Err(error)) {
            Ok(())
        } else {
            Err(AlreadyCompleted)
        }
    }

    /// Blocks the calling thread until the completion is terminal.
    ///
    /// Only ever called from application threads; reactor threads
    /// fulfill completions but never wait on them.
    pub fn wait(&self) -> Result<T, DriverError> {
        let mut state = self.state.lock().expect("completion lock");
        loop {
            match &*state {
                State::Done(result) => return result.clone(),
                State::Pending(_) => {
                    state = self.cond.wait(state).expect("completion lock");
                }
            }
        }
    }

    /// Blocks up to `timeout`; `None` when still pending afterwards.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, DriverError>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock().expect("completion lock");
        loop {
            if let State::Done(result) = &*state {
                return Some(result.clone());
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, timed_out) = self
                .cond
                .wait_timeout(state, deadline - now)
                .expect("completion lock");
            state = guard;
            if timed_out.timed_out() {
                if let State::Done(result) = &*state {
                    return Some(result.clone());
                }
                return None;
            }
        }
    }

    /// Non-blocking peek at the outcome.
    pub fn poll(&self) -> Option<Result<T, DriverError>> {
        match &*self.state.lock().expect("completion lock") {
            State::Done(result) => Some(result.clone()),
            State::Pending(_) => None,
        }
    }

    /// Registers a callback delivered exactly once: synchronously right
    /// now when already terminal, otherwise from whichever thread
    /// performs the terminal transition.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Result<T, DriverError>) + Send + 'static,
    {
        // Never invoke a callback while holding the state lock.
        let immediate = {
            let mut state = self.state.lock().expect("completion lock");
            match &mut *state {
                State::Done(result) => Some((callback, result.clone())),
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    None
                }
            }
        };
        if let Some((callback, result)) = immediate {
            callback(&result);
        }
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}
