//! Cooperative cancellation with an absolute deadline.
//!
//! Long workflows carry a [`Deadline`] and check it between steps. Cancelling
//! wakes every sleeper at once, so a worker blocked in [`Deadline::sleep`]
//! notices within one wake-up instead of a polling interval.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Why a deadline stopped the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    Cancelled,
    Expired,
}

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupted::Cancelled => write!(f, "cancelled"),
            Interrupted::Expired => write!(f, "deadline exceeded"),
        }
    }
}

impl std::error::Error for Interrupted {}

#[derive(Debug)]
struct State {
    cancelled: bool,
    at: Option<Instant>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

/// Shared between the worker and whoever may cancel it.
#[derive(Debug, Clone)]
pub struct Deadline {
    shared: Arc<Shared>,
}

impl Deadline {
    fn with(at: Option<Instant>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    cancelled: false,
                    at,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn after(timeout: Duration) -> Self {
        Self::with(Instant::now().checked_add(timeout))
    }

    pub fn never() -> Self {
        Self::with(None)
    }

    pub fn cancel(&self) {
        self.shared.state.lock().cancelled = true;
        self.shared.changed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.shared
            .state
            .lock()
            .at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn check(&self) -> Result<(), Interrupted> {
        let state = self.shared.state.lock();
        Self::status(&state)
    }

    fn status(state: &State) -> Result<(), Interrupted> {
        if state.cancelled {
            return Err(Interrupted::Cancelled);
        }
        match state.at {
            Some(at) if Instant::now() >= at => Err(Interrupted::Expired),
            _ => Ok(()),
        }
    }

    /// Sleep for `duration` unless cancelled or expired first.
    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        let wake = Instant::now().checked_add(duration);
        let mut state = self.shared.state.lock();
        loop {
            Self::status(&state)?;
            let until = match (wake, state.at) {
                (Some(wake), Some(at)) => wake.min(at),
                (Some(wake), None) => wake,
                (None, Some(at)) => at,
                (None, None) => {
                    self.shared.changed.wait(&mut state);
                    continue;
                }
            };
            if wake.is_some_and(|wake| Instant::now() >= wake) {
                return Self::status(&state);
            }
            self.shared.changed.wait_until(&mut state, until);
        }
    }
}
