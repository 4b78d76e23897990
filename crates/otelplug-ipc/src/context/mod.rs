//! Deadlines and cancellation for blocking IPC calls.
//!
//! A [`CallContext`] bundles an optional deadline with a shared
//! [`CancelToken`]. Child contexts tighten the deadline and share the parent's
//! token, so cancelling a parent aborts every call derived from it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Upper bound on a single blocking wait so cancellation is observed promptly.
pub const POLL_SLICE: Duration = Duration::from_millis(25);

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every context sharing this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Reports whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reason a context stopped permitting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
}

/// Deadline and cancellation state threaded through every blocking call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    budget: Option<Duration>,
    cancel: CancelToken,
}

impl CallContext {
    /// A context with no deadline and a fresh token.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// A context expiring `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().child(timeout)
    }

    /// Replaces the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Derives a context bounded by both `timeout` and this context's deadline.
    ///
    /// The child shares this context's cancellation token.
    #[must_use]
    pub fn child(&self, timeout: Duration) -> Self {
        let candidate = Instant::now().checked_add(timeout);
        let (deadline, budget) = match (self.deadline, candidate) {
            (Some(parent), Some(child)) if parent <= child => (Some(parent), self.budget),
            (Some(parent), None) => (Some(parent), self.budget),
            (_, Some(child)) => (Some(child), Some(timeout)),
            (None, None) => (None, None),
        };
        Self {
            deadline,
            budget,
            cancel: self.cancel.clone(),
        }
    }

    /// Absolute deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The timeout that produced the binding deadline, if any.
    #[must_use]
    pub const fn budget(&self) -> Option<Duration> {
        self.budget
    }

    /// Time left before the deadline; `None` when unbounded.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// The cancellation token shared with derived contexts.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Reports whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails once the context is cancelled or past its deadline.
    ///
    /// Cancellation is reported in preference to expiry.
    pub fn check(&self) -> Result<(), ContextError> {
        if self.cancel.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        match self.remaining() {
            Some(left) if left.is_zero() => Err(ContextError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Length of the next bounded wait: never beyond the deadline nor
    /// [`POLL_SLICE`].
    #[must_use]
    pub fn wait_slice(&self) -> Duration {
        self.remaining()
            .map_or(POLL_SLICE, |left| left.min(POLL_SLICE))
            .max(Duration::from_millis(1))
    }

    /// Sleeps for `duration` unless the context ends first.
    pub fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        let until = Instant::now().checked_add(duration);
        loop {
            self.check()?;
            let left = until.map_or(Duration::MAX, |until| {
                until.saturating_duration_since(Instant::now())
            });
            if left.is_zero() {
                return Ok(());
            }
            thread::sleep(self.wait_slice().min(left));
        }
    }
}
