//! Cooperative cancellation.
//!
//! Cancellation is advisory: the foreground sets a shared flag through a
//! [`CancelSource`] and the background observes it through [`CancelToken`]
//! at its own checkpoints. Nothing is interrupted forcibly; a task that
//! never polls its token simply runs to completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Foreground half of a cancellation pair.
///
/// Owned by the future while it is still cancellable; dropping the source
/// does not cancel, it just ends the foreground's ability to request it.
#[derive(Debug, Default)]
pub struct CancelSource {
    flag: Arc<AtomicBool>,
}

impl CancelSource {
    /// Creates a fresh, unrequested source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a background-side token observing this source.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            flag: Arc::clone(&self.flag),
        }
    }

    /// Requests cancellation. Idempotent.
    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Background-side view of a cancellation request.
///
/// Cheap to clone; all clones observe the same flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Whether the foreground has requested cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Raised out of a reporter when the task has been cancelled.
///
/// Task bodies propagate this with `?`; the wrapper recognises it and
/// records an orderly cancelled exit rather than a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("task was cancelled")]
pub struct Cancelled;
