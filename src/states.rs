//! State types shared across the crate.
//!
//! Three small state machines live here: the externally visible future
//! state, the executor lifecycle, and the sender discipline. The future's
//! *internal* state is also defined here; it refines the external state so
//! that the transition table can distinguish "cancelled before the task
//! started" from "cancelled after", and the three flavours of
//! post-cancellation termination. The external state is always a pure
//! function of the internal one.

use core::fmt;

/// Externally visible state of a future.
///
/// A future starts in [`Waiting`](Self::Waiting) and ends in exactly one of
/// the three terminal states [`Completed`](Self::Completed),
/// [`Failed`](Self::Failed) or [`Cancelled`](Self::Cancelled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FutureState {
    /// Task submitted, not yet started by the worker pool.
    Waiting,
    /// Task is executing in the background.
    Executing,
    /// Cancellation has been requested; awaiting the task's response.
    Cancelling,
    /// Task completed and a result is available.
    Completed,
    /// Task raised an error; marshalled exception information is available.
    Failed,
    /// Task terminated after a cancellation request.
    Cancelled,
}

impl FutureState {
    /// True if cancellation can still be requested in this state.
    #[must_use]
    pub const fn is_cancellable(self) -> bool {
        matches!(self, Self::Waiting | Self::Executing)
    }

    /// True if this is a terminal state: no further messages will arrive.
    #[must_use]
    pub const fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for FutureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Executing => write!(f, "executing"),
            Self::Cancelling => write!(f, "cancelling"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Internal state of a future.
///
/// Exists purely so that `receive` can validate message ordering; it is
/// never exposed to users. See [`FutureState`] for the visible projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalState {
    Waiting,
    Executing,
    /// Cancel requested while still waiting; `Started` or `Abandoned` may
    /// still arrive.
    CancellingBeforeStart,
    /// Cancel requested after the task started; a final `Returned` or
    /// `Raised` is still expected.
    CancellingAfterStart,
    Completed,
    Failed,
    /// Task observed the cancel flag before running its body.
    CancelledAbandoned,
    /// Task ran to completion despite the cancellation request.
    CancelledCompleted,
    /// Task raised despite the cancellation request.
    CancelledFailed,
}

impl InternalState {
    /// Projects the internal state onto the externally visible one.
    pub(crate) const fn external(self) -> FutureState {
        match self {
            Self::Waiting => FutureState::Waiting,
            Self::Executing => FutureState::Executing,
            Self::CancellingBeforeStart | Self::CancellingAfterStart => FutureState::Cancelling,
            Self::Completed => FutureState::Completed,
            Self::Failed => FutureState::Failed,
            Self::CancelledAbandoned | Self::CancelledCompleted | Self::CancelledFailed => {
                FutureState::Cancelled
            }
        }
    }
}

/// Lifecycle state of an [`Executor`](crate::executor::Executor).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExecutorState {
    /// Accepting submissions (initial state).
    #[default]
    Running,
    /// Stop requested; waiting for live tasks to finish.
    Stopping,
    /// Fully drained and shut down (terminal).
    Stopped,
}

impl ExecutorState {
    /// True if the executor accepts new submissions.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    /// True if the executor has fully shut down.
    #[must_use]
    pub const fn is_stopped(self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Lifecycle state of a message sender.
///
/// `start`, `send` and `stop` are only legal in the states the
/// [`channel`](crate::channel) module documents; everything else is an
/// immediate [`SendError`](crate::errors::SendError).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SenderState {
    /// Created, `start` not yet called.
    #[default]
    Initial,
    /// Between `start` and `stop`; `send` is legal.
    Open,
    /// After `stop` (terminal).
    Closed,
}

impl fmt::Display for SenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}
