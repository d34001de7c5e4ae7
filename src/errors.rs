//! Error types.
//!
//! The taxonomy follows the boundaries of the system: sender misuse is
//! raised synchronously at the call site and never transmitted; user task
//! failures are marshalled and delivered as messages, never as live
//! errors; protocol violations are loud programming-error faults; closed
//! pipe deliveries are logged drops, not errors; timeouts carry their
//! diagnostic context and leave the underlying operation progressing.

use crate::message::{ConnectionId, MessageKind};
use crate::states::{ExecutorState, FutureState, SenderState};
use std::time::Duration;
use thiserror::Error;

/// Misuse of a sender's start/send/stop discipline.
#[derive(Debug, Error)]
pub enum SendError {
    /// `start` was called on a sender that is no longer in its initial
    /// state.
    #[error("sender already started (state is {state})")]
    AlreadyStarted {
        /// Observed sender state.
        state: SenderState,
    },
    /// `send` or `stop` was called outside the open state.
    #[error("sender is not open (state is {state})")]
    NotOpen {
        /// Observed sender state.
        state: SenderState,
    },
    /// A typed payload could not be encoded for the process transport.
    #[error("failed to encode message for transport: {detail}")]
    Encode {
        /// Encoder diagnostic.
        detail: String,
    },
    /// The transport rejected the message (process variant only; the
    /// in-process queue is unbounded and never fails).
    #[error("transport rejected message: {detail}")]
    Transport {
        /// Transport diagnostic.
        detail: String,
    },
}

/// Failure inside a router operation.
#[derive(Debug, Error)]
pub enum RouterError {
    /// `start` was called on a router that is already running.
    #[error("router is already running")]
    AlreadyRunning,
    /// An operation requiring a running router was called while stopped.
    #[error("router is not running")]
    NotRunning,
    /// `bind` targeted a connection id with no registered pipe.
    #[error("no open pipe for {connection_id}")]
    UnknownPipe {
        /// The offending connection id.
        connection_id: ConnectionId,
    },
    /// A receiver's handler rejected a message. This is a protocol
    /// violation surfaced by the future's state machine; it indicates a
    /// misbehaving worker pool or a bug, and is not recoverable.
    #[error("dispatch failed on {connection_id}: {source}")]
    Dispatch {
        /// Pipe whose handler failed.
        connection_id: ConnectionId,
        /// The underlying future fault.
        source: FutureError,
    },
    /// A wire payload for the process transport failed to decode.
    #[error("failed to decode wire payload on {connection_id}: {detail}")]
    Decode {
        /// Pipe whose payload failed to decode.
        connection_id: ConnectionId,
        /// Decoder diagnostic.
        detail: String,
    },
}

/// Fault raised by a future's state machine or accessors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FutureError {
    /// A message arrived that is not a legal transition from the current
    /// state. Signals a misbehaving worker pool or a bug; fails loudly.
    #[error("unexpected {message} message in state {state}")]
    ProtocolViolation {
        /// Kind of the offending message.
        message: MessageKind,
        /// Externally visible state at the time.
        state: FutureState,
    },
    /// A payload did not have the type the future was built for.
    #[error("message payload had an unexpected type")]
    PayloadType,
    /// `result` was read outside the completed state.
    #[error("no result available; task state is {state}")]
    ResultUnavailable {
        /// Observed state.
        state: FutureState,
    },
    /// `exception` was read outside the failed state.
    #[error("no exception available; task state is {state}")]
    ExceptionUnavailable {
        /// Observed state.
        state: FutureState,
    },
}

/// Failure submitting work to a worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool has been shut down and rejects new work.
    #[error("worker pool is shut down")]
    ShutDown,
}

/// A blocking drain ran out of time.
///
/// The awaited operation keeps progressing in the background; timing out
/// does not corrupt any state.
#[derive(Debug, Error)]
#[error("condition not met after {elapsed:?} (timeout was {timeout:?})")]
pub struct TimeoutError {
    /// The configured timeout.
    pub timeout: Duration,
    /// Time actually elapsed when the deadline was declared missed.
    pub elapsed: Duration,
}

/// Failure while pumping messages through a router.
#[derive(Debug, Error)]
pub enum PumpError {
    /// The deadline passed before the condition became true.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    /// Message dispatch failed while draining.
    #[error(transparent)]
    Router(#[from] RouterError),
}

/// Failure in an executor operation.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The operation requires a running executor.
    #[error("executor is not running (state is {state})")]
    NotRunning {
        /// Observed executor state.
        state: ExecutorState,
    },
    /// The worker pool rejected the task.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// A router operation failed.
    #[error(transparent)]
    Router(#[from] RouterError),
    /// A blocking drain's deadline passed before its condition held.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    /// Shutdown did not reach the stopped state in time. The executor
    /// keeps progressing towards `Stopped` in the background.
    #[error(
        "executor still {state} with {live} live task(s) after {elapsed:?} \
         (timeout was {timeout:?})"
    )]
    ShutdownTimeout {
        /// State observed at the deadline.
        state: ExecutorState,
        /// Number of futures still awaiting their final message.
        live: usize,
        /// The configured timeout.
        timeout: Duration,
        /// Time actually elapsed.
        elapsed: Duration,
    },
}
