//! The message protocol spoken between background tasks and futures.
//!
//! Each submitted task owns one connection through the router. The task
//! side emits [`TaskMessage`] values; the router tags each with the
//! connection id and delivers it, in send order, to the matching
//! foreground receiver. The protocol is closed: the wrapper emits exactly
//! one of `Abandoned`, `Returned` or `Raised` per task, preceded by
//! `Started` unless abandoned, with any number of `Sent` messages in
//! between.

use crate::exception::MarshalledException;
use core::fmt;
use serde::{Deserialize, Serialize};
use std::any::Any;

/// Type-erased message payload for the in-process transport.
pub type Payload = Box<dyn Any + Send>;

/// Identifies one sender/receiver pipe within a router's lifetime.
///
/// Ids are allocated from a monotone counter and never reused, so a late
/// message for a closed pipe can never be misdelivered to a newer one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe#{}", self.0)
    }
}

/// A message from a background task to its future.
pub enum TaskMessage {
    /// The task is about to run its body.
    Started,
    /// The task body returned normally. Carries the result.
    Returned(Payload),
    /// The task body failed. Carries the marshalled error.
    Raised(MarshalledException),
    /// The task observed the cancel flag before running its body at all.
    Abandoned,
    /// A task-specific message (iteration item, progress report, step).
    Sent(Payload),
}

impl TaskMessage {
    /// The message's kind, for diagnostics.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Started => MessageKind::Started,
            Self::Returned(_) => MessageKind::Returned,
            Self::Raised(_) => MessageKind::Raised,
            Self::Abandoned => MessageKind::Abandoned,
            Self::Sent(_) => MessageKind::Sent,
        }
    }
}

impl fmt::Debug for TaskMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raised(exception) => f.debug_tuple("Raised").field(exception).finish(),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// Discriminant of a [`TaskMessage`], used in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// See [`TaskMessage::Started`].
    Started,
    /// See [`TaskMessage::Returned`].
    Returned,
    /// See [`TaskMessage::Raised`].
    Raised,
    /// See [`TaskMessage::Abandoned`].
    Abandoned,
    /// See [`TaskMessage::Sent`].
    Sent,
}

impl MessageKind {
    /// Whether this kind ends its task's message stream.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Returned | Self::Raised | Self::Abandoned)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Returned => write!(f, "returned"),
            Self::Raised => write!(f, "raised"),
            Self::Abandoned => write!(f, "abandoned"),
            Self::Sent => write!(f, "sent"),
        }
    }
}

/// A task message tagged with its connection id, as carried by the
/// in-process transport queue.
#[derive(Debug)]
pub struct Routed {
    /// Pipe this message belongs to.
    pub connection_id: ConnectionId,
    /// The message itself.
    pub message: TaskMessage,
}

/// Serialisable form of [`TaskMessage`] for the process transport.
///
/// Result and custom payloads are pre-encoded by the typed process sender;
/// the router decodes them back through the codec registered for the pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// See [`TaskMessage::Started`].
    Started,
    /// See [`TaskMessage::Returned`]; payload is bincode-encoded.
    Returned(Vec<u8>),
    /// See [`TaskMessage::Raised`].
    Raised(MarshalledException),
    /// See [`TaskMessage::Abandoned`].
    Abandoned,
    /// See [`TaskMessage::Sent`]; payload is bincode-encoded.
    Sent(Vec<u8>),
}

/// A wire message tagged with its connection id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    /// Pipe this message belongs to.
    pub connection_id: ConnectionId,
    /// The encoded message.
    pub message: WireMessage,
}

/// One entry on the process transport: either a routed message or the
/// router's shutdown sentinel for its monitor thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireEntry {
    /// A routed message from a background task.
    Message(WireEnvelope),
    /// Tells the monitor thread to exit. Sent by the router on `stop`.
    Shutdown,
}
