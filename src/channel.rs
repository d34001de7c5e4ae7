//! Per-task message pipes.
//!
//! A pipe is one background [`Sender`] paired with one foreground
//! [`Receiver`], both stamped with the same [`ConnectionId`]. Senders
//! push onto the router's shared unbounded queue and then ping, so a
//! send never blocks and the consumer never wakes to an empty queue.

use crate::errors::SendError;
use crate::message::{ConnectionId, Payload, Routed, TaskMessage};
use crate::notify::Pinger;
use crate::states::SenderState;
use crossbeam_queue::SegQueue;
use std::sync::Arc;

/// Background-side message producer used by the task wrapper.
///
/// Implemented by the in-process [`Sender`] and by the process
/// transport's sender; the wrapper is agnostic to which one it holds.
pub trait MessageSink: Send {
    /// Opens the sink. Must be called exactly once, before any send.
    fn start(&mut self) -> Result<(), SendError>;

    /// Delivers the `Started` lifecycle message.
    fn send_started(&mut self) -> Result<(), SendError>;

    /// Delivers a custom payload as a `Sent` message.
    fn send_custom(&mut self, payload: Payload) -> Result<(), SendError>;

    /// Delivers the `Returned` final message.
    fn send_returned(&mut self, payload: Payload) -> Result<(), SendError>;

    /// Delivers the `Raised` final message.
    fn send_raised(
        &mut self,
        exception: crate::exception::MarshalledException,
    ) -> Result<(), SendError>;

    /// Delivers the `Abandoned` final message.
    fn send_abandoned(&mut self) -> Result<(), SendError>;

    /// Closes the sink. Must be called exactly once, after the final
    /// message.
    fn stop(&mut self) -> Result<(), SendError>;
}

/// In-process sender half of a pipe. Moves into the background job.
pub struct Sender {
    connection_id: ConnectionId,
    queue: Arc<SegQueue<Routed>>,
    pinger: Arc<dyn Pinger>,
    state: SenderState,
}

impl Sender {
    pub(crate) fn new(
        connection_id: ConnectionId,
        queue: Arc<SegQueue<Routed>>,
        pinger: Arc<dyn Pinger>,
    ) -> Self {
        Self {
            connection_id,
            queue,
            pinger,
            state: SenderState::Initial,
        }
    }

    /// The pipe this sender feeds.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    fn send(&mut self, message: TaskMessage) -> Result<(), SendError> {
        if self.state != SenderState::Open {
            return Err(SendError::NotOpen { state: self.state });
        }
        self.queue.push(Routed {
            connection_id: self.connection_id,
            message,
        });
        self.pinger.ping();
        Ok(())
    }
}

impl MessageSink for Sender {
    fn start(&mut self) -> Result<(), SendError> {
        if self.state != SenderState::Initial {
            return Err(SendError::AlreadyStarted { state: self.state });
        }
        self.state = SenderState::Open;
        Ok(())
    }

    fn send_started(&mut self) -> Result<(), SendError> {
        self.send(TaskMessage::Started)
    }

    fn send_custom(&mut self, payload: Payload) -> Result<(), SendError> {
        self.send(TaskMessage::Sent(payload))
    }

    fn send_returned(&mut self, payload: Payload) -> Result<(), SendError> {
        self.send(TaskMessage::Returned(payload))
    }

    fn send_raised(
        &mut self,
        exception: crate::exception::MarshalledException,
    ) -> Result<(), SendError> {
        self.send(TaskMessage::Raised(exception))
    }

    fn send_abandoned(&mut self) -> Result<(), SendError> {
        self.send(TaskMessage::Abandoned)
    }

    fn stop(&mut self) -> Result<(), SendError> {
        if self.state != SenderState::Open {
            return Err(SendError::NotOpen { state: self.state });
        }
        self.state = SenderState::Closed;
        Ok(())
    }
}

/// Foreground-side handle to a pipe. Used to bind a handler and to
/// close the pipe once the final message has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receiver {
    connection_id: ConnectionId,
}

impl Receiver {
    pub(crate) fn new(connection_id: ConnectionId) -> Self {
        Self { connection_id }
    }

    /// The pipe this receiver observes.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPinger(AtomicUsize);

    impl Pinger for CountingPinger {
        fn ping(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pipe_parts() -> (Sender, Arc<SegQueue<Routed>>, Arc<CountingPinger>) {
        let queue = Arc::new(SegQueue::new());
        let pinger = Arc::new(CountingPinger(AtomicUsize::new(0)));
        let sender = Sender::new(
            ConnectionId::new(7),
            Arc::clone(&queue),
            Arc::clone(&pinger) as Arc<dyn Pinger>,
        );
        (sender, queue, pinger)
    }

    #[test]
    fn send_before_start_is_rejected() {
        let (mut sender, _, _) = pipe_parts();
        assert!(matches!(
            sender.send_started(),
            Err(SendError::NotOpen {
                state: SenderState::Initial
            })
        ));
    }

    #[test]
    fn double_start_is_rejected() {
        let (mut sender, _, _) = pipe_parts();
        sender.start().unwrap();
        assert!(matches!(
            sender.start(),
            Err(SendError::AlreadyStarted { .. })
        ));
    }

    #[test]
    fn send_after_stop_is_rejected() {
        let (mut sender, _, _) = pipe_parts();
        sender.start().unwrap();
        sender.stop().unwrap();
        assert!(matches!(
            sender.send_started(),
            Err(SendError::NotOpen {
                state: SenderState::Closed
            })
        ));
    }

    #[test]
    fn messages_arrive_in_order_with_one_ping_each() {
        let (mut sender, queue, pinger) = pipe_parts();
        sender.start().unwrap();
        sender.send_started().unwrap();
        sender.send_custom(Box::new(1u32)).unwrap();
        sender.send_returned(Box::new(2u32)).unwrap();
        sender.stop().unwrap();

        assert_eq!(pinger.0.load(Ordering::SeqCst), 3);
        let kinds: Vec<MessageKind> = std::iter::from_fn(|| queue.pop())
            .map(|routed| {
                assert_eq!(routed.connection_id, ConnectionId::new(7));
                routed.message.kind()
            })
            .collect();
        assert_eq!(
            kinds,
            [MessageKind::Started, MessageKind::Sent, MessageKind::Returned]
        );
    }
}
