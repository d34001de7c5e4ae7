//! In-process router backed by a lock-free queue.

use crate::channel::{Receiver, Sender};
use crate::errors::{PumpError, RouterError};
use crate::message::{ConnectionId, Routed};
use crate::notify::Pingee;
use crate::router::{Delivery, Dispatch, MessageHandler, RouteReport};
use crossbeam_queue::SegQueue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Router for tasks running on background threads in this process.
///
/// Senders push directly onto the shared queue and ping; the foreground
/// drains the queue inline from [`route_message`](Self::route_message).
/// The router itself is single-consumer and is driven from one thread.
pub struct ThreadRouter {
    queue: Arc<SegQueue<Routed>>,
    receivers: HashMap<ConnectionId, Option<MessageHandler>>,
    next_id: u64,
    pingee: Box<dyn Pingee>,
    running: bool,
}

impl ThreadRouter {
    /// Creates a stopped router notifying through `pingee`.
    #[must_use]
    pub fn new(pingee: Box<dyn Pingee>) -> Self {
        Self {
            queue: Arc::new(SegQueue::new()),
            receivers: HashMap::new(),
            next_id: 1,
            pingee,
            running: false,
        }
    }

    /// Whether the router is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Starts the router, connecting the notification primitive.
    pub fn start(&mut self) -> Result<(), RouterError> {
        if self.running {
            return Err(RouterError::AlreadyRunning);
        }
        self.pingee.connect();
        self.running = true;
        Ok(())
    }

    /// Stops the router.
    ///
    /// Pipes still open at this point are a caller bug but are
    /// tolerated: they are logged and force-closed.
    pub fn stop(&mut self) -> Result<(), RouterError> {
        if !self.running {
            return Err(RouterError::NotRunning);
        }
        if !self.receivers.is_empty() {
            tracing::warn!(
                open_pipes = self.receivers.len(),
                "router stopped with pipes still open"
            );
            self.receivers.clear();
        }
        self.pingee.disconnect();
        self.running = false;
        Ok(())
    }

    /// Opens a fresh pipe, returning its two halves.
    ///
    /// The sender moves into the background job; the receiver stays on
    /// the foreground and must be bound with [`bind`](Self::bind) before
    /// messages for it arrive.
    pub fn pipe(&mut self) -> Result<(Sender, Receiver), RouterError> {
        if !self.running {
            return Err(RouterError::NotRunning);
        }
        let connection_id = ConnectionId::new(self.next_id);
        self.next_id += 1;
        self.receivers.insert(connection_id, None);
        let sender = Sender::new(
            connection_id,
            Arc::clone(&self.queue),
            self.pingee.pinger(),
        );
        Ok((sender, Receiver::new(connection_id)))
    }

    /// Attaches the foreground handler for a pipe.
    pub fn bind(
        &mut self,
        receiver: Receiver,
        handler: MessageHandler,
    ) -> Result<(), RouterError> {
        let connection_id = receiver.connection_id();
        match self.receivers.get_mut(&connection_id) {
            Some(slot) => {
                *slot = Some(handler);
                Ok(())
            }
            None => Err(RouterError::UnknownPipe { connection_id }),
        }
    }

    /// Closes a pipe explicitly.
    ///
    /// Pipes whose handler reports a final message are closed
    /// automatically; this is for tearing down a pipe early.
    pub fn close_pipe(&mut self, receiver: Receiver) -> Result<(), RouterError> {
        let connection_id = receiver.connection_id();
        if self.receivers.remove(&connection_id).is_none() {
            return Err(RouterError::UnknownPipe { connection_id });
        }
        Ok(())
    }

    /// Routes the next queued message, if any, to its handler.
    ///
    /// Returns `Ok(None)` when the queue is empty. A message addressed
    /// to a closed pipe is dropped with a warning; late messages are
    /// expected when a pipe is torn down early.
    pub fn route_message(&mut self) -> Result<Option<RouteReport>, RouterError> {
        if !self.running {
            return Err(RouterError::NotRunning);
        }
        Self::route_from(&self.queue, &mut self.receivers)
    }

    /// Blocks until a ping arrives or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.pingee.wait(timeout)
    }

    /// Routes messages until `condition` holds, blocking between bursts.
    ///
    /// The remaining wait shrinks towards a deadline fixed at entry, so
    /// the call cannot overrun `timeout` by more than one handler run.
    pub fn route_until(
        &mut self,
        condition: impl FnMut() -> bool,
        timeout: Duration,
    ) -> Result<(), PumpError> {
        if !self.running {
            return Err(RouterError::NotRunning.into());
        }
        let Self {
            queue,
            receivers,
            pingee,
            ..
        } = self;
        super::route_until(
            condition,
            timeout,
            || Self::route_from(queue, receivers),
            |remaining| pingee.wait(remaining),
        )
    }

    fn route_from(
        queue: &SegQueue<Routed>,
        receivers: &mut HashMap<ConnectionId, Option<MessageHandler>>,
    ) -> Result<Option<RouteReport>, RouterError> {
        let Some(routed) = queue.pop() else {
            return Ok(None);
        };
        let connection_id = routed.connection_id;
        let Some(Some(handler)) = receivers.get_mut(&connection_id) else {
            tracing::warn!(
                %connection_id,
                message = %routed.message.kind(),
                "dropping message for closed pipe"
            );
            return Ok(Some(RouteReport {
                connection_id,
                delivery: Delivery::NoReceiver,
            }));
        };
        let dispatch = handler(routed.message)
            .map_err(|source| RouterError::Dispatch { connection_id, source })?;
        if dispatch == Dispatch::Final {
            receivers.remove(&connection_id);
        }
        Ok(Some(RouteReport {
            connection_id,
            delivery: Delivery::Delivered(dispatch),
        }))
    }
}
