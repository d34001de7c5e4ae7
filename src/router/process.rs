//! Router for tasks running in other processes.
//!
//! Typed payloads cannot cross a process boundary as `Box<dyn Any>`, so
//! each pipe serializes them on the background side and registers a
//! decoder on the foreground side. A monitor thread owns the blocking
//! end of the transport; it forwards wire envelopes into a local queue
//! and pings, so the foreground consumer drains exactly as it does for
//! the thread router.

use crate::channel::{MessageSink, Receiver};
use crate::errors::{PumpError, RouterError, SendError};
use crate::exception::MarshalledException;
use crate::message::{
    ConnectionId, Payload, TaskMessage, WireEntry, WireEnvelope, WireMessage,
};
use crate::notify::Pingee;
use crate::router::{Delivery, Dispatch, MessageHandler, RouteReport};
use crate::states::SenderState;
use crossbeam_queue::SegQueue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Background-to-foreground half of a process-safe transport.
pub trait TransportSender: Send {
    /// Delivers one wire entry. Entries from one sender arrive in order.
    fn send(&mut self, entry: WireEntry) -> Result<(), SendError>;
}

/// Receiving end of a process-safe transport, owned by the monitor
/// thread.
pub trait TransportReceiver: Send {
    /// Blocks for the next entry. `None` means the transport closed.
    fn recv(&mut self) -> Option<WireEntry>;
}

/// In-memory transport pair, for tests and for workers hosted on
/// threads that must still exercise the wire path.
#[must_use]
pub fn memory_transport() -> (MemorySender, MemoryReceiver) {
    let (tx, rx) = mpsc::channel();
    (MemorySender { tx }, MemoryReceiver { rx })
}

/// Sending half of [`memory_transport`]. Cloneable across workers.
#[derive(Clone)]
pub struct MemorySender {
    tx: mpsc::Sender<WireEntry>,
}

impl TransportSender for MemorySender {
    fn send(&mut self, entry: WireEntry) -> Result<(), SendError> {
        self.tx.send(entry).map_err(|_| SendError::Transport {
            detail: "channel disconnected".to_owned(),
        })
    }
}

/// Receiving half of [`memory_transport`].
pub struct MemoryReceiver {
    rx: mpsc::Receiver<WireEntry>,
}

impl TransportReceiver for MemoryReceiver {
    fn recv(&mut self) -> Option<WireEntry> {
        self.rx.recv().ok()
    }
}

/// Transport sender writing length-prefixed bincode frames to a byte
/// stream such as a pipe or socket.
///
/// Each frame is written with a single `write_all`, which keeps small
/// frames atomic on POSIX pipes.
pub struct FramedSender<W> {
    writer: W,
}

impl<W: Write + Send> FramedSender<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> TransportSender for FramedSender<W> {
    fn send(&mut self, entry: WireEntry) -> Result<(), SendError> {
        let body = bincode::serde::encode_to_vec(&entry, bincode::config::standard())
            .map_err(|error| SendError::Encode {
                detail: error.to_string(),
            })?;
        let len = u32::try_from(body.len()).map_err(|_| SendError::Encode {
            detail: format!("frame of {} bytes exceeds u32 length prefix", body.len()),
        })?;
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&body);
        self.writer
            .write_all(&frame)
            .and_then(|()| self.writer.flush())
            .map_err(|error| SendError::Transport {
                detail: error.to_string(),
            })
    }
}

/// Counterpart of [`FramedSender`].
pub struct FramedReceiver<R> {
    reader: R,
}

impl<R: Read + Send> FramedReceiver<R> {
    /// Wraps a reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read + Send> TransportReceiver for FramedReceiver<R> {
    fn recv(&mut self) -> Option<WireEntry> {
        let mut len = [0u8; 4];
        if let Err(error) = self.reader.read_exact(&mut len) {
            if error.kind() != std::io::ErrorKind::UnexpectedEof {
                tracing::error!(%error, "transport read failed");
            }
            return None;
        }
        let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
        if let Err(error) = self.reader.read_exact(&mut body) {
            tracing::error!(%error, "transport frame truncated");
            return None;
        }
        match bincode::serde::decode_from_slice(&body, bincode::config::standard()) {
            Ok((entry, _)) => Some(entry),
            Err(error) => {
                tracing::error!(%error, "transport frame undecodable");
                None
            }
        }
    }
}

/// Background sender for one pipe of a [`ProcessRouter`].
///
/// Serializes `T` result payloads and `M` custom payloads before they
/// touch the transport. Construct it foreground-side via
/// [`ProcessRouter::pipe`], or worker-side from a connection id handed
/// over at spawn with [`ProcessSender::new`].
pub struct ProcessSender<T, M, S> {
    connection_id: ConnectionId,
    transport: S,
    state: SenderState,
    _payloads: PhantomData<fn(T, M)>,
}

impl<T, M, S> ProcessSender<T, M, S>
where
    T: Serialize + Send + 'static,
    M: Serialize + Send + 'static,
    S: TransportSender,
{
    /// Builds the sender half of an already-registered pipe.
    pub fn new(connection_id: ConnectionId, transport: S) -> Self {
        Self {
            connection_id,
            transport,
            state: SenderState::Initial,
            _payloads: PhantomData,
        }
    }

    /// The pipe this sender feeds.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    fn send(&mut self, message: WireMessage) -> Result<(), SendError> {
        if self.state != SenderState::Open {
            return Err(SendError::NotOpen { state: self.state });
        }
        self.transport.send(WireEntry::Message(WireEnvelope {
            connection_id: self.connection_id,
            message,
        }))
    }

    fn encode<V: Serialize + 'static>(payload: Payload) -> Result<Vec<u8>, SendError> {
        let value = payload.downcast::<V>().map_err(|_| SendError::Encode {
            detail: format!(
                "payload is not the {} this pipe was opened for",
                std::any::type_name::<V>()
            ),
        })?;
        bincode::serde::encode_to_vec(&*value, bincode::config::standard()).map_err(|error| {
            SendError::Encode {
                detail: error.to_string(),
            }
        })
    }
}

impl<T, M, S> MessageSink for ProcessSender<T, M, S>
where
    T: Serialize + Send + 'static,
    M: Serialize + Send + 'static,
    S: TransportSender,
{
    fn start(&mut self) -> Result<(), SendError> {
        if self.state != SenderState::Initial {
            return Err(SendError::AlreadyStarted { state: self.state });
        }
        self.state = SenderState::Open;
        Ok(())
    }

    fn send_started(&mut self) -> Result<(), SendError> {
        self.send(WireMessage::Started)
    }

    fn send_custom(&mut self, payload: Payload) -> Result<(), SendError> {
        let bytes = Self::encode::<M>(payload)?;
        self.send(WireMessage::Sent(bytes))
    }

    fn send_returned(&mut self, payload: Payload) -> Result<(), SendError> {
        let bytes = Self::encode::<T>(payload)?;
        self.send(WireMessage::Returned(bytes))
    }

    fn send_raised(&mut self, exception: MarshalledException) -> Result<(), SendError> {
        self.send(WireMessage::Raised(exception))
    }

    fn send_abandoned(&mut self) -> Result<(), SendError> {
        self.send(WireMessage::Abandoned)
    }

    fn stop(&mut self) -> Result<(), SendError> {
        if self.state != SenderState::Open {
            return Err(SendError::NotOpen { state: self.state });
        }
        self.state = SenderState::Closed;
        Ok(())
    }
}

type WireDecoder = Box<dyn Fn(WireMessage) -> Result<TaskMessage, String>>;

struct PipeEntry {
    decoder: WireDecoder,
    handler: Option<MessageHandler>,
}

/// Router whose senders live in other processes.
///
/// `start` spawns a monitor thread that blocks on the transport and
/// forwards envelopes into a local queue; `stop` sends a shutdown
/// sentinel through the control sender and joins the monitor. The
/// foreground dispatch contract is identical to the thread router's.
pub struct ProcessRouter<S> {
    control: S,
    stream: Option<Box<dyn TransportReceiver>>,
    local: Arc<SegQueue<WireEnvelope>>,
    receivers: HashMap<ConnectionId, PipeEntry>,
    next_id: u64,
    pingee: Box<dyn Pingee>,
    monitor: Option<JoinHandle<()>>,
    running: bool,
}

impl<S: TransportSender> ProcessRouter<S> {
    /// Creates a stopped router over a transport pair.
    ///
    /// `control` must feed the same stream `receiver` reads; it carries
    /// the shutdown sentinel and seeds the senders handed to workers.
    pub fn new(
        control: S,
        receiver: impl TransportReceiver + 'static,
        pingee: Box<dyn Pingee>,
    ) -> Self {
        Self {
            control,
            stream: Some(Box::new(receiver)),
            local: Arc::new(SegQueue::new()),
            receivers: HashMap::new(),
            next_id: 1,
            pingee,
            monitor: None,
            running: false,
        }
    }

    /// Whether the router is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Starts the router and its monitor thread.
    pub fn start(&mut self) -> Result<(), RouterError> {
        if self.running {
            return Err(RouterError::AlreadyRunning);
        }
        self.pingee.connect();
        let Some(mut stream) = self.stream.take() else {
            return Err(RouterError::AlreadyRunning);
        };
        let queue = Arc::clone(&self.local);
        let pinger = self.pingee.pinger();
        self.monitor = Some(std::thread::spawn(move || {
            loop {
                match stream.recv() {
                    Some(WireEntry::Message(envelope)) => {
                        queue.push(envelope);
                        pinger.ping();
                    }
                    Some(WireEntry::Shutdown) | None => break,
                }
            }
        }));
        self.running = true;
        Ok(())
    }

    /// Stops the router, shutting the monitor thread down.
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
        if let Err(error) = self.control.send(WireEntry::Shutdown) {
            // Transport already gone means the monitor has exited.
            tracing::debug!(%error, "shutdown sentinel undeliverable");
        }
        if let Some(monitor) = self.monitor.take() {
            if monitor.join().is_err() {
                tracing::error!("router monitor thread panicked");
            }
        }
        self.pingee.disconnect();
        self.running = false;
        Ok(())
    }

    /// Registers a fresh pipe carrying `T` results and `M` custom
    /// payloads, returning its foreground receiver.
    ///
    /// Used when the sender half is built in the worker process from
    /// the connection id; see [`ProcessSender::new`].
    pub fn register_pipe<T, M>(&mut self) -> Result<Receiver, RouterError>
    where
        T: DeserializeOwned + Send + 'static,
        M: DeserializeOwned + Send + 'static,
    {
        if !self.running {
            return Err(RouterError::NotRunning);
        }
        let connection_id = ConnectionId::new(self.next_id);
        self.next_id += 1;
        self.receivers.insert(
            connection_id,
            PipeEntry {
                decoder: Box::new(decode_wire::<T, M>),
                handler: None,
            },
        );
        Ok(Receiver::new(connection_id))
    }

    /// Opens a fresh pipe and builds both halves, cloning the control
    /// sender for the background half.
    pub fn pipe<T, M>(&mut self) -> Result<(ProcessSender<T, M, S>, Receiver), RouterError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        M: Serialize + DeserializeOwned + Send + 'static,
        S: Clone,
    {
        let receiver = self.register_pipe::<T, M>()?;
        let sender = ProcessSender::new(receiver.connection_id(), self.control.clone());
        Ok((sender, receiver))
    }

    /// Attaches the foreground handler for a pipe.
    pub fn bind(
        &mut self,
        receiver: Receiver,
        handler: MessageHandler,
    ) -> Result<(), RouterError> {
        let connection_id = receiver.connection_id();
        match self.receivers.get_mut(&connection_id) {
            Some(entry) => {
                entry.handler = Some(handler);
                Ok(())
            }
            None => Err(RouterError::UnknownPipe { connection_id }),
        }
    }

    /// Closes a pipe explicitly.
    pub fn close_pipe(&mut self, receiver: Receiver) -> Result<(), RouterError> {
        let connection_id = receiver.connection_id();
        if self.receivers.remove(&connection_id).is_none() {
            return Err(RouterError::UnknownPipe { connection_id });
        }
        Ok(())
    }

    /// Routes the next forwarded envelope, if any, to its handler.
    pub fn route_message(&mut self) -> Result<Option<RouteReport>, RouterError> {
        if !self.running {
            return Err(RouterError::NotRunning);
        }
        Self::route_from(&self.local, &mut self.receivers)
    }

    /// Blocks until a ping arrives or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.pingee.wait(timeout)
    }

    /// Routes messages until `condition` holds, blocking between bursts
    /// against a deadline fixed at entry.
    pub fn route_until(
        &mut self,
        condition: impl FnMut() -> bool,
        timeout: Duration,
    ) -> Result<(), PumpError> {
        if !self.running {
            return Err(RouterError::NotRunning.into());
        }
        let Self {
            local,
            receivers,
            pingee,
            ..
        } = self;
        super::route_until(
            condition,
            timeout,
            || Self::route_from(local, receivers),
            |remaining| pingee.wait(remaining),
        )
    }

    fn route_from(
        local: &SegQueue<WireEnvelope>,
        receivers: &mut HashMap<ConnectionId, PipeEntry>,
    ) -> Result<Option<RouteReport>, RouterError> {
        let Some(envelope) = local.pop() else {
            return Ok(None);
        };
        let connection_id = envelope.connection_id;
        let Some(entry) = receivers.get_mut(&connection_id) else {
            tracing::warn!(%connection_id, "dropping message for closed pipe");
            return Ok(Some(RouteReport {
                connection_id,
                delivery: Delivery::NoReceiver,
            }));
        };
        let message = (entry.decoder)(envelope.message)
            .map_err(|detail| RouterError::Decode { connection_id, detail })?;
        let Some(handler) = entry.handler.as_mut() else {
            tracing::warn!(
                %connection_id,
                message = %message.kind(),
                "dropping message for unbound pipe"
            );
            return Ok(Some(RouteReport {
                connection_id,
                delivery: Delivery::NoReceiver,
            }));
        };
        let dispatch = handler(message)
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

fn decode_wire<T, M>(message: WireMessage) -> Result<TaskMessage, String>
where
    T: DeserializeOwned + Send + 'static,
    M: DeserializeOwned + Send + 'static,
{
    Ok(match message {
        WireMessage::Started => TaskMessage::Started,
        WireMessage::Abandoned => TaskMessage::Abandoned,
        WireMessage::Raised(exception) => TaskMessage::Raised(exception),
        WireMessage::Returned(bytes) => {
            let (value, _): (T, usize) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                    .map_err(|error| error.to_string())?;
            TaskMessage::Returned(Box::new(value))
        }
        WireMessage::Sent(bytes) => {
            let (value, _): (M, usize) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                    .map_err(|error| error.to_string())?;
            TaskMessage::Sent(Box::new(value))
        }
    })
}
