//! Generic channel transport
//!
//! The redirection channel rides on a message-oriented channel transport.
//! The transport owns framing and the connection lifecycle; the channel only
//! sends messages, asks it to connect/disconnect, and receives two upcalls:
//! an inbound message, and "channel up" once the link is ready.
//!
//! [`FramedTransport`] is a ready-made transport over any tokio byte stream
//! using the length-prefixed framing from the `protocol` crate.

use crate::channel::ChannelEvent;
use crate::host::RedirHost;
use async_channel::{Receiver, Sender, unbounded};
use bytes::Bytes;
use protocol::{
    Message, MessageKind, ProtocolError, encode_framed_parts, read_framed_async,
    validate_version, write_framed_async,
};
use std::fmt;
use std::ops::Deref;
use std::sync::{Mutex, PoisonError, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Why the channel asked the transport to disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Regular teardown
    None,
    /// The channel hit a protocol defect
    Defect,
}

/// Outbound buffer lent by the redirection host
///
/// Dropping it (once the transport is done with it) hands the buffer back
/// to the host that produced it.
pub struct WriteBuffer {
    data: Option<Vec<u8>>,
    host: Option<Weak<dyn RedirHost>>,
}

impl WriteBuffer {
    pub(crate) fn new(data: Vec<u8>, host: Option<Weak<dyn RedirHost>>) -> Self {
        Self {
            data: Some(data),
            host,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }
}

impl Deref for WriteBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for WriteBuffer {
    fn drop(&mut self) {
        let Some(data) = self.data.take() else {
            return;
        };
        match self.host.as_ref().and_then(Weak::upgrade) {
            Some(host) => host.free_write_buffer(data),
            None => trace!("Redirection host gone, dropping {} byte buffer", data.len()),
        }
    }
}

impl fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBuffer")
            .field("len", &self.as_slice().len())
            .finish()
    }
}

/// A message queued for sending
#[derive(Debug)]
pub struct OutgoingMessage {
    pub kind: MessageKind,
    pub buffer: WriteBuffer,
}

impl OutgoingMessage {
    /// Redirection data message wrapping `buffer`
    pub fn vmc_data(buffer: WriteBuffer) -> Self {
        Self {
            kind: MessageKind::VmcData,
            buffer,
        }
    }

    /// Encode as a length-prefixed frame
    pub fn encode_framed(&self) -> protocol::Result<Bytes> {
        encode_framed_parts(self.kind, &self.buffer)
    }
}

/// Upcall path from a transport into its channel
#[derive(Clone)]
pub struct TransportUpcalls {
    events: Sender<ChannelEvent>,
}

impl TransportUpcalls {
    pub(crate) fn new(events: Sender<ChannelEvent>) -> Self {
        Self { events }
    }

    /// Deliver an inbound message
    ///
    /// Returns false once the channel is gone.
    pub fn message(&self, message: Message) -> bool {
        self.events.try_send(ChannelEvent::Message(message)).is_ok()
    }

    /// Signal that the link is established and ready for data
    pub fn channel_up(&self) -> bool {
        self.events.try_send(ChannelEvent::ChannelUp).is_ok()
    }
}

impl fmt::Debug for TransportUpcalls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportUpcalls")
            .field("closed", &self.events.is_closed())
            .finish()
    }
}

/// Message-oriented channel transport
pub trait ChannelTransport: Send + Sync {
    /// Bind the upcall path; called once before any other method
    fn attach(&self, upcalls: TransportUpcalls);

    /// Queue a message for sending
    ///
    /// Must not block; may be called from the USB event pump thread.
    fn send(&self, message: OutgoingMessage);

    /// Establish the link; `channel_up` follows once it is ready
    fn connect(&self);

    /// Tear the link down
    fn disconnect(&self, reason: DisconnectReason);

    /// Default handling for messages the redirection channel does not own
    fn handle_default(&self, message: Message);

    /// Reset transport state, e.g. around a migration
    fn reset(&self, migrating: bool);
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct FramedInner {
    /// Stream halves and send queue, until `connect` takes them
    io: Option<(BoxedReader, BoxedWriter, Receiver<OutgoingMessage>)>,
    upcalls: Option<TransportUpcalls>,
    tasks: Vec<JoinHandle<()>>,
}

/// Channel transport over a tokio byte stream
///
/// `connect` spawns a reader and a writer task on the current runtime and
/// reports the channel up right away; the stream is assumed to be already
/// established and authenticated.
///
/// Frames that fail to decode are skipped. When the peer closes the stream
/// or a read fails, the reader stops without notifying the channel; the
/// owner of the stream must call `disconnect` on the channel handle.
pub struct FramedTransport {
    outgoing: Sender<OutgoingMessage>,
    inner: Mutex<FramedInner>,
}

impl FramedTransport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outgoing, outgoing_rx) = unbounded();
        Self {
            outgoing,
            inner: Mutex::new(FramedInner {
                io: Some((Box::new(reader), Box::new(writer), outgoing_rx)),
                upcalls: None,
                tasks: Vec::new(),
            }),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, FramedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChannelTransport for FramedTransport {
    fn attach(&self, upcalls: TransportUpcalls) {
        self.inner().upcalls = Some(upcalls);
    }

    fn send(&self, message: OutgoingMessage) {
        if let Err(e) = self.outgoing.try_send(message) {
            // Dropping the message returns its buffer to the host
            debug!("Transport closed, dropping {:?}", e.into_inner().kind);
        }
    }

    fn connect(&self) {
        let mut inner = self.inner();

        let Some(upcalls) = inner.upcalls.clone() else {
            warn!("Transport connect requested before a channel was attached");
            return;
        };
        let Some((reader, writer, outgoing_rx)) = inner.io.take() else {
            warn!("Transport connect requested twice, ignoring");
            return;
        };

        inner.tasks.push(tokio::spawn(write_loop(writer, outgoing_rx)));
        inner
            .tasks
            .push(tokio::spawn(read_loop(reader, upcalls.clone())));
        info!("Channel transport connected");

        upcalls.channel_up();
    }

    fn disconnect(&self, reason: DisconnectReason) {
        info!("Channel transport disconnecting ({:?})", reason);
        self.outgoing.close();
        for task in self.inner().tasks.drain(..) {
            task.abort();
        }
    }

    fn handle_default(&self, message: Message) {
        if !message.kind.is_base() {
            debug!("Ignoring {:?} message", message.kind);
            return;
        }
        match message.kind {
            MessageKind::Ping | MessageKind::SetAck => {
                trace!("Base channel {:?} ({} bytes)", message.kind, message.payload.len());
            }
            MessageKind::Notify => {
                info!(
                    "Peer notification: {}",
                    String::from_utf8_lossy(&message.payload)
                );
            }
            MessageKind::Disconnecting => info!("Peer is disconnecting"),
            other => debug!("Base channel {:?} not handled", other),
        }
    }

    fn reset(&self, migrating: bool) {
        debug!("Channel transport reset (migrating: {})", migrating);
    }
}

async fn write_loop(mut writer: BoxedWriter, outgoing: Receiver<OutgoingMessage>) {
    while let Ok(message) = outgoing.recv().await {
        let frame = match message.encode_framed() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode outgoing {:?}: {}", message.kind, e);
                continue;
            }
        };

        if let Err(e) = write_framed_async(&mut writer, &frame).await {
            warn!("Failed to write to channel stream: {}", e);
            break;
        }

        // Transmitted; releases the host buffer
        drop(message);
    }
    debug!("Channel writer stopped");
}

async fn read_loop(mut reader: BoxedReader, upcalls: TransportUpcalls) {
    loop {
        match read_framed_async(&mut reader).await {
            Ok(message) => {
                if let Err(e) = validate_version(&message.version) {
                    warn!("Dropping channel stream: {}", e);
                    break;
                }
                if !upcalls.message(message) {
                    break;
                }
            }
            // The whole frame was consumed, so the stream is still in sync
            Err(ProtocolError::Serialization(e)) => {
                warn!("Skipping undecodable channel frame: {}", e);
            }
            Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!("Channel stream closed by peer, inbound path stopped");
                break;
            }
            Err(e) => {
                warn!("Failed to read from channel stream, inbound path stopped: {}", e);
                break;
            }
        }
    }
    debug!("Channel reader stopped");
}
