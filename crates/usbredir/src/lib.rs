//! USB redirection channel
//!
//! Bridges a message-oriented channel transport to a redirection host that
//! encodes the traffic of one local USB device. The crate covers:
//!
//! - the per-channel connection state machine ([`UsbRedirChannel`])
//! - device acquisition, with an optional OS access-control grant first
//! - the byte bridge between the host's read/write callbacks and transport
//!   messages ([`Bridge`])
//! - the lock adapter the host uses for its internal buffers
//! - a reference-counted USB event pump thread ([`UsbEventPump`])
//!
//! # Architecture
//!
//! ```text
//!  ChannelHandle ──commands──► controlling task ──► UsbRedirChannel
//!                                   ▲                   │
//!        transport upcalls ─events──┘                   ▼
//!        grant callbacks                        RedirHost ◄──► Bridge ──► ChannelTransport
//!                                                   ▲
//!                                    UsbEventPump ──┘ (transfer completions)
//! ```
//!
//! Use [`spawn_channel`] to start a channel on the current tokio runtime.

pub mod access;
mod acquire;
pub mod bridge;
pub mod channel;
pub mod device;
pub mod error;
pub mod events;
pub mod handle;
pub mod host;
pub mod lock;
pub mod test_utils;
pub mod transport;

pub use access::{AccessControlHelper, GrantCallback, GrantRequest, SessionControl};
pub use bridge::Bridge;
pub use channel::{ChannelState, Collaborators, UsbRedirChannel};
pub use device::{DeviceRef, UsbDevice};
pub use error::{AccessGrantError, ChannelError, EventListenerError, ProtocolDefect};
pub use events::{EventListener, UsbEventPump};
pub use handle::{ChannelHandle, PendingConnect, spawn_channel};
pub use host::{
    HostCallbacks, HostError, HostLogLevel, HostOpenError, HostOptions, RedirHost,
    RedirHostFactory,
};
pub use lock::{HostLock, LockAdapter};
pub use transport::{
    ChannelTransport, DisconnectReason, FramedTransport, OutgoingMessage, TransportUpcalls,
    WriteBuffer,
};
