//! Channel message definitions
//!
//! This module defines the messages exchanged on a generic data channel that
//! carries USB redirection traffic. Messages are organized into two groups:
//! - Base channel messages (acknowledgement, keep-alive, notifications) which
//!   belong to the generic channel transport
//! - Virtual machine channel (VMC) messages which carry the opaque byte stream
//!   produced and consumed by the USB redirection host

use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};

/// Top-level message envelope
///
/// All channel messages are wrapped in this envelope which includes the
/// protocol version for compatibility checking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version of this message
    pub version: ProtocolVersion,
    /// Message type tag
    pub kind: MessageKind,
    /// Raw message body
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message with the current protocol version
    pub fn new(kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            version: crate::CURRENT_VERSION,
            kind,
            payload: payload.into(),
        }
    }

    /// Create a redirection data message
    pub fn vmc_data(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::VmcData, payload)
    }
}

/// All message types known to the channel
///
/// On the wire a kind is its numeric tag (see [`MessageKind::tag`]). Tags
/// that this build does not know about decode as [`MessageKind::Unknown`] so
/// they can still be handed to the base transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum MessageKind {
    // Base channel
    /// Peer asks the channel to migrate
    Migrate,
    /// Flow-control window update
    SetAck,
    /// Keep-alive
    Ping,
    /// Peer notification (severity + text)
    Notify,
    /// Peer is about to close the channel
    Disconnecting,

    // Virtual machine channel
    /// Opaque USB redirection stream data
    VmcData,
    /// Compressed USB redirection stream data
    VmcCompressedData,

    /// Tag not known to this build
    Unknown(u16),
}

impl MessageKind {
    /// Numeric wire tag
    pub fn tag(self) -> u16 {
        match self {
            MessageKind::Migrate => 1,
            MessageKind::SetAck => 3,
            MessageKind::Ping => 4,
            MessageKind::Disconnecting => 6,
            MessageKind::Notify => 7,
            MessageKind::VmcData => 101,
            MessageKind::VmcCompressedData => 102,
            MessageKind::Unknown(tag) => tag,
        }
    }

    /// Returns true for messages owned by the base channel transport
    pub fn is_base(&self) -> bool {
        matches!(
            self,
            MessageKind::Migrate
                | MessageKind::SetAck
                | MessageKind::Ping
                | MessageKind::Notify
                | MessageKind::Disconnecting
        )
    }

    /// Returns true for messages carrying redirection stream data
    pub fn is_vmc(&self) -> bool {
        matches!(self, MessageKind::VmcData | MessageKind::VmcCompressedData)
    }
}

impl From<u16> for MessageKind {
    fn from(tag: u16) -> Self {
        match tag {
            1 => MessageKind::Migrate,
            3 => MessageKind::SetAck,
            4 => MessageKind::Ping,
            6 => MessageKind::Disconnecting,
            7 => MessageKind::Notify,
            101 => MessageKind::VmcData,
            102 => MessageKind::VmcCompressedData,
            other => MessageKind::Unknown(other),
        }
    }
}

impl From<MessageKind> for u16 {
    fn from(kind: MessageKind) -> u16 {
        kind.tag()
    }
}
