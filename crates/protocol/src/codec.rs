//! Message serialization and deserialization using postcard
//!
//! This module provides encoding/decoding functions for channel messages.
//! Messages are serialized using postcard (compact binary format) and framed
//! with a length prefix for use over byte streams.
//!
//! # Frame Format
//!
//! ```text
//! [Length: u32 (big-endian)][Message bytes (postcard serialized)]
//! ```
//!
//! Maximum frame size is 16 MiB to prevent memory exhaustion. Redirection
//! payloads are bounded by the largest USB bulk transfer the host emits,
//! which is far below that.

use crate::{CURRENT_VERSION, Message, MessageKind, ProtocolVersion, error::ProtocolError, error::Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::io::{Read, Write};

#[cfg(feature = "async")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum allowed frame size (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes
const LENGTH_PREFIX: usize = 4;

/// Borrowed view of a [`Message`], serialized identically
///
/// Lets callers frame a payload they do not own (e.g. a buffer lent by the
/// redirection host) without copying it into a `Vec` first.
#[derive(Serialize)]
struct MessageRef<'a> {
    version: ProtocolVersion,
    kind: MessageKind,
    #[serde(with = "serde_bytes")]
    payload: &'a [u8],
}

/// Encode a message to bytes using postcard
///
/// # Example
/// ```
/// use protocol::{Message, MessageKind, encode_message};
///
/// let msg = Message::new(MessageKind::Ping, Vec::new());
/// let bytes = encode_message(&msg).unwrap();
/// assert!(!bytes.is_empty());
/// ```
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    postcard::to_allocvec(message).map_err(ProtocolError::from)
}

/// Decode a message from bytes using postcard
///
/// # Example
/// ```
/// use protocol::{Message, MessageKind, encode_message, decode_message};
///
/// let msg = Message::vmc_data(vec![1, 2, 3]);
/// let bytes = encode_message(&msg).unwrap();
/// let decoded = decode_message(&bytes).unwrap();
/// assert_eq!(decoded.kind, MessageKind::VmcData);
/// ```
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    postcard::from_bytes(bytes).map_err(ProtocolError::from)
}

/// Validate protocol version compatibility
///
/// Compatible if major versions match. Minor version differences are allowed.
pub fn validate_version(message_version: &ProtocolVersion) -> Result<()> {
    if !CURRENT_VERSION.accepts(message_version) {
        return Err(ProtocolError::IncompatibleVersion {
            major: message_version.major,
            minor: message_version.minor,
            expected_major: CURRENT_VERSION.major,
            expected_minor: CURRENT_VERSION.minor,
        });
    }
    Ok(())
}

fn frame(message_bytes: &[u8]) -> Result<Bytes> {
    let message_len = message_bytes.len();

    if message_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: message_len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + message_len);
    frame.put_u32(message_len as u32);
    frame.extend_from_slice(message_bytes);

    Ok(frame.freeze())
}

/// Encode a message with length prefix for framing
///
/// # Example
/// ```
/// use protocol::{Message, MessageKind, encode_framed};
///
/// let msg = Message::new(MessageKind::Ping, Vec::new());
/// let framed = encode_framed(&msg).unwrap();
/// assert!(framed.len() >= 4);
/// ```
pub fn encode_framed(message: &Message) -> Result<Bytes> {
    frame(&encode_message(message)?)
}

/// Encode a borrowed payload as a framed message of the given kind
///
/// The result decodes with [`decode_framed`] exactly like a framed [`Message`]
/// with the same kind and payload.
pub fn encode_framed_parts(kind: MessageKind, payload: &[u8]) -> Result<Bytes> {
    let message = MessageRef {
        version: CURRENT_VERSION,
        kind,
        payload,
    };
    let message_bytes = postcard::to_allocvec(&message)?;
    frame(&message_bytes)
}

/// Decode a framed message
///
/// Expects frame format: [4-byte length (big-endian)][postcard message bytes]
pub fn decode_framed(frame: &[u8]) -> Result<Message> {
    if frame.len() < LENGTH_PREFIX {
        return Err(ProtocolError::IncompleteFrame {
            expected: LENGTH_PREFIX,
            actual: frame.len(),
        });
    }

    let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }

    if frame.len() < LENGTH_PREFIX + length {
        return Err(ProtocolError::IncompleteFrame {
            expected: LENGTH_PREFIX + length,
            actual: frame.len(),
        });
    }

    decode_message(&frame[LENGTH_PREFIX..LENGTH_PREFIX + length])
}

/// Write a framed message to a writer
pub fn write_framed<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    let framed = encode_framed(message)?;
    writer.write_all(&framed)?;
    Ok(())
}

/// Read a framed message from a reader
///
/// # Example
/// ```
/// use protocol::{Message, MessageKind, write_framed, read_framed};
/// use std::io::Cursor;
///
/// let msg = Message::vmc_data(vec![0xAB; 16]);
/// let mut buffer = Vec::new();
/// write_framed(&mut buffer, &msg).unwrap();
///
/// let mut cursor = Cursor::new(buffer);
/// let decoded = read_framed(&mut cursor).unwrap();
/// assert_eq!(decoded.payload.len(), 16);
/// ```
pub fn read_framed<R: Read>(reader: &mut R) -> Result<Message> {
    let mut len_bytes = [0u8; LENGTH_PREFIX];
    reader.read_exact(&mut len_bytes)?;
    let length = u32::from_be_bytes(len_bytes) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut message_bytes = vec![0u8; length];
    reader.read_exact(&mut message_bytes)?;

    decode_message(&message_bytes)
}

/// Async: Write pre-framed bytes to an async writer
#[cfg(feature = "async")]
pub async fn write_framed_async<W>(writer: &mut W, framed_bytes: &[u8]) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_all(framed_bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Async: Read and decode one framed message from an async reader
#[cfg(feature = "async")]
pub async fn read_framed_async<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_bytes = [0u8; LENGTH_PREFIX];
    reader.read_exact(&mut len_bytes).await?;
    let length = u32::from_be_bytes(len_bytes) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut message_bytes = vec![0u8; length];
    reader.read_exact(&mut message_bytes).await?;

    decode_message(&message_bytes)
}
