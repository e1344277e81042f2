//! Channel message protocol for p2p-usbredir
//!
//! This crate defines the messages carried on the generic data channel that a
//! USB redirection channel rides on. It provides type-safe message
//! definitions, serialization/deserialization using postcard, length-prefixed
//! framing and protocol versioning.
//!
//! # Example
//!
//! ```
//! use protocol::{Message, MessageKind, encode_framed, decode_framed};
//!
//! let msg = Message::vmc_data(vec![0x01, 0x02]);
//!
//! let framed = encode_framed(&msg).unwrap();
//! let decoded = decode_framed(&framed).unwrap();
//! assert_eq!(decoded.kind, MessageKind::VmcData);
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod version;

pub use codec::{
    MAX_FRAME_SIZE, decode_framed, decode_message, encode_framed, encode_framed_parts,
    encode_message, read_framed, validate_version, write_framed,
};

#[cfg(feature = "async")]
pub use codec::{read_framed_async, write_framed_async};
pub use error::{ProtocolError, Result};
pub use messages::{Message, MessageKind};
pub use version::{CURRENT_VERSION, ProtocolVersion};
