//! Redirection host interface
//!
//! The redirection host encodes USB traffic of one opened device into the
//! redirection stream and decodes the peer's stream back into USB transfers.
//! It knows nothing about the transport: bytes flow in and out through the
//! [`HostCallbacks`] the channel supplies when the host is opened.

use crate::device::UsbDevice;
use crate::error::ProtocolDefect;
use crate::lock::LockAdapter;
use common::config::ChannelSettings;
use std::sync::Arc;
use thiserror::Error;

/// Severity of a redirection host log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HostLogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

/// Parameters passed to the redirection host at open time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOptions {
    /// Identification string announced to the peer
    pub name: String,
    /// Most verbose level the host should emit
    pub verbosity: HostLogLevel,
    /// The write callback takes ownership of the buffers it is given and
    /// hands them back through [`RedirHost::free_write_buffer`]
    pub write_cb_owns_buffer: bool,
}

impl HostOptions {
    pub fn from_settings(settings: &ChannelSettings) -> Self {
        Self {
            name: settings.host_name.clone(),
            verbosity: if settings.debug {
                HostLogLevel::Debug
            } else {
                HostLogLevel::Warning
            },
            write_cb_owns_buffer: true,
        }
    }
}

/// Callbacks the redirection host invokes to move bytes and report
///
/// `write` and `write_flush` may be called from the USB event pump thread
/// as well as from the controlling task.
pub trait HostCallbacks: Send + Sync {
    /// Report a log line
    fn log(&self, level: HostLogLevel, message: &str);

    /// Copy inbound stream bytes into `buf`, returning how many were copied
    ///
    /// Returns 0 once the current inbound message is drained.
    fn read(&self, buf: &mut [u8]) -> Result<usize, ProtocolDefect>;

    /// Hand an outbound buffer to the transport, returning its length
    fn write(&self, data: Vec<u8>) -> usize;

    /// Ask for buffered outbound data to be written now
    fn write_flush(&self);
}

/// Errors surfaced by [`RedirHost::read_guest_data`]
#[derive(Debug, Error)]
pub enum HostError {
    /// A callback reported a contract violation
    #[error(transparent)]
    Callback(#[from] ProtocolDefect),

    /// The peer sent a stream the host could not parse
    #[error("redirection stream parse error: {0}")]
    Parser(String),
}

/// Returned when the host cannot be opened
///
/// The reason is reported through [`HostCallbacks::log`] at error level
/// before `open` returns.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("redirection host failed to open")]
pub struct HostOpenError;

/// An opened redirection host
pub trait RedirHost: Send + Sync {
    /// Consume inbound stream data through [`HostCallbacks::read`] until it
    /// returns 0
    fn read_guest_data(&self) -> Result<(), HostError>;

    /// Write out any buffered outbound data through [`HostCallbacks::write`]
    fn write_guest_data(&self);

    /// Take back a buffer previously passed to [`HostCallbacks::write`]
    fn free_write_buffer(&self, buffer: Vec<u8>);

    /// Shut the host down and close the device handle it owns
    fn close(&self);
}

/// Opens redirection hosts for devices of type `D`
pub trait RedirHostFactory<D: UsbDevice>: Send + Sync {
    fn open(
        &self,
        context: &D::Context,
        handle: D::Handle,
        callbacks: Arc<dyn HostCallbacks>,
        locks: LockAdapter,
        options: &HostOptions,
    ) -> Result<Arc<dyn RedirHost>, HostOpenError>;
}
