//! Channel error types
//!
//! [`ChannelError`] is what a connect attempt completes with. [`ProtocolDefect`]
//! describes contract violations by the transport, the redirection host or
//! the peer; those are never retried and hard-fail the channel.

use crate::channel::ChannelState;
use protocol::MessageKind;
use thiserror::Error;

/// Failure reported by the access-control helper
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessGrantError {
    /// The user or the policy refused access to the device node
    #[error("access to USB device {bus}-{address} was denied")]
    Denied { bus: u8, address: u8 },

    /// The request was cancelled before it resolved
    #[error("access request was cancelled")]
    Cancelled,

    /// The helper itself failed
    #[error("access helper failed: {0}")]
    Helper(String),
}

/// Failure to register with the event-listening coordinator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("could not start USB event listening: {0}")]
pub struct EventListenerError(pub String);

/// Contract violations that indicate a programming or peer error
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ProtocolDefect {
    #[error("inbound dispatch re-entered while {pending} bytes are still staked")]
    ReentrantDispatch { pending: usize },

    #[error("redirection host left {remaining} inbound bytes unconsumed")]
    UnbalancedBuffer { remaining: usize },

    #[error("redirection data received without a redirection host")]
    MissingHost,

    #[error("read callback invoked outside of an inbound dispatch")]
    ReadOutsideDispatch,

    #[error("message kind {0:?} is recognized but not implemented")]
    Unimplemented(MessageKind),

    #[error("{event} is not valid in state {state}")]
    UnexpectedState {
        event: &'static str,
        state: ChannelState,
    },

    #[error("redirection host failed to open without reporting an error")]
    SilentHostFailure,
}

/// Outcome of a failed connect attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel is busy")]
    Busy,

    #[error("Could not open usb device {bus}-{address}: {source} [{code}]")]
    DeviceOpenFailed {
        bus: u8,
        address: u8,
        #[source]
        source: rusb::Error,
        /// libusb error code
        code: i32,
    },

    #[error("redirection host failed to initialize: {0}")]
    EngineInitFailed(String),

    #[error(transparent)]
    EventRegistrationFailed(#[from] EventListenerError),

    #[error("USB access grant failed: {0}")]
    AccessGrantFailed(#[source] AccessGrantError),

    #[error("USB redirection channel connect cancelled")]
    Cancelled,

    #[error("protocol defect: {0}")]
    Defect(#[from] ProtocolDefect),
}

impl ChannelError {
    /// Build a [`ChannelError::DeviceOpenFailed`] from a host stack error
    pub fn device_open(bus: u8, address: u8, source: rusb::Error) -> Self {
        ChannelError::DeviceOpenFailed {
            bus,
            address,
            source,
            code: crate::device::libusb_error_code(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_open_message_carries_code() {
        let err = ChannelError::device_open(1, 7, rusb::Error::Access);
        let msg = err.to_string();
        assert!(msg.starts_with("Could not open usb device 1-7"));
        assert!(msg.ends_with("[-3]"));
    }

    #[test]
    fn test_cancelled_text() {
        assert_eq!(
            ChannelError::Cancelled.to_string(),
            "USB redirection channel connect cancelled"
        );
    }

    #[test]
    fn test_grant_error_is_source() {
        use std::error::Error as _;

        let err = ChannelError::AccessGrantFailed(AccessGrantError::Denied { bus: 2, address: 3 });
        let source = err.source().map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("access to USB device 2-3 was denied")
        );
    }

    #[test]
    fn test_defect_display() {
        let defect = ProtocolDefect::UnexpectedState {
            event: "channel up",
            state: ChannelState::Disconnected,
        };
        assert_eq!(
            defect.to_string(),
            "channel up is not valid in state disconnected"
        );
    }
}
