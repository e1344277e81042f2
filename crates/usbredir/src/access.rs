//! OS access control for device nodes
//!
//! On systems where unprivileged processes cannot open USB device nodes, an
//! access-control helper asks the OS (typically through an interactive
//! permission prompt) to grant access to one node, identified by bus number
//! and device address. The helper is optional; without it the channel opens
//! the device directly.

use crate::error::AccessGrantError;
use tokio_util::sync::CancellationToken;

/// Completion of an access grant request
///
/// Invoked exactly once, from any thread.
pub type GrantCallback = Box<dyn FnOnce(Result<(), AccessGrantError>) + Send>;

/// An outstanding access grant
pub trait GrantRequest: Send {
    /// Close the request
    ///
    /// Closing a request that has not resolved yet cancels it; the callback
    /// still fires. Closing is idempotent.
    fn close(&mut self);
}

/// OS-level access-control helper
pub trait AccessControlHelper: Send + Sync {
    /// Ask for access to the device node at `bus`/`address`
    fn open_grant(
        &self,
        bus: u8,
        address: u8,
        cancel: CancellationToken,
        done: GrantCallback,
    ) -> Box<dyn GrantRequest>;
}

/// The session that owns the channel
pub trait SessionControl: Send + Sync {
    /// Suppress (or restore) local keyboard capture
    ///
    /// Keyboard capture is suppressed while a permission prompt is up so
    /// the user can answer it.
    fn set_inhibit_keyboard_grab(&self, inhibit: bool);
}
