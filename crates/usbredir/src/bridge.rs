//! Transport callback bridge
//!
//! Implements the [`HostCallbacks`] the redirection host calls to move
//! bytes. The host works on buffers (read N bytes, here is a buffer to
//! write) while the transport works on whole messages; the bridge
//! translates between the two:
//!
//! - inbound, the channel stakes one message payload in the bridge and lets
//!   the host drain it synchronously through `read`
//! - outbound, every `write` becomes one redirection data message whose
//!   buffer goes back to the host after transmission
//!
//! This is the only state shared with the USB event pump thread. Each field
//! has its own lock and no lock is held while calling into the host or the
//! transport.

use crate::error::ProtocolDefect;
use crate::host::{HostCallbacks, HostLogLevel, RedirHost};
use crate::transport::{ChannelTransport, OutgoingMessage, WriteBuffer};
use bytes::{Buf, Bytes};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, error, info, trace, warn};

pub struct Bridge {
    transport: Arc<dyn ChannelTransport>,
    /// Host bound to this bridge, for flushes and buffer release
    host: Mutex<Option<Weak<dyn RedirHost>>>,
    /// Mirrors `ChannelState::Connected`
    connected: AtomicBool,
    /// Inbound payload being dispatched; `Some` only during a dispatch
    inbound: Mutex<Option<Bytes>>,
    /// Armed (`Some`) while the host is being opened
    catch_error: Mutex<Option<Option<String>>>,
}

impl Bridge {
    pub fn new(transport: Arc<dyn ChannelTransport>) -> Self {
        Self {
            transport,
            host: Mutex::new(None),
            connected: AtomicBool::new(false),
            inbound: Mutex::new(None),
            catch_error: Mutex::new(None),
        }
    }

    pub(crate) fn bind_host(&self, host: &Arc<dyn RedirHost>) {
        *self.host.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(host));
    }

    pub(crate) fn unbind_host(&self) {
        self.host.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn host(&self) -> Option<Arc<dyn RedirHost>> {
        self.host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn host_weak(&self) -> Option<Weak<dyn RedirHost>> {
        self.host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Run `f` with error-level host logs captured instead of logged
    ///
    /// Returns the first error message the host logged while `f` ran.
    pub fn catch_errors<R>(&self, f: impl FnOnce() -> R) -> (R, Option<String>) {
        *self.catch_slot() = Some(None);
        let result = f();
        let caught = self.catch_slot().take().flatten();
        (result, caught)
    }

    fn catch_slot(&self) -> std::sync::MutexGuard<'_, Option<Option<String>>> {
        self.catch_error.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inbound(&self) -> std::sync::MutexGuard<'_, Option<Bytes>> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stake `payload` as the data `read` will hand out
    pub fn begin_dispatch(&self, payload: Bytes) -> Result<(), ProtocolDefect> {
        let mut inbound = self.inbound();
        if let Some(pending) = inbound.as_ref() {
            return Err(ProtocolDefect::ReentrantDispatch {
                pending: pending.len(),
            });
        }
        trace!("Dispatching {} inbound bytes", payload.len());
        *inbound = Some(payload);
        Ok(())
    }

    /// Close the dispatch window opened by [`Bridge::begin_dispatch`]
    ///
    /// The window is closed even when the payload was not fully drained.
    pub fn end_dispatch(&self) -> Result<(), ProtocolDefect> {
        match self.inbound().take() {
            Some(rest) if !rest.is_empty() => Err(ProtocolDefect::UnbalancedBuffer {
                remaining: rest.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Bytes still staked in the current dispatch
    pub fn pending_inbound(&self) -> usize {
        self.inbound().as_ref().map_or(0, Bytes::len)
    }
}

impl HostCallbacks for Bridge {
    fn log(&self, level: HostLogLevel, message: &str) {
        if level == HostLogLevel::Error {
            let mut slot = self.catch_slot();
            if let Some(caught) = slot.as_mut() {
                debug!("{}", message);
                if caught.is_none() {
                    *caught = Some(message.to_string());
                }
                return;
            }
        }

        match level {
            HostLogLevel::Error => error!("{}", message),
            HostLogLevel::Warning => warn!("{}", message),
            HostLogLevel::Info => info!("{}", message),
            HostLogLevel::Debug => debug!("{}", message),
        }
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, ProtocolDefect> {
        let mut inbound = self.inbound();
        let pending = inbound
            .as_mut()
            .ok_or(ProtocolDefect::ReadOutsideDispatch)?;

        let count = buf.len().min(pending.remaining());
        pending.copy_to_slice(&mut buf[..count]);
        Ok(count)
    }

    fn write(&self, data: Vec<u8>) -> usize {
        let count = data.len();
        let buffer = WriteBuffer::new(data, self.host_weak());
        self.transport.send(OutgoingMessage::vmc_data(buffer));
        count
    }

    fn write_flush(&self) {
        if !self.is_connected() {
            return;
        }
        if let Some(host) = self.host() {
            host.write_guest_data();
        }
    }
}
