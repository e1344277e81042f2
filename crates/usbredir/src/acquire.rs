//! Device acquisition
//!
//! Opening a device for redirection takes three steps that must be undone
//! in reverse on failure: open a handle, open a redirection host on it, and
//! register with the event pump so the host's transfers complete.

use crate::bridge::Bridge;
use crate::channel::Collaborators;
use crate::device::{DeviceRef, UsbDevice};
use crate::error::{ChannelError, ProtocolDefect};
use crate::host::{HostCallbacks, HostOptions, RedirHost};
use crate::lock::LockAdapter;
use std::sync::Arc;
use tracing::{debug, error, info};

/// A device with a running redirection host
///
/// Exists exactly while the channel is connecting or connected.
pub(crate) struct Connection<D: UsbDevice> {
    pub host: Arc<dyn RedirHost>,
    pub context: D::Context,
    pub device: DeviceRef<D>,
}

/// Open `device` and start redirecting it
///
/// On failure everything acquired so far is released, including `device`.
pub(crate) fn open_device<D: UsbDevice>(
    device: DeviceRef<D>,
    context: D::Context,
    collaborators: &Collaborators<D>,
    bridge: &Arc<Bridge>,
    options: &HostOptions,
) -> Result<Connection<D>, ChannelError> {
    let (bus, address) = (device.bus_number(), device.address());

    let handle = device
        .device()
        .open()
        .map_err(|e| ChannelError::device_open(bus, address, e))?;
    debug!("Opened USB device {}-{}", bus, address);

    let callbacks: Arc<dyn HostCallbacks> = bridge.clone();
    let (opened, caught) = bridge.catch_errors(|| {
        collaborators
            .factory
            .open(&context, handle, callbacks, LockAdapter, options)
    });

    let host = match opened {
        Ok(host) => host,
        Err(_) => {
            return Err(match caught {
                Some(message) => ChannelError::EngineInitFailed(message),
                None => {
                    error!("Redirection host for {}-{} failed silently", bus, address);
                    ProtocolDefect::SilentHostFailure.into()
                }
            });
        }
    };
    bridge.bind_host(&host);

    if let Err(e) = collaborators.events.start_listening() {
        bridge.unbind_host();
        // Closes the device handle too
        host.close();
        return Err(e.into());
    }

    collaborators.transport.connect();
    info!("Redirecting USB device {}-{}", bus, address);

    Ok(Connection {
        host,
        context,
        device,
    })
}
