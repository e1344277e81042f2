//! USB redirection channel state machine
//!
//! The channel bridges one USB device to a generic channel transport:
//!
//! ```text
//!                 connect                 grant ok / no helper      channel up
//! Disconnected ─────────► WaitingForAccessGrant ─────────► Connecting ─────────► Connected
//!      ▲                        │ disconnect                   │                     │
//!      │                        ▼                              │ disconnect          │
//!      └──── grant callback ── Disconnecting                   └──────────┬──────────┘
//!                                                                         ▼
//!                                                                    Disconnected
//! ```
//!
//! Every transition runs on the controlling task that owns the channel (see
//! [`crate::handle`]). The USB event pump thread never touches the channel;
//! it only reaches the redirection host, which serializes itself with the
//! locks from [`crate::lock`], and the [`Bridge`].
//!
//! What the channel owns is carried by the state itself: a pending access
//! grant (device reference, completion, grant request) lives in the
//! `WaitingForAccessGrant`/`Disconnecting` variants and the redirection host
//! in `Connecting`/`Connected`. Releasing a state releases its resources.

use crate::access::{AccessControlHelper, GrantRequest, SessionControl};
use crate::acquire::{Connection, open_device};
use crate::bridge::Bridge;
use crate::device::{DeviceRef, UsbDevice};
use crate::error::{AccessGrantError, ChannelError, ProtocolDefect};
use crate::events::EventListener;
use crate::host::{HostError, HostOptions, RedirHostFactory};
use crate::transport::{ChannelTransport, DisconnectReason};
use async_channel::Sender;
use bytes::Bytes;
use common::RedirConfig;
use protocol::{Message, MessageKind};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Observable channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    WaitingForAccessGrant,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::WaitingForAccessGrant => "waiting for access grant",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Where a connect attempt reports its outcome
pub(crate) type Completion = oneshot::Sender<Result<(), ChannelError>>;

/// Events delivered to the controlling task outside of commands
pub(crate) enum ChannelEvent {
    /// Inbound transport message
    Message(Message),
    /// Transport link is ready
    ChannelUp,
    /// The access-control helper resolved the pending grant
    GrantCompleted(Result<(), AccessGrantError>),
}

/// External components a channel works with
pub struct Collaborators<D: UsbDevice> {
    pub factory: Arc<dyn RedirHostFactory<D>>,
    pub events: Arc<dyn EventListener>,
    pub transport: Arc<dyn ChannelTransport>,
    pub session: Arc<dyn SessionControl>,
    /// Present only where device nodes need an OS grant before opening
    pub access: Option<Arc<dyn AccessControlHelper>>,
}

impl<D: UsbDevice> Clone for Collaborators<D> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            events: self.events.clone(),
            transport: self.transport.clone(),
            session: self.session.clone(),
            access: self.access.clone(),
        }
    }
}

/// A connect attempt waiting on the access-control helper
struct PendingGrant<D: UsbDevice> {
    device: DeviceRef<D>,
    context: D::Context,
    request: Box<dyn GrantRequest>,
    completion: Completion,
}

enum Stage<D: UsbDevice> {
    Disconnected,
    WaitingForAccessGrant(PendingGrant<D>),
    Connecting(Connection<D>),
    Connected(Connection<D>),
    Disconnecting(PendingGrant<D>),
}

impl<D: UsbDevice> Stage<D> {
    fn state(&self) -> ChannelState {
        match self {
            Stage::Disconnected => ChannelState::Disconnected,
            Stage::WaitingForAccessGrant(_) => ChannelState::WaitingForAccessGrant,
            Stage::Connecting(_) => ChannelState::Connecting,
            Stage::Connected(_) => ChannelState::Connected,
            Stage::Disconnecting(_) => ChannelState::Disconnecting,
        }
    }

    fn connection(&self) -> Option<&Connection<D>> {
        match self {
            Stage::Connecting(connection) | Stage::Connected(connection) => Some(connection),
            _ => None,
        }
    }
}

/// USB redirection channel
pub struct UsbRedirChannel<D: UsbDevice> {
    stage: Stage<D>,
    collaborators: Collaborators<D>,
    bridge: Arc<Bridge>,
    options: HostOptions,
    inhibit_keyboard_grab: bool,
    /// Feeds grant completions back to the controlling task
    events: Sender<ChannelEvent>,
}

impl<D: UsbDevice> UsbRedirChannel<D> {
    pub(crate) fn new(
        collaborators: Collaborators<D>,
        config: &RedirConfig,
        events: Sender<ChannelEvent>,
    ) -> Self {
        let bridge = Arc::new(Bridge::new(collaborators.transport.clone()));
        Self {
            stage: Stage::Disconnected,
            collaborators,
            bridge,
            options: HostOptions::from_settings(&config.channel),
            inhibit_keyboard_grab: config.access.inhibit_keyboard_grab,
            events,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.stage.state()
    }

    /// The device this channel holds a reference to, if any
    pub fn device(&self) -> Option<&D> {
        match &self.stage {
            Stage::Disconnected => None,
            Stage::WaitingForAccessGrant(pending) | Stage::Disconnecting(pending) => {
                Some(pending.device.device())
            }
            Stage::Connecting(connection) | Stage::Connected(connection) => {
                Some(connection.device.device())
            }
        }
    }

    /// Host stack context of the current device, if any
    pub fn context(&self) -> Option<&D::Context> {
        match &self.stage {
            Stage::Disconnected => None,
            Stage::WaitingForAccessGrant(pending) | Stage::Disconnecting(pending) => {
                Some(&pending.context)
            }
            Stage::Connecting(connection) | Stage::Connected(connection) => {
                Some(&connection.context)
            }
        }
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    fn set_stage(&mut self, stage: Stage<D>) {
        let (from, to) = (self.stage.state(), stage.state());
        self.stage = stage;
        if from != to {
            debug!("USB redirection channel: {} -> {}", from, to);
        }
    }

    fn take_stage(&mut self) -> Stage<D> {
        std::mem::replace(&mut self.stage, Stage::Disconnected)
    }

    /// Start redirecting `device`
    ///
    /// `device` is the channel's own reference; it is released when the
    /// attempt fails or the channel disconnects. The outcome is always sent
    /// on `completion`, exactly once.
    pub(crate) fn connect(
        &mut self,
        context: D::Context,
        device: D,
        cancel: CancellationToken,
        completion: Completion,
    ) {
        if self.state() != ChannelState::Disconnected {
            debug!("Connect rejected, channel is {}", self.state());
            drop(device);
            let _ = completion.send(Err(ChannelError::Busy));
            return;
        }

        let device = DeviceRef::new(device);
        info!(
            "Connecting USB device {}-{}",
            device.bus_number(),
            device.address()
        );

        let Some(access) = self.collaborators.access.clone() else {
            let result = if cancel.is_cancelled() {
                Err(ChannelError::Cancelled)
            } else {
                self.open(device, context)
            };
            let _ = completion.send(result);
            return;
        };

        if self.inhibit_keyboard_grab {
            self.collaborators.session.set_inhibit_keyboard_grab(true);
        }

        let events = self.events.clone();
        let request = access.open_grant(
            device.bus_number(),
            device.address(),
            cancel,
            Box::new(move |result| {
                // The channel may be gone by the time the helper answers
                let _ = events.try_send(ChannelEvent::GrantCompleted(result));
            }),
        );

        self.set_stage(Stage::WaitingForAccessGrant(PendingGrant {
            device,
            context,
            request,
            completion,
        }));
    }

    /// Open the device and move to `Connecting`
    ///
    /// Leaves the state untouched on failure.
    fn open(&mut self, device: DeviceRef<D>, context: D::Context) -> Result<(), ChannelError> {
        let connection = open_device(
            device,
            context,
            &self.collaborators,
            &self.bridge,
            &self.options,
        )?;
        self.set_stage(Stage::Connecting(connection));
        Ok(())
    }

    /// Resolve the pending access grant
    pub(crate) fn grant_completed(&mut self, result: Result<(), AccessGrantError>) {
        let (pending, cancelled) = match self.take_stage() {
            Stage::WaitingForAccessGrant(pending) => (pending, false),
            Stage::Disconnecting(pending) => (pending, true),
            other => {
                warn!("Access grant completed while {}, ignoring", other.state());
                self.stage = other;
                return;
            }
        };

        let PendingGrant {
            device,
            context,
            mut request,
            completion,
        } = pending;

        let outcome = match result {
            _ if cancelled => {
                drop(device);
                Err(ChannelError::Cancelled)
            }
            Err(e) => {
                drop(device);
                Err(ChannelError::AccessGrantFailed(e))
            }
            Ok(()) => self.open(device, context),
        };

        if let Err(e) = &outcome {
            info!("USB redirection connect failed: {}", e);
            self.set_stage(Stage::Disconnected);
        }

        request.close();
        drop(request);
        if self.inhibit_keyboard_grab {
            self.collaborators.session.set_inhibit_keyboard_grab(false);
        }

        let _ = completion.send(outcome);
    }

    /// Stop redirecting
    ///
    /// While an access grant is pending this only cancels it; the channel
    /// reaches `Disconnected` when the grant callback fires.
    pub(crate) fn disconnect(&mut self) {
        match self.take_stage() {
            Stage::Disconnected => {}
            Stage::Disconnecting(pending) => self.stage = Stage::Disconnecting(pending),
            Stage::WaitingForAccessGrant(mut pending) => {
                info!("Cancelling pending USB access grant");
                pending.request.close();
                self.set_stage(Stage::Disconnecting(pending));
            }
            Stage::Connecting(connection) | Stage::Connected(connection) => {
                self.teardown(connection, DisconnectReason::None);
                self.set_stage(Stage::Disconnected);
            }
        }
    }

    fn teardown(&mut self, connection: Connection<D>, reason: DisconnectReason) {
        let Connection {
            host,
            context,
            device,
        } = connection;
        info!(
            "Disconnecting USB device {}-{}",
            device.bus_number(),
            device.address()
        );

        self.bridge.set_connected(false);
        self.collaborators.transport.disconnect(reason);
        // Must stop before the host closes: closing interrupts the pump's
        // current poll, and the pump must not start another on a closed handle
        self.collaborators.events.stop_listening();
        // Also closes the device handle
        host.close();
        self.bridge.unbind_host();
        drop(host);
        drop(context);
        drop(device);
    }

    /// Route an inbound message
    pub(crate) fn handle_message(&mut self, message: Message) -> Result<(), ProtocolDefect> {
        match message.kind {
            MessageKind::VmcData => self.dispatch(Bytes::from(message.payload)),
            kind if kind.is_vmc() => Err(ProtocolDefect::Unimplemented(kind)),
            _ => {
                self.collaborators.transport.handle_default(message);
                Ok(())
            }
        }
    }

    /// Feed one redirection payload to the host
    fn dispatch(&mut self, payload: Bytes) -> Result<(), ProtocolDefect> {
        let host = self
            .stage
            .connection()
            .map(|connection| connection.host.clone())
            .ok_or(ProtocolDefect::MissingHost)?;

        self.bridge.begin_dispatch(payload)?;
        let result = host.read_guest_data();
        let drained = self.bridge.end_dispatch();

        match result {
            Ok(()) => {}
            Err(HostError::Callback(defect)) => return Err(defect),
            Err(HostError::Parser(e)) => warn!("Redirection host rejected data: {}", e),
        }
        drained
    }

    /// Transport link is ready
    pub(crate) fn channel_up(&mut self) -> Result<(), ProtocolDefect> {
        match self.take_stage() {
            Stage::Connecting(connection) => {
                let host = connection.host.clone();
                self.set_stage(Stage::Connected(connection));
                self.bridge.set_connected(true);
                // Flush what the host queued during the handshake
                host.write_guest_data();
                Ok(())
            }
            other => {
                let state = other.state();
                self.stage = other;
                Err(ProtocolDefect::UnexpectedState {
                    event: "channel up",
                    state,
                })
            }
        }
    }

    /// Forward a channel reset to the transport
    pub(crate) fn reset(&mut self, migrating: bool) {
        self.collaborators.transport.reset(migrating);
    }

    /// Handle an event from the transport or the access-control helper
    pub(crate) fn handle_event(&mut self, event: ChannelEvent) {
        let result = match event {
            ChannelEvent::Message(message) => self.handle_message(message),
            ChannelEvent::ChannelUp => self.channel_up(),
            ChannelEvent::GrantCompleted(result) => {
                self.grant_completed(result);
                Ok(())
            }
        };

        if let Err(defect) = result {
            self.fail(defect);
        }
    }

    /// Hard-fail the channel after a defect
    fn fail(&mut self, defect: ProtocolDefect) {
        error!("USB redirection channel defect: {}", defect);
        match self.take_stage() {
            Stage::Connecting(connection) | Stage::Connected(connection) => {
                self.teardown(connection, DisconnectReason::Defect);
                self.set_stage(Stage::Disconnected);
            }
            other => {
                self.stage = other;
                self.disconnect();
            }
        }
    }

    /// Release everything, whatever the state
    pub(crate) fn dispose(&mut self) {
        self.disconnect();
        if self.state() == ChannelState::Disconnecting {
            // Nobody will process the grant callback anymore
            self.grant_completed(Err(AccessGrantError::Cancelled));
        }
    }
}

impl<D: UsbDevice> Drop for UsbRedirChannel<D> {
    fn drop(&mut self) {
        self.dispose();
    }
}
