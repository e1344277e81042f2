//! Controlling task and its handle
//!
//! A channel is owned by one tokio task that applies every transition in
//! order. Callers talk to it through a cloneable [`ChannelHandle`]: each
//! operation is a command with a oneshot reply, the same bridge pattern the
//! USB worker uses elsewhere in the workspace. Transport upcalls and access
//! grant completions arrive on a second queue that the task drains before
//! looking at new commands.

use crate::channel::{ChannelEvent, ChannelState, Collaborators, Completion, UsbRedirChannel};
use crate::device::UsbDevice;
use crate::error::ChannelError;
use crate::transport::TransportUpcalls;
use async_channel::{Receiver, Sender, unbounded};
use common::RedirConfig;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Commands from a [`ChannelHandle`] to the controlling task
pub(crate) enum ChannelCommand<D: UsbDevice> {
    Connect {
        context: D::Context,
        device: D,
        cancel: CancellationToken,
        response: Completion,
    },
    Disconnect {
        response: oneshot::Sender<()>,
    },
    GetDevice {
        response: oneshot::Sender<Option<D>>,
    },
    GetState {
        response: oneshot::Sender<ChannelState>,
    },
    Reset {
        migrating: bool,
    },
    /// Dispose of the channel and stop the task
    Shutdown,
}

/// An in-flight connect, resolved with [`ChannelHandle::connect_finish`]
#[must_use = "a connect outcome is only observed through connect_finish"]
pub struct PendingConnect {
    response: oneshot::Receiver<Result<(), ChannelError>>,
}

/// Handle to a running USB redirection channel
pub struct ChannelHandle<D: UsbDevice> {
    commands: Sender<ChannelCommand<D>>,
}

impl<D: UsbDevice> Clone for ChannelHandle<D> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<D: UsbDevice> ChannelHandle<D> {
    fn send(&self, command: ChannelCommand<D>) {
        // A closed queue drops the reply sender, which callers observe
        if self.commands.try_send(command).is_err() {
            debug!("USB redirection channel task is gone");
        }
    }

    /// Start redirecting `device`
    ///
    /// The channel takes its own reference to `device`. Fails with
    /// [`ChannelError::Busy`] unless the channel is disconnected.
    pub fn connect_async(
        &self,
        context: D::Context,
        device: &D,
        cancel: CancellationToken,
    ) -> PendingConnect {
        let (response, rx) = oneshot::channel();
        self.send(ChannelCommand::Connect {
            context,
            device: device.clone(),
            cancel,
            response,
        });
        PendingConnect { response: rx }
    }

    /// Wait for the outcome of a [`ChannelHandle::connect_async`]
    pub async fn connect_finish(&self, pending: PendingConnect) -> Result<(), ChannelError> {
        // The task dropped the completion without answering: it shut down
        pending
            .response
            .await
            .unwrap_or(Err(ChannelError::Cancelled))
    }

    /// [`ChannelHandle::connect_async`] followed by
    /// [`ChannelHandle::connect_finish`]
    pub async fn connect(
        &self,
        context: D::Context,
        device: &D,
        cancel: CancellationToken,
    ) -> Result<(), ChannelError> {
        let pending = self.connect_async(context, device, cancel);
        self.connect_finish(pending).await
    }

    /// Stop redirecting
    ///
    /// Returns once the disconnect has been applied. A pending access grant
    /// is cancelled; its connect reports [`ChannelError::Cancelled`] once the
    /// helper acknowledges.
    pub async fn disconnect(&self) {
        let (response, rx) = oneshot::channel();
        self.send(ChannelCommand::Disconnect { response });
        let _ = rx.await;
    }

    /// The device being redirected, if any
    pub async fn device(&self) -> Option<D> {
        let (response, rx) = oneshot::channel();
        self.send(ChannelCommand::GetDevice { response });
        rx.await.ok().flatten()
    }

    /// Current channel state
    pub async fn state(&self) -> ChannelState {
        let (response, rx) = oneshot::channel();
        self.send(ChannelCommand::GetState { response });
        rx.await.unwrap_or(ChannelState::Disconnected)
    }

    /// Forward a reset to the channel transport
    pub fn reset(&self, migrating: bool) {
        self.send(ChannelCommand::Reset { migrating });
    }

    /// Dispose of the channel
    ///
    /// Everything the channel holds is released; a pending connect completes
    /// with [`ChannelError::Cancelled`].
    pub fn shutdown(&self) {
        self.send(ChannelCommand::Shutdown);
    }

    /// Whether the controlling task has stopped
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Create a channel and spawn its controlling task on the current runtime
///
/// The channel is disposed of when [`ChannelHandle::shutdown`] is called or
/// the last handle is dropped.
pub fn spawn_channel<D: UsbDevice>(
    collaborators: Collaborators<D>,
    config: &RedirConfig,
) -> ChannelHandle<D> {
    let (commands_tx, commands_rx) = unbounded();
    let (events_tx, events_rx) = unbounded();

    collaborators
        .transport
        .attach(TransportUpcalls::new(events_tx.clone()));
    let channel = UsbRedirChannel::new(collaborators, config, events_tx);

    tokio::spawn(run_channel(channel, commands_rx, events_rx));

    ChannelHandle {
        commands: commands_tx,
    }
}

/// Body of the controlling task
async fn run_channel<D: UsbDevice>(
    mut channel: UsbRedirChannel<D>,
    commands: Receiver<ChannelCommand<D>>,
    events: Receiver<ChannelEvent>,
) {
    info!("USB redirection channel task started");

    loop {
        tokio::select! {
            biased;

            Ok(event) = events.recv() => channel.handle_event(event),

            command = commands.recv() => match command {
                Ok(ChannelCommand::Shutdown) | Err(_) => break,
                Ok(command) => apply(&mut channel, command),
            },
        }
    }

    commands.close();
    channel.dispose();
    info!("USB redirection channel task stopped");
}

fn apply<D: UsbDevice>(channel: &mut UsbRedirChannel<D>, command: ChannelCommand<D>) {
    match command {
        ChannelCommand::Connect {
            context,
            device,
            cancel,
            response,
        } => channel.connect(context, device, cancel, response),
        ChannelCommand::Disconnect { response } => {
            channel.disconnect();
            let _ = response.send(());
        }
        ChannelCommand::GetDevice { response } => {
            let _ = response.send(channel.device().cloned());
        }
        ChannelCommand::GetState { response } => {
            let _ = response.send(channel.state());
        }
        ChannelCommand::Reset { migrating } => channel.reset(migrating),
        ChannelCommand::Shutdown => channel.dispose(),
    }
}
