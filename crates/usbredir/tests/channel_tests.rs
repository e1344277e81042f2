//! End-to-end tests of the USB redirection channel driven through its handle

use common::RedirConfig;
use common::test_utils::{DEFAULT_TEST_TIMEOUT, wait_until, with_timeout};
use protocol::{Message, MessageKind};
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use usbredir::test_utils::{MockCollaborators, MockContext, MockDevice, MockHostBehavior};
use usbredir::{
    AccessGrantError, ChannelError, ChannelHandle, ChannelState, DisconnectReason,
    ProtocolDefect, UsbDevice, spawn_channel,
};

fn setup(with_access: bool) -> (ChannelHandle<MockDevice>, MockCollaborators) {
    setup_with(with_access, &RedirConfig::default())
}

fn setup_with(
    with_access: bool,
    config: &RedirConfig,
) -> (ChannelHandle<MockDevice>, MockCollaborators) {
    // Already initialized by an earlier test in this binary
    let _ = common::setup_logging(&config.channel.log_level);
    let mocks = MockCollaborators::new();
    let handle = spawn_channel(mocks.collaborators(with_access), config);
    (handle, mocks)
}

async fn connect(
    handle: &ChannelHandle<MockDevice>,
    device: &MockDevice,
) -> Result<(), ChannelError> {
    with_timeout(
        DEFAULT_TEST_TIMEOUT,
        handle.connect(MockContext, device, CancellationToken::new()),
    )
    .await
    .expect("connect timed out")
}

/// Connect without an access helper and bring the link up
async fn connected(device: &MockDevice) -> (ChannelHandle<MockDevice>, MockCollaborators) {
    let (handle, mocks) = setup(false);
    mocks.transport.set_auto_channel_up(true);
    connect(&handle, device).await.unwrap();
    assert_eq!(handle.state().await, ChannelState::Connected);
    (handle, mocks)
}

#[tokio::test]
async fn test_connect_and_disconnect_without_helper() {
    let device = MockDevice::new(1, 4);
    let (handle, mocks) = setup(false);

    connect(&handle, &device).await.unwrap();
    assert_eq!(handle.state().await, ChannelState::Connecting);
    assert_eq!(device.ref_count(), 2);
    assert_eq!(device.open_handles(), 1);

    let upcalls = mocks.transport.upcalls().unwrap();
    assert!(upcalls.channel_up());
    assert_eq!(handle.state().await, ChannelState::Connected);

    let held = handle.device().await.unwrap();
    assert_eq!(held.address(), 4);
    drop(held);

    handle.disconnect().await;
    assert_eq!(handle.state().await, ChannelState::Disconnected);
    assert!(handle.device().await.is_none());
    assert_eq!(device.ref_count(), 1);
    assert_eq!(device.open_handles(), 0);
    assert_eq!(mocks.events.listeners(), 0);
    assert_eq!(
        mocks.transport.disconnect_reasons(),
        vec![DisconnectReason::None]
    );
}

#[tokio::test]
async fn test_connect_while_busy() {
    let device = MockDevice::new(1, 4);
    let other = MockDevice::new(2, 7);
    let (handle, _mocks) = connected(&device).await;

    assert_eq!(connect(&handle, &other).await, Err(ChannelError::Busy));
    assert_eq!(other.ref_count(), 1);
    assert_eq!(other.open_count(), 0);

    // The existing redirection is untouched
    assert_eq!(handle.state().await, ChannelState::Connected);
    assert_eq!(device.ref_count(), 2);
}

#[tokio::test]
async fn test_connect_while_connecting_is_busy() {
    let device = MockDevice::new(1, 4);
    let other = MockDevice::new(2, 7);
    let (handle, mocks) = setup(false);

    connect(&handle, &device).await.unwrap();
    assert_eq!(handle.state().await, ChannelState::Connecting);

    assert_eq!(connect(&handle, &other).await, Err(ChannelError::Busy));
    assert_eq!(handle.state().await, ChannelState::Connecting);
    assert_eq!(other.ref_count(), 1);
    assert_eq!(other.open_count(), 0);
    assert_eq!(mocks.factory.opened(), 1);
    assert_eq!(mocks.transport.connects(), 1);
}

#[tokio::test]
async fn test_connect_while_waiting_for_grant_is_busy() {
    let device = MockDevice::new(3, 12);
    let other = MockDevice::new(2, 7);
    let (handle, mocks) = setup(true);

    let pending = handle.connect_async(MockContext, &device, CancellationToken::new());
    assert_eq!(
        handle.state().await,
        ChannelState::WaitingForAccessGrant
    );

    assert_eq!(connect(&handle, &other).await, Err(ChannelError::Busy));
    assert_eq!(
        handle.state().await,
        ChannelState::WaitingForAccessGrant
    );
    assert_eq!(other.ref_count(), 1);
    assert_eq!(mocks.access.requests(), vec![(3, 12)]);
    assert_eq!(mocks.session.toggles(), vec![true]);

    // The first attempt is unaffected
    mocks.access.complete(Ok(()));
    assert_eq!(handle.connect_finish(pending).await, Ok(()));
}

#[tokio::test]
async fn test_disconnect_twice_while_waiting_for_grant() {
    let device = MockDevice::new(3, 12);
    let (handle, mocks) = setup(true);

    let pending = handle.connect_async(MockContext, &device, CancellationToken::new());
    handle.state().await;

    handle.disconnect().await;
    handle.disconnect().await;
    assert_eq!(handle.state().await, ChannelState::Disconnecting);
    assert_eq!(mocks.access.closes(), 1);
    assert_eq!(device.ref_count(), 2);
    assert_eq!(mocks.session.toggles(), vec![true]);

    mocks.access.complete(Ok(()));
    assert_eq!(
        handle.connect_finish(pending).await,
        Err(ChannelError::Cancelled)
    );
    handle.disconnect().await;

    assert_eq!(handle.state().await, ChannelState::Disconnected);
    assert_eq!(mocks.access.closes(), 2);
    assert_eq!(device.ref_count(), 1);
    assert_eq!(device.open_count(), 0);
    assert_eq!(mocks.session.toggles(), vec![true, false]);
    assert!(mocks.transport.disconnect_reasons().is_empty());
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let device = MockDevice::new(1, 4);
    let (handle, mocks) = setup(false);

    handle.disconnect().await;
    assert!(mocks.transport.disconnect_reasons().is_empty());

    connect(&handle, &device).await.unwrap();
    handle.disconnect().await;
    handle.disconnect().await;

    assert_eq!(mocks.transport.disconnect_reasons().len(), 1);
    assert_eq!(mocks.events.listeners(), 0);
    assert_eq!(device.ref_count(), 1);
}

#[tokio::test]
async fn test_device_open_failure() {
    let device = MockDevice::new(1, 4);
    device.set_open_error(Some(rusb::Error::Access));
    let (handle, mocks) = setup(false);

    let err = connect(&handle, &device).await.unwrap_err();
    assert!(matches!(
        err,
        ChannelError::DeviceOpenFailed {
            bus: 1,
            address: 4,
            code: -3,
            ..
        }
    ));
    assert!(err.to_string().starts_with("Could not open usb device 1-4"));

    assert_eq!(handle.state().await, ChannelState::Disconnected);
    assert_eq!(device.ref_count(), 1);
    assert_eq!(mocks.factory.opened(), 0);
    assert_eq!(mocks.transport.connects(), 0);
}

#[tokio::test]
async fn test_host_open_failure_reports_caught_error() {
    let device = MockDevice::new(1, 4);
    let (handle, mocks) = setup(false);
    mocks.factory.set_behavior(MockHostBehavior {
        fail_open: true,
        open_error: Some("unsupported device class".to_string()),
        ..Default::default()
    });

    assert_eq!(
        connect(&handle, &device).await,
        Err(ChannelError::EngineInitFailed(
            "unsupported device class".to_string()
        ))
    );
    assert_eq!(device.ref_count(), 1);
    assert_eq!(device.open_handles(), 0);
    assert_eq!(mocks.events.listeners(), 0);
}

#[tokio::test]
async fn test_silent_host_failure_is_defect() {
    let device = MockDevice::new(1, 4);
    let (handle, mocks) = setup(false);
    mocks.factory.set_behavior(MockHostBehavior {
        fail_open: true,
        ..Default::default()
    });

    assert_eq!(
        connect(&handle, &device).await,
        Err(ChannelError::Defect(ProtocolDefect::SilentHostFailure))
    );
    assert_eq!(device.ref_count(), 1);
}

#[tokio::test]
async fn test_event_registration_failure_closes_host() {
    let device = MockDevice::new(1, 4);
    let (handle, mocks) = setup(false);
    mocks.events.set_fail(true);

    let err = connect(&handle, &device).await.unwrap_err();
    assert!(matches!(err, ChannelError::EventRegistrationFailed(_)));

    let host = mocks.factory.last_host().unwrap();
    assert!(host.is_closed());
    assert_eq!(device.open_handles(), 0);
    assert_eq!(device.ref_count(), 1);
    assert_eq!(mocks.transport.connects(), 0);
    assert_eq!(handle.state().await, ChannelState::Disconnected);
}

#[tokio::test]
async fn test_access_grant_then_connect() {
    let device = MockDevice::new(3, 12);
    let (handle, mocks) = setup(true);

    let pending = handle.connect_async(MockContext, &device, CancellationToken::new());
    assert_eq!(
        handle.state().await,
        ChannelState::WaitingForAccessGrant
    );
    assert_eq!(mocks.access.requests(), vec![(3, 12)]);
    assert_eq!(mocks.session.toggles(), vec![true]);
    // Nothing is opened before the grant
    assert_eq!(device.open_count(), 0);

    assert!(mocks.access.complete(Ok(())));
    with_timeout(DEFAULT_TEST_TIMEOUT, handle.connect_finish(pending))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(handle.state().await, ChannelState::Connecting);
    assert_eq!(mocks.session.toggles(), vec![true, false]);
    assert_eq!(mocks.access.closes(), 1);
    assert_eq!(device.open_handles(), 1);
}

#[tokio::test]
async fn test_access_grant_denied() {
    let device = MockDevice::new(3, 12);
    let (handle, mocks) = setup(true);

    let pending = handle.connect_async(MockContext, &device, CancellationToken::new());
    handle.state().await;
    mocks
        .access
        .complete(Err(AccessGrantError::Denied { bus: 3, address: 12 }));

    let err = handle.connect_finish(pending).await.unwrap_err();
    assert_eq!(
        err,
        ChannelError::AccessGrantFailed(AccessGrantError::Denied { bus: 3, address: 12 })
    );
    assert_eq!(handle.state().await, ChannelState::Disconnected);
    assert_eq!(device.ref_count(), 1);
    assert_eq!(device.open_count(), 0);
    assert_eq!(mocks.session.toggles(), vec![true, false]);
}

#[tokio::test]
async fn test_disconnect_cancels_pending_grant() {
    let device = MockDevice::new(3, 12);
    let (handle, mocks) = setup(true);

    let pending = handle.connect_async(MockContext, &device, CancellationToken::new());
    handle.state().await;

    handle.disconnect().await;
    assert_eq!(handle.state().await, ChannelState::Disconnecting);
    assert_eq!(mocks.access.closes(), 1);
    // Still owned by the pending grant
    assert_eq!(device.ref_count(), 2);

    // A new connect must wait for the old attempt to settle
    let other = MockDevice::new(1, 1);
    assert_eq!(connect(&handle, &other).await, Err(ChannelError::Busy));

    // The helper answers after all; the grant no longer matters
    mocks.access.complete(Ok(()));
    assert_eq!(
        handle.connect_finish(pending).await,
        Err(ChannelError::Cancelled)
    );
    assert_eq!(handle.state().await, ChannelState::Disconnected);
    assert_eq!(device.ref_count(), 1);
    assert_eq!(device.open_count(), 0);
    assert_eq!(mocks.session.toggles(), vec![true, false]);
}

#[tokio::test]
async fn test_shutdown_while_waiting_for_grant() {
    let device = MockDevice::new(3, 12);
    let (handle, mocks) = setup(true);

    let pending = handle.connect_async(MockContext, &device, CancellationToken::new());
    handle.state().await;
    handle.shutdown();

    assert_eq!(
        with_timeout(DEFAULT_TEST_TIMEOUT, handle.connect_finish(pending))
            .await
            .unwrap(),
        Err(ChannelError::Cancelled)
    );
    wait_until(DEFAULT_TEST_TIMEOUT, || handle.is_closed())
        .await
        .unwrap();
    assert_eq!(device.ref_count(), 1);

    // Late answer from the helper goes nowhere
    assert!(mocks.access.complete(Ok(())));
    assert_eq!(device.open_count(), 0);
}

#[tokio::test]
async fn test_cancel_token_reaches_helper() {
    let device = MockDevice::new(3, 12);
    let (handle, mocks) = setup(true);
    let cancel = CancellationToken::new();

    let pending = handle.connect_async(MockContext, &device, cancel.clone());
    handle.state().await;

    cancel.cancel();
    assert!(mocks.access.last_cancel().unwrap().is_cancelled());
    mocks.access.complete(Err(AccessGrantError::Cancelled));

    assert_eq!(
        handle.connect_finish(pending).await,
        Err(ChannelError::AccessGrantFailed(AccessGrantError::Cancelled))
    );
    assert_eq!(device.ref_count(), 1);
}

#[tokio::test]
async fn test_keyboard_grab_left_alone_when_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usbredir.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "[access]\ninhibit_keyboard_grab = false").unwrap();

    let config = RedirConfig::load(Some(path)).unwrap();
    let device = MockDevice::new(3, 12);
    let (handle, mocks) = setup_with(true, &config);
    mocks.access.complete_immediately(Ok(()));

    connect(&handle, &device).await.unwrap();
    assert!(mocks.session.toggles().is_empty());
}

#[tokio::test]
async fn test_host_options_follow_config() {
    let mut config = RedirConfig::default();
    config.channel.host_name = "test-host 1.0".to_string();
    config.channel.debug = true;

    let device = MockDevice::new(1, 4);
    let (handle, mocks) = setup_with(false, &config);
    connect(&handle, &device).await.unwrap();

    let options = mocks.factory.last_options().unwrap();
    assert_eq!(options.name, "test-host 1.0");
    assert_eq!(options.verbosity, usbredir::HostLogLevel::Debug);
    assert!(options.write_cb_owns_buffer);
}

#[tokio::test]
async fn test_inbound_data_reaches_host() {
    let device = MockDevice::new(1, 4);
    let (handle, mocks) = connected(&device).await;
    let host = mocks.factory.last_host().unwrap();
    let upcalls = mocks.transport.upcalls().unwrap();

    let payload: Vec<u8> = (0..=255).collect();
    assert!(upcalls.message(Message::vmc_data(payload.clone())));
    assert!(upcalls.message(Message::new(MessageKind::Ping, Vec::new())));

    // Events are handled before the next command
    assert_eq!(handle.state().await, ChannelState::Connected);
    assert_eq!(host.consumed(), payload);
    assert_eq!(mocks.transport.default_handled().len(), 1);
}

#[tokio::test]
async fn test_unconsumed_data_hard_fails() {
    let device = MockDevice::new(1, 4);
    let (handle, mocks) = setup(false);
    mocks.transport.set_auto_channel_up(true);
    mocks.factory.set_behavior(MockHostBehavior {
        consume_limit: Some(8),
        ..Default::default()
    });
    connect(&handle, &device).await.unwrap();

    let upcalls = mocks.transport.upcalls().unwrap();
    upcalls.message(Message::vmc_data(vec![0; 32]));

    assert_eq!(handle.state().await, ChannelState::Disconnected);
    assert_eq!(device.ref_count(), 1);
    assert_eq!(
        mocks.transport.disconnect_reasons(),
        vec![DisconnectReason::Defect]
    );
}

#[tokio::test]
async fn test_parse_error_keeps_channel_up() {
    let device = MockDevice::new(1, 4);
    let (handle, mocks) = setup(false);
    mocks.transport.set_auto_channel_up(true);
    mocks.factory.set_behavior(MockHostBehavior {
        parse_error: true,
        ..Default::default()
    });
    connect(&handle, &device).await.unwrap();

    mocks
        .transport
        .upcalls()
        .unwrap()
        .message(Message::vmc_data(vec![1, 2, 3]));
    assert_eq!(handle.state().await, ChannelState::Connected);
}

#[tokio::test]
async fn test_writes_from_pump_thread_are_sent_and_released() {
    let device = MockDevice::new(1, 4);
    let (_handle, mocks) = connected(&device).await;
    let host = mocks.factory.last_host().unwrap();

    let pump_host = Arc::clone(&host);
    std::thread::spawn(move || {
        pump_host.queue_write(vec![0xAB; 16]);
        pump_host.queue_write(vec![0xCD; 8]);
    })
    .join()
    .unwrap();

    let sent = mocks.transport.take_sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|m| m.kind == MessageKind::VmcData));
    assert_eq!(sent[0].buffer.as_slice(), &[0xAB; 16]);
    assert_eq!(host.freed_buffers(), 0);

    drop(sent);
    assert_eq!(host.freed_buffers(), 2);
}

#[tokio::test]
async fn test_no_flush_after_disconnect() {
    let device = MockDevice::new(1, 4);
    let (handle, mocks) = connected(&device).await;
    let host = mocks.factory.last_host().unwrap();
    let flushes = host.flushes();

    handle.disconnect().await;
    host.queue_write(vec![1]);

    assert_eq!(host.flushes(), flushes);
    assert!(mocks.transport.take_sent().is_empty());
}

#[tokio::test]
async fn test_reset_is_forwarded() {
    let (handle, mocks) = setup(false);

    handle.reset(true);
    handle.reset(false);
    handle.state().await;

    assert_eq!(mocks.transport.resets(), vec![true, false]);
}

#[tokio::test]
async fn test_dropping_handle_disposes_channel() {
    let device = MockDevice::new(1, 4);
    let (handle, mocks) = connected(&device).await;
    let host = mocks.factory.last_host().unwrap();

    drop(handle);

    wait_until(DEFAULT_TEST_TIMEOUT, || host.is_closed())
        .await
        .unwrap();
    wait_until(DEFAULT_TEST_TIMEOUT, || device.ref_count() == 1)
        .await
        .unwrap();
    assert_eq!(mocks.events.listeners(), 0);
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let device = MockDevice::new(1, 4);
    let (handle, mocks) = connected(&device).await;

    handle.disconnect().await;
    connect(&handle, &device).await.unwrap();

    assert_eq!(handle.state().await, ChannelState::Connected);
    assert_eq!(mocks.factory.opened(), 2);
    assert_eq!(mocks.transport.connects(), 2);
    assert_eq!(device.ref_count(), 2);
}
