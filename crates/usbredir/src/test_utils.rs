//! Test doubles for the channel's collaborators
//!
//! Every external component the channel talks to has an in-memory mock
//! here that records what happened to it. [`MockCollaborators`] wires a full
//! set together, sharing one [`MockCallLog`] so tests can check the order of
//! calls across components.

use crate::access::{AccessControlHelper, GrantCallback, GrantRequest, SessionControl};
use crate::channel::Collaborators;
use crate::device::UsbDevice;
use crate::error::{AccessGrantError, EventListenerError};
use crate::events::EventListener;
use crate::host::{
    HostCallbacks, HostError, HostLogLevel, HostOpenError, HostOptions, RedirHost,
    RedirHostFactory,
};
use crate::lock::{HostLock, LockAdapter};
use crate::transport::{ChannelTransport, DisconnectReason, OutgoingMessage, TransportUpcalls};
use protocol::Message;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared, ordered record of collaborator calls
#[derive(Debug, Clone, Default)]
pub struct MockCallLog {
    entries: Arc<Mutex<Vec<&'static str>>>,
}

impl MockCallLog {
    pub fn push(&self, entry: &'static str) {
        locked(&self.entries).push(entry);
    }

    pub fn entries(&self) -> Vec<&'static str> {
        locked(&self.entries).clone()
    }

    pub fn clear(&self) {
        locked(&self.entries).clear();
    }
}

/// Host stack context of a [`MockDevice`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockContext;

/// Reference-counted fake USB device
///
/// Every clone counts as one reference; [`MockDevice::ref_count`] reports
/// how many are alive.
#[derive(Debug)]
pub struct MockDevice {
    bus: u8,
    address: u8,
    refs: Arc<AtomicUsize>,
    opens: Arc<AtomicUsize>,
    handles: Arc<AtomicUsize>,
    open_error: Arc<Mutex<Option<rusb::Error>>>,
}

impl MockDevice {
    pub fn new(bus: u8, address: u8) -> Self {
        Self {
            bus,
            address,
            refs: Arc::new(AtomicUsize::new(1)),
            opens: Arc::new(AtomicUsize::new(0)),
            handles: Arc::new(AtomicUsize::new(0)),
            open_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Make subsequent opens fail with `error`
    pub fn set_open_error(&self, error: Option<rusb::Error>) {
        *locked(&self.open_error) = error;
    }

    /// Live references, including this one
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    /// Successful and failed open attempts
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Handles that are open right now
    pub fn open_handles(&self) -> usize {
        self.handles.load(Ordering::SeqCst)
    }
}

impl Clone for MockDevice {
    fn clone(&self) -> Self {
        self.refs.fetch_add(1, Ordering::SeqCst);
        Self {
            bus: self.bus,
            address: self.address,
            refs: self.refs.clone(),
            opens: self.opens.clone(),
            handles: self.handles.clone(),
            open_error: self.open_error.clone(),
        }
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

impl UsbDevice for MockDevice {
    type Context = MockContext;
    type Handle = MockHandle;

    fn open(&self) -> Result<MockHandle, rusb::Error> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = *locked(&self.open_error) {
            return Err(error);
        }
        self.handles.fetch_add(1, Ordering::SeqCst);
        Ok(MockHandle {
            handles: self.handles.clone(),
        })
    }

    fn bus_number(&self) -> u8 {
        self.bus
    }

    fn address(&self) -> u8 {
        self.address
    }
}

/// Open handle of a [`MockDevice`]; closed on drop
#[derive(Debug)]
pub struct MockHandle {
    handles: Arc<AtomicUsize>,
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.handles.fetch_sub(1, Ordering::SeqCst);
    }
}

/// How hosts opened by a [`MockHostFactory`] behave
#[derive(Debug, Clone, Default)]
pub struct MockHostBehavior {
    /// Fail `open`
    pub fail_open: bool,
    /// Logged at error level before a failed `open` returns
    pub open_error: Option<String>,
    /// Stop reading after this many bytes per dispatch
    pub consume_limit: Option<usize>,
    /// Reject every inbound payload as unparsable
    pub parse_error: bool,
}

/// In-memory redirection host
///
/// Reads inbound data in small chunks and writes out whatever was queued
/// with [`MockHost::queue_write`].
pub struct MockHost {
    callbacks: Option<Arc<dyn HostCallbacks>>,
    behavior: MockHostBehavior,
    lock: Arc<HostLock>,
    handle: Mutex<Option<MockHandle>>,
    queued: Mutex<Vec<Vec<u8>>>,
    consumed: Mutex<Vec<u8>>,
    flushes: AtomicUsize,
    freed: AtomicUsize,
    closed: AtomicBool,
    log: Option<MockCallLog>,
}

impl MockHost {
    /// Read chunk size
    const CHUNK: usize = 64;

    /// A host not connected to any callbacks
    pub fn detached() -> Self {
        Self::build(None, MockHostBehavior::default(), LockAdapter, None, None)
    }

    fn build(
        callbacks: Option<Arc<dyn HostCallbacks>>,
        behavior: MockHostBehavior,
        locks: LockAdapter,
        handle: Option<MockHandle>,
        log: Option<MockCallLog>,
    ) -> Self {
        Self {
            callbacks,
            behavior,
            lock: locks.alloc(),
            handle: Mutex::new(handle),
            queued: Mutex::new(Vec::new()),
            consumed: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            log,
        }
    }

    /// Queue outbound data and ask for a flush, like a host completing a
    /// transfer on the event pump thread
    pub fn queue_write(&self, data: Vec<u8>) {
        {
            let _guard = self.lock.guard();
            locked(&self.queued).push(data);
        }
        if let Some(callbacks) = &self.callbacks {
            callbacks.write_flush();
        }
    }

    /// Everything read through the callbacks so far
    pub fn consumed(&self) -> Vec<u8> {
        locked(&self.consumed).clone()
    }

    /// Calls to `write_guest_data`
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Buffers handed back through `free_write_buffer`
    pub fn freed_buffers(&self) -> usize {
        self.freed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl RedirHost for MockHost {
    fn read_guest_data(&self) -> Result<(), HostError> {
        let Some(callbacks) = &self.callbacks else {
            return Ok(());
        };
        let _guard = self.lock.guard();

        let mut total = 0;
        loop {
            let want = match self.behavior.consume_limit {
                Some(limit) if total >= limit => break,
                Some(limit) => Self::CHUNK.min(limit - total),
                None => Self::CHUNK,
            };
            let mut buf = [0u8; Self::CHUNK];
            let count = callbacks.read(&mut buf[..want])?;
            if count == 0 {
                break;
            }
            total += count;
            locked(&self.consumed).extend_from_slice(&buf[..count]);
        }

        if self.behavior.parse_error {
            return Err(HostError::Parser(format!("bad packet of {} bytes", total)));
        }
        Ok(())
    }

    fn write_guest_data(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        let pending = {
            let _guard = self.lock.guard();
            std::mem::take(&mut *locked(&self.queued))
        };
        if let Some(callbacks) = &self.callbacks {
            for data in pending {
                callbacks.write(data);
            }
        }
    }

    fn free_write_buffer(&self, _buffer: Vec<u8>) {
        self.freed.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        locked(&self.handle).take();
        if let Some(log) = &self.log {
            log.push("host.close");
        }
    }
}

/// Opens [`MockHost`]s
#[derive(Default)]
pub struct MockHostFactory {
    behavior: Mutex<MockHostBehavior>,
    hosts: Mutex<Vec<Arc<MockHost>>>,
    options: Mutex<Option<HostOptions>>,
    log: MockCallLog,
}

impl MockHostFactory {
    pub fn new(log: MockCallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    pub fn set_behavior(&self, behavior: MockHostBehavior) {
        *locked(&self.behavior) = behavior;
    }

    /// Most recently opened host
    pub fn last_host(&self) -> Option<Arc<MockHost>> {
        locked(&self.hosts).last().cloned()
    }

    /// Hosts opened successfully
    pub fn opened(&self) -> usize {
        locked(&self.hosts).len()
    }

    /// Options passed to the last `open`
    pub fn last_options(&self) -> Option<HostOptions> {
        locked(&self.options).clone()
    }
}

impl RedirHostFactory<MockDevice> for MockHostFactory {
    fn open(
        &self,
        _context: &MockContext,
        handle: MockHandle,
        callbacks: Arc<dyn HostCallbacks>,
        locks: LockAdapter,
        options: &HostOptions,
    ) -> Result<Arc<dyn RedirHost>, HostOpenError> {
        *locked(&self.options) = Some(options.clone());
        let behavior = locked(&self.behavior).clone();

        callbacks.log(HostLogLevel::Info, "mock host opening");
        if behavior.fail_open {
            if let Some(message) = &behavior.open_error {
                callbacks.log(HostLogLevel::Error, message);
            }
            return Err(HostOpenError);
        }

        let host = Arc::new(MockHost::build(
            Some(callbacks),
            behavior,
            locks,
            Some(handle),
            Some(self.log.clone()),
        ));
        locked(&self.hosts).push(host.clone());
        Ok(host)
    }
}

/// Records everything the channel asks of its transport
#[derive(Default)]
pub struct MockTransport {
    upcalls: Mutex<Option<TransportUpcalls>>,
    sent: Mutex<Vec<OutgoingMessage>>,
    connects: AtomicUsize,
    disconnects: Mutex<Vec<DisconnectReason>>,
    defaults: Mutex<Vec<Message>>,
    resets: Mutex<Vec<bool>>,
    auto_channel_up: AtomicBool,
    log: Option<MockCallLog>,
}

impl MockTransport {
    pub fn new(log: MockCallLog) -> Self {
        Self {
            log: Some(log),
            ..Default::default()
        }
    }

    /// Report the channel up as soon as `connect` is called
    pub fn set_auto_channel_up(&self, enabled: bool) {
        self.auto_channel_up.store(enabled, Ordering::SeqCst);
    }

    /// Upcall path bound by the channel
    pub fn upcalls(&self) -> Option<TransportUpcalls> {
        locked(&self.upcalls).clone()
    }

    /// Take the messages sent so far
    pub fn take_sent(&self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut *locked(&self.sent))
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_reasons(&self) -> Vec<DisconnectReason> {
        locked(&self.disconnects).clone()
    }

    /// Messages passed to `handle_default`
    pub fn default_handled(&self) -> Vec<Message> {
        locked(&self.defaults).clone()
    }

    pub fn resets(&self) -> Vec<bool> {
        locked(&self.resets).clone()
    }

    fn record(&self, entry: &'static str) {
        if let Some(log) = &self.log {
            log.push(entry);
        }
    }
}

impl ChannelTransport for MockTransport {
    fn attach(&self, upcalls: TransportUpcalls) {
        *locked(&self.upcalls) = Some(upcalls);
    }

    fn send(&self, message: OutgoingMessage) {
        locked(&self.sent).push(message);
    }

    fn connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.record("transport.connect");
        if self.auto_channel_up.load(Ordering::SeqCst) {
            if let Some(upcalls) = self.upcalls() {
                upcalls.channel_up();
            }
        }
    }

    fn disconnect(&self, reason: DisconnectReason) {
        locked(&self.disconnects).push(reason);
        self.record("transport.disconnect");
    }

    fn handle_default(&self, message: Message) {
        locked(&self.defaults).push(message);
    }

    fn reset(&self, migrating: bool) {
        locked(&self.resets).push(migrating);
    }
}

/// Reference-counted listener registrations
#[derive(Debug, Default)]
pub struct MockEventListener {
    listeners: AtomicUsize,
    fail: AtomicBool,
    log: MockCallLog,
}

impl MockEventListener {
    pub fn new(log: MockCallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    /// Make `start_listening` fail
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn listeners(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }
}

impl EventListener for MockEventListener {
    fn start_listening(&self) -> Result<(), EventListenerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EventListenerError("mock event thread refused".to_string()));
        }
        self.listeners.fetch_add(1, Ordering::SeqCst);
        self.log.push("events.start");
        Ok(())
    }

    fn stop_listening(&self) {
        self.listeners.fetch_sub(1, Ordering::SeqCst);
        self.log.push("events.stop");
    }
}

/// Access-control helper answered by the test
#[derive(Default)]
pub struct MockAccessHelper {
    pending: Mutex<Option<GrantCallback>>,
    immediate: Mutex<Option<Result<(), AccessGrantError>>>,
    requests: Mutex<Vec<(u8, u8)>>,
    cancel: Mutex<Option<CancellationToken>>,
    closes: Arc<AtomicUsize>,
}

impl MockAccessHelper {
    /// Answer the next request from inside `open_grant`
    pub fn complete_immediately(&self, result: Result<(), AccessGrantError>) {
        *locked(&self.immediate) = Some(result);
    }

    /// Answer the outstanding request
    ///
    /// Returns false when nothing is outstanding.
    pub fn complete(&self, result: Result<(), AccessGrantError>) -> bool {
        let Some(done) = locked(&self.pending).take() else {
            return false;
        };
        done(result);
        true
    }

    pub fn has_pending(&self) -> bool {
        locked(&self.pending).is_some()
    }

    /// Bus/address pairs requested so far
    pub fn requests(&self) -> Vec<(u8, u8)> {
        locked(&self.requests).clone()
    }

    /// Cancellation token of the last request
    pub fn last_cancel(&self) -> Option<CancellationToken> {
        locked(&self.cancel).clone()
    }

    /// Calls to `GrantRequest::close`
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl AccessControlHelper for MockAccessHelper {
    fn open_grant(
        &self,
        bus: u8,
        address: u8,
        cancel: CancellationToken,
        done: GrantCallback,
    ) -> Box<dyn GrantRequest> {
        locked(&self.requests).push((bus, address));
        *locked(&self.cancel) = Some(cancel);

        let immediate = locked(&self.immediate).take();
        match immediate {
            Some(result) => done(result),
            None => *locked(&self.pending) = Some(done),
        }

        Box::new(MockGrantRequest {
            closes: self.closes.clone(),
        })
    }
}

struct MockGrantRequest {
    closes: Arc<AtomicUsize>,
}

impl GrantRequest for MockGrantRequest {
    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records keyboard-grab inhibit toggles
#[derive(Debug, Default)]
pub struct MockSession {
    toggles: Mutex<Vec<bool>>,
}

impl MockSession {
    pub fn toggles(&self) -> Vec<bool> {
        locked(&self.toggles).clone()
    }
}

impl SessionControl for MockSession {
    fn set_inhibit_keyboard_grab(&self, inhibit: bool) {
        locked(&self.toggles).push(inhibit);
    }
}

/// A full set of mocks sharing one call log
pub struct MockCollaborators {
    pub factory: Arc<MockHostFactory>,
    pub events: Arc<MockEventListener>,
    pub transport: Arc<MockTransport>,
    pub session: Arc<MockSession>,
    pub access: Arc<MockAccessHelper>,
    pub log: MockCallLog,
}

impl MockCollaborators {
    pub fn new() -> Self {
        let log = MockCallLog::default();
        Self {
            factory: Arc::new(MockHostFactory::new(log.clone())),
            events: Arc::new(MockEventListener::new(log.clone())),
            transport: Arc::new(MockTransport::new(log.clone())),
            session: Arc::new(MockSession::default()),
            access: Arc::new(MockAccessHelper::default()),
            log,
        }
    }

    /// Collaborators for a channel, with or without the access helper
    pub fn collaborators(&self, with_access: bool) -> Collaborators<MockDevice> {
        Collaborators {
            factory: self.factory.clone(),
            events: self.events.clone(),
            transport: self.transport.clone(),
            session: self.session.clone(),
            access: with_access.then(|| self.access.clone() as Arc<dyn AccessControlHelper>),
        }
    }
}

impl Default for MockCollaborators {
    fn default() -> Self {
        Self::new()
    }
}
