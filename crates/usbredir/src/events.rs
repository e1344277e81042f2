//! USB event listening
//!
//! Asynchronous USB transfers only complete while someone pumps the host
//! stack's event loop. The event-listening coordinator runs that loop on a
//! dedicated thread for as long as at least one redirected device is
//! registered, and is shared by every channel of a session.

use crate::error::EventListenerError;
use common::config::EventSettings;
use rusb::UsbContext;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registration with the event-listening coordinator
pub trait EventListener: Send + Sync {
    /// Register one listener, starting the pump if it is not running
    fn start_listening(&self) -> Result<(), EventListenerError>;

    /// Drop one registration, stopping the pump when none remain
    fn stop_listening(&self);
}

struct PumpState {
    listeners: usize,
    /// Stop flag of the running pump thread
    stop: Option<Arc<AtomicBool>>,
    thread: Option<JoinHandle<()>>,
}

/// Reference-counted USB event pump thread
///
/// Stopping does not join the thread: the last `handle_events` call may
/// block for up to one poll interval and the controlling task must not wait
/// on it. Each pump thread owns its stop flag, so a quick stop/start never
/// leaves two pumps running.
pub struct UsbEventPump<T: UsbContext> {
    context: T,
    poll_interval: Duration,
    state: Mutex<PumpState>,
}

impl<T: UsbContext + 'static> UsbEventPump<T> {
    /// Create a pump for `context`
    ///
    /// `poll_interval` bounds how long a stop request can go unnoticed.
    pub fn new(context: T, poll_interval: Duration) -> Self {
        Self {
            context,
            poll_interval,
            state: Mutex::new(PumpState {
                listeners: 0,
                stop: None,
                thread: None,
            }),
        }
    }

    /// Create a pump for `context` polling at the configured interval
    pub fn from_settings(context: T, settings: &EventSettings) -> Self {
        Self::new(context, settings.poll_interval())
    }

    /// Timeout of each `handle_events` call
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Number of active registrations
    pub fn listeners(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
    }

    /// Whether a pump thread is currently running
    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop
            .is_some()
    }

    fn spawn_pump(&self) -> std::io::Result<(Arc<AtomicBool>, JoinHandle<()>)> {
        let stop = Arc::new(AtomicBool::new(false));
        let context = self.context.clone();
        let poll_interval = self.poll_interval;
        let thread_stop = stop.clone();

        let thread = std::thread::Builder::new()
            .name("usb-events".to_string())
            .spawn(move || run_pump(context, thread_stop, poll_interval))?;

        Ok((stop, thread))
    }
}

impl<T: UsbContext + 'static> EventListener for UsbEventPump<T> {
    fn start_listening(&self) -> Result<(), EventListenerError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if state.listeners == 0 {
            let (stop, thread) = self
                .spawn_pump()
                .map_err(|e| EventListenerError(e.to_string()))?;
            state.stop = Some(stop);
            state.thread = Some(thread);
            info!("USB event pump started");
        }

        state.listeners += 1;
        debug!("USB event listeners: {}", state.listeners);
        Ok(())
    }

    fn stop_listening(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if state.listeners == 0 {
            warn!("stop_listening called without a matching start_listening");
            return;
        }

        state.listeners -= 1;
        debug!("USB event listeners: {}", state.listeners);

        if state.listeners == 0 {
            if let Some(stop) = state.stop.take() {
                stop.store(true, Ordering::SeqCst);
            }
            // Detach; the thread exits after its current poll
            state.thread = None;
            info!("USB event pump stopping");
        }
    }
}

impl<T: UsbContext> Drop for UsbEventPump<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(stop) = state.stop.take() {
            stop.store(true, Ordering::SeqCst);
        }
        if let Some(thread) = state.thread.take() {
            if thread.join().is_err() {
                warn!("USB event pump thread panicked");
            }
        }
    }
}

/// Body of the pump thread
fn run_pump<T: UsbContext>(context: T, stop: Arc<AtomicBool>, poll_interval: Duration) {
    debug!("USB event pump thread running");

    while !stop.load(Ordering::SeqCst) {
        match context.handle_events(Some(poll_interval)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                // Transient errors are retried after a pause instead of
                // spinning on them
                std::thread::sleep(poll_interval);
            }
        }
    }

    debug!("USB event pump thread stopped");
}
