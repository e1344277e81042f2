//! USB device abstraction
//!
//! The channel only needs a handful of things from the USB host stack:
//! open a handle, and identify the device by bus number and address for the
//! access-control helper. [`UsbDevice`] captures exactly that and is
//! implemented for `rusb::Device`.
//!
//! Device references are reference-counted by the host stack; in Rust a
//! clone is a `ref` and a drop is an `unref`. [`DeviceRef`] is the single
//! reference the channel holds from acquisition to release.

use rusb::UsbContext;
use tracing::debug;

/// A USB device the channel can redirect
pub trait UsbDevice: Clone + Send + Sync + 'static {
    /// Host stack context the device belongs to
    type Context: Clone + Send + Sync + 'static;
    /// Open handle, owned by the redirection host once opened
    type Handle: Send + 'static;

    /// Open a handle to the device
    fn open(&self) -> Result<Self::Handle, rusb::Error>;

    /// Bus the device is attached to
    fn bus_number(&self) -> u8;

    /// Address of the device on its bus
    fn address(&self) -> u8;
}

impl<T: UsbContext + 'static> UsbDevice for rusb::Device<T> {
    type Context = T;
    type Handle = rusb::DeviceHandle<T>;

    fn open(&self) -> Result<Self::Handle, rusb::Error> {
        rusb::Device::<T>::open(self)
    }

    fn bus_number(&self) -> u8 {
        rusb::Device::<T>::bus_number(self)
    }

    fn address(&self) -> u8 {
        rusb::Device::<T>::address(self)
    }
}

/// The channel's own reference to a device
///
/// Created when a connect attempt starts and dropped exactly once when the
/// attempt fails or the channel disconnects.
pub struct DeviceRef<D: UsbDevice> {
    device: D,
}

impl<D: UsbDevice> DeviceRef<D> {
    /// Take ownership of one reference to `device`
    pub fn new(device: D) -> Self {
        debug!(
            "Acquired reference to USB device {}-{}",
            device.bus_number(),
            device.address()
        );
        Self { device }
    }

    /// The referenced device
    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    pub fn address(&self) -> u8 {
        self.device.address()
    }
}

impl<D: UsbDevice> Drop for DeviceRef<D> {
    fn drop(&mut self) {
        debug!(
            "Released reference to USB device {}-{}",
            self.device.bus_number(),
            self.device.address()
        );
    }
}

/// Map a host stack error to its libusb error code
pub fn libusb_error_code(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NoDevice => -4,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => -99,
    }
}
