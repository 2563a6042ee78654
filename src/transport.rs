//! Trait seams for the device transports.
//!
//! The restore pipeline never talks USB or sockets directly; it consumes
//! these traits. Production implementations live in [usbmux](crate::usbmux)
//! (normal and restore modes, which enumerate through the usbmux daemon)
//! and [usb](crate::usb) (recovery mode and bus presence); tests supply
//! scripted fakes.

use std::fmt;
use std::path::Path;

use plist::Value;

use crate::Result;

/// What kind of device appeared or disappeared on the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Normal,
    Recovery,
    Restore,
}

impl From<DeviceKind> for &'static str {
    fn from(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Normal => "normal",
            DeviceKind::Recovery => "recovery",
            DeviceKind::Restore => "restore",
        }
    }
}

impl From<&DeviceKind> for &'static str {
    fn from(kind: &DeviceKind) -> Self {
        (*kind).into()
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(self))
    }
}

/// A hotplug event delivered to the session observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Add(DeviceKind),
    Remove(DeviceKind),
}

/// Observer callback for hotplug events.
pub type EventObserver = Box<dyn Fn(DeviceEvent) + Send>;

/// Identity/query channel on a normal-mode device.
pub trait NormalLink {
    /// Read the device's 64-bit unique chip identifier.
    fn unique_chip_id(&mut self) -> Result<u64>;

    /// Ask the device to reboot into recovery mode. The device drops off
    /// the bus; the caller must wait for it to re-enumerate.
    fn enter_recovery(&mut self) -> Result<()>;
}

/// Recovery-mode (iBoot) transport.
pub trait RecoveryLink {
    /// Read the ECID advertised by iBoot.
    fn ecid(&mut self) -> Result<u64>;

    /// Push an image to the device.
    fn upload(&mut self, image: &[u8]) -> Result<()>;

    /// Run an iBoot console command.
    fn command(&mut self, cmd: &str) -> Result<()>;
}

/// Structured message channel to the on-device restore agent.
pub trait RestoreLink {
    /// Handshake: ask the peer what service it is.
    fn query_type(&mut self) -> Result<String>;

    /// Kick off the restore on the device.
    fn start_restore(&mut self) -> Result<()>;

    /// Receive the next message. `Ok(None)` is a clean peer close.
    fn receive(&mut self) -> Result<Option<Value>>;

    /// Send a message to the restore agent.
    fn send(&mut self, msg: &Value) -> Result<()>;
}

/// Pipes the filesystem image to the device's ASR agent.
pub trait ImageStreamer {
    fn stream(&mut self, image: &Path) -> Result<()>;
}

/// Factory for the transports above, plus hotplug subscription.
///
/// `open_normal` and `open_recovery` return `Ok(None)` when no such
/// device is present; hard I/O failures are errors.
pub trait Backend {
    fn open_normal(&self, uuid: Option<&str>) -> Result<Option<Box<dyn NormalLink>>>;

    fn open_recovery(&self) -> Result<Option<Box<dyn RecoveryLink>>>;

    fn open_restore(&self) -> Result<Box<dyn RestoreLink>>;

    fn open_streamer(&self) -> Result<Box<dyn ImageStreamer>>;

    /// Register the hotplug observer. The observer runs on the backend's
    /// watcher thread until the session quit latch is set.
    fn subscribe(&self, observer: EventObserver) -> Result<()>;
}
