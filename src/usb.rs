//! Raw-USB transport for recovery mode, bus presence watching, and the
//! production [Backend] wiring.
//!
//! A device in recovery mode runs iBoot and does not enumerate through
//! the usbmux daemon; it is driven directly: images go to the bulk
//! upload endpoint, console commands go out as vendor control
//! transfers, and the ECID is advertised inside the USB serial string.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures_lite::future::block_on;
use log::{debug, trace, warn};
use nusb::transfer::{Control, ControlType, Recipient};
use nusb::{DeviceInfo, Interface};

use crate::session::Shared;
use crate::transport::{
    Backend, DeviceEvent, DeviceKind, EventObserver, ImageStreamer, NormalLink, RecoveryLink,
    RestoreLink,
};
use crate::usbmux::{self, AsrClient, LockdownClient, RestoredClient};
use crate::{Error, Result};

/// Apple's USB vendor id.
pub const APPLE_VID: u16 = 0x05ac;

mod pid {
    /// iBoot recovery mode
    pub const RECOVERY_LOW: u16 = 0x1280;
    pub const RECOVERY_HIGH: u16 = 0x1283;
    /// Restore ramdisk
    pub const RESTORE: u16 = 0x1297;
    /// Normal-mode band
    pub const NORMAL_LOW: u16 = 0x1290;
    pub const NORMAL_HIGH: u16 = 0x12af;
}

/// iBoot's bulk upload endpoint.
const UPLOAD_ENDPOINT: u8 = 0x04;
const UPLOAD_CHUNK: usize = 0x4000;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Period of the bus presence poll.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Classify a USB id pair as one of the device kinds this crate drives.
pub fn classify(vendor_id: u16, product_id: u16) -> Option<DeviceKind> {
    if vendor_id != APPLE_VID {
        return None;
    }

    match product_id {
        pid::RECOVERY_LOW..=pid::RECOVERY_HIGH => Some(DeviceKind::Recovery),
        pid::RESTORE => Some(DeviceKind::Restore),
        pid::NORMAL_LOW..=pid::NORMAL_HIGH => Some(DeviceKind::Normal),
        _ => None,
    }
}

fn recovery_error(message: String) -> Error {
    Error::transport("recovery", message)
}

/// An open recovery-mode (iBoot) device.
pub struct RecoveryUsb {
    interface: Interface,
    serial: String,
}

impl RecoveryUsb {
    /// Open the first recovery-mode device on the bus.
    pub fn open() -> Result<Option<Self>> {
        let devices = nusb::list_devices().map_err(|err| recovery_error(format!("{err}")))?;

        for info in devices {
            if classify(info.vendor_id(), info.product_id()) != Some(DeviceKind::Recovery) {
                continue;
            }

            let serial = info.serial_number().unwrap_or_default().to_string();
            let device = info
                .open()
                .map_err(|err| recovery_error(format!("open: {err}")))?;
            let interface = device
                .claim_interface(0)
                .map_err(|err| recovery_error(format!("claim interface: {err}")))?;

            debug!("recovery device open, serial {serial:?}");

            return Ok(Some(Self { interface, serial }));
        }

        Ok(None)
    }
}

impl RecoveryLink for RecoveryUsb {
    fn ecid(&mut self) -> Result<u64> {
        // iBoot advertises e.g. "CPID:8920 CPRV:15 ... ECID:0123456789ABCDEF"
        self.serial
            .split_whitespace()
            .find_map(|token| token.strip_prefix("ECID:"))
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .ok_or_else(|| {
                Error::IdentityUnavailable(format!("no ECID in serial string {:?}", self.serial))
            })
    }

    fn upload(&mut self, image: &[u8]) -> Result<()> {
        for chunk in image.chunks(UPLOAD_CHUNK) {
            block_on(self.interface.bulk_out(UPLOAD_ENDPOINT, chunk.to_vec()))
                .into_result()
                .map_err(|err| recovery_error(format!("bulk upload: {err}")))?;
        }

        trace!("uploaded {} bytes", image.len());

        Ok(())
    }

    fn command(&mut self, cmd: &str) -> Result<()> {
        debug!("iBoot command: {cmd}");

        let mut data = cmd.as_bytes().to_vec();
        data.push(0);

        self.interface
            .control_out_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: 0,
                    value: 0,
                    index: 0,
                },
                &data,
                COMMAND_TIMEOUT,
            )
            .map_err(|err| recovery_error(format!("command {cmd}: {err}")))?;

        Ok(())
    }
}

fn snapshot() -> HashMap<(u8, u8), DeviceKind> {
    let mut present = HashMap::new();

    match nusb::list_devices() {
        Ok(devices) => {
            for info in devices {
                if let Some(kind) = classify(info.vendor_id(), info.product_id()) {
                    present.insert((info.bus_number(), info.device_address()), kind);
                }
            }
        }
        Err(err) => warn!("bus scan failed: {err}"),
    }

    present
}

/// Watch the bus and feed add/remove events to the observer.
///
/// Runs until the session quit latch is set. Presence is sampled once
/// per second; recovery-mode devices are visible here even though the
/// usbmux daemon cannot see them.
pub fn watch(shared: Arc<Shared>, observer: EventObserver) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut known = snapshot();

        while !shared.quit() {
            thread::sleep(POLL_INTERVAL);

            let present = snapshot();

            for (address, kind) in &present {
                if !known.contains_key(address) {
                    trace!("device add: {kind} at {address:?}");
                    observer(DeviceEvent::Add(*kind));
                }
            }
            for (address, kind) in &known {
                if !present.contains_key(address) {
                    trace!("device remove: {kind} at {address:?}");
                    observer(DeviceEvent::Remove(*kind));
                }
            }

            known = present;
        }
    })
}

/// Production backend: usbmux for normal and restore mode, raw USB for
/// recovery mode and presence.
pub struct UsbBackend {
    shared: Arc<Shared>,
}

impl UsbBackend {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn mux_device(&self, uuid: Option<&str>) -> Result<Option<usbmux::MuxDevice>> {
        let devices = usbmux::list_devices()?;

        Ok(match uuid {
            Some(uuid) => devices.into_iter().find(|device| device.serial == uuid),
            None => devices.into_iter().next(),
        })
    }
}

impl Backend for UsbBackend {
    fn open_normal(&self, uuid: Option<&str>) -> Result<Option<Box<dyn NormalLink>>> {
        let Some(device) = self.mux_device(uuid)? else {
            return Ok(None);
        };

        debug!("normal-mode device {} ({})", device.device_id, device.serial);

        Ok(Some(Box::new(LockdownClient::open(device.device_id)?)))
    }

    fn open_recovery(&self) -> Result<Option<Box<dyn RecoveryLink>>> {
        Ok(RecoveryUsb::open()?.map(|link| Box::new(link) as Box<dyn RecoveryLink>))
    }

    fn open_restore(&self) -> Result<Box<dyn RestoreLink>> {
        let device = self
            .mux_device(None)?
            .ok_or_else(|| Error::transport("restore-protocol", "no restore-mode device"))?;

        Ok(Box::new(RestoredClient::open(device.device_id)?))
    }

    fn open_streamer(&self) -> Result<Box<dyn ImageStreamer>> {
        let device = self
            .mux_device(None)?
            .ok_or_else(|| Error::transport("asr", "no restore-mode device"))?;

        Ok(Box::new(AsrClient::open(device.device_id)?))
    }

    fn subscribe(&self, observer: EventObserver) -> Result<()> {
        watch(self.shared.clone(), observer);

        Ok(())
    }
}
