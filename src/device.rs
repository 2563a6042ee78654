//! Device presence and mode tracking.
//!
//! Owns the open link to whichever mode the device is currently in and
//! drives the normal -> recovery transition. The hotplug subscription
//! installs the one observer allowed to touch session state, and it may
//! only do two things: promote the mode to restore on an add event, and
//! latch quit on a remove event.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::session::{Mode, Shared};
use crate::transport::{Backend, DeviceEvent, DeviceKind, NormalLink, RecoveryLink};
use crate::{Error, Result};

/// Poll period while waiting for the device to reach restore mode.
const RESTORE_POLL: Duration = Duration::from_secs(1);

pub struct Tracker<'a> {
    backend: &'a dyn Backend,
    shared: Arc<Shared>,
    uuid: Option<String>,
    normal: Option<Box<dyn NormalLink>>,
    recovery: Option<Box<dyn RecoveryLink>>,
}

impl<'a> Tracker<'a> {
    pub fn new(backend: &'a dyn Backend, shared: Arc<Shared>, uuid: Option<String>) -> Self {
        Self {
            backend,
            shared,
            uuid,
            normal: None,
            recovery: None,
        }
    }

    /// Find the device: normal-mode attach first, then recovery.
    ///
    /// Promotes the session mode accordingly and keeps the opened link
    /// for [read_ecid](Self::read_ecid) / [enter_recovery](Self::enter_recovery).
    pub fn detect(&mut self) -> Result<Mode> {
        if let Some(link) = self.backend.open_normal(self.uuid.as_deref())? {
            info!("found device in normal mode");
            self.normal = Some(link);

            return Ok(self.shared.promote(Mode::Normal));
        }

        if let Some(link) = self.backend.open_recovery()? {
            info!("found device in recovery mode");
            self.recovery = Some(link);

            return Ok(self.shared.promote(Mode::Recovery));
        }

        Err(Error::DeviceAbsent)
    }

    /// Read the device's ECID through whichever link detect opened.
    pub fn read_ecid(&mut self) -> Result<u64> {
        let ecid = match self.shared.mode() {
            Mode::Normal => self
                .normal
                .as_mut()
                .ok_or_else(|| Error::IdentityUnavailable("normal link lost".into()))?
                .unique_chip_id()?,
            Mode::Recovery => self
                .recovery
                .as_mut()
                .ok_or_else(|| Error::IdentityUnavailable("recovery link lost".into()))?
                .ecid()?,
            mode => {
                return Err(Error::IdentityUnavailable(format!(
                    "ECID is not readable in {mode} mode"
                )))
            }
        };

        info!("device ECID: {ecid:016X}");

        Ok(ecid)
    }

    /// Reboot the device from normal mode into recovery.
    ///
    /// The normal-mode link is gone afterwards; the device re-enumerates
    /// as a recovery device that the uploader opens itself.
    pub fn enter_recovery(&mut self) -> Result<()> {
        if self.shared.mode() != Mode::Normal {
            return Err(Error::transport(
                "enter-recovery",
                format!("not in normal mode ({})", self.shared.mode()),
            ));
        }

        let mut link = self
            .normal
            .take()
            .ok_or_else(|| Error::transport("enter-recovery", "normal link lost"))?;
        link.enter_recovery()?;

        self.shared.promote(Mode::Recovery);

        Ok(())
    }

    /// Drop whatever link detect opened.
    ///
    /// Called before the bootchain upload so the uploader can claim the
    /// recovery device itself.
    pub fn disconnect(&mut self) {
        self.normal = None;
        self.recovery = None;
    }

    /// Install the hotplug observer.
    ///
    /// Called after the bootchain upload: the checkpoint's deliberate
    /// unplug happens earlier and must not latch quit.
    pub fn subscribe(&self) -> Result<()> {
        let shared = self.shared.clone();

        self.backend.subscribe(Box::new(move |event| match event {
            DeviceEvent::Add(DeviceKind::Restore) => {
                shared.promote(Mode::Restore);
            }
            DeviceEvent::Add(kind) => {
                debug!("ignoring add of {kind} device");
            }
            DeviceEvent::Remove(_) => {
                shared.latch_quit();
            }
        }))
    }

    /// Block until the session reaches restore mode.
    ///
    /// Returns false if quit was latched first (device removed).
    pub fn wait_for_restore(&self) -> bool {
        info!("waiting for device to enter restore mode");

        loop {
            if self.shared.quit() {
                warn!("device removed while waiting for restore mode");
                return false;
            }
            if self.shared.mode() == Mode::Restore {
                info!("device entered restore mode");
                return true;
            }

            thread::sleep(RESTORE_POLL);
        }
    }
}
