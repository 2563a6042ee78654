//! Recovery-mode bootchain upload.
//!
//! Five images go up in a fixed order: iBEC, AppleLogo, DeviceTree,
//! Ramdisk, KernelCache. iBoot drops and re-enumerates between stages,
//! so every stage opens a fresh recovery link inside a bounded retry
//! window. After the ramdisk the device needs a hard reset before it
//! will accept a kernelcache; that pause is the checkpoint hook.

use std::io::Read;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::component::{self, name, signed_image};
use crate::session::Session;
use crate::transport::{Backend, RecoveryLink};
use crate::{Bundle, Error, Result, Selector, Ticket};

/// Settle time after handing control to iBEC.
const IBEC_SETTLE: Duration = Duration::from_secs(1);

const REOPEN_ATTEMPTS: u32 = 10;
const REOPEN_DELAY: Duration = Duration::from_secs(1);

/// The pause between ramdisk and kernelcache.
///
/// The default implementation blocks on the operator; automated
/// deployments whose hardware no longer needs the reset can supply
/// [AutoCheckpoint].
pub trait CheckpointHook {
    fn wait(&mut self) -> Result<()>;
}

/// Prompt the operator to replug the device and wait for a keystroke.
pub struct StdinCheckpoint;

impl CheckpointHook for StdinCheckpoint {
    fn wait(&mut self) -> Result<()> {
        eprintln!("Please unplug your device, then plug it back in.");
        eprintln!("Hit any key when done");

        let mut key = [0u8; 1];
        std::io::stdin().read_exact(&mut key).map_err(Error::from)
    }
}

/// No-op checkpoint for unattended runs.
pub struct AutoCheckpoint;

impl CheckpointHook for AutoCheckpoint {
    fn wait(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Uploads the bootchain through the recovery transport.
pub struct BootchainUploader<'a> {
    backend: &'a dyn Backend,
    bundle: &'a mut Bundle,
    ticket: &'a Ticket,
    session: &'a Session,
}

impl<'a> BootchainUploader<'a> {
    pub fn new(
        backend: &'a dyn Backend,
        bundle: &'a mut Bundle,
        ticket: &'a Ticket,
        session: &'a Session,
    ) -> Self {
        Self {
            backend,
            bundle,
            ticket,
            session,
        }
    }

    /// Run the five-stage upload.
    ///
    /// Any failure aborts; there is no partial-state recovery, the
    /// operator re-enumerates the device and starts over.
    pub fn run(&mut self, checkpoint: &mut dyn CheckpointHook) -> Result<()> {
        self.send_stage(name::IBEC, &["go"])?;
        thread::sleep(IBEC_SETTLE);

        self.send_stage(name::APPLE_LOGO, &["setpicture", "bgcolor 0 0 0"])?;
        self.send_stage(name::DEVICE_TREE, &["devicetree"])?;
        self.send_stage(name::RAMDISK, &["ramdisk"])?;

        // iBoot will not take a kernelcache until the device has been
        // hard-reset after the ramdisk
        checkpoint.wait()?;

        self.send_stage(name::KERNEL_CACHE, &["bootx"])?;

        info!("bootchain upload complete");

        Ok(())
    }

    fn send_stage(&mut self, component: &str, commands: &[&str]) -> Result<()> {
        let (entry, image) = signed_image(
            self.bundle,
            self.ticket,
            Selector::Name(component),
            self.session.custom,
        )?;
        if self.session.dump_images() {
            component::dump_image(&entry, &image)?;
        }

        let mut link = self.open_link()?;

        info!("uploading {component} ({} bytes)", image.len());
        link.upload(&image)?;
        for cmd in commands {
            link.command(cmd)?;
        }

        Ok(())
    }

    /// Open the recovery device, waiting for it to re-enumerate.
    fn open_link(&self) -> Result<Box<dyn RecoveryLink>> {
        for attempt in 1..=REOPEN_ATTEMPTS {
            if let Some(link) = self.backend.open_recovery()? {
                return Ok(link);
            }

            warn!("recovery device not present (attempt {attempt}/{REOPEN_ATTEMPTS})");
            thread::sleep(REOPEN_DELAY);
        }

        Err(Error::transport("recovery", "device did not re-enumerate"))
    }
}
