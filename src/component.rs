//! Firmware component resolution.
//!
//! One path from a ticket selector to pushable bytes: resolve the entry,
//! pull the member from the bundle, substitute the signature. Both the
//! recovery uploader and the restore dispatcher go through here, so
//! name- and path-addressed components cannot diverge.

use std::path::Path;

use log::{debug, trace};

use crate::{Bundle, Img3, Result, Selector, SignedEntry, Ticket};

/// Ticket entry names of the bootchain and NOR components.
pub mod name {
    pub const IBEC: &str = "iBEC";
    pub const APPLE_LOGO: &str = "AppleLogo";
    pub const DEVICE_TREE: &str = "DeviceTree";
    pub const RAMDISK: &str = "Ramdisk";
    pub const KERNEL_CACHE: &str = "KernelCache";
    pub const LLB: &str = "LLB";
}

/// Archive directory holding the NOR flash images.
pub const ALL_FLASH_DIR: &str = "Firmware/all_flash/";

/// Resolve a component and produce the bytes to push to the device.
///
/// With `custom` set the archive member is returned verbatim (the bundle
/// is assumed pre-signed); otherwise the member is parsed as an IMG3
/// container and its signature chunk is replaced with the ticket blob.
pub fn signed_image(
    bundle: &mut Bundle,
    ticket: &Ticket,
    selector: Selector,
    custom: bool,
) -> Result<(SignedEntry, Vec<u8>)> {
    let entry = ticket.find(selector)?;
    let bytes = bundle.read(&entry.path)?;

    if custom {
        trace!("custom mode, {} left untouched", entry.name);
        return Ok((entry, bytes));
    }

    let mut image = Img3::parse(&bytes)?;
    image.replace_signature(&entry.blob)?;
    let bytes = image.serialize();

    debug!("re-signed {} ({} bytes)", entry.name, bytes.len());

    Ok((entry, bytes))
}

/// Write a re-signed image to the working directory under its basename.
///
/// Only called at debug verbosity, for offline inspection of what was
/// pushed to the device.
pub fn dump_image(entry: &SignedEntry, bytes: &[u8]) -> Result<()> {
    let basename = Path::new(&entry.path)
        .file_name()
        .unwrap_or_else(|| entry.path.as_ref());

    std::fs::write(basename, bytes)?;
    debug!("dumped {} to {basename:?}", entry.name);

    Ok(())
}
