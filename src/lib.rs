//! # IPSW Restore
//!
//! This crate restores a mobile device's firmware and filesystem from a
//! signed IPSW firmware bundle.
//!
//! A restore drives the device through three bootstates. In normal mode
//! the device identifier (ECID) is read and a per-device signing ticket
//! is obtained from the TSS signing authority. The device is then
//! rebooted into recovery mode, where the bootchain images (iBEC,
//! AppleLogo, DeviceTree, Ramdisk, KernelCache) are re-signed with the
//! ticket's blobs and pushed over USB. Once the restore ramdisk is
//! running, the roles flip: the on-device restore agent pulls the
//! filesystem image, the kernelcache and the NOR flash set from the
//! host until it reports a terminal status.
//!
//! The [pipeline](crate::pipeline) module composes the stages; each
//! stage consumes its collaborators through the seams in
//! [transport](crate::transport), so everything above the wire is
//! exercised in the test suite with scripted devices.

/// Firmware bundle (IPSW) access
pub mod bundle;
/// Component resolution: ticket lookup, extraction, re-signing
pub mod component;
/// Device presence and mode tracking
pub mod device;
/// Library error types
pub mod error;
/// IMG3 tagged-container codec
pub mod img3;
/// Logging convenience helpers
pub mod logging;
mod macros;
/// The restore pipeline
pub mod pipeline;
/// Typed property-list access
pub mod props;
/// Recovery-mode bootchain upload
pub mod recovery;
/// Restore-mode message loop
pub mod restore;
/// Session state shared with the hotplug observer
pub mod session;
/// Signing-ticket store
pub mod ticket;
/// Trait seams for the device transports
pub mod transport;
/// Signing authority (TSS) client
pub mod tss;
/// Raw-USB recovery transport and bus presence watching
pub mod usb;
/// usbmux-based transports: normal mode, restore mode, ASR
pub mod usbmux;

#[cfg(test)]
pub(crate) mod testutil;

pub use bundle::*;
pub use component::*;
pub use device::*;
pub use error::*;
pub use img3::Img3;
pub use logging::*;
pub use pipeline::*;
pub use props::Manifest;
pub use recovery::*;
pub use restore::*;
pub use session::*;
pub use ticket::*;
pub use transport::*;
pub use tss::*;
