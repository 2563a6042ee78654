//! Firmware bundle (IPSW) access.
//!
//! The bundle is a ZIP archive; members are resolved through the central
//! directory, so stored order never matters. Small members (manifest,
//! bootchain images) are read into memory; the multi-gigabyte filesystem
//! image is only ever streamed to disk.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use log::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::{Error, Manifest, Result};

/// Archive member holding the build manifest.
pub const MANIFEST_MEMBER: &str = "BuildManifest.plist";

/// An opened firmware bundle.
pub struct Bundle {
    archive: ZipArchive<File>,
}

impl Bundle {
    /// Open a firmware bundle from disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|err| Error::Io(format!("{}: {err}", path.display())))?;
        let archive = ZipArchive::new(file)
            .map_err(|err| Error::Io(format!("{}: not a firmware bundle: {err}", path.display())))?;

        Ok(Self { archive })
    }

    /// Read a member fully into memory.
    pub fn read(&mut self, member: &str) -> Result<Vec<u8>> {
        let mut entry = match self.archive.by_name(member) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Err(Error::ArchiveMember(member.into())),
            Err(err) => return Err(Error::Io(format!("{member}: {err}"))),
        };

        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut buf)
            .map_err(|err| Error::Io(format!("{member}: {err}")))?;

        debug!("read {member} ({} bytes)", buf.len());

        Ok(buf)
    }

    /// Stream a member to a file on disk, returning the byte count.
    pub fn extract_to(&mut self, member: &str, dst: &Path) -> Result<u64> {
        let mut entry = match self.archive.by_name(member) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Err(Error::ArchiveMember(member.into())),
            Err(err) => return Err(Error::Io(format!("{member}: {err}"))),
        };

        let mut out = File::create(dst)
            .map_err(|err| Error::Io(format!("{}: {err}", dst.display())))?;
        let written = io::copy(&mut entry, &mut out)
            .map_err(|err| Error::Io(format!("{member}: {err}")))?;

        debug!("extracted {member} to {} ({written} bytes)", dst.display());

        Ok(written)
    }

    /// Read and decode `BuildManifest.plist`.
    pub fn manifest(&mut self) -> Result<Manifest> {
        let bytes = self.read(MANIFEST_MEMBER)?;
        Manifest::from_xml(&bytes)
    }
}
