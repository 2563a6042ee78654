//! The restore pipeline.
//!
//! A linear sequence with one allowed skip (a device discovered already
//! in recovery does not take the normal -> recovery transition):
//! detect, read ECID, obtain the signing ticket, extract the filesystem
//! image, enter recovery, upload the bootchain, wait for restore mode,
//! then serve the restore agent until it finishes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use crate::device::Tracker;
use crate::recovery::{BootchainUploader, CheckpointHook};
use crate::restore::Dispatcher;
use crate::session::{Mode, Session, Shared};
use crate::transport::Backend;
use crate::tss::{self, SigningAuthority};
use crate::{Bundle, Error, Result};

/// Latches quit when dropped, so the presence watcher winds down on
/// every exit path.
struct LatchOnDrop(Arc<Shared>);

impl Drop for LatchOnDrop {
    fn drop(&mut self) {
        self.0.latch_quit();
    }
}

/// The extracted filesystem image on disk.
///
/// Deleted on drop unless the restore has begun; once it has, a failed
/// run leaves the image behind for the operator's retry, and only a
/// clean completion unlinks it.
struct ImageFile {
    path: PathBuf,
    keep: bool,
}

impl ImageFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(&mut self) {
        self.keep = true;
    }

    fn unlink(&mut self) -> Result<()> {
        fs::remove_file(&self.path)
            .map_err(|err| Error::Io(format!("{}: {err}", self.path.display())))?;
        self.keep = true;

        Ok(())
    }
}

impl Drop for ImageFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Run a full restore of the bundle at `bundle_path`.
///
/// `workdir` is where the filesystem image is staged (the CLI passes the
/// working directory). Returns only after the device finished, the
/// channel closed, or a fatal error.
pub fn run(
    bundle_path: &Path,
    workdir: &Path,
    session: &Session,
    backend: &dyn Backend,
    authority: &dyn SigningAuthority,
    checkpoint: &mut dyn CheckpointHook,
) -> Result<()> {
    let _latch = LatchOnDrop(session.shared.clone());

    let mut bundle = Bundle::open(bundle_path)?;
    let manifest = bundle.manifest()?;
    debug!("opened bundle {}", bundle_path.display());

    let mut tracker = Tracker::new(backend, session.shared.clone(), session.uuid.clone());
    let mode = tracker.detect()?;
    let ecid = tracker.read_ecid()?;

    let request = tss::build_request(&manifest, ecid)?;
    let ticket = authority.exchange(&request)?;

    let os_path = ticket.os_image_path()?;
    let basename = Path::new(&os_path)
        .file_name()
        .ok_or_else(|| Error::schema("ticket OS.Info.Path has no file name"))?;
    let mut image = ImageFile::new(workdir.join(basename));

    info!("extracting filesystem image {os_path}");
    bundle.extract_to(&os_path, image.path())?;

    if mode == Mode::Normal {
        tracker.enter_recovery()?;
    }
    tracker.disconnect();

    BootchainUploader::new(backend, &mut bundle, &ticket, session).run(checkpoint)?;

    tracker.subscribe()?;
    if !tracker.wait_for_restore() {
        // the device went away before the restore began; nothing on it
        // needs the staged image, so a clean teardown is all that's left
        return Ok(());
    }

    image.keep();

    let link = backend.open_restore()?;
    let streamer = backend.open_streamer()?;
    Dispatcher::new(
        link,
        streamer,
        &mut bundle,
        &ticket,
        session,
        image.path().to_path_buf(),
    )
    .run()?;

    image.unlink()?;
    info!("restore complete");

    Ok(())
}
