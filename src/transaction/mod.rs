// src/transaction/mod.rs

//! Transactional image deployment
//!
//! Placing a new image in the store and pointing the namespace at it is a
//! small state machine. Every step can fail and leave an inspectable state:
//!
//! ```text
//! START -> COPY_IMAGE -> WRITE_MANIFEST_INPROGRESS -> [caller swaps symlinks] -> FINALIZE_MANIFEST
//!             |                    |                              |
//!        nothing visible   orphan .inprogress             .inprogress left for repair
//! ```
//!
//! - The image appears at its final name only through an atomic rename.
//! - The manifest is finalized only after the caller's body succeeded.
//! - A body that fails (or panics) leaves the in-progress manifest in place
//!   for [`recovery`] to classify later.
//! - A finalize failure after a successful body is logged, not returned: the
//!   content change already happened and repair reconciles the bookkeeping.

pub mod recovery;
mod snapshot;
mod space;
pub mod swap;

pub use recovery::{
    find_inprogress_manifests, Repairer, RepairAction, RepairOutcome, TransactionReport,
    TransactionStatus,
};
pub use snapshot::{SnapshotChange, SnapshotVerification, SymlinkSnapshot};
pub use space::{check_space, ensure_space, required_space, SpaceCheck};
pub use swap::{
    backup_and_replace, backup_and_symlink, backup_and_symlink_with, path_state, reference_state,
    rollback_from_backup, BackupCleanup, PathState, Reference,
};

use crate::error::{Error, Result};
use crate::manifest::{self, Manifest};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Deployment phases, used for logging and for reporting where a failure hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployState {
    /// Nothing written yet
    Start,
    /// Image bytes are at their final name
    ImagePlaced,
    /// `.yaml.inprogress` is on disk; the namespace may now change
    ManifestInProgress,
    /// `.yaml` is on disk
    Finalized,
}

/// What [`copy_image_atomically`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// Bytes copied into place
    Copied(u64),
    /// An image with this name already exists; identical by construction
    AlreadyPresent,
}

/// Copy an image into the store without ever exposing a partial file
///
/// The copy goes to a uniquely named temporary file in the destination
/// directory and is renamed into place. An existing destination is left alone:
/// the name embeds the content hash, so it holds the same bytes.
pub fn copy_image_atomically(source: &Path, dest: &Path) -> Result<CopyOutcome> {
    if dest.exists() {
        debug!("{} already present, skipping copy", dest.display());
        return Ok(CopyOutcome::AlreadyPresent);
    }

    let dir = dest
        .parent()
        .ok_or_else(|| Error::FormatError(format!("{} has no parent", dest.display())))?;
    fs::create_dir_all(dir)?;

    // Dropped (and deleted) on any early return
    let mut temp = tempfile::Builder::new()
        .prefix(".cefs-copy-")
        .suffix(".tmp")
        .tempfile_in(dir)?;

    let mut reader = File::open(source)?;
    let bytes = io::copy(&mut reader, temp.as_file_mut())?;
    temp.as_file().sync_all()?;
    temp.persist(dest).map_err(|e| Error::Io(e.error))?;

    if let Err(e) = File::open(dir).and_then(|handle| handle.sync_all()) {
        warn!("Failed to sync directory {}: {}", dir.display(), e);
    }

    info!("Placed image {} ({} bytes)", dest.display(), bytes);
    Ok(CopyOutcome::Copied(bytes))
}

/// An open deployment: image placed, manifest in progress
///
/// Dropping without [`commit`](Self::commit) leaves the in-progress manifest
/// on disk. That is the crash-equivalent state repair knows how to handle.
#[derive(Debug)]
pub struct DeployTransaction {
    image_path: PathBuf,
    inprogress_path: PathBuf,
    copy_outcome: CopyOutcome,
    state: DeployState,
}

impl DeployTransaction {
    /// Copy the image into place and write the in-progress manifest
    pub fn begin(source: &Path, image_path: &Path, manifest: &Manifest) -> Result<Self> {
        let copy_outcome = copy_image_atomically(source, image_path)?;
        let inprogress_path = manifest.write_in_progress(image_path)?;

        debug!(
            "Transaction open for {} ({} contents)",
            image_path.display(),
            manifest.contents.len()
        );
        Ok(Self {
            image_path: image_path.to_path_buf(),
            inprogress_path,
            copy_outcome,
            state: DeployState::ManifestInProgress,
        })
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn inprogress_path(&self) -> &Path {
        &self.inprogress_path
    }

    pub fn copy_outcome(&self) -> CopyOutcome {
        self.copy_outcome
    }

    pub fn state(&self) -> DeployState {
        self.state
    }

    /// Finalize the manifest
    ///
    /// Returns the finalized path, or `None` when finalize failed. A failure
    /// is logged; the deployment itself stands.
    pub fn commit(mut self) -> Option<PathBuf> {
        match manifest::finalize(&self.image_path) {
            Ok(path) => {
                self.state = DeployState::Finalized;
                Some(path)
            }
            Err(e) => {
                // Mark handled so Drop does not log twice
                self.state = DeployState::Finalized;
                warn!(
                    "Deployment of {} succeeded but manifest finalize failed: {}; run repair",
                    self.image_path.display(),
                    e
                );
                None
            }
        }
    }
}

impl Drop for DeployTransaction {
    fn drop(&mut self) {
        if self.state != DeployState::Finalized {
            warn!(
                "Transaction for {} not committed; leaving {} for repair",
                self.image_path.display(),
                self.inprogress_path.display()
            );
        }
    }
}

/// Run `body` inside a deployment transaction
///
/// The body typically swaps namespace symlinks to the new image. Its error is
/// returned unchanged and the manifest stays in progress.
pub fn deploy_transactional<T, E, F>(
    source: &Path,
    image_path: &Path,
    manifest: &Manifest,
    body: F,
) -> std::result::Result<T, E>
where
    F: FnOnce(&DeployTransaction) -> std::result::Result<T, E>,
    E: From<Error>,
{
    let txn = DeployTransaction::begin(source, image_path, manifest)?;
    let value = body(&txn)?;
    txn.commit();
    Ok(value)
}
