// src/transaction/swap.rs

//! Namespace swaps: backup, symlink, rollback
//!
//! A namespace entry is a directory, a CEFS symlink, or missing. Changing it
//! always parks the previous state at `<path>.bak` first and creates the new
//! symlink last, so a crash at any point leaves either the old state in place
//! or the old state safely at `.bak`.

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::paths::{backup_path, delete_marker_path, StoreLayout};
use chrono::Local;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Current state of a namespace path, probed without following symlinks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathState {
    Directory,
    Symlink(PathBuf),
    /// Regular file or anything else that is neither a directory nor a link
    File,
    Missing,
}

impl PathState {
    pub fn exists(&self) -> bool {
        !matches!(self, Self::Missing)
    }
}

/// How a displaced `.bak` (or the entry replaced by a rollback) is removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupCleanup {
    /// Delete right away
    Immediate,
    /// Rename to `<path>.DELETE_ME_<YYYYMMDD_HHMMSS>` for a later sweep
    Deferred,
}

/// How a namespace entry relates to a given image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// The entry (or its `.bak`) resolves by hash to the image
    Correct,
    /// A symlink exists but points somewhere else
    Other(PathBuf),
    /// No symlink at the entry or its `.bak`
    Missing,
}

pub fn path_state(path: &Path) -> Result<PathState> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            let file_type = meta.file_type();
            if file_type.is_symlink() {
                Ok(PathState::Symlink(fs::read_link(path)?))
            } else if file_type.is_dir() {
                Ok(PathState::Directory)
            } else {
                Ok(PathState::File)
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PathState::Missing),
        Err(e) => Err(e.into()),
    }
}

/// Whether `path` or `path.bak` is a symlink resolving, by hash, to `hash`
///
/// Plain directories count as [`Reference::Missing`]: nothing CEFS-backed can
/// be resolved through them.
pub fn reference_state(layout: &StoreLayout, path: &Path, hash: &ContentHash) -> Result<Reference> {
    let mut other = None;
    for candidate in [path.to_path_buf(), backup_path(path)] {
        if let PathState::Symlink(target) = path_state(&candidate)? {
            if layout.hash_from_mount_path(&target).as_ref() == Some(hash) {
                return Ok(Reference::Correct);
            }
            other.get_or_insert(target);
        }
    }
    Ok(other.map_or(Reference::Missing, Reference::Other))
}

/// Point `path` at `target`, parking whatever was there at `.bak`
pub fn backup_and_symlink(path: &Path, target: &Path, cleanup: BackupCleanup) -> Result<()> {
    backup_and_symlink_with(path, target, cleanup, |target, link| {
        std::os::unix::fs::symlink(target, link)
    })
}

/// [`backup_and_symlink`] with the link creation step supplied by the caller
///
/// `create_link(target, link)` runs last. If it fails, `.bak` is moved back
/// so the namespace path is exactly as before, and `SymlinkFailure` is
/// returned.
pub fn backup_and_symlink_with<F>(
    path: &Path,
    target: &Path,
    cleanup: BackupCleanup,
    create_link: F,
) -> Result<()>
where
    F: FnOnce(&Path, &Path) -> io::Result<()>,
{
    let backup = backup_path(path);

    if path_state(&backup)?.exists() {
        let retired = retire(&backup, cleanup)?;
        debug!("Cleared stale backup {} ({:?})", backup.display(), retired);
    }

    let had_previous = path_state(path)?.exists();
    if had_previous {
        fs::rename(path, &backup)?;
        debug!("Backed up {} to {}", path.display(), backup.display());
    }

    if let Err(source) = create_link(target, path) {
        if had_previous {
            restore_backup(path, &backup);
        }
        return Err(Error::SymlinkFailure {
            path: path.to_path_buf(),
            source,
        });
    }

    info!("{} -> {}", path.display(), target.display());
    Ok(())
}

/// Replace `path` with an already prepared directory, parking the old entry
///
/// `replacement` is renamed into place, so it must be on the same filesystem.
pub fn backup_and_replace(path: &Path, replacement: &Path, cleanup: BackupCleanup) -> Result<()> {
    backup_and_symlink_with(path, replacement, cleanup, |replacement, path| {
        fs::rename(replacement, path)
    })
}

fn restore_backup(path: &Path, backup: &Path) {
    // A half-created link would block the rename back
    if let Ok(PathState::Symlink(_)) = path_state(path) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to remove half-created {}: {}", path.display(), e);
        }
    }
    match fs::rename(backup, path) {
        Ok(()) => warn!("Restored {} from {}", path.display(), backup.display()),
        Err(e) => error!(
            "Failed to restore {} from {}: {}; previous state remains at the backup",
            path.display(),
            backup.display(),
            e
        ),
    }
}

/// Put `<path>.bak` back in place
///
/// The current entry, if any, is removed or parked as a deferred-delete
/// marker depending on `cleanup`. Fails with `NothingToRollback` when there
/// is no backup.
pub fn rollback_from_backup(path: &Path, cleanup: BackupCleanup) -> Result<()> {
    let backup = backup_path(path);
    if !path_state(&backup)?.exists() {
        return Err(Error::NothingToRollback(path.to_path_buf()));
    }

    if path_state(path)?.exists() {
        retire(path, cleanup)?;
    }
    fs::rename(&backup, path)?;

    info!("Rolled back {} from {}", path.display(), backup.display());
    Ok(())
}

/// Remove an entry now, or rename it to a deferred-delete marker
///
/// Returns the marker path for deferred cleanup.
pub fn retire(path: &Path, cleanup: BackupCleanup) -> Result<Option<PathBuf>> {
    match cleanup {
        BackupCleanup::Immediate => {
            remove_entry(path)?;
            Ok(None)
        }
        BackupCleanup::Deferred => {
            let marker = delete_marker_path(path, Local::now());
            fs::rename(path, &marker)?;
            Ok(Some(marker))
        }
    }
}

/// Delete a file, symlink or whole directory tree without following links
pub fn remove_entry(path: &Path) -> Result<()> {
    match path_state(path)? {
        PathState::Directory => fs::remove_dir_all(path)?,
        PathState::Symlink(_) | PathState::File => fs::remove_file(path)?,
        PathState::Missing => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    const HASH: &str = "abcdef0123456789abcdef01";

    #[test]
    fn test_path_state() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir(root.join("dir")).unwrap();
        fs::write(root.join("file"), b"x").unwrap();
        symlink("/cefs/ab/x", root.join("link")).unwrap();

        assert_eq!(path_state(&root.join("dir")).unwrap(), PathState::Directory);
        assert_eq!(path_state(&root.join("file")).unwrap(), PathState::File);
        assert_eq!(
            path_state(&root.join("link")).unwrap(),
            PathState::Symlink(PathBuf::from("/cefs/ab/x"))
        );
        assert_eq!(path_state(&root.join("nope")).unwrap(), PathState::Missing);
    }

    #[test]
    fn test_new_path_gets_no_backup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gcc");

        backup_and_symlink(&path, Path::new("/cefs/ab/new"), BackupCleanup::Immediate).unwrap();

        assert_eq!(fs::read_link(&path).unwrap(), PathBuf::from("/cefs/ab/new"));
        assert!(!backup_path(&path).exists());
    }

    #[test]
    fn test_directory_is_parked_at_bak() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gcc");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("bin"), b"x").unwrap();

        backup_and_symlink(&path, Path::new("/cefs/ab/new"), BackupCleanup::Immediate).unwrap();

        assert!(fs::symlink_metadata(&path).unwrap().file_type().is_symlink());
        assert!(backup_path(&path).join("bin").is_file());
    }

    #[test]
    fn test_failed_link_restores_directory() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gcc");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("marker"), b"original").unwrap();

        let err = backup_and_symlink_with(
            &path,
            Path::new("/cefs/ab/new"),
            BackupCleanup::Immediate,
            |_, _| Err(io::Error::from(io::ErrorKind::PermissionDenied)),
        )
        .unwrap_err();

        assert!(matches!(err, Error::SymlinkFailure { .. }));
        assert_eq!(path_state(&path).unwrap(), PathState::Directory);
        assert_eq!(fs::read(path.join("marker")).unwrap(), b"original");
        assert!(!backup_path(&path).exists());
    }

    #[test]
    fn test_half_created_link_is_cleared_before_restore() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gcc");
        symlink("/cefs/ab/old", &path).unwrap();

        // The link lands but the step still reports failure
        let err = backup_and_symlink_with(
            &path,
            Path::new("/cefs/ab/new"),
            BackupCleanup::Immediate,
            |target, link| {
                symlink(target, link)?;
                Err(io::Error::other("fsync failed"))
            },
        )
        .unwrap_err();

        assert!(matches!(err, Error::SymlinkFailure { .. }));
        assert_eq!(fs::read_link(&path).unwrap(), PathBuf::from("/cefs/ab/old"));
        assert!(!backup_path(&path).exists());
    }

    #[test]
    fn test_stale_backup_handling() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gcc");
        symlink("/cefs/ab/old", &path).unwrap();
        fs::create_dir(backup_path(&path)).unwrap();

        backup_and_symlink(&path, Path::new("/cefs/ab/new"), BackupCleanup::Deferred).unwrap();

        // Old symlink is now the backup, older backup became a marker
        assert_eq!(
            fs::read_link(backup_path(&path)).unwrap(),
            PathBuf::from("/cefs/ab/old")
        );
        let markers: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("gcc.DELETE_ME_"))
            .collect();
        assert_eq!(markers.len(), 1);
    }

    #[test]
    fn test_replace_symlink_with_directory() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gcc");
        symlink("/cefs/ab/old", &path).unwrap();
        let staged = temp_dir.path().join(".staged");
        fs::create_dir(&staged).unwrap();
        fs::write(staged.join("bin"), b"x").unwrap();

        backup_and_replace(&path, &staged, BackupCleanup::Immediate).unwrap();

        assert_eq!(path_state(&path).unwrap(), PathState::Directory);
        assert!(path.join("bin").is_file());
        assert!(!staged.exists());
        assert_eq!(
            path_state(&backup_path(&path)).unwrap(),
            PathState::Symlink(PathBuf::from("/cefs/ab/old"))
        );
    }

    #[test]
    fn test_rollback_from_backup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gcc");
        symlink("/cefs/ab/new", &path).unwrap();
        symlink("/cefs/ab/old", backup_path(&path)).unwrap();

        rollback_from_backup(&path, BackupCleanup::Immediate).unwrap();
        assert_eq!(fs::read_link(&path).unwrap(), PathBuf::from("/cefs/ab/old"));
        assert!(!backup_path(&path).exists());

        let err = rollback_from_backup(&path, BackupCleanup::Immediate).unwrap_err();
        assert!(matches!(err, Error::NothingToRollback(_)));
    }

    #[test]
    fn test_reference_state() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StoreLayout::new("/efs", "/cefs", temp_dir.path());
        let hash = ContentHash::new(HASH).unwrap();
        let ours = layout.mount_path(&hash, Some(Path::new("gcc")));
        let theirs = PathBuf::from("/cefs/12/1234567890abcdef12345678");

        let a = temp_dir.path().join("a");
        symlink(&ours, &a).unwrap();
        assert_eq!(reference_state(&layout, &a, &hash).unwrap(), Reference::Correct);

        // Only the backup still points at us
        let b = temp_dir.path().join("b");
        symlink(&theirs, &b).unwrap();
        symlink(&ours, backup_path(&b)).unwrap();
        assert_eq!(reference_state(&layout, &b, &hash).unwrap(), Reference::Correct);

        let c = temp_dir.path().join("c");
        symlink(&theirs, &c).unwrap();
        assert_eq!(
            reference_state(&layout, &c, &hash).unwrap(),
            Reference::Other(theirs.clone())
        );

        let d = temp_dir.path().join("d");
        fs::create_dir(&d).unwrap();
        assert_eq!(reference_state(&layout, &d, &hash).unwrap(), Reference::Missing);
    }
}
