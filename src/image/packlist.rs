// src/image/packlist.rs

//! Pack lists: explicit image contents without a materialized tree
//!
//! A pack list records, for every path inside the image to be built, its
//! type, mode, ownership and where its bytes come from. Consolidation builds
//! one pack list over many mounted images and hands it to the image tool,
//! which reads each file straight from its current location.
//!
//! Enumeration here only reads the filesystem; nothing invokes the tool.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Mode used for parent directories the list has to invent
const IMPLIED_DIR_MODE: u32 = 0o755;

/// Kind of a pack list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackEntryKind {
    Directory,
    /// Regular file whose bytes are read from `source`
    File { source: PathBuf },
    Symlink { target: PathBuf },
}

/// One path inside the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackEntry {
    /// Path inside the image, relative, no leading `/`
    pub path: PathBuf,
    pub kind: PackEntryKind,
    /// Permission bits (`& 0o7777`)
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl PackEntry {
    pub fn directory(path: impl Into<PathBuf>, mode: u32) -> Self {
        Self {
            path: path.into(),
            kind: PackEntryKind::Directory,
            mode,
            uid: 0,
            gid: 0,
        }
    }

    /// Render as one mksquashfs pseudo-file definition
    ///
    /// ```text
    /// "path" d 755 0 0
    /// "path" f 644 0 0 cat 'source'
    /// "path" s 777 0 0 target
    /// ```
    pub fn to_pseudo_line(&self) -> Result<String> {
        let name = quote_pseudo_name(&self.path)?;
        let attrs = format!("{:o} {} {}", self.mode & 0o7777, self.uid, self.gid);
        Ok(match &self.kind {
            PackEntryKind::Directory => format!("{} d {}", name, attrs),
            PackEntryKind::File { source } => {
                format!("{} f {} cat {}", name, attrs, shell_quote(&single_line(source)?))
            }
            PackEntryKind::Symlink { target } => {
                format!("{} s {} {}", name, attrs, single_line(target)?)
            }
        })
    }
}

/// Ordered set of pack entries keyed by image path
#[derive(Debug, Clone, Default)]
pub struct PackList {
    entries: BTreeMap<PathBuf, PackEntry>,
}

impl PackList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in path order (parents before children)
    pub fn entries(&self) -> impl Iterator<Item = &PackEntry> {
        self.entries.values()
    }

    pub fn get(&self, path: &Path) -> Option<&PackEntry> {
        self.entries.get(path)
    }

    /// Insert one entry, inventing any missing parent directories
    pub fn push(&mut self, entry: PackEntry) -> Result<()> {
        let path = normalize_relative(&entry.path)?;
        for parent in path.ancestors().skip(1) {
            if parent.as_os_str().is_empty() {
                break;
            }
            self.entries
                .entry(parent.to_path_buf())
                .or_insert_with(|| PackEntry::directory(parent, IMPLIED_DIR_MODE));
        }
        self.entries.insert(path.clone(), PackEntry { path, ..entry });
        Ok(())
    }

    /// Enumerate a real directory tree into the list under `prefix`
    ///
    /// Symlinks are recorded, never followed. Mode and ownership come from the
    /// source. Returns the number of bytes of regular file content added.
    pub fn add_tree(&mut self, source_root: &Path, prefix: &Path) -> Result<u64> {
        let prefix = normalize_relative(prefix)?;
        let mut bytes = 0u64;

        for entry in WalkDir::new(source_root)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                Error::Io(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::other(format!("walk failed under {}", source_root.display()))
                }))
            })?;

            let relative = entry
                .path()
                .strip_prefix(source_root)
                .map_err(|_| Error::FormatError(format!("{} escaped walk root", entry.path().display())))?;
            let image_path = prefix.join(relative);
            if image_path.as_os_str().is_empty() {
                // Image root itself; nothing to declare
                continue;
            }

            let meta = fs::symlink_metadata(entry.path())?;
            let file_type = meta.file_type();
            let kind = if file_type.is_dir() {
                PackEntryKind::Directory
            } else if file_type.is_symlink() {
                PackEntryKind::Symlink {
                    target: fs::read_link(entry.path())?,
                }
            } else if file_type.is_file() {
                bytes += meta.len();
                PackEntryKind::File {
                    source: entry.path().to_path_buf(),
                }
            } else {
                warn!("Skipping special file {}", entry.path().display());
                continue;
            };

            self.push(PackEntry {
                path: image_path,
                kind,
                mode: meta.mode() & 0o7777,
                uid: meta.uid(),
                gid: meta.gid(),
            })?;
        }

        debug!(
            "Pack list: {} under {} ({} entries total, {} bytes)",
            source_root.display(),
            prefix.display(),
            self.entries.len(),
            bytes
        );
        Ok(bytes)
    }

    /// Render the complete pseudo file for mksquashfs `-pf`
    pub fn to_pseudo_file(&self) -> Result<String> {
        let mut out = String::new();
        for entry in self.entries.values() {
            out.push_str(&entry.to_pseudo_line()?);
            out.push('\n');
        }
        Ok(out)
    }
}

/// Reject absolute or escaping paths and strip `.` components
fn normalize_relative(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(Error::FormatError(format!(
                    "pack path escapes image root: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(out)
}

fn single_line(path: &Path) -> Result<String> {
    let s = path.to_string_lossy();
    if s.contains('\n') {
        return Err(Error::BadImage(format!("newline in path {:?}", s)));
    }
    Ok(s.into_owned())
}

/// Double-quote a pseudo-file name, escaping `"` and `\`
fn quote_pseudo_name(path: &Path) -> Result<String> {
    let s = single_line(path)?;
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    Ok(format!("\"{}\"", escaped))
}

/// Single-quote for /bin/sh
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
