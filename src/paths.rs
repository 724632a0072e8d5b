// src/paths.rs

//! Image and mount path naming
//!
//! ```text
//! <image_root>/<hash[0:2]>/<hash>_<suffix>.sqfs      stored image
//! <image_root>/<hash[0:2]>/<hash>_<suffix>.yaml      its manifest
//! <mount_point>/<hash[0:2]>/<hash>[/<subpath>]      on-access mounted view
//! ```
//!
//! The suffix is cosmetic. Identity is the hash plus its shard directory, so
//! lookups from a mount path back to an image glob on `<hash>*`.

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use std::path::{Component, Path, PathBuf};

/// Extension of stored image files
pub const IMAGE_EXTENSION: &str = "sqfs";

/// Longest descriptive suffix kept in a file name
const MAX_SUFFIX_LEN: usize = 100;

/// Suffix used for images holding many installables
pub const CONSOLIDATED_SUFFIX: &str = "consolidated";

/// The three roots every path is derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    pub image_root: PathBuf,
    pub mount_point: PathBuf,
    pub namespace_root: PathBuf,
}

/// Result of resolving a mount path back to its image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTarget {
    pub image_path: PathBuf,
    pub hash: ContentHash,
    /// True when the mount path addresses a subtree of a consolidated image
    pub is_consolidated: bool,
}

impl StoreLayout {
    pub fn new(
        image_root: impl Into<PathBuf>,
        mount_point: impl Into<PathBuf>,
        namespace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            image_root: image_root.into(),
            mount_point: mount_point.into(),
            namespace_root: namespace_root.into(),
        }
    }

    pub fn from_config(config: &crate::config::CefsConfig) -> Self {
        Self::new(
            config.image_root.clone(),
            config.mount_point.clone(),
            config.namespace_root.clone(),
        )
    }

    /// Shard directory holding an image
    pub fn image_dir(&self, hash: &ContentHash) -> PathBuf {
        self.image_root.join(hash.shard())
    }

    /// Full image path for a hash and descriptive suffix
    pub fn image_path(&self, hash: &ContentHash, suffix: &str) -> PathBuf {
        let file_name = if suffix.is_empty() {
            format!("{}.{}", hash, IMAGE_EXTENSION)
        } else {
            format!("{}_{}.{}", hash, suffix, IMAGE_EXTENSION)
        };
        self.image_dir(hash).join(file_name)
    }

    /// Mount path for a hash, optionally addressing a subtree
    pub fn mount_path(&self, hash: &ContentHash, subpath: Option<&Path>) -> PathBuf {
        let base = self.mount_point.join(hash.shard()).join(hash.as_str());
        match subpath {
            Some(sub) => base.join(strip_root(sub)),
            None => base,
        }
    }

    /// Hash addressed by a mount path, without touching the filesystem
    ///
    /// Returns `None` for paths outside the mount point or with a malformed
    /// shard/hash pair. Used to decide whether a symlink "resolves, by hash"
    /// to a given image.
    pub fn hash_from_mount_path(&self, path: &Path) -> Option<ContentHash> {
        let (hash, _) = self.split_mount_path(path).ok()?;
        Some(hash)
    }

    /// Locate the image file behind a mount path
    ///
    /// Fails with `FormatError` when the path is shorter than
    /// `mount_point/shard/hash` (or has a malformed hash), and with `NotFound`
    /// when no image file for the hash exists in its shard directory.
    pub fn parse_target(&self, mount_path: &Path) -> Result<ParsedTarget> {
        let (hash, extra) = self.split_mount_path(mount_path)?;
        let image_path = self.find_image(&hash)?.ok_or_else(|| {
            Error::NotFound(format!(
                "no image for {} in {}",
                hash,
                self.image_dir(&hash).display()
            ))
        })?;

        Ok(ParsedTarget {
            image_path,
            hash,
            is_consolidated: extra > 0,
        })
    }

    /// Find the stored image for a hash by globbing its shard directory
    ///
    /// Several files may carry the same hash when identical bytes were
    /// deployed for different destinations; the first by name is returned.
    pub fn find_image(&self, hash: &ContentHash) -> Result<Option<PathBuf>> {
        Ok(self.find_images(hash)?.into_iter().next())
    }

    /// Every stored image file carrying `hash`, sorted
    pub fn find_images(&self, hash: &ContentHash) -> Result<Vec<PathBuf>> {
        self.shard_files(hash, &format!("*.{}", IMAGE_EXTENSION))
    }

    /// Files in the hash's shard directory named `<hash><tail>`
    pub fn shard_files(&self, hash: &ContentHash, tail: &str) -> Result<Vec<PathBuf>> {
        let dir = self.image_dir(hash);
        let pattern = format!(
            "{}/{}{}",
            glob::Pattern::escape(&dir.to_string_lossy()),
            hash,
            tail
        );
        let paths = glob::glob(&pattern)
            .map_err(|e| Error::FormatError(format!("bad glob {}: {}", pattern, e)))?;

        let mut found: Vec<PathBuf> = paths
            .filter_map(|p| p.ok())
            .filter(|p| p.is_file())
            .collect();
        found.sort();
        Ok(found)
    }

    /// Split into (hash, number of path components after the hash)
    fn split_mount_path(&self, path: &Path) -> Result<(ContentHash, usize)> {
        let relative = path.strip_prefix(&self.mount_point).map_err(|_| {
            Error::FormatError(format!(
                "{} is not under {}",
                path.display(),
                self.mount_point.display()
            ))
        })?;

        let parts: Vec<&str> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();

        if parts.len() < 2 {
            return Err(Error::FormatError(format!(
                "{} is shorter than <mount>/<shard>/<hash>",
                path.display()
            )));
        }

        let hash = ContentHash::new(parts[1])
            .map_err(|e| Error::FormatError(format!("{}: {}", path.display(), e)))?;
        if hash.shard() != parts[0] {
            return Err(Error::FormatError(format!(
                "{}: shard {} does not match hash {}",
                path.display(),
                parts[0],
                hash
            )));
        }

        Ok((hash, parts.len() - 2))
    }

    /// Every stored image file, sorted
    ///
    /// Only `<image_root>/<shard>/*.sqfs` is considered. A missing image root
    /// is an empty store.
    pub fn list_images(&self) -> Result<Vec<PathBuf>> {
        self.list_store_files(|name| name.ends_with(&format!(".{}", IMAGE_EXTENSION)))
    }

    /// Files two levels below the image root whose names satisfy `keep`
    pub fn list_store_files<F>(&self, keep: F) -> Result<Vec<PathBuf>>
    where
        F: Fn(&str) -> bool,
    {
        if !self.image_root.is_dir() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for entry in walkdir::WalkDir::new(&self.image_root)
            .min_depth(2)
            .max_depth(2)
            .follow_links(false)
        {
            let entry = entry.map_err(|e| {
                Error::Io(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::other(format!("walk failed under {}", self.image_root.display()))
                }))
            })?;
            if entry.file_type().is_file() && entry.file_name().to_str().is_some_and(&keep) {
                found.push(entry.into_path());
            }
        }
        found.sort();
        Ok(found)
    }

    /// Whether a path lies inside the mount root
    pub fn is_under_mount(&self, path: &Path) -> bool {
        path.starts_with(&self.mount_point)
    }

    /// Descriptive suffix for an image file name
    ///
    /// Single-content images get `<label>_<sanitized destination>`, where the
    /// destination is made relative to the namespace root first.
    pub fn describe_suffix(&self, label: &str, destination: Option<&Path>) -> String {
        let Some(destination) = destination else {
            return label.to_string();
        };

        let relative = destination
            .strip_prefix(&self.namespace_root)
            .unwrap_or(destination);
        let sanitized = sanitize_for_filename(&relative.to_string_lossy());

        let mut suffix = if sanitized.is_empty() {
            label.to_string()
        } else {
            format!("{}_{}", label, sanitized)
        };
        suffix.truncate(MAX_SUFFIX_LEN);
        suffix
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`, trimming separators
pub fn sanitize_for_filename(input: &str) -> String {
    let mapped: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    mapped.trim_matches('_').to_string()
}

/// Drop a leading `/` so a subpath can be joined under another root
pub fn strip_root(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}

/// `<path>.bak`
pub fn backup_path(path: &Path) -> PathBuf {
    append_to_file_name(path, ".bak")
}

/// `<path>.DELETE_ME_<YYYYMMDD_HHMMSS>`
pub fn delete_marker_path(path: &Path, now: chrono::DateTime<chrono::Local>) -> PathBuf {
    append_to_file_name(path, &format!(".DELETE_ME_{}", now.format("%Y%m%d_%H%M%S")))
}

/// Append a literal suffix to the last path component
pub fn append_to_file_name(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
