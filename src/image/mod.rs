// src/image/mod.rs

//! Image building and extraction
//!
//! The compression tool is external. [`ImageTool`] is the seam: production
//! code uses [`SquashfsTool`], tests plug in an in-process fake.
//!
//! Builds land in a temporary file under the work directory and are hashed
//! there; only then does the deployment code decide where the image belongs.

pub mod packlist;
mod squashfs;

pub use packlist::{PackEntry, PackEntryKind, PackList};
pub use squashfs::SquashfsTool;

use crate::error::Result;
use crate::hash::{self, ContentHash};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::info;

/// Builds images from trees or pack lists, extracts them back
pub trait ImageTool {
    /// Build `dest` from a real directory, overwriting it
    fn build_from_dir(&self, source: &Path, dest: &Path) -> Result<()>;

    /// Build `dest` from an explicit pack list, overwriting it
    fn build_from_pack_list(&self, list: &PackList, dest: &Path) -> Result<()>;

    /// Extract an image (or one subtree of it) under `dest`
    ///
    /// Returns where the requested content landed: `dest` for a whole image,
    /// `dest/<subpath>` for a subtree.
    fn extract(&self, image: &Path, dest: &Path, subpath: Option<&Path>) -> Result<PathBuf>;
}

/// A freshly built image waiting to be placed in the store
///
/// The temporary file is removed when this is dropped.
#[derive(Debug)]
pub struct BuiltImage {
    path: TempPath,
    pub hash: ContentHash,
    pub size: u64,
}

impl BuiltImage {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Build from a directory and hash the result
pub fn build_from_dir(tool: &dyn ImageTool, source: &Path, work_dir: &Path) -> Result<BuiltImage> {
    let temp = scratch_file(work_dir)?;
    tool.build_from_dir(source, &temp)?;
    finish(temp)
}

/// Build from a pack list and hash the result
pub fn build_from_pack_list(
    tool: &dyn ImageTool,
    list: &PackList,
    work_dir: &Path,
) -> Result<BuiltImage> {
    let temp = scratch_file(work_dir)?;
    tool.build_from_pack_list(list, &temp)?;
    finish(temp)
}

fn scratch_file(work_dir: &Path) -> Result<TempPath> {
    fs::create_dir_all(work_dir)?;
    let file = tempfile::Builder::new()
        .prefix("cefs-build-")
        .suffix(".sqfs")
        .tempfile_in(work_dir)?;
    Ok(file.into_temp_path())
}

fn finish(path: TempPath) -> Result<BuiltImage> {
    let hash = hash::hash_file(&path)?;
    let size = fs::metadata(&path)?.len();
    info!("Built image {} ({} bytes)", hash, size);
    Ok(BuiltImage { path, hash, size })
}
