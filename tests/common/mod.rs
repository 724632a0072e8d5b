// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use cefs::image::{PackEntryKind, PackList};
use cefs::{ContentHash, ImageTool, Result, StoreLayout};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Image tool that writes a text listing of its input instead of squashfs
///
/// Identical trees produce identical bytes, so hashing behaves like the real
/// tool. `extract` reproduces files from the listing.
pub struct FakeTool;

impl ImageTool for FakeTool {
    fn build_from_dir(&self, source: &Path, dest: &Path) -> Result<()> {
        let mut list = PackList::new();
        list.add_tree(source, Path::new(""))?;
        self.build_from_pack_list(&list, dest)
    }

    fn build_from_pack_list(&self, list: &PackList, dest: &Path) -> Result<()> {
        let mut out = String::new();
        for entry in list.entries() {
            if let PackEntryKind::File { source } = &entry.kind {
                let content = fs::read_to_string(source)?;
                out.push_str(&format!("{}={}\n", entry.path.display(), content.trim_end()));
            }
        }
        fs::write(dest, out)?;
        Ok(())
    }

    fn extract(&self, image: &Path, dest: &Path, subpath: Option<&Path>) -> Result<PathBuf> {
        let listing = fs::read_to_string(image)?;
        for line in listing.lines() {
            let Some((path, content)) = line.split_once('=') else {
                continue;
            };
            let path = Path::new(path);
            let relative = match subpath {
                Some(sub) => match path.strip_prefix(sub) {
                    Ok(rest) => sub.join(rest),
                    Err(_) => continue,
                },
                None => path.to_path_buf(),
            };
            let out = dest.join(relative);
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(out, content)?;
        }
        Ok(subpath.map_or(dest.to_path_buf(), |s| dest.join(s)))
    }
}

/// Image root, mount point and namespace root under one temporary directory
///
/// The mount point is a plain directory: "mounting" an image means writing
/// its tree under `<mount>/<shard>/<hash>`.
pub struct TestStore {
    pub temp: TempDir,
    pub layout: StoreLayout,
}

impl TestStore {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let layout = StoreLayout::new(
            temp.path().join("images"),
            temp.path().join("cefs"),
            temp.path().join("ns"),
        );
        fs::create_dir_all(&layout.image_root).unwrap();
        fs::create_dir_all(&layout.mount_point).unwrap();
        fs::create_dir_all(&layout.namespace_root).unwrap();
        Self { temp, layout }
    }

    pub fn work_dir(&self) -> PathBuf {
        self.temp.path().join("work")
    }

    pub fn ns(&self, rel: &str) -> PathBuf {
        self.layout.namespace_root.join(rel)
    }

    /// A staged directory with one file
    pub fn staged(&self, rel: &str, file: &str, content: &str) -> PathBuf {
        let dir = self.temp.path().join("staging").join(rel);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(file), content).unwrap();
        dir
    }

    /// Make `hash`'s image readable at its mount path, as the automounter would
    pub fn mount(&self, hash: &ContentHash) -> PathBuf {
        let image = self.layout.find_image(hash).unwrap().unwrap();
        let mount = self.layout.mount_path(hash, None);
        FakeTool.extract(&image, &mount, None).unwrap();
        mount
    }

    pub fn point(&self, rel: &str, target: &Path) {
        symlink(target, self.ns(rel)).unwrap();
    }

    /// Set a file's mtime `secs` seconds into the past
    pub fn age(&self, path: &Path, secs: u64) {
        let when = std::time::SystemTime::now() - std::time::Duration::from_secs(secs);
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(when).unwrap();
    }
}
