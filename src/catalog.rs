// src/catalog.rs

//! Catalog of logical subpaths backed by CEFS mounts
//!
//! A catalog maps a subpath (e.g. `gcc-13.1.0`) to the mount path currently
//! holding its content. It lives in memory while images are built and is
//! persisted only as a rendered directory of symlinks plus a metadata file.
//!
//! Consolidation and import share one algorithm:
//!
//! 1. walk the real directories of the participating entries into a pack list
//! 2. build one image from the pack list
//! 3. repoint each participant at `<new mount path>/<subpath>`
//!
//! Only the set of participants differs.

use crate::error::{Error, Result};
use crate::image::{self, BuiltImage, ImageTool, PackList};
use crate::paths::{strip_root, StoreLayout};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Name of the only plain file allowed in a rendered catalog
pub const METADATA_FILE: &str = "metadata.txt";

/// Participant in a pack-and-build run: (subpath, directory to read from)
pub type Participant = (PathBuf, PathBuf);

#[derive(Debug, Clone)]
pub struct Catalog {
    mount_point: PathBuf,
    entries: BTreeMap<PathBuf, PathBuf>,
    description: String,
}

/// Pack list plus the byte count it will read
#[derive(Debug)]
pub struct PackPlan {
    pub list: PackList,
    pub source_bytes: u64,
    pub subpaths: Vec<PathBuf>,
}

impl Catalog {
    /// Empty catalog for a mount root
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
            entries: BTreeMap::new(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Rebuild a catalog from a rendered directory of symlinks
    ///
    /// Every symlink must point inside the mount root and the only plain file
    /// allowed is [`METADATA_FILE`]; anything else is `BadImage`.
    pub fn load_from_directory(dir: &Path, mount_point: impl Into<PathBuf>) -> Result<Self> {
        let mut catalog = Self::new(mount_point);

        for entry in WalkDir::new(dir).follow_links(false).min_depth(1) {
            let entry = entry.map_err(|e| Error::BadImage(format!("walk {}: {}", dir.display(), e)))?;
            let relative = entry
                .path()
                .strip_prefix(dir)
                .map_err(|_| Error::BadImage(format!("{} escaped catalog", entry.path().display())))?
                .to_path_buf();
            let file_type = entry.file_type();

            if file_type.is_symlink() {
                let target = fs::read_link(entry.path())?;
                if !target.starts_with(&catalog.mount_point) {
                    return Err(Error::BadImage(format!(
                        "{} points outside {}: {}",
                        relative.display(),
                        catalog.mount_point.display(),
                        target.display()
                    )));
                }
                catalog.entries.insert(relative, target);
            } else if file_type.is_file() {
                if relative != Path::new(METADATA_FILE) {
                    return Err(Error::BadImage(format!(
                        "unexpected file {} in catalog",
                        relative.display()
                    )));
                }
                catalog.description = read_description(&fs::read_to_string(entry.path())?);
            } else if !file_type.is_dir() {
                return Err(Error::BadImage(format!(
                    "unexpected special file {} in catalog",
                    relative.display()
                )));
            }
        }

        debug!("Loaded catalog with {} entries from {}", catalog.len(), dir.display());
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, subpath: &Path) -> Option<&Path> {
        self.entries.get(strip_root(subpath)).map(PathBuf::as_path)
    }

    pub fn contains(&self, subpath: &Path) -> bool {
        self.entries.contains_key(strip_root(subpath))
    }

    /// `(subpath, target)` pairs in subpath order
    pub fn entries(&self) -> impl Iterator<Item = (&Path, &Path)> {
        self.entries.iter().map(|(k, v)| (k.as_path(), v.as_path()))
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Add or overwrite one entry; the target must be inside the mount root
    pub fn link_path(&mut self, subpath: impl AsRef<Path>, target: impl Into<PathBuf>) -> Result<()> {
        let subpath = strip_root(subpath.as_ref()).to_path_buf();
        let target = target.into();
        if !target.starts_with(&self.mount_point) {
            return Err(Error::BadLink {
                subpath,
                target,
                mount_point: self.mount_point.clone(),
            });
        }
        self.entries.insert(subpath, target);
        Ok(())
    }

    /// Write the metadata file and one symlink per entry under `dest_dir`
    pub fn render_to(&self, dest_dir: &Path) -> Result<()> {
        fs::create_dir_all(dest_dir)?;
        fs::write(dest_dir.join(METADATA_FILE), self.metadata_text())?;

        for (subpath, target) in &self.entries {
            let link = dest_dir.join(subpath);
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent)?;
            }
            std::os::unix::fs::symlink(target, &link)?;
        }

        debug!("Rendered {} catalog entries to {}", self.len(), dest_dir.display());
        Ok(())
    }

    fn metadata_text(&self) -> String {
        format!(
            "created_at: {}\nentries: {}\ndescription: {}\n",
            Utc::now().to_rfc3339(),
            self.entries.len(),
            self.description
        )
    }

    /// Every entry as a pack participant reading from its current target
    pub fn participants(&self) -> Vec<Participant> {
        self.entries
            .iter()
            .map(|(sub, target)| (sub.clone(), target.clone()))
            .collect()
    }

    /// Merge every entry into one new image
    ///
    /// Each entry's current target must be a readable directory. On success
    /// every entry points into the returned image's mount path.
    pub fn consolidate(
        &mut self,
        tool: &dyn ImageTool,
        layout: &StoreLayout,
        work_dir: &Path,
    ) -> Result<BuiltImage> {
        let participants = self.participants();
        info!("Consolidating {} catalog entries", participants.len());
        self.pack_and_repoint(participants, tool, layout, work_dir)
    }

    /// Build one image covering exactly the newly imported subdirectories
    ///
    /// Relative `subdirs` resolve against `root`; the catalog subpath is the
    /// path relative to `root`. Already cataloged subdirectories are skipped
    /// unless `replace` is set. Returns `None` when nothing was imported.
    pub fn import_existing(
        &mut self,
        root: &Path,
        subdirs: &[PathBuf],
        replace: bool,
        tool: &dyn ImageTool,
        layout: &StoreLayout,
        work_dir: &Path,
    ) -> Result<Option<BuiltImage>> {
        let mut participants = Vec::new();
        for subdir in subdirs {
            let source = if subdir.is_absolute() {
                subdir.clone()
            } else {
                root.join(subdir)
            };
            let subpath = source
                .strip_prefix(root)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| PathBuf::from(source.file_name().unwrap_or_default()));

            if self.contains(&subpath) && !replace {
                debug!("Skipping already cataloged {}", subpath.display());
                continue;
            }
            participants.push((subpath, source));
        }

        if participants.is_empty() {
            return Ok(None);
        }
        info!("Importing {} directories", participants.len());
        self.pack_and_repoint(participants, tool, layout, work_dir).map(Some)
    }

    fn pack_and_repoint(
        &mut self,
        participants: Vec<Participant>,
        tool: &dyn ImageTool,
        layout: &StoreLayout,
        work_dir: &Path,
    ) -> Result<BuiltImage> {
        let plan = plan_pack_list(&participants)?;
        let built = image::build_from_pack_list(tool, &plan.list, work_dir)?;

        for subpath in plan.subpaths {
            let target = layout.mount_path(&built.hash, Some(&subpath));
            self.link_path(&subpath, target)?;
        }
        Ok(built)
    }
}

/// Enumerate participants into one pack list without building anything
///
/// Sources must be directories. Overlapping subpaths (one inside another)
/// are rejected since the image could not hold both.
pub fn plan_pack_list(participants: &[Participant]) -> Result<PackPlan> {
    let subpaths: Vec<PathBuf> = participants
        .iter()
        .map(|(sub, _)| strip_root(sub).to_path_buf())
        .collect();

    for (i, a) in subpaths.iter().enumerate() {
        if a.as_os_str().is_empty() {
            return Err(Error::BadImage("empty catalog subpath".to_string()));
        }
        for b in subpaths.iter().skip(i + 1) {
            if a.starts_with(b) || b.starts_with(a) {
                return Err(Error::BadImage(format!(
                    "overlapping subpaths {} and {}",
                    a.display(),
                    b.display()
                )));
            }
        }
    }

    let mut list = PackList::new();
    let mut source_bytes = 0;
    for ((_, source), subpath) in participants.iter().zip(&subpaths) {
        if !source.is_dir() {
            return Err(Error::NotFound(format!(
                "{} (for {}) is not a directory",
                source.display(),
                subpath.display()
            )));
        }
        source_bytes += list.add_tree(source, subpath)?;
    }

    Ok(PackPlan {
        list,
        source_bytes,
        subpaths,
    })
}

fn read_description(text: &str) -> String {
    text.lines()
        .find_map(|line| line.strip_prefix("description: "))
        .unwrap_or_default()
        .to_string()
}
