// src/fsck.rs

//! Read-only consistency check of the store
//!
//! Classifies the manifest of every stored image and lists stale leftovers:
//! in-progress manifests (oldest first), `.bak` backups and deferred-delete
//! markers. Fixing things is left to repair and to the operator.

use crate::config::FsckConfig;
use crate::error::Result;
use crate::manifest::{Manifest, ManifestValidation};
use crate::paths::StoreLayout;
use crate::transaction::recovery::{file_age, find_inprogress_manifests};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use walkdir::WalkDir;

const BACKUP_SUFFIX: &str = ".bak";
const DELETE_MARKER: &str = ".DELETE_ME_";

/// State of one image's sidecar manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestCheck {
    Valid,
    Missing,
    OldFormat,
    InvalidName(String),
    Invalid(String),
    Unreadable(String),
}

impl ManifestCheck {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Missing => "missing",
            Self::OldFormat => "old_format",
            Self::InvalidName(_) => "invalid_name",
            Self::Invalid(_) => "invalid",
            Self::Unreadable(_) => "unreadable",
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl fmt::Display for ManifestCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName(detail) | Self::Invalid(detail) | Self::Unreadable(detail) => {
                write!(f, "{}: {}", self.label(), detail)
            }
            _ => f.write_str(self.label()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCheck {
    pub image_path: PathBuf,
    pub manifest: ManifestCheck,
}

/// A leftover file or directory and how long it has been there
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleArtifact {
    pub path: PathBuf,
    pub age: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct FsckReport {
    pub images: Vec<ImageCheck>,
    /// Oldest first
    pub stale_inprogress: Vec<StaleArtifact>,
    pub stale_backups: Vec<StaleArtifact>,
    pub stale_delete_markers: Vec<StaleArtifact>,
}

impl FsckReport {
    /// True when every manifest is valid
    pub fn manifests_ok(&self) -> bool {
        self.images.iter().all(|i| i.manifest.is_valid())
    }

    pub fn problems(&self) -> impl Iterator<Item = &ImageCheck> {
        self.images.iter().filter(|i| !i.manifest.is_valid())
    }

    /// Number of images per manifest classification
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for image in &self.images {
            *counts.entry(image.manifest.label()).or_insert(0) += 1;
        }
        counts
    }
}

/// Classify a single image's sidecar
pub fn check_manifest(image_path: &Path) -> ManifestCheck {
    match Manifest::read_alongside(image_path) {
        Ok(None) => ManifestCheck::Missing,
        Ok(Some(manifest)) => match manifest.validate() {
            ManifestValidation::Valid => ManifestCheck::Valid,
            ManifestValidation::OldFormat => ManifestCheck::OldFormat,
            ManifestValidation::InvalidName(name) => ManifestCheck::InvalidName(name),
            ManifestValidation::Invalid(reason) => ManifestCheck::Invalid(reason),
        },
        Err(e) => ManifestCheck::Unreadable(e.to_string()),
    }
}

pub struct Fsck<'a> {
    layout: &'a StoreLayout,
    config: &'a FsckConfig,
    now: SystemTime,
}

impl<'a> Fsck<'a> {
    pub fn new(layout: &'a StoreLayout, config: &'a FsckConfig) -> Self {
        Self {
            layout,
            config,
            now: SystemTime::now(),
        }
    }

    pub fn run(&self) -> Result<FsckReport> {
        let mut report = FsckReport::default();

        for image_path in self.layout.list_images()? {
            let manifest = check_manifest(&image_path);
            if !manifest.is_valid() {
                debug!("{}: {}", image_path.display(), manifest);
            }
            report.images.push(ImageCheck {
                image_path,
                manifest,
            });
        }

        report.stale_inprogress = self.stale_inprogress()?;
        let (backups, markers) = self.scan_namespace();
        report.stale_backups = backups;
        report.stale_delete_markers = markers;

        Ok(report)
    }

    /// In-progress manifests older than the staleness threshold, oldest first
    pub fn stale_inprogress(&self) -> Result<Vec<StaleArtifact>> {
        let mut stale = Vec::new();
        for path in find_inprogress_manifests(self.layout)? {
            match file_age(&path, self.now) {
                Ok(age) if age >= self.config.stale_after() => stale.push(StaleArtifact { path, age }),
                Ok(_) => {}
                Err(e) => debug!("{} vanished during scan: {}", path.display(), e),
            }
        }
        stale.sort_by(|a, b| b.age.cmp(&a.age));
        Ok(stale)
    }

    /// Stale `.bak` entries and deferred-delete markers in the namespace
    ///
    /// Depth-limited since the namespace may be a slow network mount. Symlinks
    /// are never followed and matched entries are not descended into.
    fn scan_namespace(&self) -> (Vec<StaleArtifact>, Vec<StaleArtifact>) {
        let mut backups = Vec::new();
        let mut markers = Vec::new();
        let root = &self.layout.namespace_root;

        if !root.is_dir() {
            warn!("Namespace root {} not found; skipping backup scan", root.display());
            return (backups, markers);
        }

        let mut walker = WalkDir::new(root)
            .min_depth(1)
            .max_depth(self.config.max_depth)
            .follow_links(false)
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable namespace entry: {}", e);
                    continue;
                }
            };
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };

            let bucket = if name.contains(DELETE_MARKER) {
                &mut markers
            } else if name.ends_with(BACKUP_SUFFIX) {
                &mut backups
            } else {
                continue;
            };
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }

            match file_age(entry.path(), self.now) {
                Ok(age) if age >= self.config.stale_after() => bucket.push(StaleArtifact {
                    path: entry.into_path(),
                    age,
                }),
                Ok(_) => {}
                Err(e) => debug!("{} vanished during scan: {}", entry.path().display(), e),
            }
        }

        backups.sort_by(|a, b| a.path.cmp(&b.path));
        markers.sort_by(|a, b| a.path.cmp(&b.path));
        (backups, markers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContentHash;
    use crate::manifest::{self, ContentEntry, Operation};
    use std::fs;
    use tempfile::TempDir;

    fn layout(root: &Path) -> StoreLayout {
        StoreLayout::new(root.join("images"), root.join("cefs"), root.join("ns"))
    }

    fn store_image(layout: &StoreLayout, hash: &str) -> PathBuf {
        let hash = ContentHash::new(hash).unwrap();
        let image = layout.image_path(&hash, "install");
        fs::create_dir_all(image.parent().unwrap()).unwrap();
        fs::write(&image, b"image").unwrap();
        image
    }

    fn valid_manifest() -> Manifest {
        Manifest::create(
            Operation::Install,
            "t",
            vec![ContentEntry::new("tools/cmake 3.28.0", "/opt/ce/cmake")],
            Some(vec!["cefs".to_string()]),
        )
    }

    #[test]
    fn test_manifest_classification() {
        let temp_dir = TempDir::new().unwrap();
        let layout = layout(temp_dir.path());

        let valid = store_image(&layout, "aaaaaaaaaaaaaaaaaaaaaaaa");
        valid_manifest().write_in_progress(&valid).unwrap();
        manifest::finalize(&valid).unwrap();

        let missing = store_image(&layout, "bbbbbbbbbbbbbbbbbbbbbbbb");

        let unreadable = store_image(&layout, "cccccccccccccccccccccccc");
        fs::write(manifest::manifest_path(&unreadable), "{{{").unwrap();

        let bad_name = store_image(&layout, "dddddddddddddddddddddddd");
        let mut manifest = valid_manifest();
        manifest.contents[0].name = "cmake".to_string();
        fs::write(manifest::manifest_path(&bad_name), manifest.to_yaml().unwrap()).unwrap();

        let report = Fsck::new(&layout, &FsckConfig::default()).run().unwrap();
        assert_eq!(report.images.len(), 4);
        assert!(!report.manifests_ok());
        assert_eq!(check_manifest(&valid), ManifestCheck::Valid);
        assert_eq!(check_manifest(&missing), ManifestCheck::Missing);
        assert!(matches!(check_manifest(&unreadable), ManifestCheck::Unreadable(_)));
        assert_eq!(
            check_manifest(&bad_name),
            ManifestCheck::InvalidName("cmake".to_string())
        );

        let counts = report.counts();
        assert_eq!(counts["valid"], 1);
        assert_eq!(report.problems().count(), 3);
    }

    #[test]
    fn test_stale_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let layout = layout(temp_dir.path());
        fs::create_dir_all(layout.namespace_root.join("arm")).unwrap();
        fs::create_dir_all(layout.namespace_root.join("gcc.bak/inner.bak")).unwrap();
        fs::create_dir_all(layout.namespace_root.join("arm/gcc.DELETE_ME_20240101_120000"))
            .unwrap();
        fs::write(layout.namespace_root.join("arm/normal"), b"x").unwrap();

        let image = store_image(&layout, "eeeeeeeeeeeeeeeeeeeeeeee");
        valid_manifest().write_in_progress(&image).unwrap();

        let config = FsckConfig {
            stale_after_secs: 0,
            ..FsckConfig::default()
        };
        let report = Fsck::new(&layout, &config).run().unwrap();

        assert_eq!(report.stale_inprogress.len(), 1);
        // Not descended into
        assert_eq!(report.stale_backups.len(), 1);
        assert_eq!(report.stale_backups[0].path, layout.namespace_root.join("gcc.bak"));
        assert_eq!(report.stale_delete_markers.len(), 1);

        // Nothing is stale under the default threshold
        let report = Fsck::new(&layout, &FsckConfig::default()).run().unwrap();
        assert!(report.stale_inprogress.is_empty());
        assert!(report.stale_backups.is_empty());
    }

    #[test]
    fn test_depth_limit() {
        let temp_dir = TempDir::new().unwrap();
        let layout = layout(temp_dir.path());
        fs::create_dir_all(layout.namespace_root.join("a/b/c/d.bak")).unwrap();

        let shallow = FsckConfig {
            max_depth: 2,
            stale_after_secs: 0,
        };
        let report = Fsck::new(&layout, &shallow).run().unwrap();
        assert!(report.stale_backups.is_empty());

        let deep = FsckConfig {
            max_depth: 4,
            stale_after_secs: 0,
        };
        assert_eq!(Fsck::new(&layout, &deep).run().unwrap().stale_backups.len(), 1);
    }
}
