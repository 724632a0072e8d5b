// src/config.rs

//! Store configuration
//!
//! Loaded once at process start from a TOML file and passed down by
//! reference. Every field has a default so a missing file, or a file that only
//! overrides a few keys, is valid.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cefs/cefs.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CefsConfig {
    /// Where image files and their manifests live
    pub image_root: PathBuf,
    /// Where the on-access mounts appear
    pub mount_point: PathBuf,
    /// Root of the logical namespace (installation directories)
    pub namespace_root: PathBuf,
    /// Scratch space for image builds
    pub local_temp_dir: PathBuf,
    pub squashfs: SquashfsConfig,
    pub repair: RepairConfig,
    pub fsck: FsckConfig,
    pub consolidation: ConsolidationConfig,
    /// Installables known to the registry
    pub installables: Vec<InstallableConfig>,
}

impl Default for CefsConfig {
    fn default() -> Self {
        Self {
            image_root: PathBuf::from("/efs/cefs-images"),
            mount_point: PathBuf::from("/cefs"),
            namespace_root: PathBuf::from("/opt/compiler-explorer"),
            local_temp_dir: PathBuf::from("/tmp/cefs"),
            squashfs: SquashfsConfig::default(),
            repair: RepairConfig::default(),
            fsck: FsckConfig::default(),
            consolidation: ConsolidationConfig::default(),
            installables: Vec::new(),
        }
    }
}

/// External compression tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SquashfsConfig {
    pub mksquashfs: PathBuf,
    pub unsquashfs: PathBuf,
    pub compression: String,
    pub compression_level: u32,
}

impl Default for SquashfsConfig {
    fn default() -> Self {
        Self {
            mksquashfs: PathBuf::from("mksquashfs"),
            unsquashfs: PathBuf::from("unsquashfs"),
            compression: "zstd".to_string(),
            compression_level: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepairConfig {
    /// Transactions younger than this are never touched
    pub min_age_secs: u64,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self { min_age_secs: 3600 }
    }
}

impl RepairConfig {
    pub fn min_age(&self) -> Duration {
        Duration::from_secs(self.min_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FsckConfig {
    /// Recursion limit for namespace scans (the namespace may be a slow mount)
    pub max_depth: usize,
    /// Artifacts older than this are reported as stale
    pub stale_after_secs: u64,
}

impl Default for FsckConfig {
    fn default() -> Self {
        Self {
            max_depth: 4,
            stale_after_secs: 3600,
        }
    }
}

impl FsckConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsolidationConfig {
    /// Upper bound on the summed size of images merged into one
    pub max_image_size: u64,
    /// Do not consolidate fewer items than this
    pub min_items: usize,
    /// Free space required = source bytes * factor
    pub space_factor: f64,
    /// Consolidated images smaller than this are "small" in usage reports
    pub small_image_size: u64,
    /// Consolidated images below this usage are flagged for reconsolidation
    pub low_usage_pct: f64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            max_image_size: 20 * 1024 * 1024 * 1024,
            min_items: 2,
            space_factor: 2.0,
            small_image_size: 1024 * 1024 * 1024,
            low_usage_pct: 50.0,
        }
    }
}

/// One `[[installables]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallableConfig {
    pub name: String,
    pub destination: PathBuf,
}

impl CefsConfig {
    /// Load from a file, or fall back to defaults when the default path is absent
    ///
    /// An explicitly requested file that does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Parse a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse TOML content
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check paths are usable
    pub fn validate(&self) -> Result<()> {
        for (key, path) in [
            ("image_root", &self.image_root),
            ("mount_point", &self.mount_point),
            ("namespace_root", &self.namespace_root),
        ] {
            if !path.is_absolute() {
                return Err(Error::Config(format!(
                    "{} must be absolute, got {}",
                    key,
                    path.display()
                )));
            }
        }
        if self.consolidation.space_factor < 1.0 {
            return Err(Error::Config(
                "consolidation.space_factor must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Builder-style overrides used by the CLI and tests
    pub fn with_roots(
        mut self,
        image_root: impl Into<PathBuf>,
        mount_point: impl Into<PathBuf>,
        namespace_root: impl Into<PathBuf>,
    ) -> Self {
        self.image_root = image_root.into();
        self.mount_point = mount_point.into();
        self.namespace_root = namespace_root.into();
        self
    }
}
