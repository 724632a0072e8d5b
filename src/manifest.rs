// src/manifest.rs

//! Sidecar manifests for stored images
//!
//! Every image has a YAML manifest next to it with the same stem:
//!
//! ```text
//! ab/abcdef..._convert_gcc.sqfs
//! ab/abcdef..._convert_gcc.yaml.inprogress   while the transaction runs
//! ab/abcdef..._convert_gcc.yaml              once finalized
//! ```
//!
//! A finalized manifest asserts the image bytes are durably stored. An
//! in-progress manifest that outlives its process is evidence of an
//! interrupted transaction and is picked up by repair.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

/// Current manifest schema version
pub const MANIFEST_VERSION: u32 = 1;

/// Extension of finalized manifests
pub const MANIFEST_EXTENSION: &str = "yaml";

/// Suffix appended while a transaction is open
pub const INPROGRESS_SUFFIX: &str = ".inprogress";

/// Sentinel recorded when the source revision is unknown
pub const UNKNOWN_GIT_SHA: &str = "unknown";

/// `<path segments> <version>`, no empty segments, no edge whitespace
static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[^/\s](?:[^/]*[^/\s])?/)*[^/\s](?:[^/]*[^/\s])? [^/\s]+$")
        .expect("static regex")
});

/// What created an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Install,
    Convert,
    Consolidate,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Convert => "convert",
            Self::Consolidate => "consolidate",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One installable held by an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContentEntry {
    /// Logical installable name, e.g. `compilers/c++/x86/gcc 13.1.0`
    pub name: String,

    /// Deprecated label field; its presence marks an old-format manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Path in the logical namespace that should point at this image
    pub destination: PathBuf,
}

impl ContentEntry {
    pub fn new(name: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            target: None,
            destination: destination.into(),
        }
    }
}

/// Manifest record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub git_sha: String,
    pub command: Vec<String>,
    pub description: String,
    pub operation: Operation,
    pub contents: Vec<ContentEntry>,
}

/// Outcome of [`Manifest::validate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestValidation {
    Valid,
    /// Uses the deprecated `target` field
    OldFormat,
    /// A content entry has a malformed logical name
    InvalidName(String),
    /// Any other schema violation
    Invalid(String),
}

impl ManifestValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl Manifest {
    /// Build a manifest stamped with the current time and source revision
    ///
    /// `command` defaults to the actual process invocation.
    pub fn create(
        operation: Operation,
        description: impl Into<String>,
        contents: Vec<ContentEntry>,
        command: Option<Vec<String>>,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            created_at: Utc::now(),
            git_sha: current_git_sha(),
            command: command.unwrap_or_else(|| std::env::args().collect()),
            description: description.into(),
            operation,
            contents,
        }
    }

    /// Parse YAML text
    pub fn parse(content: &str, origin: &Path) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|source| Error::ManifestParse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Read and parse a manifest file at an explicit path
    pub fn read_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content, path)
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|source| Error::ManifestParse {
            path: PathBuf::new(),
            source,
        })
    }

    /// Write as `<stem>.yaml.inprogress` next to the image
    ///
    /// The file appears atomically so repair never sees a torn manifest.
    pub fn write_in_progress(&self, image_path: &Path) -> Result<PathBuf> {
        let path = inprogress_path(image_path);
        let dir = path
            .parent()
            .ok_or_else(|| Error::FormatError(format!("{} has no parent", path.display())))?;

        let yaml = self.to_yaml()?;
        let mut temp = tempfile::Builder::new()
            .prefix(".manifest-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        temp.write_all(yaml.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| Error::Io(e.error))?;

        debug!("Wrote in-progress manifest {}", path.display());
        Ok(path)
    }

    /// Finalized sidecar for an image, `None` if there is none
    ///
    /// Malformed sidecars are surfaced as errors; validation tooling needs them.
    pub fn read_alongside(image_path: &Path) -> Result<Option<Self>> {
        let path = manifest_path(image_path);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_file(&path).map(Some)
    }

    /// Like [`read_alongside`](Self::read_alongside) but malformed means "no data"
    pub fn read_alongside_lenient(image_path: &Path) -> Option<Self> {
        match Self::read_alongside(image_path) {
            Ok(manifest) => manifest,
            Err(e) => {
                debug!("Ignoring unreadable manifest for {}: {}", image_path.display(), e);
                None
            }
        }
    }

    /// Check the schema beyond what parsing enforces
    pub fn validate(&self) -> ManifestValidation {
        if self.contents.iter().any(|c| c.target.is_some()) {
            return ManifestValidation::OldFormat;
        }

        if let Some(bad) = self.contents.iter().find(|c| !is_valid_name(&c.name)) {
            return ManifestValidation::InvalidName(bad.name.clone());
        }

        if self.version != MANIFEST_VERSION {
            return ManifestValidation::Invalid(format!(
                "unsupported version {}",
                self.version
            ));
        }
        if self.git_sha.is_empty() {
            return ManifestValidation::Invalid("empty git_sha".to_string());
        }
        if self.contents.is_empty() {
            return ManifestValidation::Invalid("no contents".to_string());
        }
        if let Some(rel) = self.contents.iter().find(|c| !c.destination.is_absolute()) {
            return ManifestValidation::Invalid(format!(
                "destination {} is not absolute",
                rel.destination.display()
            ));
        }

        ManifestValidation::Valid
    }

    /// Content names, for filtering
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.contents.iter().map(|c| c.name.as_str())
    }
}

/// Rename `<stem>.yaml.inprogress` to `<stem>.yaml`
///
/// A missing in-progress file is an error, never a silent no-op.
pub fn finalize(image_path: &Path) -> Result<PathBuf> {
    let from = inprogress_path(image_path);
    let to = manifest_path(image_path);

    if !from.exists() {
        return Err(Error::MissingInProgress(from));
    }
    fs::rename(&from, &to)?;

    debug!("Finalized manifest {}", to.display());
    Ok(to)
}

/// `<stem>.yaml` for an image
pub fn manifest_path(image_path: &Path) -> PathBuf {
    image_path.with_extension(MANIFEST_EXTENSION)
}

/// `<stem>.yaml.inprogress` for an image
pub fn inprogress_path(image_path: &Path) -> PathBuf {
    crate::paths::append_to_file_name(&manifest_path(image_path), INPROGRESS_SUFFIX)
}

/// Image path an in-progress manifest belongs to
pub fn image_for_inprogress(inprogress: &Path) -> Option<PathBuf> {
    let name = inprogress.file_name()?.to_str()?;
    let stem = name.strip_suffix(&format!(".{}{}", MANIFEST_EXTENSION, INPROGRESS_SUFFIX))?;
    Some(inprogress.with_file_name(format!("{}.{}", stem, crate::paths::IMAGE_EXTENSION)))
}

/// Whether a logical installable name is well-formed
pub fn is_valid_name(name: &str) -> bool {
    !name.chars().any(char::is_control) && NAME_PATTERN.is_match(name)
}

/// Source revision this binary was built from
pub fn current_git_sha() -> String {
    option_env!("CEFS_GIT_SHA")
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_GIT_SHA)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Manifest {
        Manifest::create(
            Operation::Convert,
            "Converted gcc 13.1.0",
            vec![ContentEntry::new(
                "compilers/c++/x86/gcc 13.1.0",
                "/opt/compiler-explorer/gcc-13.1.0",
            )],
            Some(vec!["cefs".to_string(), "convert".to_string()]),
        )
    }

    #[test]
    fn test_create_defaults() {
        let manifest = Manifest::create(Operation::Install, "x", Vec::new(), None);
        assert_eq!(manifest.version, MANIFEST_VERSION);
        assert!(!manifest.git_sha.is_empty());
        assert!(!manifest.command.is_empty());
    }

    #[test]
    fn test_inprogress_then_finalize() {
        let temp_dir = TempDir::new().unwrap();
        let image = temp_dir.path().join("0123456789abcdef01234567_convert_gcc.sqfs");

        let written = sample().write_in_progress(&image).unwrap();
        assert_eq!(
            written,
            temp_dir.path().join("0123456789abcdef01234567_convert_gcc.yaml.inprogress")
        );
        assert_eq!(image_for_inprogress(&written).unwrap(), image);
        assert!(Manifest::read_alongside(&image).unwrap().is_none());

        let finalized = finalize(&image).unwrap();
        assert!(!written.exists());
        assert!(finalized.exists());

        let read = Manifest::read_alongside(&image).unwrap().unwrap();
        assert_eq!(read, sample_with_time(read.created_at));
    }

    fn sample_with_time(created_at: DateTime<Utc>) -> Manifest {
        Manifest {
            created_at,
            git_sha: current_git_sha(),
            ..sample()
        }
    }

    #[test]
    fn test_finalize_without_inprogress_fails() {
        let temp_dir = TempDir::new().unwrap();
        let image = temp_dir.path().join("x.sqfs");
        assert!(matches!(finalize(&image), Err(Error::MissingInProgress(_))));
    }

    #[test]
    fn test_malformed_sidecar() {
        let temp_dir = TempDir::new().unwrap();
        let image = temp_dir.path().join("x.sqfs");
        fs::write(manifest_path(&image), "version: [not, a, number").unwrap();

        assert!(matches!(
            Manifest::read_alongside(&image),
            Err(Error::ManifestParse { .. })
        ));
        assert!(Manifest::read_alongside_lenient(&image).is_none());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let yaml = sample().to_yaml().unwrap() + "surprise: true\n";
        assert!(Manifest::parse(&yaml, Path::new("m.yaml")).is_err());
    }

    #[test]
    fn test_validate_old_format_wins() {
        let mut manifest = sample();
        manifest.contents[0].target = Some("13.1.0".to_string());
        assert_eq!(manifest.validate(), ManifestValidation::OldFormat);

        // Still old format with a broken name alongside
        manifest.contents[0].name = "bad".to_string();
        assert_eq!(manifest.validate(), ManifestValidation::OldFormat);
    }

    #[test]
    fn test_validate_old_format_from_yaml() {
        let yaml = r#"
version: 1
created_at: 2024-01-01T00:00:00Z
git_sha: abc
command: [ce_install, cefs, convert]
description: legacy
operation: convert
contents:
  - name: compilers/c++/gcc 9.1.0
    target: 9.1.0
    destination: /opt/compiler-explorer/gcc-9.1.0
"#;
        let manifest = Manifest::parse(yaml, Path::new("m.yaml")).unwrap();
        assert_eq!(manifest.validate(), ManifestValidation::OldFormat);
    }

    #[test]
    fn test_validate_names_and_other() {
        let mut manifest = sample();
        assert!(manifest.validate().is_valid());

        manifest.contents[0].name = "gcc".to_string();
        assert_eq!(manifest.validate(), ManifestValidation::InvalidName("gcc".to_string()));

        let mut manifest = sample();
        manifest.contents[0].destination = PathBuf::from("relative/path");
        assert!(matches!(manifest.validate(), ManifestValidation::Invalid(_)));

        let mut manifest = sample();
        manifest.version = 2;
        assert!(matches!(manifest.validate(), ManifestValidation::Invalid(_)));
    }

    #[test]
    fn test_name_rules() {
        assert!(is_valid_name("compilers/c++/x86/gcc 13.1.0"));
        assert!(is_valid_name("libraries/boost 1.84.0"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("gcc"));
        assert!(!is_valid_name("/compilers/gcc 1"));
        assert!(!is_valid_name("compilers//gcc 1"));
        assert!(!is_valid_name("compilers/gcc 1 "));
        assert!(!is_valid_name(" compilers/gcc 1"));
        assert!(!is_valid_name("compilers/gcc\t1"));
    }
}
