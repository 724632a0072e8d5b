// src/transaction/recovery.rs

//! Repair of interrupted deployments
//!
//! Every `.yaml.inprogress` left in the store is an unfinished transaction.
//! Repair classifies each one from on-disk evidence and picks an action:
//!
//! | Status               | Action   | Evidence                                        |
//! |----------------------|----------|-------------------------------------------------|
//! | `TooRecent`          | skip     | younger than the minimum age, may be in flight  |
//! | `FailedEarly`        | delete   | no image, or no destination points at it        |
//! | `FullyComplete`      | finalize | every destination points at the image           |
//! | `PartiallyComplete`  | finalize | some do, none point elsewhere                   |
//! | `Conflicted`         | skip     | superseded, unreadable, or otherwise unclear    |
//!
//! Age gating is checked first, so nothing younger than the threshold is ever
//! touched. Finalize and delete both remove the in-progress file, which makes
//! a second run a no-op.
//!
//! Delete never removes an image file that is still in use: when a finalized
//! manifest sits beside it, or when it is the only file carrying its hash and
//! another manifest of that hash still has a live or `.bak` reference, only
//! the in-progress manifest goes.

use super::swap::{reference_state, Reference};
use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::manifest::{self, Manifest, INPROGRESS_SUFFIX, MANIFEST_EXTENSION};
use crate::paths::StoreLayout;
use crate::registry::Filter;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// Classification of one interrupted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransactionStatus {
    FullyComplete,
    PartiallyComplete,
    FailedEarly,
    Conflicted,
    TooRecent,
}

impl TransactionStatus {
    pub fn action(&self) -> RepairAction {
        match self {
            Self::FullyComplete | Self::PartiallyComplete => RepairAction::Finalize,
            Self::FailedEarly => RepairAction::Delete,
            Self::Conflicted | Self::TooRecent => RepairAction::Skip,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullyComplete => "FULLY_COMPLETE",
            Self::PartiallyComplete => "PARTIALLY_COMPLETE",
            Self::FailedEarly => "FAILED_EARLY",
            Self::Conflicted => "CONFLICTED",
            Self::TooRecent => "TOO_RECENT",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    Finalize,
    Delete,
    Skip,
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Finalize => "FINALIZE",
            Self::Delete => "DELETE",
            Self::Skip => "SKIP",
        })
    }
}

/// Destinations of one manifest, bucketed by what they point at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationBuckets {
    pub correct: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
    /// (destination, where it points instead)
    pub conflicting: Vec<(PathBuf, PathBuf)>,
}

impl DestinationBuckets {
    pub fn total(&self) -> usize {
        self.correct.len() + self.missing.len() + self.conflicting.len()
    }
}

/// Classification of one in-progress manifest
#[derive(Debug, Clone)]
pub struct TransactionReport {
    pub inprogress_path: PathBuf,
    pub image_path: PathBuf,
    pub status: TransactionStatus,
    pub age: Duration,
    pub reason: String,
    pub manifest: Option<Manifest>,
    pub destinations: DestinationBuckets,
}

impl TransactionReport {
    pub fn action(&self) -> RepairAction {
        self.status.action()
    }

    /// Content names, empty when the manifest could not be read
    pub fn names(&self) -> Vec<&str> {
        self.manifest
            .as_ref()
            .map(|m| m.names().collect())
            .unwrap_or_default()
    }
}

/// Result of applying (or planning) one action
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub report: TransactionReport,
    /// False for skips and for every dry-run outcome
    pub applied: bool,
    /// Bytes freed (or that would be freed) by a delete
    pub reclaimed_bytes: u64,
    /// Why a delete left the image file in place
    pub kept_image: Option<String>,
}

/// Every in-progress manifest under the image root, sorted by path
pub fn find_inprogress_manifests(layout: &StoreLayout) -> Result<Vec<PathBuf>> {
    let suffix = format!(".{}{}", MANIFEST_EXTENSION, INPROGRESS_SUFFIX);
    layout.list_store_files(|name| name.ends_with(&suffix))
}

/// Age of a file by modification time; future mtimes count as zero
pub fn file_age(path: &Path, now: SystemTime) -> Result<Duration> {
    let modified = fs::symlink_metadata(path)?.modified()?;
    Ok(now.duration_since(modified).unwrap_or(Duration::ZERO))
}

/// Classifies and repairs interrupted transactions
#[derive(Debug, Clone)]
pub struct Repairer<'a> {
    layout: &'a StoreLayout,
    min_age: Duration,
    now: SystemTime,
}

impl<'a> Repairer<'a> {
    pub fn new(layout: &'a StoreLayout, min_age: Duration) -> Self {
        Self {
            layout,
            min_age,
            now: SystemTime::now(),
        }
    }

    /// Classify one in-progress manifest without changing anything
    pub fn classify(&self, inprogress: &Path) -> Result<TransactionReport> {
        let image_path = manifest::image_for_inprogress(inprogress).ok_or_else(|| {
            Error::FormatError(format!("{} is not an in-progress manifest", inprogress.display()))
        })?;
        let age = file_age(inprogress, self.now)?;

        let mut report = TransactionReport {
            inprogress_path: inprogress.to_path_buf(),
            image_path,
            status: TransactionStatus::Conflicted,
            age,
            reason: String::new(),
            manifest: None,
            destinations: DestinationBuckets::default(),
        };

        if age < self.min_age {
            return Ok(report.with(TransactionStatus::TooRecent, "younger than minimum age"));
        }

        let manifest = match Manifest::read_file(inprogress) {
            Ok(m) => m,
            Err(e) => {
                return Ok(report.with(TransactionStatus::Conflicted, format!("unreadable: {}", e)));
            }
        };
        report.manifest = Some(manifest.clone());

        if !report.image_path.exists() {
            return Ok(report.with(TransactionStatus::FailedEarly, "image file missing"));
        }

        let hash = image_hash(&report.image_path)
            .ok_or_else(|| Error::FormatError(format!("no hash in {}", report.image_path.display())))?;

        for entry in &manifest.contents {
            let dest = &entry.destination;
            match reference_state(self.layout, dest, &hash)? {
                Reference::Correct => report.destinations.correct.push(dest.clone()),
                Reference::Missing => report.destinations.missing.push(dest.clone()),
                Reference::Other(target) => {
                    report.destinations.conflicting.push((dest.clone(), target))
                }
            }
        }

        let buckets = &report.destinations;
        let total = buckets.total();
        let (status, reason) = if !buckets.conflicting.is_empty() {
            (
                TransactionStatus::Conflicted,
                format!("{} destination(s) point at another image", buckets.conflicting.len()),
            )
        } else if total > 0 && buckets.correct.len() == total {
            (TransactionStatus::FullyComplete, "all destinations live".to_string())
        } else if !buckets.correct.is_empty() {
            (
                TransactionStatus::PartiallyComplete,
                format!("{} of {} destinations live", buckets.correct.len(), total),
            )
        } else if total > 0 && buckets.missing.len() == total {
            (TransactionStatus::FailedEarly, "no destination points at image".to_string())
        } else {
            error!(
                "Unclassifiable transaction {} (correct={}, missing={}, conflicting={}); this is a bug",
                inprogress.display(),
                buckets.correct.len(),
                buckets.missing.len(),
                buckets.conflicting.len()
            );
            (TransactionStatus::Conflicted, "unclassifiable state".to_string())
        };

        Ok(report.with(status, reason))
    }

    /// Carry out (or, for a dry run, only size up) the report's action
    pub fn apply(&self, report: TransactionReport, dry_run: bool) -> Result<RepairOutcome> {
        let mut outcome = RepairOutcome {
            applied: false,
            reclaimed_bytes: 0,
            kept_image: None,
            report,
        };
        let report = &outcome.report;

        match report.action() {
            RepairAction::Skip => {
                debug!("Skipping {} ({})", report.inprogress_path.display(), report.status);
            }
            RepairAction::Finalize => {
                if !dry_run {
                    manifest::finalize(&report.image_path)?;
                    info!("Finalized {} ({})", report.image_path.display(), report.status);
                    outcome.applied = true;
                }
            }
            RepairAction::Delete => {
                let kept_image = self.image_still_needed(report)?;
                let image_bytes = match kept_image {
                    Some(_) => 0,
                    None => size_if_present(&report.image_path)?,
                };
                let manifest_bytes = size_if_present(&report.inprogress_path)?;
                outcome.reclaimed_bytes = image_bytes + manifest_bytes;

                if !dry_run {
                    match &kept_image {
                        Some(reason) => {
                            info!("Keeping {}: {}", report.image_path.display(), reason)
                        }
                        None if report.image_path.exists() => {
                            fs::remove_file(&report.image_path)?;
                        }
                        None => {}
                    }
                    fs::remove_file(&report.inprogress_path)?;
                    info!(
                        "Deleted failed transaction {} ({} bytes)",
                        report.image_path.display(),
                        outcome.reclaimed_bytes
                    );
                    outcome.applied = true;
                }
                outcome.kept_image = kept_image;
            }
        }

        Ok(outcome)
    }

    /// Classify and apply every in-progress transaction matching `filter`
    ///
    /// Unreadable manifests only match the empty filter. A failure on one
    /// transaction is logged and does not stop the others; it is returned in
    /// the second list.
    pub fn run(
        &self,
        filter: &Filter,
        dry_run: bool,
    ) -> Result<(Vec<RepairOutcome>, Vec<(PathBuf, Error)>)> {
        let mut outcomes = Vec::new();
        let mut failures = Vec::new();

        for inprogress in find_inprogress_manifests(self.layout)? {
            let result = self.classify(&inprogress).and_then(|report| {
                if !filter.matches_any(report.names()) {
                    return Ok(None);
                }
                self.apply(report, dry_run).map(Some)
            });
            match result {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(e) => {
                    warn!("Repair of {} failed: {}", inprogress.display(), e);
                    failures.push((inprogress, e));
                }
            }
        }

        Ok((outcomes, failures))
    }
}

impl Repairer<'_> {
    /// Why the image behind a failed transaction must outlive it, if it must
    fn image_still_needed(&self, report: &TransactionReport) -> Result<Option<String>> {
        let finalized = manifest::manifest_path(&report.image_path);
        if finalized.exists() {
            return Ok(Some(format!("{} shares the image", finalized.display())));
        }
        if !report.image_path.exists() {
            return Ok(None);
        }
        let Some(hash) = image_hash(&report.image_path) else {
            return Ok(None);
        };

        // Another file with the same bytes keeps serving the hash
        if self
            .layout
            .find_images(&hash)?
            .iter()
            .any(|other| other != &report.image_path)
        {
            return Ok(None);
        }

        let sidecars = self
            .layout
            .shard_files(&hash, &format!("*.{}*", MANIFEST_EXTENSION))?;
        for sidecar in sidecars.iter().filter(|p| *p != &report.inprogress_path) {
            let Ok(other) = Manifest::read_file(sidecar) else {
                continue;
            };
            for entry in &other.contents {
                if reference_state(self.layout, &entry.destination, &hash)? == Reference::Correct {
                    return Ok(Some(format!(
                        "{} still resolves to it",
                        entry.destination.display()
                    )));
                }
            }
        }
        Ok(None)
    }
}

fn image_hash(image_path: &Path) -> Option<ContentHash> {
    image_path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(ContentHash::from_file_name)
}

impl TransactionReport {
    fn with(mut self, status: TransactionStatus, reason: impl Into<String>) -> Self {
        self.status = status;
        self.reason = reason.into();
        self
    }
}

fn size_if_present(path: &Path) -> Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}
