// src/usage.rs

//! Usage accounting for stored images
//!
//! For each image, count how many of its manifest's destinations still
//! resolve to it (directly or through `.bak`). Nothing here deletes anything;
//! the report drives deletion and reconsolidation decisions made elsewhere.

use crate::config::ConsolidationConfig;
use crate::error::Result;
use crate::hash::ContentHash;
use crate::manifest::{Manifest, Operation};
use crate::paths::StoreLayout;
use crate::transaction::swap::{reference_state, Reference};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Usage of one image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageUsage {
    pub image_path: PathBuf,
    pub hash: ContentHash,
    pub size: u64,
    pub operation: Operation,
    pub total: usize,
    pub referenced: usize,
    /// Destinations no longer pointing at this image
    pub unreferenced: Vec<PathBuf>,
}

impl ImageUsage {
    /// Referenced entries as a percentage of all entries
    pub fn usage_pct(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.referenced as f64 / self.total as f64 * 100.0
    }

    /// Bytes attributable to unreferenced contents: `size * (1 - usage)`
    pub fn wasted_bytes(&self) -> u64 {
        if self.total == 0 {
            return self.size;
        }
        let unused = (self.total - self.referenced) as f64 / self.total as f64;
        (self.size as f64 * unused).round() as u64
    }

    pub fn band(&self) -> UsageBand {
        UsageBand::classify(self.referenced, self.total)
    }
}

/// Reporting buckets by usage percentage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UsageBand {
    Unused,
    Pct1To25,
    Pct26To50,
    Pct51To75,
    Pct76To99,
    Full,
}

impl UsageBand {
    pub fn classify(referenced: usize, total: usize) -> Self {
        if referenced == 0 || total == 0 {
            return Self::Unused;
        }
        if referenced >= total {
            return Self::Full;
        }
        let pct = referenced as f64 / total as f64 * 100.0;
        if pct <= 25.0 {
            Self::Pct1To25
        } else if pct <= 50.0 {
            Self::Pct26To50
        } else if pct <= 75.0 {
            Self::Pct51To75
        } else {
            Self::Pct76To99
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Unused => "0%",
            Self::Pct1To25 => "1-25%",
            Self::Pct26To50 => "26-50%",
            Self::Pct51To75 => "51-75%",
            Self::Pct76To99 => "76-99%",
            Self::Full => "100%",
        }
    }
}

impl fmt::Display for UsageBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Default)]
pub struct UsageReport {
    pub images: Vec<ImageUsage>,
    /// Images with no readable manifest; usage cannot be assessed
    pub unknown: Vec<PathBuf>,
}

impl UsageReport {
    pub fn by_band(&self) -> BTreeMap<UsageBand, Vec<&ImageUsage>> {
        let mut bands: BTreeMap<UsageBand, Vec<&ImageUsage>> = BTreeMap::new();
        for image in &self.images {
            bands.entry(image.band()).or_default().push(image);
        }
        bands
    }

    /// Images nothing points at
    pub fn deletion_candidates(&self) -> impl Iterator<Item = &ImageUsage> {
        self.images.iter().filter(|i| i.band() == UsageBand::Unused)
    }

    pub fn partially_used(&self) -> impl Iterator<Item = &ImageUsage> {
        self.images
            .iter()
            .filter(|i| !matches!(i.band(), UsageBand::Unused | UsageBand::Full))
    }

    /// Small, low-usage consolidated images worth reconsolidating
    pub fn consolidation_candidates<'a>(
        &'a self,
        config: &'a ConsolidationConfig,
    ) -> impl Iterator<Item = &'a ImageUsage> + 'a {
        self.partially_used().filter(move |i| {
            i.operation == Operation::Consolidate
                && i.size < config.small_image_size
                && i.usage_pct() < config.low_usage_pct
        })
    }

    pub fn total_wasted_bytes(&self) -> u64 {
        self.images.iter().map(ImageUsage::wasted_bytes).sum()
    }
}

/// Measure usage of one image against its manifest
pub fn image_usage(
    layout: &StoreLayout,
    image_path: PathBuf,
    hash: ContentHash,
    manifest: &Manifest,
) -> Result<ImageUsage> {
    let size = fs::metadata(&image_path)?.len();
    let mut referenced = 0;
    let mut unreferenced = Vec::new();

    for entry in &manifest.contents {
        match reference_state(layout, &entry.destination, &hash)? {
            Reference::Correct => referenced += 1,
            Reference::Other(_) | Reference::Missing => {
                unreferenced.push(entry.destination.clone())
            }
        }
    }

    Ok(ImageUsage {
        image_path,
        hash,
        size,
        operation: manifest.operation,
        total: manifest.contents.len(),
        referenced,
        unreferenced,
    })
}

/// Scan the whole store
pub fn analyze(layout: &StoreLayout) -> Result<UsageReport> {
    let mut report = UsageReport::default();

    for image_path in layout.list_images()? {
        let Some(hash) = image_path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(ContentHash::from_file_name)
        else {
            warn!("Skipping {}: no content hash in name", image_path.display());
            continue;
        };

        match Manifest::read_alongside_lenient(&image_path) {
            Some(manifest) => {
                let usage = image_usage(layout, image_path, hash, &manifest)?;
                debug!(
                    "{}: {}/{} referenced",
                    usage.image_path.display(),
                    usage.referenced,
                    usage.total
                );
                report.images.push(usage);
            }
            None => report.unknown.push(image_path),
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(referenced: usize, total: usize, size: u64) -> ImageUsage {
        ImageUsage {
            image_path: PathBuf::from("/efs/ab/x.sqfs"),
            hash: ContentHash::new("abcdef0123456789abcdef01").unwrap(),
            size,
            operation: Operation::Consolidate,
            total,
            referenced,
            unreferenced: Vec::new(),
        }
    }

    #[test]
    fn test_usage_math() {
        let u = usage(2, 3, 3000);
        assert!((u.usage_pct() - 66.6).abs() < 0.1);
        assert_eq!(u.wasted_bytes(), 1000);
        assert_eq!(u.band(), UsageBand::Pct51To75);

        assert_eq!(usage(0, 3, 10).wasted_bytes(), 10);
        assert_eq!(usage(3, 3, 10).wasted_bytes(), 0);
    }

    #[test]
    fn test_bands() {
        assert_eq!(UsageBand::classify(0, 4), UsageBand::Unused);
        assert_eq!(UsageBand::classify(1, 4), UsageBand::Pct1To25);
        assert_eq!(UsageBand::classify(2, 4), UsageBand::Pct26To50);
        assert_eq!(UsageBand::classify(3, 4), UsageBand::Pct51To75);
        assert_eq!(UsageBand::classify(99, 100), UsageBand::Pct76To99);
        assert_eq!(UsageBand::classify(4, 4), UsageBand::Full);
    }

    #[test]
    fn test_candidates() {
        let config = ConsolidationConfig::default();
        let report = UsageReport {
            images: vec![usage(0, 2, 10), usage(1, 4, 10), usage(3, 4, 10), usage(2, 2, 10)],
            unknown: Vec::new(),
        };

        assert_eq!(report.deletion_candidates().count(), 1);
        assert_eq!(report.partially_used().count(), 2);
        let candidates: Vec<_> = report.consolidation_candidates(&config).collect();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].referenced, 1);
        assert_eq!(report.by_band().len(), 4);
    }
}
