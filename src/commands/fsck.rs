// src/commands/fsck.rs
//! Read-only store reports

use super::{format_bytes, Context};
use anyhow::{bail, Result};
use cefs::fsck::{Fsck, ImageCheck, StaleArtifact};
use cefs::usage::{self, UsageBand};
use cefs::{Filter, Manifest};

/// Check manifests and list stale leftovers
///
/// A non-empty filter restricts the manifest checks to images whose manifest
/// names a matching installable; images without a readable manifest are
/// always shown.
pub fn cmd_fsck(ctx: &Context, filter: &Filter) -> Result<()> {
    let report = Fsck::new(&ctx.layout, &ctx.config.fsck).run()?;

    let checked: Vec<&ImageCheck> = report
        .images
        .iter()
        .filter(|check| match Manifest::read_alongside_lenient(&check.image_path) {
            Some(manifest) => filter.matches_any(manifest.names()),
            None => true,
        })
        .collect();

    println!("Checked {} image(s) in {}", checked.len(), ctx.layout.image_root.display());
    let mut counts = std::collections::BTreeMap::new();
    for check in &checked {
        *counts.entry(check.manifest.label()).or_insert(0usize) += 1;
    }
    for (label, count) in &counts {
        println!("  {:<14} {}", label, count);
    }

    let problems: Vec<&&ImageCheck> = checked.iter().filter(|c| !c.manifest.is_valid()).collect();
    if !problems.is_empty() {
        println!();
        println!("Manifest problems:");
        for check in &problems {
            println!("  {}: {}", check.image_path.display(), check.manifest);
        }
    }

    print_stale("Stale in-progress manifests", &report.stale_inprogress);
    print_stale("Stale .bak entries", &report.stale_backups);
    print_stale("Deferred deletions not yet swept", &report.stale_delete_markers);

    if !problems.is_empty() {
        bail!("{} image(s) with manifest problems", problems.len());
    }
    Ok(())
}

fn print_stale(title: &str, artifacts: &[StaleArtifact]) {
    if artifacts.is_empty() {
        return;
    }
    println!();
    println!("{} ({}):", title, artifacts.len());
    for artifact in artifacts {
        println!(
            "  {:>6}h  {}",
            artifact.age.as_secs() / 3600,
            artifact.path.display()
        );
    }
}

/// Usage bands, candidates and wasted space
pub fn cmd_usage(ctx: &Context) -> Result<()> {
    let report = usage::analyze(&ctx.layout)?;
    let bands = report.by_band();

    println!("Image usage ({} images)", report.images.len());
    for band in [
        UsageBand::Unused,
        UsageBand::Pct1To25,
        UsageBand::Pct26To50,
        UsageBand::Pct51To75,
        UsageBand::Pct76To99,
        UsageBand::Full,
    ] {
        let images = bands.get(&band).map(Vec::as_slice).unwrap_or_default();
        let bytes: u64 = images.iter().map(|i| i.size).sum();
        println!("  {:>7}  {:>5} images  {:>12}", band.label(), images.len(), format_bytes(bytes));
    }

    let deletable: Vec<_> = report.deletion_candidates().collect();
    if !deletable.is_empty() {
        println!();
        println!("Unreferenced images (deletion candidates):");
        for image in deletable {
            println!("  {}  {}", format_bytes(image.size), image.image_path.display());
        }
    }

    let candidates: Vec<_> = report
        .consolidation_candidates(&ctx.config.consolidation)
        .collect();
    if !candidates.is_empty() {
        println!();
        println!("Consolidation candidates:");
        for image in candidates {
            println!(
                "  {:>5.1}%  {}  {}",
                image.usage_pct(),
                format_bytes(image.size),
                image.image_path.display()
            );
        }
    }

    if !report.unknown.is_empty() {
        println!();
        println!("Images without a readable manifest ({}):", report.unknown.len());
        for path in &report.unknown {
            println!("  {}", path.display());
        }
    }

    println!();
    println!("Estimated wasted space: {}", format_bytes(report.total_wasted_bytes()));
    Ok(())
}
