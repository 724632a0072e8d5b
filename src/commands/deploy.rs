// src/commands/deploy.rs
//! Install and convert: build a single-content image and point its
//! destination at it

use super::{cleanup_mode, format_bytes, tree_bytes, Context, OperationTally};
use anyhow::Result;
use cefs::image::{self, BuiltImage};
use cefs::transaction::{check_space, ensure_space, path_state, PathState};
use cefs::{
    backup_and_symlink, deploy_transactional, BackupCleanup, ContentEntry, Filter, Installable,
    Manifest, Operation,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Build images from a staging tree and deploy them
pub fn cmd_install(
    ctx: &Context,
    staging_root: &Path,
    filter: &Filter,
    dry_run: bool,
    defer_cleanup: bool,
) -> Result<()> {
    install_items(ctx, staging_root, filter, dry_run, cleanup_mode(defer_cleanup))
        .finish("installed", dry_run)
}

fn install_items(
    ctx: &Context,
    staging_root: &Path,
    filter: &Filter,
    dry_run: bool,
    cleanup: BackupCleanup,
) -> OperationTally {
    let mut tally = OperationTally::default();

    for item in ctx.registry.matching(filter) {
        let source = staged_source(ctx, staging_root, &item.destination);
        if !source.is_dir() {
            tally.skip(&item.name, format!("nothing staged at {}", source.display()));
            continue;
        }

        match deploy_directory(ctx, &item, &source, Operation::Install, dry_run, cleanup) {
            Ok(Deployed::Planned) => tally.success(&item.name),
            Ok(Deployed::Swapped(image)) => {
                println!("  installed {} -> {}", item.name, image.display());
                tally.success(&item.name);
            }
            Ok(Deployed::AlreadyCurrent) => {
                tally.skip(&item.name, "already points at an identical image")
            }
            Err(e) => tally.failure(&item.name, e),
        }
    }

    tally
}

/// Convert installed directories into images
pub fn cmd_convert(ctx: &Context, filter: &Filter, dry_run: bool, defer_cleanup: bool) -> Result<()> {
    let cleanup = cleanup_mode(defer_cleanup);
    let mut tally = OperationTally::default();

    for item in ctx.registry.matching(filter) {
        match path_state(&item.destination)? {
            PathState::Directory => {}
            PathState::Symlink(target) => {
                tally.skip(&item.name, format!("already a symlink to {}", target.display()));
                continue;
            }
            PathState::File => {
                tally.failure(
                    &item.name,
                    format!("{} is not a directory", item.destination.display()),
                );
                continue;
            }
            PathState::Missing => {
                tally.skip(&item.name, "not installed");
                continue;
            }
        }

        match deploy_directory(ctx, &item, &item.destination, Operation::Convert, dry_run, cleanup) {
            Ok(Deployed::Planned) => tally.success(&item.name),
            Ok(Deployed::Swapped(image)) => {
                println!("  converted {} -> {}", item.name, image.display());
                tally.success(&item.name);
            }
            Ok(Deployed::AlreadyCurrent) => tally.skip(&item.name, "already converted"),
            Err(e) => tally.failure(&item.name, e),
        }
    }

    tally.finish("converted", dry_run)
}

enum Deployed {
    /// Dry run: built in scratch space and reported
    Planned,
    Swapped(PathBuf),
    AlreadyCurrent,
}

/// `<staging_root>/<destination relative to the namespace root>`
fn staged_source(ctx: &Context, staging_root: &Path, destination: &Path) -> PathBuf {
    let relative = destination
        .strip_prefix(&ctx.layout.namespace_root)
        .unwrap_or_else(|_| cefs::paths::strip_root(destination));
    staging_root.join(relative)
}

/// Build one image from `source` and swap the installable's destination to it
///
/// The build always happens, into the scratch directory, so a dry run sees
/// the same hash and the same already-current decision as a real run. Each
/// destination gets its own image file even when its bytes match another's.
fn deploy_directory(
    ctx: &Context,
    item: &Installable,
    source: &Path,
    operation: Operation,
    dry_run: bool,
    cleanup: BackupCleanup,
) -> Result<Deployed> {
    info!("Building image for {} from {}", item.name, source.display());
    let built = image::build_from_dir(ctx.tool.as_ref(), source, ctx.work_dir())?;
    let mount = ctx.layout.mount_path(&built.hash, None);

    if let PathState::Symlink(current) = path_state(&item.destination)? {
        if ctx.layout.hash_from_mount_path(&current).as_ref() == Some(&built.hash) {
            debug!("{} already points at {}", item.destination.display(), mount.display());
            return Ok(Deployed::AlreadyCurrent);
        }
    }

    let image_path = ctx.layout.image_path(
        &built.hash,
        &ctx.layout
            .describe_suffix(operation.as_str(), Some(&item.destination)),
    );

    if dry_run {
        print_plan(ctx, item, source, operation, &built, &image_path)?;
        return Ok(Deployed::Planned);
    }

    if !image_path.exists() {
        ensure_space(&ctx.layout.image_root, built.size)?;
    }

    let manifest = Manifest::create(
        operation,
        format!("{} {}", operation, item.name),
        vec![ContentEntry::new(&item.name, &item.destination)],
        None,
    );

    deploy_transactional(built.path(), &image_path, &manifest, |_| -> Result<()> {
        backup_and_symlink(&item.destination, &mount, cleanup)?;
        Ok(())
    })?;

    Ok(Deployed::Swapped(image_path))
}

fn print_plan(
    ctx: &Context,
    item: &Installable,
    source: &Path,
    operation: Operation,
    built: &BuiltImage,
    image_path: &Path,
) -> Result<()> {
    let bytes = tree_bytes(source)?;
    let space = check_space(&ctx.layout.image_root, built.size)?;
    println!("  {} {}", operation, item.name);
    println!("    source:      {} ({})", source.display(), format_bytes(bytes));
    println!(
        "    destination: {} -> {}",
        item.destination.display(),
        ctx.layout.mount_path(&built.hash, None).display()
    );
    println!(
        "    image:       {} ({}{})",
        image_path.display(),
        format_bytes(built.size),
        if image_path.exists() { ", already present" } else { "" }
    );
    println!(
        "    free space:  {} available{}",
        format_bytes(space.available),
        if space.is_sufficient() { "" } else { " (INSUFFICIENT)" }
    );
    Ok(())
}
