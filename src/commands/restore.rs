// src/commands/restore.rs
//! Rollback and unpack: take a destination back off its current image

use super::{cleanup_mode, Context, OperationTally};
use anyhow::{anyhow, Result};
use cefs::paths::backup_path;
use cefs::transaction::{backup_and_replace, path_state, PathState};
use cefs::{rollback_from_backup, BackupCleanup, Filter, Installable};
use std::path::Path;
use tracing::info;

/// Restore matched installables from their `.bak`
pub fn cmd_rollback(ctx: &Context, filter: &Filter, dry_run: bool) -> Result<()> {
    let mut tally = OperationTally::default();

    for item in ctx.registry.matching(filter) {
        let backup = backup_path(&item.destination);
        let backup_state = path_state(&backup)?;
        if !backup_state.exists() {
            tally.failure(&item.name, format!("no backup at {}", backup.display()));
            continue;
        }

        if dry_run {
            println!(
                "  {}: {} -> {} ({})",
                item.name,
                backup.display(),
                item.destination.display(),
                describe(&backup_state)
            );
            tally.success(&item.name);
            continue;
        }

        let result = rollback_from_backup(&item.destination, BackupCleanup::Deferred)
            .map_err(anyhow::Error::from)
            .and_then(|()| {
                if ctx.registry.is_installed(&item.name) {
                    Ok(())
                } else {
                    Err(anyhow!(
                        "rolled back but {} does not look installed",
                        item.destination.display()
                    ))
                }
            });
        match result {
            Ok(()) => {
                println!("  rolled back {}", item.name);
                tally.success(&item.name);
            }
            Err(e) => tally.failure(&item.name, e),
        }
    }

    tally.finish("rolled back", dry_run)
}

/// Replace matched CEFS symlinks with real directories
pub fn cmd_unpack(ctx: &Context, filter: &Filter, dry_run: bool, defer_cleanup: bool) -> Result<()> {
    let cleanup = cleanup_mode(defer_cleanup);
    let mut tally = OperationTally::default();

    for item in ctx.registry.matching(filter) {
        let target = match path_state(&item.destination)? {
            PathState::Symlink(target) if ctx.layout.is_under_mount(&target) => target,
            PathState::Missing => {
                tally.skip(&item.name, "not installed");
                continue;
            }
            _ => {
                tally.skip(&item.name, "not a CEFS symlink");
                continue;
            }
        };

        match unpack_one(ctx, &item, &target, dry_run, cleanup) {
            Ok(()) => tally.success(&item.name),
            Err(e) => tally.failure(&item.name, e),
        }
    }

    tally.finish("unpacked", dry_run)
}

fn unpack_one(
    ctx: &Context,
    item: &Installable,
    target: &Path,
    dry_run: bool,
    cleanup: BackupCleanup,
) -> Result<()> {
    let parsed = ctx.layout.parse_target(target)?;
    let subpath = if parsed.is_consolidated {
        Some(target.strip_prefix(ctx.layout.mount_path(&parsed.hash, None))?)
    } else {
        None
    };

    if dry_run {
        println!(
            "  {}: extract {}{} into {}",
            item.name,
            parsed.image_path.display(),
            subpath.map(|s| format!(":/{}", s.display())).unwrap_or_default(),
            item.destination.display()
        );
        return Ok(());
    }

    // Staged next to the destination so the final rename stays on one filesystem
    let parent = item
        .destination
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent", item.destination.display()))?;
    let staging = tempfile::Builder::new()
        .prefix(".cefs-unpack-")
        .tempdir_in(parent)?;
    let extracted = ctx.tool.extract(
        &parsed.image_path,
        &staging.path().join("content"),
        subpath,
    )?;

    backup_and_replace(&item.destination, &extracted, cleanup)?;
    info!("Unpacked {} from {}", item.name, parsed.image_path.display());
    println!("  unpacked {}", item.name);
    Ok(())
}

fn describe(state: &PathState) -> String {
    match state {
        PathState::Symlink(target) => format!("symlink to {}", target.display()),
        PathState::Directory => "directory".to_string(),
        PathState::File => "file".to_string(),
        PathState::Missing => "missing".to_string(),
    }
}
