// src/commands/consolidate.rs
//! Merge many single-content images into consolidated images

use super::{format_bytes, Context, OperationTally};
use anyhow::{anyhow, Result};
use cefs::catalog::plan_pack_list;
use cefs::paths::{strip_root, CONSOLIDATED_SUFFIX};
use cefs::transaction::{check_space, ensure_space, path_state, required_space, PathState};
use cefs::{
    backup_and_symlink, deploy_transactional, BackupCleanup, Catalog, ContentEntry, Filter,
    Manifest, Operation, SymlinkSnapshot,
};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// An installable currently served from a single-content image
#[derive(Debug, Clone)]
struct Member {
    name: String,
    destination: PathBuf,
    /// Current symlink target (a mount path)
    target: PathBuf,
    /// Path of the destination inside the consolidated image
    subpath: PathBuf,
    image_size: u64,
}

/// Consolidate matched installables into as few images as the limits allow
pub fn cmd_consolidate(
    ctx: &Context,
    filter: &Filter,
    dry_run: bool,
    max_size: Option<u64>,
    min_items: Option<usize>,
) -> Result<()> {
    let max_size = max_size.unwrap_or(ctx.config.consolidation.max_image_size);
    let min_items = min_items.unwrap_or(ctx.config.consolidation.min_items);
    let mut tally = OperationTally::default();

    let members = collect_members(ctx, filter, &mut tally)?;
    let groups = group_by_size(members, max_size);
    info!(
        "Consolidating into {} group(s), max {} per image",
        groups.len(),
        format_bytes(max_size)
    );

    for (index, group) in groups.into_iter().enumerate() {
        if group.len() < min_items {
            for member in &group {
                tally.skip(
                    &member.name,
                    format!("group of {} is below the minimum of {}", group.len(), min_items),
                );
            }
            continue;
        }

        println!("Group {} ({} items)", index + 1, group.len());
        let result = if dry_run {
            print_plan(ctx, &group)
        } else {
            consolidate_group(ctx, &group).map(|failures| {
                for (name, reason) in failures {
                    tally.failure(name, reason);
                }
            })
        };

        match result {
            Ok(()) => {
                for member in &group {
                    if !tally.failed.iter().any(|(name, _)| name == &member.name) {
                        tally.success(&member.name);
                    }
                }
            }
            Err(e) => {
                for member in &group {
                    tally.failure(&member.name, &e);
                }
                // Structural catalog errors would repeat for every group
                if e
                    .downcast_ref::<cefs::Error>()
                    .is_some_and(cefs::Error::is_catalog_violation)
                {
                    break;
                }
            }
        }
    }

    tally.finish("consolidated", dry_run)
}

/// Matched installables whose destination is a symlink to a whole image
fn collect_members(ctx: &Context, filter: &Filter, tally: &mut OperationTally) -> Result<Vec<Member>> {
    let mut members = Vec::new();

    for item in ctx.registry.matching(filter) {
        let target = match path_state(&item.destination)? {
            PathState::Symlink(target) if ctx.layout.is_under_mount(&target) => target,
            PathState::Missing => {
                tally.skip(&item.name, "not installed");
                continue;
            }
            _ => {
                tally.skip(&item.name, "not backed by CEFS");
                continue;
            }
        };

        let parsed = match ctx.layout.parse_target(&target) {
            Ok(parsed) => parsed,
            Err(e) => {
                tally.failure(&item.name, e);
                continue;
            }
        };
        if parsed.is_consolidated {
            tally.skip(&item.name, "already consolidated");
            continue;
        }

        let subpath = item
            .destination
            .strip_prefix(&ctx.layout.namespace_root)
            .unwrap_or_else(|_| strip_root(&item.destination))
            .to_path_buf();
        members.push(Member {
            name: item.name,
            destination: item.destination,
            target,
            subpath,
            image_size: fs::metadata(&parsed.image_path)?.len(),
        });
    }

    Ok(members)
}

/// Pack members greedily in order, starting a new group when the summed
/// image size would exceed `max_size`
fn group_by_size(members: Vec<Member>, max_size: u64) -> Vec<Vec<Member>> {
    let mut groups = Vec::new();
    let mut current: Vec<Member> = Vec::new();
    let mut current_size = 0;

    for member in members {
        if !current.is_empty() && current_size + member.image_size > max_size {
            groups.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += member.image_size;
        current.push(member);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

fn catalog_for(ctx: &Context, group: &[Member]) -> Result<Catalog> {
    let mut catalog = Catalog::new(&ctx.layout.mount_point)
        .with_description(format!("consolidation of {} items", group.len()));
    for member in group {
        catalog.link_path(&member.subpath, &member.target)?;
    }
    Ok(catalog)
}

fn print_plan(ctx: &Context, group: &[Member]) -> Result<()> {
    let plan = plan_pack_list(&catalog_for(ctx, group)?.participants())?;
    let required = required_space(plan.source_bytes, ctx.config.consolidation.space_factor);
    let space = check_space(ctx.work_dir(), required)?;

    for member in group {
        println!(
            "  {} -> <hash>/{}",
            member.destination.display(),
            member.subpath.display()
        );
    }
    println!("    image:       <hash>_{}.sqfs", CONSOLIDATED_SUFFIX);
    println!(
        "    pack list:   {} entries, {}",
        plan.list.len(),
        format_bytes(plan.source_bytes)
    );
    println!(
        "    free space:  need {}, {} available{}",
        format_bytes(required),
        format_bytes(space.available),
        if space.is_sufficient() { "" } else { " (INSUFFICIENT)" }
    );
    Ok(())
}

/// Build and deploy one consolidated image
///
/// Returns the members left untouched because their destination changed
/// while the image was being built. When every member changed, nothing is
/// copied into the store.
fn consolidate_group(ctx: &Context, group: &[Member]) -> Result<Vec<(String, String)>> {
    let mut catalog = catalog_for(ctx, group)?;
    let plan = plan_pack_list(&catalog.participants())?;
    ensure_space(
        ctx.work_dir(),
        required_space(plan.source_bytes, ctx.config.consolidation.space_factor),
    )?;

    let snapshot = SymlinkSnapshot::take(group.iter().map(|m| &m.destination))?;
    let built = catalog.consolidate(ctx.tool.as_ref(), &ctx.layout, ctx.work_dir())?;
    let image_path = ctx.layout.image_path(&built.hash, CONSOLIDATED_SUFFIX);

    if snapshot.verify_unchanged()?.unchanged.is_empty() {
        warn!("Every destination changed while building {}", built.hash);
        return Err(anyhow!(
            "all {} destinations changed during the build; nothing deployed",
            group.len()
        ));
    }
    if !image_path.exists() {
        ensure_space(&ctx.layout.image_root, built.size)?;
    }

    let manifest = Manifest::create(
        Operation::Consolidate,
        catalog.description(),
        group
            .iter()
            .map(|m| ContentEntry::new(&m.name, &m.destination))
            .collect(),
        None,
    );

    deploy_transactional(built.path(), &image_path, &manifest, |_| -> Result<_> {
        let verification = snapshot.verify_unchanged()?;
        let mut left_alone = Vec::new();
        let mut swapped = 0;

        for member in group {
            if let Some((_, change)) = verification
                .changed
                .iter()
                .find(|(path, _)| path == &member.destination)
            {
                warn!("{} changed during consolidation: {:?}", member.destination.display(), change);
                left_alone.push((member.name.clone(), format!("changed concurrently: {:?}", change)));
                continue;
            }

            let new_target = catalog
                .get(&member.subpath)
                .ok_or_else(|| anyhow!("{} missing from catalog", member.subpath.display()))?;
            match backup_and_symlink(&member.destination, new_target, BackupCleanup::Deferred) {
                Ok(()) => swapped += 1,
                Err(e) => left_alone.push((member.name.clone(), e.to_string())),
            }
        }

        if swapped == 0 {
            return Err(anyhow!("no destination could be switched to the consolidated image"));
        }
        Ok(left_alone)
    })
    .inspect(|_| println!("  deployed {}", image_path.display()))
}
