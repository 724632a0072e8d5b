// src/main.rs

mod cli;
mod commands;

use anyhow::{Context as _, Result};
use cefs::{CefsConfig, Filter, SquashfsTool};
use clap::Parser;
use cli::{Cli, Commands, GlobalArgs};
use commands::Context;
use tracing::debug;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing subscriber for logging
    let default_level = if cli.global.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = load_config(&cli.global)?;
    debug!(
        "Store: images={} mount={} namespace={}",
        config.image_root.display(),
        config.mount_point.display(),
        config.namespace_root.display()
    );
    if needs_image_tool(&cli.command) {
        SquashfsTool::new(&config.squashfs).check()?;
    }
    let ctx = Context::new(config);

    match cli.command {
        Commands::Install {
            staging_root,
            selection,
            defer_cleanup,
        } => commands::cmd_install(
            &ctx,
            &staging_root,
            &Filter::new(selection.filter),
            selection.dry_run,
            defer_cleanup,
        ),
        Commands::Convert {
            selection,
            defer_cleanup,
        } => commands::cmd_convert(
            &ctx,
            &Filter::new(selection.filter),
            selection.dry_run,
            defer_cleanup,
        ),
        Commands::Consolidate {
            selection,
            max_size,
            min_items,
        } => commands::cmd_consolidate(
            &ctx,
            &Filter::new(selection.filter),
            selection.dry_run,
            max_size,
            min_items,
        ),
        Commands::Rollback { selection } => {
            commands::cmd_rollback(&ctx, &Filter::new(selection.filter), selection.dry_run)
        }
        Commands::Unpack {
            selection,
            defer_cleanup,
        } => commands::cmd_unpack(
            &ctx,
            &Filter::new(selection.filter),
            selection.dry_run,
            defer_cleanup,
        ),
        Commands::Repair {
            selection,
            min_age_secs,
        } => commands::cmd_repair(
            &ctx,
            &Filter::new(selection.filter),
            selection.dry_run,
            min_age_secs,
        ),
        Commands::Fsck { filter } => commands::cmd_fsck(&ctx, &Filter::new(filter)),
        Commands::Usage => commands::cmd_usage(&ctx),
    }
}

/// Commands that will build or extract an image
///
/// Install and convert build into scratch space even on a dry run, to learn
/// the content hash.
fn needs_image_tool(command: &Commands) -> bool {
    match command {
        Commands::Install { .. } | Commands::Convert { .. } => true,
        Commands::Consolidate { selection, .. }
        | Commands::Unpack { selection, .. } => !selection.dry_run,
        Commands::Rollback { .. }
        | Commands::Repair { .. }
        | Commands::Fsck { .. }
        | Commands::Usage => false,
    }
}

/// Configuration file plus command-line root overrides
fn load_config(global: &GlobalArgs) -> Result<CefsConfig> {
    let mut config = CefsConfig::load(global.config.as_deref()).with_context(|| {
        format!(
            "loading configuration{}",
            global
                .config
                .as_ref()
                .map(|p| format!(" from {}", p.display()))
                .unwrap_or_default()
        )
    })?;

    if let Some(root) = &global.image_root {
        config.image_root = root.clone();
    }
    if let Some(root) = &global.mount_point {
        config.mount_point = root.clone();
    }
    if let Some(root) = &global.namespace_root {
        config.namespace_root = root.clone();
    }

    config.validate()?;
    Ok(config)
}
