// src/cli/mod.rs
//! CLI definitions for the CEFS store
//!
//! This module contains the command-line interface definitions using clap.
//! The command implementations are in the `commands` module.
//!
//! Mutating commands take filter terms and `--dry-run`:
//! - `install` - Build images from a staging tree and deploy them
//! - `convert` - Turn installed directories into images
//! - `consolidate` - Merge single-content images
//! - `rollback` - Restore from `.bak`
//! - `unpack` - Replace symlinks with real directories
//! - `repair` - Fix interrupted transactions
//!
//! Read-only:
//! - `fsck` - Manifest and leftover check
//! - `usage` - Usage and wasted space report

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cefs")]
#[command(author = "CEFS Contributors")]
#[command(version)]
#[command(about = "Content-addressed squashfs layer store", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Configuration file (default: /etc/cefs/cefs.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the image root
    #[arg(long, global = true)]
    pub image_root: Option<PathBuf>,

    /// Override the mount point
    #[arg(long, global = true)]
    pub mount_point: Option<PathBuf>,

    /// Override the namespace root
    #[arg(long, global = true)]
    pub namespace_root: Option<PathBuf>,

    /// Debug logging (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Filter and dry-run flags shared by mutating commands
#[derive(Args, Debug, Clone, Default)]
pub struct Selection {
    /// Filter terms; every term must appear in the installable name
    pub filter: Vec<String>,

    /// Show what would happen without changing anything
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build images from a staging tree and deploy them
    Install {
        /// Staging tree laid out like the namespace root
        staging_root: PathBuf,

        #[command(flatten)]
        selection: Selection,

        /// Rename replaced entries to .DELETE_ME_<timestamp> instead of deleting them
        #[arg(long)]
        defer_cleanup: bool,
    },

    /// Convert installed directories into CEFS images
    Convert {
        #[command(flatten)]
        selection: Selection,

        /// Rename replaced entries to .DELETE_ME_<timestamp> instead of deleting them
        #[arg(long)]
        defer_cleanup: bool,
    },

    /// Merge many single-content images into consolidated images
    Consolidate {
        #[command(flatten)]
        selection: Selection,

        /// Maximum summed image bytes per consolidated image
        #[arg(long)]
        max_size: Option<u64>,

        /// Minimum items per consolidated image
        #[arg(long)]
        min_items: Option<usize>,
    },

    /// Restore installables from their .bak backups
    Rollback {
        #[command(flatten)]
        selection: Selection,
    },

    /// Replace CEFS symlinks with real directories
    Unpack {
        #[command(flatten)]
        selection: Selection,

        /// Rename replaced entries to .DELETE_ME_<timestamp> instead of deleting them
        #[arg(long)]
        defer_cleanup: bool,
    },

    /// Classify and fix interrupted transactions
    Repair {
        #[command(flatten)]
        selection: Selection,

        /// Minimum transaction age in seconds (overrides configuration)
        #[arg(long)]
        min_age_secs: Option<u64>,
    },

    /// Check manifests and report stale leftovers
    Fsck {
        /// Filter terms matched against manifest content names
        filter: Vec<String>,
    },

    /// Report image usage and wasted space
    Usage,
}
