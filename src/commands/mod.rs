// src/commands/mod.rs
//! Command handlers for the CEFS CLI

mod consolidate;
mod deploy;
mod fsck;
mod repair;
mod restore;

pub use consolidate::cmd_consolidate;
pub use deploy::{cmd_convert, cmd_install};
pub use fsck::{cmd_fsck, cmd_usage};
pub use repair::cmd_repair;
pub use restore::{cmd_rollback, cmd_unpack};

use anyhow::Result;
use cefs::{
    BackupCleanup, CefsConfig, ConfigRegistry, ImageTool, InstallableRegistry, SquashfsTool,
    StoreLayout,
};
use std::fmt::Display;
use std::path::Path;
use walkdir::WalkDir;

/// Everything a command needs, built once in `main`
pub struct Context {
    pub config: CefsConfig,
    pub layout: StoreLayout,
    pub tool: Box<dyn ImageTool>,
    pub registry: Box<dyn InstallableRegistry>,
}

impl Context {
    pub fn new(config: CefsConfig) -> Self {
        let tool = Box::new(SquashfsTool::new(&config.squashfs));
        let registry = Box::new(ConfigRegistry::from_config(&config));
        Self::with_parts(config, tool, registry)
    }

    pub fn with_parts(
        config: CefsConfig,
        tool: Box<dyn ImageTool>,
        registry: Box<dyn InstallableRegistry>,
    ) -> Self {
        Self {
            layout: StoreLayout::from_config(&config),
            config,
            tool,
            registry,
        }
    }

    /// Scratch directory for builds and extraction staging
    pub fn work_dir(&self) -> &Path {
        &self.config.local_temp_dir
    }
}

/// Per-item results of one command
#[derive(Debug, Default)]
pub struct OperationTally {
    pub succeeded: Vec<String>,
    pub skipped: Vec<(String, String)>,
    pub failed: Vec<(String, String)>,
}

impl OperationTally {
    pub fn success(&mut self, name: impl Into<String>) {
        self.succeeded.push(name.into());
    }

    pub fn skip(&mut self, name: impl Into<String>, reason: impl Display) {
        let name = name.into();
        println!("  skip {}: {}", name, reason);
        self.skipped.push((name, reason.to_string()));
    }

    pub fn failure(&mut self, name: impl Into<String>, error: impl Display) {
        let name = name.into();
        let message = error.to_string();
        tracing::error!("{}: {}", name, message);
        println!("  FAILED {}: {}", name, message);
        self.failed.push((name, message));
    }

    /// Print the tally and turn any failure into an error for a non-zero exit
    pub fn finish(self, verb: &str, dry_run: bool) -> Result<()> {
        let prefix = if dry_run { "[dry run] would have " } else { "" };
        println!();
        println!(
            "{}{} {}, skipped {}, failed {}",
            prefix,
            verb,
            self.succeeded.len(),
            self.skipped.len(),
            self.failed.len()
        );
        if self.failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("{} item(s) failed", self.failed.len()))
        }
    }
}

pub fn cleanup_mode(defer_cleanup: bool) -> BackupCleanup {
    if defer_cleanup {
        BackupCleanup::Deferred
    } else {
        BackupCleanup::Immediate
    }
}

/// Total bytes of regular files under `root`, not following links
pub fn tree_bytes(root: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
#[path = "../../tests/common/mod.rs"]
mod fixtures;
