// src/error.rs

//! Error types for the CEFS store
//!
//! One enum covers every failure the library can report. Transaction
//! classifications produced by repair (too recent, conflicted, ...) are
//! values of [`crate::transaction::TransactionStatus`], not errors.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A rendered catalog directory violates the catalog layout
    #[error("Bad image: {0}")]
    BadImage(String),

    /// A catalog link points outside the configured mount root
    #[error("Bad link {subpath}: target {target} is not under {mount_point}")]
    BadLink {
        subpath: PathBuf,
        target: PathBuf,
        mount_point: PathBuf,
    },

    /// The external image tool exited non-zero
    #[error("{tool} failed ({status}): {stderr}")]
    BuildFailure {
        tool: String,
        status: String,
        stderr: String,
    },

    /// A referenced path, image or binary does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A path does not have the expected CEFS shape
    #[error("Format error: {0}")]
    FormatError(String),

    /// The OS refused the symlink swap; the previous state has been restored
    #[error("Symlink swap failed for {path}: {source}")]
    SymlinkFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Pre-flight free space check failed
    #[error("Insufficient space in {path}: need {required} bytes, {available} available")]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// Finalize was requested but no in-progress sidecar exists
    #[error("No in-progress manifest at {0}")]
    MissingInProgress(PathBuf),

    /// A manifest sidecar could not be parsed
    #[error("Failed to parse manifest {path}: {source}")]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Rollback requested for a path with no `.bak`
    #[error("Nothing to roll back: {0} has no backup")]
    NothingToRollback(PathBuf),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True for errors the catalog raises on structural violations
    pub fn is_catalog_violation(&self) -> bool {
        matches!(self, Self::BadImage(_) | Self::BadLink { .. })
    }
}
