// src/lib.rs

//! CEFS: content-addressed squashfs layer store
//!
//! Large immutable installations (compilers, libraries) are stored once as
//! squashfs images named by their content hash and exposed through
//! on-access mounts. The logical namespace is a tree of symlinks into those
//! mounts, so installs and rollbacks are symlink swaps.
//!
//! # Architecture
//!
//! - Content addressing: image identity is a truncated SHA-256 of its bytes
//! - Sidecar manifests: every image carries a YAML record of what it holds
//! - Transactions: atomic placement, in-progress manifest, symlink swap, finalize
//! - Repair: interrupted transactions are classified and fixed from disk state
//! - Consolidation: many small images are merged through a pack list

pub mod catalog;
pub mod config;
mod error;
pub mod fsck;
pub mod hash;
pub mod image;
pub mod manifest;
pub mod paths;
pub mod registry;
pub mod transaction;
pub mod usage;

pub use catalog::Catalog;
pub use config::CefsConfig;
pub use error::{Error, Result};
pub use hash::ContentHash;
pub use image::{BuiltImage, ImageTool, PackList, SquashfsTool};
pub use manifest::{ContentEntry, Manifest, ManifestValidation, Operation};
pub use paths::StoreLayout;
pub use registry::{ConfigRegistry, Filter, Installable, InstallableRegistry};
pub use transaction::{
    backup_and_symlink, copy_image_atomically, deploy_transactional, rollback_from_backup,
    BackupCleanup, DeployTransaction, Repairer, SymlinkSnapshot, TransactionStatus,
};
