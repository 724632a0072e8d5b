// src/transaction/snapshot.rs

//! Detect concurrent changes to namespace symlinks
//!
//! There is no cross-process lock. A long operation (consolidation) records
//! the symlink targets it is about to replace, does its work, then checks
//! nothing moved underneath it before swapping.

use super::swap::{path_state, PathState};
use crate::error::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Targets of a set of namespace paths at one moment
#[derive(Debug, Clone, Default)]
pub struct SymlinkSnapshot {
    /// `None` when the path was not a symlink at snapshot time
    targets: BTreeMap<PathBuf, Option<PathBuf>>,
}

/// How a snapshotted path differs now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotChange {
    /// Still a symlink, different target
    Retargeted { before: PathBuf, after: PathBuf },
    /// Was a symlink, now gone
    Disappeared { before: PathBuf },
    /// Was a symlink, now a directory or file
    NoLongerSymlink { before: PathBuf },
    /// Was not a symlink, now is one
    Appeared { after: PathBuf },
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotVerification {
    pub unchanged: Vec<PathBuf>,
    pub changed: Vec<(PathBuf, SnapshotChange)>,
}

impl SnapshotVerification {
    pub fn is_clean(&self) -> bool {
        self.changed.is_empty()
    }

    pub fn is_changed(&self, path: &Path) -> bool {
        self.changed.iter().any(|(p, _)| p == path)
    }
}

impl SymlinkSnapshot {
    /// Record the current target of every path
    pub fn take<I, P>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut targets = BTreeMap::new();
        for path in paths {
            let path = path.as_ref();
            let target = match path_state(path)? {
                PathState::Symlink(target) => Some(target),
                _ => None,
            };
            targets.insert(path.to_path_buf(), target);
        }
        Ok(Self { targets })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Target recorded for a path; outer `None` if the path was not snapshotted
    pub fn get(&self, path: &Path) -> Option<Option<&Path>> {
        self.targets.get(path).map(|t| t.as_deref())
    }

    /// Compare every recorded path against its current state
    pub fn verify_unchanged(&self) -> Result<SnapshotVerification> {
        let mut verification = SnapshotVerification::default();

        for (path, before) in &self.targets {
            let now = path_state(path)?;
            let change = match (before, now) {
                (Some(before), PathState::Symlink(after)) if &after == before => None,
                (Some(before), PathState::Symlink(after)) => Some(SnapshotChange::Retargeted {
                    before: before.clone(),
                    after,
                }),
                (Some(before), PathState::Missing) => Some(SnapshotChange::Disappeared {
                    before: before.clone(),
                }),
                (Some(before), _) => Some(SnapshotChange::NoLongerSymlink {
                    before: before.clone(),
                }),
                (None, PathState::Symlink(after)) => Some(SnapshotChange::Appeared { after }),
                (None, _) => None,
            };

            match change {
                Some(change) => {
                    warn!("{} changed during operation: {:?}", path.display(), change);
                    verification.changed.push((path.clone(), change));
                }
                None => verification.unchanged.push(path.clone()),
            }
        }

        Ok(verification)
    }
}
