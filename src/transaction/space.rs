// src/transaction/space.rs

//! Free space pre-flight checks

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Result of comparing free space against an estimate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceCheck {
    pub path: PathBuf,
    pub required: u64,
    pub available: u64,
}

impl SpaceCheck {
    pub fn is_sufficient(&self) -> bool {
        self.available >= self.required
    }
}

/// Bytes to demand before building from `source_bytes` of input
pub fn required_space(source_bytes: u64, factor: f64) -> u64 {
    (source_bytes as f64 * factor).ceil() as u64
}

/// Measure free space on the filesystem holding `dir`
///
/// `dir` need not exist yet; its nearest existing ancestor is measured.
pub fn check_space(dir: &Path, required: u64) -> Result<SpaceCheck> {
    let probe = dir
        .ancestors()
        .find(|p| p.exists())
        .ok_or_else(|| Error::NotFound(format!("no existing ancestor of {}", dir.display())))?;
    let available = fs2::available_space(probe)?;

    debug!(
        "Space check on {}: need {} bytes, {} available",
        probe.display(),
        required,
        available
    );
    Ok(SpaceCheck {
        path: dir.to_path_buf(),
        required,
        available,
    })
}

/// Like [`check_space`] but insufficient space is an error
pub fn ensure_space(dir: &Path, required: u64) -> Result<SpaceCheck> {
    let check = check_space(dir, required)?;
    if !check.is_sufficient() {
        return Err(Error::InsufficientSpace {
            path: check.path,
            required: check.required,
            available: check.available,
        });
    }
    Ok(check)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_required_space() {
        assert_eq!(required_space(1000, 2.0), 2000);
        assert_eq!(required_space(3, 1.5), 5);
    }

    #[test]
    fn test_small_request_fits() {
        let temp_dir = TempDir::new().unwrap();
        let check = check_space(&temp_dir.path().join("not/yet/created"), 1).unwrap();
        assert!(check.is_sufficient());
        assert!(ensure_space(temp_dir.path(), 0).is_ok());
    }

    #[test]
    fn test_impossible_request_fails() {
        let temp_dir = TempDir::new().unwrap();
        let err = ensure_space(temp_dir.path(), u64::MAX).unwrap_err();
        assert!(matches!(err, Error::InsufficientSpace { .. }));
    }
}
