// src/registry.rs

//! Installable registry and name filters
//!
//! The registry maps a logical installable name to its destination in the
//! namespace and answers "does this look installed?", which is how rollback
//! validates its result. The production registry is the `[[installables]]`
//! list from the configuration file.

use crate::config::CefsConfig;
use std::fs;
use std::path::{Path, PathBuf};

/// One logical installable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installable {
    pub name: String,
    pub destination: PathBuf,
}

pub trait InstallableRegistry {
    /// Every known installable, in registry order
    fn installables(&self) -> Vec<Installable>;

    fn destination(&self, name: &str) -> Option<PathBuf> {
        self.installables()
            .into_iter()
            .find(|i| i.name == name)
            .map(|i| i.destination)
    }

    fn is_installed(&self, name: &str) -> bool;

    /// Installables whose names match `filter`
    fn matching(&self, filter: &Filter) -> Vec<Installable> {
        self.installables()
            .into_iter()
            .filter(|i| filter.matches(&i.name))
            .collect()
    }
}

/// Registry backed by the configuration file
#[derive(Debug, Clone, Default)]
pub struct ConfigRegistry {
    items: Vec<Installable>,
}

impl ConfigRegistry {
    pub fn new(items: Vec<Installable>) -> Self {
        Self { items }
    }

    pub fn from_config(config: &CefsConfig) -> Self {
        Self::new(
            config
                .installables
                .iter()
                .map(|i| Installable {
                    name: i.name.clone(),
                    destination: i.destination.clone(),
                })
                .collect(),
        )
    }
}

impl InstallableRegistry for ConfigRegistry {
    fn installables(&self) -> Vec<Installable> {
        self.items.clone()
    }

    /// Installed when the destination resolves to a non-empty directory
    fn is_installed(&self, name: &str) -> bool {
        self.destination(name)
            .is_some_and(|dest| is_populated_dir(&dest))
    }
}

/// Follows symlinks, so a CEFS-backed destination is read through its mount
fn is_populated_dir(path: &Path) -> bool {
    fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_some())
}

/// Conjunction of substring terms; the empty filter matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    terms: Vec<String>,
}

impl Filter {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            terms: terms
                .into_iter()
                .map(Into::into)
                .filter(|t: &String| !t.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.terms.iter().all(|t| name.contains(t.as_str()))
    }

    /// True when any of `names` matches
    pub fn matches_any<'a, I>(&self, names: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.is_empty() || names.into_iter().any(|n| self.matches(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_filter() {
        let filter = Filter::new(["gcc", "13"]);
        assert!(filter.matches("compilers/c++/x86/gcc 13.1.0"));
        assert!(!filter.matches("compilers/c++/x86/gcc 12.2.0"));
        assert!(Filter::default().matches("anything"));
        assert!(Filter::new([""]).is_empty());

        assert!(filter.matches_any(["libs/boost 1.84", "compilers/gcc 13.2.0"]));
        assert!(!filter.matches_any(Vec::<&str>::new()));
        assert!(Filter::default().matches_any(Vec::<&str>::new()));
    }

    #[test]
    fn test_is_installed() {
        let temp_dir = TempDir::new().unwrap();
        let full = temp_dir.path().join("full");
        let empty = temp_dir.path().join("empty");
        fs::create_dir_all(&full).unwrap();
        fs::write(full.join("bin"), b"x").unwrap();
        fs::create_dir_all(&empty).unwrap();

        let registry = ConfigRegistry::new(vec![
            Installable {
                name: "tools/full 1".to_string(),
                destination: full.clone(),
            },
            Installable {
                name: "tools/empty 1".to_string(),
                destination: empty,
            },
            Installable {
                name: "tools/missing 1".to_string(),
                destination: temp_dir.path().join("missing"),
            },
        ]);

        assert!(registry.is_installed("tools/full 1"));
        assert!(!registry.is_installed("tools/empty 1"));
        assert!(!registry.is_installed("tools/missing 1"));
        assert!(!registry.is_installed("tools/unknown 1"));
        assert_eq!(registry.destination("tools/full 1"), Some(full));
        assert_eq!(registry.matching(&Filter::new(["full"])).len(), 1);
    }
}
