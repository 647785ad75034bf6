//! Directory-set configuration.
//!
//! The engine is configured with a `;`-separated list of directories, one per
//! NUMA shard. Slice `k` of a logical file named `name` lives at
//! `<dir[k mod D]>/<name>.<k>`, so data is striped round-robin over the set.

use std::path::{Path, PathBuf};

use crate::store::constants::MAX_DIR_COUNT;
use crate::StoreError;

/// Parsed, validated set of storage directories.
#[derive(Debug, Clone)]
pub struct DirSet {
    paths: Vec<PathBuf>,
}

impl DirSet {
    /// Parse a `;`-separated directory list. Empty items are skipped.
    pub fn parse(list: &str) -> Result<Self, StoreError> {
        let paths: Vec<PathBuf> = list
            .split(';')
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
        if paths.is_empty() {
            return Err(StoreError::Config(format!(
                "no directories in {:?}",
                list
            )));
        }
        if paths.len() > MAX_DIR_COUNT {
            return Err(StoreError::Config(format!(
                "{} directories configured, at most {} supported",
                paths.len(),
                MAX_DIR_COUNT
            )));
        }
        Ok(DirSet { paths })
    }

    /// A single-directory set. Undo segments pin their slices to one shard
    /// for group affinity.
    pub fn single(path: &Path) -> Self {
        DirSet {
            paths: vec![path.to_path_buf()],
        }
    }

    /// Number of directory shards.
    pub fn count(&self) -> u32 {
        self.paths.len() as u32
    }

    /// Directory for shard `i` (callers stripe with `i mod count()`).
    pub fn path(&self, i: usize) -> &Path {
        &self.paths[i % self.paths.len()]
    }

    /// Remove and recreate every directory. Used by `Engine::init` only.
    pub fn recreate_all(&self) -> Result<(), StoreError> {
        for p in &self.paths {
            if p.exists() {
                std::fs::remove_dir_all(p).map_err(|e| {
                    StoreError::Io(format!("cannot clear {}: {}", p.display(), e))
                })?;
            }
            std::fs::create_dir_all(p).map_err(|e| {
                StoreError::Io(format!("cannot create {}: {}", p.display(), e))
            })?;
        }
        Ok(())
    }

    /// Verify every directory exists. Used by `Engine::bootstrap`.
    pub fn check_all(&self) -> Result<(), StoreError> {
        for p in &self.paths {
            if !p.is_dir() {
                return Err(StoreError::Config(format!(
                    "storage directory {} does not exist",
                    p.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single() {
        let d = DirSet::parse("/tmp/pm0").unwrap();
        assert_eq!(d.count(), 1);
        assert_eq!(d.path(0), Path::new("/tmp/pm0"));
        assert_eq!(d.path(5), Path::new("/tmp/pm0"));
    }

    #[test]
    fn test_parse_striped() {
        let d = DirSet::parse("/a;/b;/c").unwrap();
        assert_eq!(d.count(), 3);
        assert_eq!(d.path(4), Path::new("/b"));
    }

    #[test]
    fn test_parse_skips_empty_items() {
        let d = DirSet::parse("/a;;/b;").unwrap();
        assert_eq!(d.count(), 2);
    }

    #[test]
    fn test_parse_rejects_empty_and_oversized() {
        assert!(DirSet::parse("").is_err());
        assert!(DirSet::parse(";;").is_err());
        assert!(DirSet::parse("/a;/b;/c;/d;/e").is_err());
    }
}
