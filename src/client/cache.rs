//! Change detection for the local project.
//!
//! Digests of the requested key list and of the bibliography file are kept
//! next to the bibliography, so a project whose keys and file are unchanged
//! since the last successful sync skips the server round trip.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::Result;

/// SHA-256 of `bytes`, hex encoded.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Order- and duplicate-insensitive digest of a key list.
pub fn keys_digest(keys: &[String]) -> String {
    let mut sorted: Vec<&str> = keys.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    digest(sorted.join("\n").as_bytes())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("references.bib"));
    name.push(suffix);
    path.with_file_name(name)
}

/// Digest files for one bibliography.
#[derive(Debug, Clone)]
pub struct ChangeCache {
    bib_path: PathBuf,
    keys_digest_path: PathBuf,
    bib_digest_path: PathBuf,
}

/// What changed since the last recorded sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Changes {
    pub keys: bool,
    pub bibliography: bool,
}

impl ChangeCache {
    pub fn for_bibliography(bib_path: &Path) -> Self {
        Self {
            bib_path: bib_path.to_path_buf(),
            keys_digest_path: sibling(bib_path, ".keys.sha256"),
            bib_digest_path: sibling(bib_path, ".sha256"),
        }
    }

    fn stored(path: &Path) -> Option<String> {
        fs::read_to_string(path).ok().map(|s| s.trim().to_string())
    }

    fn current_bib_digest(&self) -> Result<Option<String>> {
        if !self.bib_path.exists() {
            return Ok(None);
        }
        Ok(Some(digest(&fs::read(&self.bib_path)?)))
    }

    /// Compare the key list and the bibliography with the recorded digests.
    ///
    /// A missing bibliography has nothing to push, so it never counts as
    /// changed.
    pub fn changes(&self, keys: &[String]) -> Result<Changes> {
        let keys = Self::stored(&self.keys_digest_path).as_deref() != Some(keys_digest(keys).as_str());

        let bibliography = match self.current_bib_digest()? {
            None => false,
            Some(current) => Self::stored(&self.bib_digest_path).as_deref() != Some(current.as_str()),
        };

        Ok(Changes { keys, bibliography })
    }

    /// Record the key list and the bibliography as synced.
    pub fn record(&self, keys: &[String]) -> Result<()> {
        fs::write(&self.keys_digest_path, keys_digest(keys))?;
        if let Some(current) = self.current_bib_digest()? {
            fs::write(&self.bib_digest_path, current)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_keys_digest_ignores_order_and_repeats() {
        assert_eq!(
            keys_digest(&keys(&["b", "a", "a"])),
            keys_digest(&keys(&["a", "b"]))
        );
        assert_ne!(keys_digest(&keys(&["a"])), keys_digest(&keys(&["a", "b"])));
    }

    #[test]
    fn test_first_run_then_unchanged_then_edited() {
        let temp = TempDir::new().unwrap();
        let bib = temp.path().join("refs.bib");
        fs::write(&bib, "@misc{a, title = {A}}\n").unwrap();
        let cache = ChangeCache::for_bibliography(&bib);
        let wanted = keys(&["a"]);

        assert_eq!(
            cache.changes(&wanted).unwrap(),
            Changes {
                keys: true,
                bibliography: true
            }
        );

        cache.record(&wanted).unwrap();
        assert!(temp.path().join("refs.bib.sha256").exists());
        assert!(temp.path().join("refs.bib.keys.sha256").exists());
        assert_eq!(
            cache.changes(&wanted).unwrap(),
            Changes {
                keys: false,
                bibliography: false
            }
        );

        fs::write(&bib, "@misc{a, title = {A2}}\n").unwrap();
        assert!(cache.changes(&wanted).unwrap().bibliography);
        assert!(cache.changes(&keys(&["a", "b"])).unwrap().keys);
    }

    #[test]
    fn test_missing_bibliography_has_nothing_to_push() {
        let temp = TempDir::new().unwrap();
        let cache = ChangeCache::for_bibliography(&temp.path().join("refs.bib"));

        let changes = cache.changes(&keys(&["a"])).unwrap();
        assert!(changes.keys);
        assert!(!changes.bibliography);
    }
}
