//! Server configuration.

use std::path::PathBuf;

/// Default bibliography file name inside each realm directory.
pub const DEFAULT_BIB_FILE: &str = "references.bib";

/// Realm used when a request names none.
pub const DEFAULT_REALM: &str = "default";

/// Configuration for the realm registry.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root directory; each realm lives in a subdirectory named after it.
    pub data_dir: PathBuf,

    /// Bibliography file name inside each realm directory.
    pub bib_file: String,

    /// Realm for requests that do not name one.
    pub default_realm: String,

    /// Record changes in the realm's git work tree.
    pub commit: bool,

    /// Push after each commit.
    pub push: bool,
}

impl ServerConfig {
    /// Create a config rooted at `data_dir` with defaults for everything else.
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            bib_file: DEFAULT_BIB_FILE.to_string(),
            default_realm: DEFAULT_REALM.to_string(),
            commit: true,
            push: true,
        }
    }

    /// Set the bibliography file name.
    pub fn with_bib_file(mut self, name: impl Into<String>) -> Self {
        self.bib_file = name.into();
        self
    }

    /// Set the default realm.
    pub fn with_default_realm(mut self, realm: impl Into<String>) -> Self {
        self.default_realm = realm.into();
        self
    }

    /// Write files only, never touch git.
    pub fn without_commit(mut self) -> Self {
        self.commit = false;
        self
    }

    /// Commit locally but never push.
    pub fn without_push(mut self) -> Self {
        self.push = false;
        self
    }

    /// Directory of a (validated) realm.
    pub fn realm_dir(&self, realm: &str) -> PathBuf {
        self.data_dir.join(realm)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("org", "bibsync", "bibsync")
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".bibsync"));

        Self::new(data_dir)
    }
}
