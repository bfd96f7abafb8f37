//! Durable commit log behind each realm.
//!
//! The bibliography file is the in-memory store's on-disk image; the log
//! records every change to it. Git is the production backend and is only
//! ever driven through `commit`, `pull` and `push`.
//!
//! Log operations block (git may wait on the network), so async callers run
//! them on tokio's blocking pool. Several realms may live in one work tree:
//! a commit only ever covers the paths it was given, and operations touching
//! the index are serialized per repository.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use thiserror::Error;
use tracing::debug;

/// Marker prefixed to every commit message written by the server.
pub const COMMIT_MARKER: &str = "[bibsync]";

/// Durable log errors.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("{0} is not a git work tree")]
    NotARepository(PathBuf),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Log task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, LogError>;

/// Append-only commit log with remote replication.
pub trait DurableLog: Send + Sync {
    /// Durably record the current contents of `paths`.
    fn commit(&self, paths: &[PathBuf], message: &str) -> Result<()>;

    /// Fetch and integrate remote history.
    fn pull(&self) -> Result<()>;

    /// Publish local history to the remote.
    fn push(&self) -> Result<()>;

    /// Backend name for logs.
    fn kind(&self) -> &'static str;
}

/// Log for realms without version control: the file write is the commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLog;

impl DurableLog for LocalLog {
    fn commit(&self, paths: &[PathBuf], message: &str) -> Result<()> {
        debug!(files = paths.len(), message = %message, "Local commit (file write only)");
        Ok(())
    }

    fn pull(&self) -> Result<()> {
        Ok(())
    }

    fn push(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}

/// Lock guarding the index of the repository rooted at `toplevel`.
fn repository_lock(toplevel: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();

    let mut locks = LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    locks.entry(toplevel.to_path_buf()).or_default().clone()
}

/// Git work tree driven through the `git` binary.
#[derive(Debug, Clone)]
pub struct GitLog {
    work_tree: PathBuf,
    toplevel: PathBuf,
    remote: Option<String>,
    push: bool,
    index: Arc<Mutex<()>>,
}

impl GitLog {
    /// Open the work tree containing `dir`.
    pub fn open(dir: &Path, push: bool) -> Result<Self> {
        let top = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["rev-parse", "--show-toplevel"])
            .output()?;

        let toplevel = PathBuf::from(String::from_utf8_lossy(&top.stdout).trim());
        if !top.status.success() || toplevel.as_os_str().is_empty() {
            return Err(LogError::NotARepository(dir.to_path_buf()));
        }

        let mut log = Self {
            work_tree: dir.to_path_buf(),
            index: repository_lock(&toplevel),
            toplevel,
            remote: None,
            push,
        };

        let remotes = log.git(&["remote"])?;
        log.remote = String::from_utf8_lossy(&remotes.stdout)
            .lines()
            .map(str::trim)
            .find(|r| !r.is_empty())
            .map(str::to_string);

        debug!(
            work_tree = %dir.display(),
            repository = %log.toplevel.display(),
            remote = ?log.remote,
            "Opened git log"
        );

        Ok(log)
    }

    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    /// Root of the repository this work tree belongs to.
    pub fn toplevel(&self) -> &Path {
        &self.toplevel
    }

    fn lock_index(&self) -> MutexGuard<'_, ()> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn git(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.work_tree)
            .args(args)
            .output()?;

        if output.status.success() {
            Ok(output)
        } else {
            Err(LogError::Git {
                command: args.first().copied().unwrap_or_default().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn has_staged_changes(&self, paths: &[String]) -> Result<bool> {
        let status = Command::new("git")
            .arg("-C")
            .arg(&self.work_tree)
            .args(["diff", "--cached", "--quiet", "--"])
            .args(paths)
            .status()?;
        // `--quiet` exits 1 when there are differences.
        Ok(!status.success())
    }
}

impl DurableLog for GitLog {
    fn commit(&self, paths: &[PathBuf], message: &str) -> Result<()> {
        // git runs inside the work tree, so relative paths must be relative to it.
        let paths: Vec<String> = paths
            .iter()
            .map(|p| p.strip_prefix(&self.work_tree).unwrap_or(p).display().to_string())
            .collect();
        let _index = self.lock_index();

        let mut add = vec!["add", "--"];
        add.extend(paths.iter().map(String::as_str));
        self.git(&add)?;

        if !self.has_staged_changes(&paths)? {
            debug!("Nothing to commit");
            return Ok(());
        }

        // Only the given paths, whatever else is staged.
        let mut commit = vec!["commit", "--quiet", "-m", message, "--"];
        commit.extend(paths.iter().map(String::as_str));
        self.git(&commit)?;
        Ok(())
    }

    fn pull(&self) -> Result<()> {
        if self.remote.is_none() {
            return Ok(());
        }
        let _index = self.lock_index();
        self.git(&["pull", "--quiet"]).map(|_| ())
    }

    fn push(&self) -> Result<()> {
        if !self.push || self.remote.is_none() {
            return Ok(());
        }
        self.git(&["push", "--quiet"]).map(|_| ())
    }

    fn kind(&self) -> &'static str {
        "git"
    }
}

/// Build the message for a change summary.
///
/// `attribution` carries the token (or `none`) when the realm enforces
/// authorization, so history shows who made a change.
pub fn commit_message(summary: &str, attribution: Option<&str>) -> String {
    match attribution {
        Some(token) => format!("{} {} (Token {})", COMMIT_MARKER, summary, token),
        None => format!("{} {}", COMMIT_MARKER, summary),
    }
}

/// Whether a commit title/message was written by this server.
pub fn is_own_commit(text: &str) -> bool {
    text.contains(COMMIT_MARKER)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Run git in `dir`; `None` when git is missing or the command fails.
    fn git(dir: &Path, args: &[&str]) -> Option<String> {
        let out = Command::new("git").arg("-C").arg(dir).args(args).output().ok()?;
        out.status
            .success()
            .then(|| String::from_utf8_lossy(&out.stdout).into_owned())
    }

    #[test]
    fn test_commit_covers_only_its_own_paths() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        if git(root, &["init", "--quiet"]).is_none() {
            return;
        }
        git(root, &["config", "user.name", "bibsync"]).unwrap();
        git(root, &["config", "user.email", "bibsync@example.invalid"]).unwrap();
        git(root, &["config", "commit.gpgsign", "false"]).unwrap();
        git(root, &["commit", "--quiet", "--allow-empty", "-m", "init"]).unwrap();

        // Another realm of the same repository has a change staged.
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(root.join("b/references.bib"), "@misc{bonly}\n").unwrap();
        git(root, &["add", "b/references.bib"]).unwrap();

        let log = GitLog::open(&root.join("a"), false).unwrap();
        let a_bib = root.join("a/references.bib");
        fs::write(&a_bib, "@misc{aonly}\n").unwrap();
        log.commit(&[a_bib], &commit_message("Added aonly", None)).unwrap();

        let committed = git(root, &["show", "--name-only", "--format=", "HEAD"]).unwrap();
        assert_eq!(committed.trim(), "a/references.bib");
        let staged = git(root, &["diff", "--cached", "--name-only"]).unwrap();
        assert_eq!(staged.trim(), "b/references.bib");

        let other = GitLog::open(&root.join("b"), false).unwrap();
        assert!(Arc::ptr_eq(&log.index, &other.index));
    }

    #[test]
    fn test_commit_message() {
        assert_eq!(commit_message("Added x", None), "[bibsync] Added x");
        assert_eq!(
            commit_message("Added x", Some("none")),
            "[bibsync] Added x (Token none)"
        );
        assert!(is_own_commit(&commit_message("Deleted y", Some("t"))));
        assert!(!is_own_commit("Fix typo in smith2020"));
    }

    #[test]
    fn test_plain_directory_is_not_a_repository() {
        let temp = TempDir::new().unwrap();
        // Either git is missing (Io) or the directory is not a work tree.
        assert!(GitLog::open(temp.path(), false).is_err());
    }
}
