//! Realm registry.
//!
//! A realm is an isolated tenant: its own record store, token table and
//! durable log, all living in `<data_dir>/<realm>/`. Realms are materialized
//! lazily on first reference and stay resident; `resync` reloads one in
//! place from disk and the remote.
//!
//! Each realm sits behind its own `RwLock`, so realms never contend with
//! each other. Writers hold the lock across classify, append, file write and
//! commit; readers always see a store between mutations. A realm is built
//! in its own slot with the registry map unlocked, so a slow first load
//! (git pull) only delays requests for that realm.
//!
//! A realm whose bibliography file exists but cannot be parsed is served
//! empty and refuses every write until a resync reads the file cleanly.

pub mod config;
pub mod log;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OnceCell, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

use crate::auth::RealmTokens;
use crate::store::{RecordStore, StoreError};

pub use config::ServerConfig;
pub use log::{commit_message, is_own_commit, DurableLog, GitLog, LocalLog, LogError, COMMIT_MARKER};

/// Errors that can occur in realm operations.
#[derive(Error, Debug)]
pub enum RealmError {
    #[error("Invalid realm name: {0:?}")]
    InvalidName(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Commit failed: {0}")]
    Log(#[from] LogError),

    #[error("Realm {realm} is read-only, its bibliography is unreadable: {reason}")]
    ReadOnly { realm: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RealmError>;

/// Reject names that would escape the data directory.
pub fn validate_realm_name(name: &str) -> Result<()> {
    let bad = name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);

    if bad {
        Err(RealmError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Mutable state of one realm.
pub struct RealmState {
    name: String,
    dir: PathBuf,
    bib_path: PathBuf,
    store: RecordStore,
    tokens: RealmTokens,
    log: Arc<dyn DurableLog>,
    unreadable: Option<String>,
}

/// Run a log operation on the blocking pool.
async fn run_log<T, F>(log: &Arc<dyn DurableLog>, op: F) -> std::result::Result<T, LogError>
where
    T: Send + 'static,
    F: FnOnce(&dyn DurableLog) -> std::result::Result<T, LogError> + Send + 'static,
{
    let log = Arc::clone(log);
    tokio::task::spawn_blocking(move || op(log.as_ref())).await?
}

impl RealmState {
    /// Open a realm directory, creating it if needed.
    pub async fn open(name: &str, config: &ServerConfig) -> Result<Self> {
        validate_realm_name(name)?;
        let dir = config.realm_dir(name);
        fs::create_dir_all(&dir)?;

        let log: Arc<dyn DurableLog> = if config.commit {
            let (at, push) = (dir.clone(), config.push);
            let opened = tokio::task::spawn_blocking(move || GitLog::open(&at, push))
                .await
                .map_err(LogError::from)
                .and_then(|opened| opened);

            match opened {
                Ok(git) => Arc::new(git),
                Err(e) => {
                    info!(realm = %name, reason = %e, "No usable git log, changes are file writes only");
                    Arc::new(LocalLog)
                }
            }
        } else {
            Arc::new(LocalLog)
        };

        Ok(Self::with_log(name, &dir, &config.bib_file, log).await)
    }

    /// Open a realm with an explicit log backend.
    pub async fn with_log(name: &str, dir: &Path, bib_file: &str, log: Arc<dyn DurableLog>) -> Self {
        let mut state = Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            bib_path: dir.join(bib_file),
            store: RecordStore::new(),
            tokens: RealmTokens::Disabled,
            log,
            unreadable: None,
        };
        state.reload().await;
        state
    }

    /// Pull, then rebuild the store and token table from disk.
    ///
    /// Failures degrade: an unreadable bibliography becomes an empty,
    /// read-only store, an unreadable token table disables authorization
    /// for this realm.
    pub async fn reload(&mut self) {
        if let Err(e) = run_log(&self.log, |log| log.pull()).await {
            warn!(realm = %self.name, error = %e, "Pull failed, loading local state");
        }

        self.store = match RecordStore::load(&self.bib_path) {
            Ok(store) => {
                self.unreadable = None;
                store
            }
            Err(e) => {
                error!(
                    realm = %self.name,
                    path = %self.bib_path.display(),
                    error = %e,
                    "Bibliography unreadable, serving an empty read-only store"
                );
                self.unreadable = Some(e.to_string());
                RecordStore::new()
            }
        };

        self.tokens = RealmTokens::load(&self.dir);

        info!(
            realm = %self.name,
            records = self.store.len(),
            authorization = self.tokens.is_enabled(),
            log = self.log.kind(),
            "Realm loaded"
        );
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn bib_path(&self) -> &Path {
        &self.bib_path
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut RecordStore {
        &mut self.store
    }

    pub fn tokens(&self) -> &RealmTokens {
        &self.tokens
    }

    /// The bibliography file failed to parse on the last load.
    pub fn is_read_only(&self) -> bool {
        self.unreadable.is_some()
    }

    /// Persist the current store and commit it.
    ///
    /// On failure the store and file are restored to `snapshot` and the
    /// error is returned: an uncommitted change is not a change. Push
    /// failures are logged only. A read-only realm restores `snapshot`
    /// without touching the file.
    pub async fn commit(
        &mut self,
        snapshot: RecordStore,
        summary: &str,
        attribution: Option<&str>,
    ) -> Result<()> {
        if let Some(reason) = self.unreadable.clone() {
            warn!(realm = %self.name, summary = %summary, "Write refused, realm is read-only");
            self.store = snapshot;
            return Err(RealmError::ReadOnly {
                realm: self.name.clone(),
                reason,
            });
        }

        let message = commit_message(summary, attribution);
        let paths = vec![self.bib_path.clone()];

        let written = match self.store.save(&self.bib_path) {
            Ok(()) => {
                let message = message.clone();
                run_log(&self.log, move |log| log.commit(&paths, &message))
                    .await
                    .map_err(RealmError::from)
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = written {
            error!(realm = %self.name, error = %e, "Commit failed, rolling back");
            self.store = snapshot;
            if let Err(restore) = self.store.save(&self.bib_path) {
                error!(realm = %self.name, error = %restore, "Could not restore bibliography file");
            }
            return Err(e);
        }

        debug!(realm = %self.name, message = %message, "Committed");

        if let Err(e) = run_log(&self.log, |log| log.push()).await {
            warn!(realm = %self.name, error = %e, "Push failed, change kept locally");
        }

        Ok(())
    }
}

/// A resident realm.
pub struct Realm {
    name: String,
    state: RwLock<RealmState>,
}

impl Realm {
    fn new(state: RealmState) -> Self {
        Self {
            name: state.name().to_string(),
            state: RwLock::new(state),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared access for lookups.
    pub async fn read(&self) -> RwLockReadGuard<'_, RealmState> {
        self.state.read().await
    }

    /// Exclusive access for mutations.
    pub async fn write(&self) -> RwLockWriteGuard<'_, RealmState> {
        self.state.write().await
    }
}

/// A realm, or the place it will be loaded into.
type Slot = Arc<OnceCell<Arc<Realm>>>;

/// Name → realm map, populated on demand.
pub struct RealmRegistry {
    config: ServerConfig,
    realms: RwLock<HashMap<String, Slot>>,
}

impl RealmRegistry {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            realms: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The requested realm name, or the default one.
    pub fn resolve_name<'a>(&'a self, realm: Option<&'a str>) -> Result<&'a str> {
        let name = match realm {
            Some(name) if !name.is_empty() => name,
            _ => self.config.default_realm.as_str(),
        };
        validate_realm_name(name)?;
        Ok(name)
    }

    async fn slot(&self, name: &str) -> Slot {
        if let Some(slot) = self.realms.read().await.get(name) {
            return slot.clone();
        }
        self.realms
            .write()
            .await
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// The realm, loading it on first reference.
    ///
    /// Concurrent first requests for one realm share a single load; a
    /// failed load leaves the slot empty for the next request to retry.
    pub async fn ensure_loaded(&self, realm: Option<&str>) -> Result<Arc<Realm>> {
        let name = self.resolve_name(realm)?;
        let slot = self.slot(name).await;

        let realm = slot
            .get_or_try_init(|| async {
                let state = RealmState::open(name, &self.config).await?;
                Ok::<_, RealmError>(Arc::new(Realm::new(state)))
            })
            .await?;
        Ok(realm.clone())
    }

    /// Make a pre-built realm resident, replacing any realm of that name.
    pub async fn insert(&self, state: RealmState) -> Arc<Realm> {
        let realm = Arc::new(Realm::new(state));
        let slot = Arc::new(OnceCell::new_with(Some(realm.clone())));
        self.realms.write().await.insert(realm.name().to_string(), slot);
        realm
    }

    /// Reload a realm from its log and files.
    pub async fn resync(&self, realm: Option<&str>) -> Result<Arc<Realm>> {
        let realm = self.ensure_loaded(realm).await?;
        realm.write().await.reload().await;
        Ok(realm)
    }

    /// Names of resident realms.
    pub async fn loaded(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .realms
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
