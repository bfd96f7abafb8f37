//! The `get` flow: bring a local bibliography in step with a realm for a set
//! of citation keys.
//!
//! 1. Refuse to talk to a server speaking a newer protocol.
//! 2. Skip everything when neither the keys nor the file changed.
//! 3. Push the whole local bibliography and resolve what the server flags.
//! 4. Pull records for keys missing locally.
//! 5. Offer suggestions for keys the server does not know either.

use std::path::Path;

use tracing::{debug, info};

use super::cache::ChangeCache;
use super::resolve::{resolve, Action, Resolver};
use super::{ClientError, Remote, Result};
use crate::classify::Suggestion;
use crate::policy::PolicyRejection;
use crate::store::RecordStore;
use crate::wire::PROTOCOL_VERSION;

/// Inputs of one sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Citation keys the project cites.
    pub keys: Vec<String>,

    /// Ask the server to skip its policy gate.
    pub force: bool,

    /// Sync even when nothing changed since the last run.
    pub always: bool,
}

/// A key neither side has.
#[derive(Debug, Clone, PartialEq)]
pub struct Unresolved {
    pub key: String,
    pub suggestions: Vec<Suggestion>,
}

/// What a sync run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Nothing changed, no request beyond the version check was made.
    pub skipped: bool,

    /// The user aborted; the local file was left untouched.
    pub aborted: bool,

    /// IDs the server accepted from the push.
    pub pushed: Vec<String>,

    pub rejected: Vec<PolicyRejection>,

    pub actions: Vec<Action>,

    /// IDs added to the local file from the server.
    pub pulled: Vec<String>,

    pub unresolved: Vec<Unresolved>,
}

fn dedup_keys(keys: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    keys.iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty() && seen.insert(k.to_string()))
        .map(str::to_string)
        .collect()
}

/// Run the flow against `remote` for the bibliography at `bib_path`.
pub async fn sync_bibliography<R: Remote>(
    remote: &R,
    bib_path: &Path,
    options: &SyncOptions,
    resolver: &mut dyn Resolver,
) -> Result<SyncReport> {
    let server = remote.version().await?;
    if server.version > PROTOCOL_VERSION {
        return Err(ClientError::Outdated {
            server: server.version,
            client: PROTOCOL_VERSION,
            url: server.url,
        });
    }

    let keys = dedup_keys(&options.keys);
    let cache = ChangeCache::for_bibliography(bib_path);
    let changes = cache.changes(&keys)?;
    let push = changes.bibliography || options.always;
    let fetch = changes.keys || push;

    let mut report = SyncReport::default();
    if !push && !fetch {
        debug!(path = %bib_path.display(), "Keys and bibliography unchanged, skipping");
        report.skipped = true;
        return Ok(report);
    }

    let mut local = RecordStore::load(bib_path)?;
    let mut dirty = false;

    if push && !local.is_empty() {
        let reply = remote.update(local.records(), options.force).await?;
        info!(
            added = reply.added.len(),
            duplicates = reply.duplicates.len(),
            rejected = reply.rejected.len(),
            "Pushed local bibliography"
        );
        report.pushed = reply.added;
        report.rejected = reply.rejected;

        if !reply.duplicates.is_empty() {
            let resolution = resolve(reply.duplicates, &mut local, remote, resolver, options.force).await?;
            dirty |= resolution.changes_local();
            report.actions = resolution.actions;
            if resolution.aborted {
                info!("Resolution aborted, local bibliography left untouched");
                report.aborted = true;
                return Ok(report);
            }
        }
    }

    if fetch {
        let missing: Vec<String> = keys
            .iter()
            .filter(|k| local.lookup(k).is_none())
            .cloned()
            .collect();

        if !missing.is_empty() {
            let found = remote.get_json(&missing).await?;
            for (key, slot) in missing.iter().zip(found) {
                match slot {
                    Some(record) => {
                        let id = record.id().to_string();
                        if local.insert(record) {
                            report.pulled.push(id);
                            dirty = true;
                        }
                    }
                    None => {
                        let suggestions = remote.suggest(key).await?;
                        report.unresolved.push(Unresolved {
                            key: key.clone(),
                            suggestions,
                        });
                    }
                }
            }
        }
    }

    if dirty {
        local.save(bib_path)?;
        info!(path = %bib_path.display(), records = local.len(), "Local bibliography updated");
    }
    cache.record(&keys)?;

    Ok(report)
}
