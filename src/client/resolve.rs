//! Interactive resolution of duplicate verdicts.
//!
//! Each verdict becomes a [`Conflict`] between a local record and the
//! server's record it resembles. A [`Resolver`] (usually a person at a
//! terminal) picks what to do; nothing is resolved automatically.

use std::collections::HashSet;

use tracing::{debug, warn};

use super::{ClientError, Remote, Result};
use crate::classify::Verdict;
use crate::record::Record;
use crate::store::RecordStore;

/// A local record and the remote record it was matched against.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub local: Record,
    pub remote: Record,
    pub distance: usize,
}

impl Conflict {
    /// Both sides share a key but differ in content.
    pub fn is_same_key(&self) -> bool {
        self.local.id() == self.remote.id()
    }
}

/// Choices for a shared key with different content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameKeyChoice {
    /// Overwrite the server's record with the local one.
    PushLocal,
    /// Overwrite the local record with the server's one.
    PullRemote,
    Ignore,
    Abort,
}

/// Choices for a different key with similar content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimilarChoice {
    /// Add the local record to the server as a separate entry.
    CommitLocal,
    DeleteRemote,
    DeleteLocal,
    Ignore,
    Abort,
}

/// Decides conflicts one at a time.
pub trait Resolver {
    fn same_key(&mut self, conflict: &Conflict) -> SameKeyChoice;

    fn similar(&mut self, conflict: &Conflict) -> SimilarChoice;
}

/// What a resolution step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    PushedLocal(String),
    PulledRemote(String),
    CommittedLocal(String),
    DeletedRemote(String),
    DeletedLocal(String),
    Ignored(String),
    /// The server refused the step; the session went on.
    Refused { id: String, reason: String },
}

impl Action {
    /// The step rewrote the local bibliography.
    pub fn changes_local(&self) -> bool {
        matches!(self, Action::PulledRemote(_) | Action::DeletedLocal(_))
    }
}

/// Outcome of a resolution session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub actions: Vec<Action>,
    pub aborted: bool,
}

impl Resolution {
    pub fn changes_local(&self) -> bool {
        self.actions.iter().any(Action::changes_local)
    }
}

/// Map a server refusal to an action, keep transport failures fatal.
fn settle(id: &str, result: Result<()>, done: Action) -> Result<Action> {
    match result {
        Ok(()) => Ok(done),
        Err(ClientError::Server { reason, message }) => {
            warn!(id = %id, reason = %reason, message = %message, "Server refused resolution step");
            Ok(Action::Refused {
                id: id.to_string(),
                reason: format!("{}: {}", reason, message),
            })
        }
        Err(e) => Err(e),
    }
}

/// Walk the verdicts, applying the resolver's choices to `local` and the
/// remote.
///
/// Verdicts whose local or remote side was already removed by an earlier
/// choice are skipped. An abort stops the walk immediately; the caller must
/// not write `local` back in that case.
pub async fn resolve<R: Remote>(
    verdicts: Vec<Verdict>,
    local: &mut RecordStore,
    remote: &R,
    resolver: &mut dyn Resolver,
    force: bool,
) -> Result<Resolution> {
    let mut resolution = Resolution::default();
    let mut deleted_remote: HashSet<String> = HashSet::new();

    for verdict in verdicts {
        let Some(local_record) = local.get(&verdict.candidate_id).cloned() else {
            debug!(id = %verdict.candidate_id, "Local side gone, skipping verdict");
            continue;
        };
        if deleted_remote.contains(verdict.existing.id()) {
            continue;
        }

        let conflict = Conflict {
            local: local_record,
            remote: verdict.existing,
            distance: verdict.distance,
        };
        let local_id = conflict.local.id().to_string();
        let remote_id = conflict.remote.id().to_string();

        let action = if conflict.is_same_key() {
            match resolver.same_key(&conflict) {
                SameKeyChoice::PushLocal => {
                    let result = remote.replace(&local_id, &conflict.local, force).await;
                    settle(&local_id, result, Action::PushedLocal(local_id.clone()))?
                }
                SameKeyChoice::PullRemote => {
                    local.replace(&local_id, conflict.remote.clone());
                    Action::PulledRemote(local_id)
                }
                SameKeyChoice::Ignore => Action::Ignored(local_id),
                SameKeyChoice::Abort => {
                    resolution.aborted = true;
                    return Ok(resolution);
                }
            }
        } else {
            match resolver.similar(&conflict) {
                SimilarChoice::CommitLocal => {
                    let result = remote.create(&conflict.local, force).await;
                    settle(&local_id, result, Action::CommittedLocal(local_id.clone()))?
                }
                SimilarChoice::DeleteRemote => {
                    let result = remote.delete(&remote_id).await;
                    let action = settle(&remote_id, result, Action::DeletedRemote(remote_id.clone()))?;
                    if matches!(action, Action::DeletedRemote(_)) {
                        deleted_remote.insert(remote_id);
                    }
                    action
                }
                SimilarChoice::DeleteLocal => {
                    local.remove(&local_id);
                    Action::DeletedLocal(local_id)
                }
                SimilarChoice::Ignore => Action::Ignored(local_id),
                SimilarChoice::Abort => {
                    resolution.aborted = true;
                    return Ok(resolution);
                }
            }
        };

        debug!(?action, "Resolved");
        resolution.actions.push(action);
    }

    Ok(resolution)
}
