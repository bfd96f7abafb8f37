//! Server side of the reconciliation protocol.
//!
//! All functions take the realm state by `&mut`, so callers hold the realm's
//! write lock for the whole classify, append, write and commit sequence.
//!
//! Bulk update processes the whole batch before answering:
//! - unchanged resubmissions are skipped
//! - candidates without verdicts go through the policy gate (unless forced)
//!   and are appended
//! - candidates with verdicts are collected for the caller to resolve
//!
//! Everything accepted is committed as one change, even when other
//! candidates in the batch were rejected or flagged.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::classify::{classify, Verdict};
use crate::policy::{PolicyDecision, PolicyGate, PolicyRejection};
use crate::realm::{RealmError, RealmState};
use crate::record::Record;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists: {}", .0.id())]
    Exists(Box<Record>),

    #[error("Rejected by policy: {}", .0.reason)]
    Policy(Box<PolicyRejection>),

    #[error(transparent)]
    Commit(#[from] RealmError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// How a write is applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions<'a> {
    /// Skip the policy gate. Duplicate detection still runs.
    pub force: bool,

    /// Token recorded in the commit message, when the realm enforces tokens.
    pub attribution: Option<&'a str>,
}

/// Result of a bulk update.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct BulkOutcome {
    /// IDs appended and committed by this call.
    pub added: Vec<String>,

    /// Candidates identical to a stored record.
    pub unchanged: usize,

    /// Similar records found for candidates that were not applied.
    pub duplicates: Vec<Verdict>,

    /// Candidates vetoed by the policy gate.
    pub rejected: Vec<PolicyRejection>,
}

fn vet(
    policy: &dyn PolicyGate,
    candidate: &Record,
    existing: &[Record],
    force: bool,
) -> std::result::Result<(), PolicyRejection> {
    if force {
        return Ok(());
    }
    match policy.check(candidate, existing) {
        PolicyDecision::Accept => Ok(()),
        PolicyDecision::Reject(reason) => Err(PolicyRejection {
            record: candidate.clone(),
            reason,
        }),
    }
}

/// Apply a batch of candidate records.
pub async fn bulk_update(
    state: &mut RealmState,
    entries: Vec<Record>,
    policy: &dyn PolicyGate,
    options: WriteOptions<'_>,
) -> Result<BulkOutcome> {
    let snapshot = state.store().clone();
    let mut outcome = BulkOutcome::default();
    let mut changelog = Vec::new();

    for entry in entries {
        if state.store().get(entry.id()) == Some(&entry) {
            outcome.unchanged += 1;
            continue;
        }

        let verdicts = classify(&entry, state.store().records());
        if !verdicts.is_empty() {
            debug!(id = %entry.id(), matches = verdicts.len(), "Candidate has similar entries");
            outcome.duplicates.extend(verdicts);
            continue;
        }

        if let Err(rejection) = vet(policy, &entry, state.store().records(), options.force) {
            debug!(id = %entry.id(), reason = %rejection.reason, "Candidate rejected by policy");
            outcome.rejected.push(rejection);
            continue;
        }

        let id = entry.id().to_string();
        if state.store_mut().insert(entry) {
            changelog.push(format!("Added {}", id));
            outcome.added.push(id);
        }
    }

    if !outcome.added.is_empty() {
        state.commit(snapshot, &changelog.join("\n"), options.attribution).await?;
        info!(
            realm = %state.name(),
            added = outcome.added.len(),
            duplicates = outcome.duplicates.len(),
            rejected = outcome.rejected.len(),
            "Bulk update committed"
        );
    }

    Ok(outcome)
}

/// Add one new record.
pub async fn create_entry(
    state: &mut RealmState,
    record: Record,
    policy: &dyn PolicyGate,
    options: WriteOptions<'_>,
) -> Result<()> {
    if let Some(existing) = state.store().get(record.id()) {
        return Err(ReconcileError::Exists(Box::new(existing.clone())));
    }

    vet(policy, &record, state.store().records(), options.force)
        .map_err(|r| ReconcileError::Policy(Box::new(r)))?;

    let snapshot = state.store().clone();
    let summary = format!("Added {}", record.id());
    state.store_mut().insert(record);
    state.commit(snapshot, &summary, options.attribution).await?;

    info!(realm = %state.name(), summary = %summary, "Entry created");
    Ok(())
}

/// Replace the record stored under `key`.
pub async fn replace_entry(
    state: &mut RealmState,
    key: &str,
    record: Record,
    policy: &dyn PolicyGate,
    options: WriteOptions<'_>,
) -> Result<()> {
    let current = state
        .store()
        .get(key)
        .ok_or_else(|| ReconcileError::NotFound(key.to_string()))?;

    if *current == record {
        return Ok(());
    }

    // Renaming onto another stored key would leave two records with one ID.
    if record.id() != key {
        if let Some(other) = state.store().get(record.id()) {
            return Err(ReconcileError::Exists(Box::new(other.clone())));
        }
    }

    vet(policy, &record, state.store().records(), options.force)
        .map_err(|r| ReconcileError::Policy(Box::new(r)))?;

    let snapshot = state.store().clone();
    state.store_mut().replace(key, record);
    let summary = format!("Changed {}", key);
    state.commit(snapshot, &summary, options.attribution).await?;

    info!(realm = %state.name(), summary = %summary, "Entry replaced");
    Ok(())
}

/// Remove the record stored under `key`.
pub async fn delete_entry(state: &mut RealmState, key: &str, attribution: Option<&str>) -> Result<Record> {
    let snapshot = state.store().clone();
    let removed = state
        .store_mut()
        .remove(key)
        .ok_or_else(|| ReconcileError::NotFound(key.to_string()))?;

    let summary = format!("Deleted {}", key);
    state.commit(snapshot, &summary, attribution).await?;

    info!(realm = %state.name(), summary = %summary, "Entry deleted");
    Ok(removed)
}
