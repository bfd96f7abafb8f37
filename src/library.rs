//! Operation surface of the daemon.
//!
//! Every request resolves its realm, authorizes against that realm's token
//! table and then runs against the realm state under the matching lock:
//! shared for lookups, exclusive for anything that can mutate.

use std::sync::Arc;

use tracing::{debug, info};

use crate::api::error::{ApiError, Result};
use crate::auth::{Authorizer, Capability};
use crate::classify::{suggest, Suggestion};
use crate::policy::{AcceptAll, PolicyGate};
use crate::realm::{RealmRegistry, RealmState, ServerConfig};
use crate::reconcile::{self, WriteOptions};
use crate::record::{FieldMap, Record};
use crate::store::SearchQuery;
use crate::wire::WebhookCommit;

/// Caller identity for one request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Access<'a> {
    pub realm: Option<&'a str>,
    pub token: Option<&'a str>,
}

impl<'a> Access<'a> {
    pub fn new(realm: Option<&'a str>, token: Option<&'a str>) -> Self {
        Self { realm, token }
    }
}

fn write_capabilities(force: bool) -> &'static [Capability] {
    if force {
        &[Capability::Write, Capability::Force]
    } else {
        &[Capability::Write]
    }
}

/// Realms, authorization and the admission policy.
pub struct Library {
    registry: RealmRegistry,
    authorizer: Authorizer,
    policy: Arc<dyn PolicyGate>,
}

impl Library {
    pub fn new(config: ServerConfig, authorizer: Authorizer, policy: Arc<dyn PolicyGate>) -> Self {
        Self {
            registry: RealmRegistry::new(config),
            authorizer,
            policy,
        }
    }

    /// Library admitting every record.
    pub fn open(config: ServerConfig, authorizer: Authorizer) -> Self {
        Self::new(config, authorizer, Arc::new(AcceptAll))
    }

    pub fn registry(&self) -> &RealmRegistry {
        &self.registry
    }

    fn authorize(&self, state: &RealmState, token: Option<&str>, capabilities: &[Capability]) -> Result<()> {
        let decision = self.authorizer.authorize_all(state.tokens(), token, capabilities);
        if !decision.is_grant() {
            debug!(realm = %state.name(), ?decision, "Request refused");
        }
        ApiError::from_decision(decision)
    }

    /// Token recorded in commit messages, when the realm enforces tokens.
    fn attribution<'t>(&self, state: &RealmState, token: Option<&'t str>) -> Option<&'t str> {
        if self.authorizer.is_enabled() && state.tokens().is_enabled() {
            Some(token.unwrap_or("none"))
        } else {
            None
        }
    }

    /// Records matching every term of `query`.
    pub async fn search(&self, access: Access<'_>, query: &str) -> Result<Vec<Record>> {
        let query = SearchQuery::parse(query)?;

        let realm = self.registry.ensure_loaded(access.realm).await?;
        let state = realm.read().await;
        self.authorize(&state, access.token, &[Capability::Search])?;

        Ok(state.store().search(&query).into_iter().cloned().collect())
    }

    /// Candidates for a key the realm does not know.
    pub async fn suggest(&self, access: Access<'_>, key: &str) -> Result<Vec<Suggestion>> {
        let realm = self.registry.ensure_loaded(access.realm).await?;
        let state = realm.read().await;
        self.authorize(&state, access.token, &[Capability::Search])?;

        if let Some(record) = state.store().lookup(key) {
            return Ok(vec![Suggestion {
                score: 1.0,
                record: record.clone(),
            }]);
        }

        Ok(suggest(key, state.store().records()))
    }

    /// One record by key (prefix lookup).
    pub async fn entry(&self, access: Access<'_>, key: &str) -> Result<Record> {
        let realm = self.registry.ensure_loaded(access.realm).await?;
        let state = realm.read().await;
        self.authorize(&state, access.token, &[Capability::Read])?;

        state
            .store()
            .lookup(key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(key.to_string()))
    }

    /// One slot per key, `None` where nothing matches.
    pub async fn get(&self, access: Access<'_>, keys: &[String]) -> Result<Vec<Option<Record>>> {
        let realm = self.registry.ensure_loaded(access.realm).await?;
        let state = realm.read().await;
        self.authorize(&state, access.token, &[Capability::Read])?;

        Ok(keys
            .iter()
            .map(|key| state.store().lookup(key).cloned())
            .collect())
    }

    /// Add a record under `key` unless its body names another ID.
    pub async fn create(&self, access: Access<'_>, key: &str, entry: FieldMap, force: bool) -> Result<Record> {
        let record = Record::from_map_or_key(entry, key)?;

        let realm = self.registry.ensure_loaded(access.realm).await?;
        let mut state = realm.write().await;
        self.authorize(&state, access.token, write_capabilities(force))?;

        let options = WriteOptions {
            force,
            attribution: self.attribution(&state, access.token),
        };
        reconcile::create_entry(&mut state, record.clone(), self.policy.as_ref(), options).await?;
        Ok(record)
    }

    /// Replace the record stored under exactly `key`.
    pub async fn replace(&self, access: Access<'_>, key: &str, entry: FieldMap, force: bool) -> Result<Record> {
        let record = Record::from_map_or_key(entry, key)?;

        let realm = self.registry.ensure_loaded(access.realm).await?;
        let mut state = realm.write().await;
        self.authorize(&state, access.token, write_capabilities(force))?;

        let options = WriteOptions {
            force,
            attribution: self.attribution(&state, access.token),
        };
        reconcile::replace_entry(&mut state, key, record.clone(), self.policy.as_ref(), options).await?;
        Ok(record)
    }

    pub async fn delete(&self, access: Access<'_>, key: &str) -> Result<Record> {
        let realm = self.registry.ensure_loaded(access.realm).await?;
        let mut state = realm.write().await;
        self.authorize(&state, access.token, &[Capability::Delete])?;

        let attribution = self.attribution(&state, access.token);
        Ok(reconcile::delete_entry(&mut state, key, attribution).await?)
    }

    /// Apply a batch; returns the accepted IDs.
    ///
    /// Unresolved duplicates win over policy rejections in the failure, and
    /// both still report what was accepted alongside them.
    pub async fn bulk_update(&self, access: Access<'_>, entries: Vec<Record>, force: bool) -> Result<Vec<String>> {
        let realm = self.registry.ensure_loaded(access.realm).await?;
        let mut state = realm.write().await;
        self.authorize(&state, access.token, write_capabilities(force))?;

        let options = WriteOptions {
            force,
            attribution: self.attribution(&state, access.token),
        };
        let submitted = entries.len();
        let outcome = reconcile::bulk_update(&mut state, entries, self.policy.as_ref(), options).await?;

        debug!(
            realm = %state.name(),
            submitted,
            unchanged = outcome.unchanged,
            added = outcome.added.len(),
            "Bulk update processed"
        );

        if !outcome.duplicates.is_empty() {
            return Err(ApiError::Duplicate {
                verdicts: outcome.duplicates,
                added: outcome.added,
            });
        }
        if !outcome.rejected.is_empty() {
            return Err(ApiError::Policy {
                rejected: outcome.rejected,
                added: outcome.added,
            });
        }

        Ok(outcome.added)
    }

    /// Reload a realm from its log and files.
    pub async fn resync(&self, realm: Option<&str>) -> Result<()> {
        let realm = self.registry.resync(realm).await?;
        info!(realm = %realm.name(), "Resynced");
        Ok(())
    }

    /// Resync unless every pushed commit was written by this server.
    pub async fn webhook(&self, realm: Option<&str>, commits: &[WebhookCommit]) -> Result<bool> {
        let external = commits.iter().filter(|c| !c.is_own()).count();
        if external == 0 {
            debug!(commits = commits.len(), "Webhook carried only own commits");
            return Ok(false);
        }

        info!(external, "External commits pushed, resyncing");
        self.resync(realm).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TOKENS_FILE;
    use crate::policy::RequiredFields;
    use crate::record::bibtex;
    use std::fs;
    use tempfile::TempDir;

    const TOKENS: &str = r#"{
        "reader": {"search": true, "read": true},
        "writer": {"search": true, "read": true, "write": true, "delete": true},
        "admin":  {"search": true, "read": true, "write": true, "delete": true, "force": true}
    }"#;

    fn rec(fields: &[(&str, &str)]) -> Record {
        Record::from_fields(fields.iter().copied()).unwrap()
    }

    fn map(fields: &[(&str, &str)]) -> FieldMap {
        fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn setup(tokens: Option<&str>, records: &[Record]) -> (TempDir, Library) {
        let temp = TempDir::new().unwrap();
        let config = ServerConfig::new(temp.path().to_path_buf()).without_commit();
        let dir = config.realm_dir(&config.default_realm);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(&config.bib_file), bibtex::render_all(records)).unwrap();
        if let Some(tokens) = tokens {
            fs::write(dir.join(TOKENS_FILE), tokens).unwrap();
        }

        let library = Library::new(config, Authorizer::new(), Arc::new(RequiredFields::new(["title"])));
        (temp, library)
    }

    fn as_token(token: &str) -> Access<'_> {
        Access::new(None, Some(token))
    }

    #[tokio::test]
    async fn test_unknown_token_is_denied_everywhere() {
        let (_temp, library) = setup(Some(TOKENS), &[rec(&[("ID", "knuth84"), ("title", "TeX")])]);
        let who = as_token("intruder");

        let denied = |r: &ApiError| r.reason() == "access_denied";
        assert!(denied(&library.search(who, "tex").await.unwrap_err()));
        assert!(denied(&library.suggest(who, "knuth").await.unwrap_err()));
        assert!(denied(&library.entry(who, "knuth84").await.unwrap_err()));
        assert!(denied(&library.get(who, &["knuth84".into()]).await.unwrap_err()));
        assert!(denied(&library.create(who, "x", map(&[("title", "X")]), false).await.unwrap_err()));
        assert!(denied(&library.replace(who, "knuth84", map(&[("title", "X")]), false).await.unwrap_err()));
        assert!(denied(&library.delete(who, "knuth84").await.unwrap_err()));
        assert!(denied(&library.bulk_update(who, vec![], false).await.unwrap_err()));
    }

    #[tokio::test]
    async fn test_empty_table_is_server_problem() {
        let (_temp, library) = setup(Some("{}"), &[]);
        let who = as_token("anything");

        let problem = |r: &ApiError| r.reason() == "server_problem";
        assert!(problem(&library.search(who, "tex").await.unwrap_err()));
        assert!(problem(&library.get(who, &[]).await.unwrap_err()));
        assert!(problem(&library.delete(who, "x").await.unwrap_err()));
        assert!(problem(&library.bulk_update(who, vec![], true).await.unwrap_err()));
    }

    #[tokio::test]
    async fn test_short_search_term_fails_before_loading() {
        let (_temp, library) = setup(None, &[]);

        let err = library.search(Access::default(), "a systems").await.unwrap_err();
        assert_eq!(err.reason(), "invalid_request");
        assert!(library.registry().loaded().await.is_empty());
    }

    #[tokio::test]
    async fn test_reader_cannot_write() {
        let (_temp, library) = setup(Some(TOKENS), &[rec(&[("ID", "knuth84"), ("title", "TeX")])]);

        let found = library.search(as_token("reader"), "tex").await.unwrap();
        assert_eq!(found.len(), 1);

        let err = library
            .create(as_token("reader"), "x", map(&[("title", "X")]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::AccessDenied { capability: Capability::Write }));
    }

    #[tokio::test]
    async fn test_force_requires_force_capability() {
        let (_temp, library) = setup(Some(TOKENS), &[]);
        let untitled = vec![rec(&[("ID", "draft")])];

        let err = library
            .bulk_update(as_token("writer"), untitled.clone(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::AccessDenied { capability: Capability::Force }));

        let err = library
            .bulk_update(as_token("writer"), untitled.clone(), false)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "policy");

        let added = library.bulk_update(as_token("admin"), untitled, true).await.unwrap();
        assert_eq!(added, vec!["draft"]);
    }

    #[tokio::test]
    async fn test_duplicates_take_precedence_over_policy() {
        let (_temp, library) = setup(None, &[rec(&[("ID", "jones19"), ("title", "Learning Systems")])]);

        let entries = vec![
            rec(&[("ID", "draft")]),
            rec(&[("ID", "jones2019"), ("title", "Learning Systems")]),
            rec(&[("ID", "knuth84"), ("title", "TeX")]),
        ];
        match library.bulk_update(Access::default(), entries, false).await {
            Err(ApiError::Duplicate { verdicts, added }) => {
                assert_eq!(verdicts.len(), 1);
                assert_eq!(added, vec!["knuth84"]);
            }
            other => panic!("expected duplicate, got {other:?}"),
        }

        let found = library.get(Access::default(), &["knuth84".into()]).await.unwrap();
        assert!(found[0].is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_similar_updates_admit_one() {
        let (_temp, library) = setup(None, &[]);
        let library = Arc::new(library);

        let submit = |id: &'static str| {
            let library = library.clone();
            tokio::spawn(async move {
                let entries = vec![rec(&[("ID", id), ("title", "Learning Systems"), ("year", "2019")])];
                library.bulk_update(Access::default(), entries, false).await
            })
        };
        let (first, second) = tokio::join!(submit("jones19"), submit("jones2019"));

        let mut added = Vec::new();
        let mut verdicts = 0;
        for outcome in [first.unwrap(), second.unwrap()] {
            match outcome {
                Ok(ids) => added.extend(ids),
                Err(ApiError::Duplicate { verdicts: v, added: a }) => {
                    assert!(a.is_empty());
                    verdicts += v.len();
                }
                other => panic!("expected added or duplicate, got {other:?}"),
            }
        }
        assert_eq!(added.len(), 1);
        assert_eq!(verdicts, 1);

        let realm = library.registry().ensure_loaded(None).await.unwrap();
        assert_eq!(realm.read().await.store().len(), 1);
    }

    #[tokio::test]
    async fn test_single_entry_lifecycle() {
        let (_temp, library) = setup(None, &[]);
        let open = Access::default();

        let created = library
            .create(open, "lamport94", map(&[("title", "LaTeX"), ("ENTRYTYPE", "book")]), false)
            .await
            .unwrap();
        assert_eq!(created.id(), "lamport94");

        let err = library
            .create(open, "lamport94", map(&[("title", "LaTeX")]), false)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "exists");

        library
            .replace(open, "lamport94", map(&[("title", "LaTeX, 2nd ed.")]), false)
            .await
            .unwrap();
        assert_eq!(
            library.entry(open, "lamport94").await.unwrap().get("title"),
            Some("LaTeX, 2nd ed.")
        );

        let err = library.replace(open, "nobody", map(&[("title", "X")]), false).await.unwrap_err();
        assert_eq!(err.reason(), "not_found");

        library.delete(open, "lamport94").await.unwrap();
        assert_eq!(library.delete(open, "lamport94").await.unwrap_err().reason(), "not_found");
    }

    #[tokio::test]
    async fn test_suggest_prefers_direct_match() {
        let (_temp, library) = setup(
            None,
            &[
                rec(&[("ID", "smith2020"), ("title", "A")]),
                rec(&[("ID", "smith2021"), ("title", "B")]),
            ],
        );

        let direct = library.suggest(Access::default(), "smith2020").await.unwrap();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].score, 1.0);

        let fuzzy = library.suggest(Access::default(), "smyth2022").await.unwrap();
        assert!(!fuzzy.is_empty());
        assert!(fuzzy.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_webhook_ignores_own_commits() {
        let (_temp, library) = setup(None, &[]);

        let own = vec![WebhookCommit {
            title: Some("[bibsync] Added x".into()),
            message: None,
        }];
        assert!(!library.webhook(None, &own).await.unwrap());

        let external = vec![WebhookCommit {
            title: None,
            message: Some("Manual edit".into()),
        }];
        assert!(library.webhook(None, &external).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_realm_name() {
        let (_temp, library) = setup(None, &[]);
        let err = library
            .entry(Access::new(Some("../etc"), None), "x")
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "invalid_request");
    }
}
