//! End-to-end tests: a real daemon on an ephemeral port, driven over HTTP.

use std::fs;
use std::sync::Arc;

use bibsync::{
    api::{self, ApiState},
    auth::{Authorizer, TOKENS_FILE},
    client::{sync_bibliography, Conflict, HttpRemote, Remote, Resolver, SameKeyChoice, SimilarChoice, SyncOptions},
    policy::RequiredFields,
    wire::{Failure, PROTOCOL_VERSION},
    Library, Record, ServerConfig,
};
use serde_json::json;
use tempfile::TempDir;

const BIB: &str = r#"
@article{smith2020,
  title = {Foo Systems},
  author = {Smith, Jane},
  year = {2020}
}

@book{knuth84,
  title = {Literate Programming},
  author = {Knuth, Donald},
  year = {1984}
}
"#;

const TOKENS: &str = r#"{
    "reader": {"search": true, "read": true},
    "writer": {"search": true, "read": true, "write": true, "delete": true}
}"#;

struct Server {
    url: String,
    temp: TempDir,
    client: reqwest::Client,
}

impl Server {
    async fn start() -> Self {
        let temp = TempDir::new().unwrap();
        let config = ServerConfig::new(temp.path().to_path_buf()).without_commit();

        let open = config.realm_dir("default");
        fs::create_dir_all(&open).unwrap();
        fs::write(open.join(&config.bib_file), BIB).unwrap();

        let locked = config.realm_dir("locked");
        fs::create_dir_all(&locked).unwrap();
        fs::write(locked.join(&config.bib_file), BIB).unwrap();
        fs::write(locked.join(TOKENS_FILE), TOKENS).unwrap();

        let broken = config.realm_dir("broken");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join(TOKENS_FILE), "{}").unwrap();

        let library = Library::new(config, Authorizer::new(), Arc::new(RequiredFields::new(["title"])));
        let state = Arc::new(ApiState::new(library, "https://example.invalid/bibsync"));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, api::router(state)).await.unwrap();
        });

        Self {
            url: format!("http://{}/v1", addr),
            temp,
            client: reqwest::Client::new(),
        }
    }

    fn remote(&self, realm: Option<&str>, token: Option<&str>) -> HttpRemote {
        HttpRemote::new(&self.url, realm.map(String::from), token.map(String::from))
    }

    fn path(&self, path: &str) -> String {
        format!("{}/{}", self.url, path)
    }

    fn bib_path(&self, realm: &str) -> std::path::PathBuf {
        self.temp.path().join(realm).join("references.bib")
    }
}

async fn failure(response: reqwest::Response) -> (u16, Failure) {
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn test_version() {
    let server = Server::start().await;
    let version = server.remote(None, None).version().await.unwrap();

    assert_eq!(version.version, PROTOCOL_VERSION);
    assert_eq!(version.url, "https://example.invalid/bibsync");
}

#[tokio::test]
async fn test_search_returns_bibtex() {
    let server = Server::start().await;
    let remote = server.remote(None, None);

    let text = remote.search("literate knuth").await.unwrap();
    assert!(text.starts_with("@book{knuth84,"));
    assert!(!text.contains("smith2020"));

    let response = server
        .client
        .get(server.path("search"))
        .query(&[("query", "of systems")])
        .send()
        .await
        .unwrap();
    let (status, body) = failure(response).await;
    assert_eq!(status, 400);
    assert_eq!(body.reason, "invalid_request");
}

#[tokio::test]
async fn test_lookups() {
    let server = Server::start().await;
    let remote = server.remote(None, None);

    let found = remote
        .get_json(&["knuth".to_string(), "nobody".to_string(), "smith2020".to_string()])
        .await
        .unwrap();
    assert_eq!(found[0].as_ref().map(Record::id), Some("knuth84"));
    assert!(found[1].is_none());
    assert_eq!(found[2].as_ref().map(Record::id), Some("smith2020"));

    let text = server
        .client
        .post(server.path("get"))
        .json(&json!({"entries": ["smith2020", "nobody"]}))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.starts_with("@article{smith2020,"));

    let entry: serde_json::Value = server
        .client
        .get(server.path("entry/knuth84"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(entry["success"], true);
    assert_eq!(entry["entry"]["ENTRYTYPE"], "book");

    let response = server.client.get(server.path("bibentry/nobody")).send().await.unwrap();
    let (status, body) = failure(response).await;
    assert_eq!(status, 404);
    assert_eq!(body.reason, "not_found");

    let suggestions = remote.suggest("smith2021").await.unwrap();
    assert_eq!(suggestions[0].record.id(), "smith2020");
    assert!(suggestions.iter().all(|s| s.score > 0.0 && s.score <= 1.0));
}

#[tokio::test]
async fn test_update_reports_duplicates_and_adds_the_rest() {
    let server = Server::start().await;

    let response = server
        .client
        .post(server.path("update"))
        .json(&json!({
            "entries": [
                {"ID": "smith2020", "ENTRYTYPE": "article", "title": "Foo Systems", "author": "Smith, Jane", "year": "2021"},
                {"ID": "lamport94", "ENTRYTYPE": "book", "title": "LaTeX: A Document Preparation System"}
            ]
        }))
        .send()
        .await
        .unwrap();
    let (status, body) = failure(response).await;

    assert_eq!(status, 409);
    assert_eq!(body.reason, "duplicate");
    assert_eq!(body.added, Some(vec!["lamport94".to_string()]));
    let verdicts = body.verdicts();
    assert_eq!(verdicts.len(), 1);
    assert_eq!(verdicts[0].distance, 1);
    assert!(verdicts[0].is_exact());

    // Resubmitting what is stored is a no-op.
    let reply = server
        .remote(None, None)
        .update(&[verdicts[0].existing.clone()], false)
        .await
        .unwrap();
    assert!(reply.added.is_empty());
    assert!(reply.duplicates.is_empty());
}

#[tokio::test]
async fn test_policy_rejection_and_missing_entry() {
    let server = Server::start().await;
    let remote = server.remote(None, None);

    let untitled = Record::new("draft", "misc").unwrap();
    let reply = remote.update(&[untitled.clone()], false).await.unwrap();
    assert_eq!(reply.rejected.len(), 1);
    assert!(reply.rejected[0].reason.contains("title"));

    let forced = remote.update(&[untitled], true).await.unwrap();
    assert_eq!(forced.added, vec!["draft"]);

    let response = server
        .client
        .post(server.path("update"))
        .json(&json!({"entries": [{"title": "No key"}]}))
        .send()
        .await
        .unwrap();
    let (status, body) = failure(response).await;
    assert_eq!(status, 400);
    assert_eq!(body.reason, "missing_entry");
}

#[tokio::test]
async fn test_unwritable_records_never_reach_the_file() {
    let server = Server::start().await;
    let remote = server.remote(None, None);
    let before = fs::read_to_string(server.bib_path("default")).unwrap();

    for entry in [
        json!({"ID": "smith 2021", "title": "Spaced key"}),
        json!({"ID": "sets21", "title": "Sets like } this"}),
        json!({"ID": "odd21", "ti tle": "Spaced field"}),
    ] {
        let response = server
            .client
            .post(server.path("update"))
            .json(&json!({"entries": [entry]}))
            .send()
            .await
            .unwrap();
        let (status, body) = failure(response).await;
        assert_eq!(status, 400);
        assert_eq!(body.reason, "missing_entry");
    }
    assert_eq!(fs::read_to_string(server.bib_path("default")).unwrap(), before);

    // What is accepted reads back identically after a reload.
    let messy: Record = serde_json::from_value(json!({
        "ID": "turing36",
        "title": "On Computable\n   Numbers",
        "note": "{Nested {braces}} stay",
    }))
    .unwrap();
    assert_eq!(remote.update(&[messy.clone()], false).await.unwrap().added, vec!["turing36"]);
    assert_eq!(remote.resync().await.unwrap(), "Synced!");

    let found = remote
        .get_json(&["turing36".to_string(), "knuth84".to_string()])
        .await
        .unwrap();
    assert_eq!(found[0].as_ref(), Some(&messy));
    assert_eq!(found[1].as_ref().map(Record::id), Some("knuth84"));

    let again = remote.update(&[messy], false).await.unwrap();
    assert!(again.added.is_empty());
    assert!(again.duplicates.is_empty());
}

#[tokio::test]
async fn test_entry_lifecycle() {
    let server = Server::start().await;
    let remote = server.remote(None, None);
    let record = Record::new("lamport94", "book")
        .unwrap()
        .with_field("title", "LaTeX");

    remote.create(&record, false).await.unwrap();

    let response = server
        .client
        .post(server.path("entry/knuth84"))
        .json(&json!({"entry": {"title": "Another"}}))
        .send()
        .await
        .unwrap();
    let (status, body) = failure(response).await;
    assert_eq!(status, 409);
    assert_eq!(body.reason, "exists");
    assert_eq!(body.entry.map(|e| e.id().to_string()), Some("knuth84".to_string()));

    let revised = record.clone().with_field("edition", "2");
    remote.replace("lamport94", &revised, false).await.unwrap();
    let stored = remote.get_json(&["lamport94".to_string()]).await.unwrap();
    assert_eq!(stored[0].as_ref(), Some(&revised));

    remote.delete("lamport94").await.unwrap();
    let err = remote.delete("lamport94").await.unwrap_err();
    assert!(err.to_string().contains("not_found"));

    let on_disk = fs::read_to_string(server.bib_path("default")).unwrap();
    assert!(!on_disk.contains("lamport94"));
}

#[tokio::test]
async fn test_authorization_per_realm() {
    let server = Server::start().await;

    let reader = server.remote(Some("locked"), Some("reader"));
    assert!(reader.search("literate").await.is_ok());

    let err = reader
        .create(&Record::new("x1", "misc").unwrap().with_field("title", "X"), false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("access_denied"));

    let response = server
        .client
        .get(server.path("search"))
        .query(&[("query", "literate"), ("realm", "locked"), ("token", "stranger")])
        .send()
        .await
        .unwrap();
    let (status, body) = failure(response).await;
    assert_eq!(status, 403);
    assert_eq!(body.reason, "access_denied");

    let response = server
        .client
        .get(server.path("entry/knuth84"))
        .query(&[("realm", "broken"), ("token", "anything")])
        .send()
        .await
        .unwrap();
    let (status, body) = failure(response).await;
    assert_eq!(status, 500);
    assert_eq!(body.reason, "server_problem");

    // The open realm is unaffected by the others' tables.
    assert!(server.remote(None, None).search("literate").await.is_ok());
}

#[tokio::test]
async fn test_resync_and_webhook_pick_up_external_edits() {
    let server = Server::start().await;
    let remote = server.remote(None, None);

    // Load the realm, then edit its file behind the server's back.
    assert!(remote.search("turing").await.unwrap().is_empty());
    let mut text = fs::read_to_string(server.bib_path("default")).unwrap();
    text.push_str("\n@article{turing36, title = {On Computable Numbers}}\n");
    fs::write(server.bib_path("default"), text).unwrap();

    // Own commits do not trigger a reload.
    server
        .client
        .post(server.path("webhook"))
        .json(&json!({"commits": [{"title": "[bibsync] Added x (Token none)"}]}))
        .send()
        .await
        .unwrap();
    assert!(remote.search("turing").await.unwrap().is_empty());

    server
        .client
        .post(server.path("webhook"))
        .json(&json!({"commits": [{"message": "Hand-edited turing36"}]}))
        .send()
        .await
        .unwrap();
    assert!(remote.search("turing").await.unwrap().contains("turing36"));

    assert_eq!(remote.resync().await.unwrap(), "Synced!");
}

/// Answers every conflict the same way.
struct Always(SameKeyChoice, SimilarChoice);

impl Resolver for Always {
    fn same_key(&mut self, _conflict: &Conflict) -> SameKeyChoice {
        self.0
    }

    fn similar(&mut self, _conflict: &Conflict) -> SimilarChoice {
        self.1
    }
}

#[tokio::test]
async fn test_client_sync_round_trip() {
    let server = Server::start().await;
    let project = TempDir::new().unwrap();
    let bib = project.path().join("paper.bib");
    fs::write(
        &bib,
        "@article{smith2020, title = {Foo Systems}, author = {Smith, Jane}, year = {2019}}\n\
         @misc{mine2022, title = {Unpublished Notes on Sync}}\n",
    )
    .unwrap();

    let remote = server.remote(None, None);
    let options = SyncOptions {
        keys: vec!["smith2020".into(), "mine2022".into(), "knuth84".into(), "knuth85".into()],
        ..Default::default()
    };
    let mut resolver = Always(SameKeyChoice::PullRemote, SimilarChoice::Ignore);

    let report = sync_bibliography(&remote, &bib, &options, &mut resolver).await.unwrap();

    assert!(!report.aborted);
    assert_eq!(report.pushed, vec!["mine2022"]);
    assert_eq!(report.pulled, vec!["knuth84"]);
    assert_eq!(report.unresolved.len(), 1);
    assert_eq!(report.unresolved[0].key, "knuth85");

    let local = fs::read_to_string(&bib).unwrap();
    assert!(local.contains("year = {2020}"));
    assert!(local.contains("knuth84"));

    let again = sync_bibliography(&remote, &bib, &options, &mut resolver).await.unwrap();
    assert!(again.skipped);
}
