//! Client side: talks to a bibsync daemon and keeps a local bibliography in
//! step with a realm.

pub mod cache;
pub mod prompt;
pub mod resolve;
pub mod sync;

use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::classify::{Suggestion, Verdict};
use crate::policy::PolicyRejection;
use crate::record::{FieldMap, Record};
use crate::store::StoreError;
use crate::wire::{
    AccessParams, Ack, EntryRequest, Failure, KeysRequest, SearchParams, SuggestResponse, UpdateRequest,
    VersionInfo,
};

pub use cache::ChangeCache;
pub use prompt::PromptResolver;
pub use resolve::{resolve, Action, Conflict, Resolution, Resolver, SameKeyChoice, SimilarChoice};
pub use sync::{sync_bibliography, SyncOptions, SyncReport, Unresolved};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server refused the request ({reason}): {message}")]
    Server { reason: String, message: String },

    #[error("Server speaks protocol {server}, this client speaks {client}; get a newer client from {url}")]
    Outdated { server: u32, client: u32, url: String },

    #[error("Local bibliography: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl From<Failure> for ClientError {
    fn from(failure: Failure) -> Self {
        ClientError::Server {
            reason: failure.reason,
            message: failure.message,
        }
    }
}

/// Answer to a bulk update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateReply {
    pub added: Vec<String>,
    pub duplicates: Vec<Verdict>,
    pub rejected: Vec<PolicyRejection>,
}

/// Operations the sync flow needs from a server.
#[allow(async_fn_in_trait)]
pub trait Remote {
    async fn version(&self) -> Result<VersionInfo>;

    /// Submit a batch; duplicate and policy outcomes are part of the reply.
    async fn update(&self, entries: &[Record], force: bool) -> Result<UpdateReply>;

    async fn get_json(&self, keys: &[String]) -> Result<Vec<Option<Record>>>;

    async fn suggest(&self, key: &str) -> Result<Vec<Suggestion>>;

    async fn create(&self, record: &Record, force: bool) -> Result<()>;

    async fn replace(&self, key: &str, record: &Record, force: bool) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// `http://host:port` or `http://host:port/v1` → `http://host:port/v1`.
pub fn api_base(server: &str) -> String {
    let trimmed = server.trim().trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}

/// Remote over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    base: String,
    realm: Option<String>,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(server: &str, realm: Option<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: api_base(server),
            realm,
            token,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    fn access(&self) -> AccessParams {
        AccessParams {
            realm: self.realm.clone(),
            token: self.token.clone(),
        }
    }

    fn entry_request(&self, record: &Record, force: bool) -> EntryRequest {
        EntryRequest {
            entry: FieldMap::from(record.clone()),
            realm: self.realm.clone(),
            token: self.token.clone(),
            force,
        }
    }

    /// Send a request; a non-2xx answer comes back as its failure body.
    async fn exchange(&self, request: RequestBuilder) -> Result<std::result::Result<Response, Failure>> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(Ok(response));
        }

        let text = response.text().await?;
        debug!(status = %status, body = %text, "Server returned failure");
        let failure = serde_json::from_str::<Failure>(&text).unwrap_or_else(|_| Failure {
            reason: format!("http_{}", status.as_u16()),
            message: text,
            ..Default::default()
        });
        Ok(Err(failure))
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        match self.exchange(request).await? {
            Ok(response) => Ok(response.json().await?),
            Err(failure) => Err(failure.into()),
        }
    }

    async fn text(&self, request: RequestBuilder) -> Result<String> {
        match self.exchange(request).await? {
            Ok(response) => Ok(response.text().await?),
            Err(failure) => Err(failure.into()),
        }
    }

    /// Matching records as BibTeX.
    pub async fn search(&self, query: &str) -> Result<String> {
        let params = SearchParams {
            query: query.to_string(),
            realm: self.realm.clone(),
            token: self.token.clone(),
        };
        self.text(self.client.get(self.url("search")).query(&params)).await
    }

    /// Ask the server to reload the realm.
    pub async fn resync(&self) -> Result<String> {
        self.text(self.client.get(self.url("sync")).query(&self.access())).await
    }
}

impl Remote for HttpRemote {
    async fn version(&self) -> Result<VersionInfo> {
        self.json(self.client.get(self.url("version"))).await
    }

    async fn update(&self, entries: &[Record], force: bool) -> Result<UpdateReply> {
        let body = UpdateRequest {
            entries: entries.to_vec(),
            realm: self.realm.clone(),
            token: self.token.clone(),
            force,
        };

        match self.exchange(self.client.post(self.url("update")).json(&body)).await? {
            Ok(response) => {
                let ack: Ack = response.json().await?;
                Ok(UpdateReply {
                    added: ack.added.unwrap_or_default(),
                    ..Default::default()
                })
            }
            Err(failure) if failure.reason == "duplicate" => Ok(UpdateReply {
                added: failure.added.clone().unwrap_or_default(),
                duplicates: failure.verdicts(),
                rejected: Vec::new(),
            }),
            Err(failure) if failure.reason == "policy" => Ok(UpdateReply {
                added: failure.added.clone().unwrap_or_default(),
                duplicates: Vec::new(),
                rejected: failure.rejections(),
            }),
            Err(failure) => Err(failure.into()),
        }
    }

    async fn get_json(&self, keys: &[String]) -> Result<Vec<Option<Record>>> {
        let body = KeysRequest {
            entries: keys.to_vec(),
            realm: self.realm.clone(),
            token: self.token.clone(),
        };
        self.json(self.client.post(self.url("get_json")).json(&body)).await
    }

    async fn suggest(&self, key: &str) -> Result<Vec<Suggestion>> {
        let url = self.url(&format!("suggest/{}", key));
        let response: SuggestResponse = self.json(self.client.get(url).query(&self.access())).await?;
        Ok(response.entries)
    }

    async fn create(&self, record: &Record, force: bool) -> Result<()> {
        let url = self.url(&format!("entry/{}", record.id()));
        let _: Ack = self
            .json(self.client.post(url).json(&self.entry_request(record, force)))
            .await?;
        Ok(())
    }

    async fn replace(&self, key: &str, record: &Record, force: bool) -> Result<()> {
        let url = self.url(&format!("entry/{}", key));
        let _: Ack = self
            .json(self.client.put(url).json(&self.entry_request(record, force)))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let url = self.url(&format!("entry/{}", key));
        let _: Ack = self
            .json(self.client.delete(url).query(&self.access()))
            .await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_base() {
        assert_eq!(api_base("http://localhost:8780"), "http://localhost:8780/v1");
        assert_eq!(api_base("http://localhost:8780/"), "http://localhost:8780/v1");
        assert_eq!(api_base("https://bib.example.org/v1/"), "https://bib.example.org/v1");
    }

    #[test]
    fn test_failure_to_error() {
        let failure: Failure = serde_json::from_str(
            r#"{"success": false, "reason": "access_denied", "message": "no read"}"#,
        )
        .unwrap();

        match ClientError::from(failure) {
            ClientError::Server { reason, message } => {
                assert_eq!(reason, "access_denied");
                assert_eq!(message, "no read");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
