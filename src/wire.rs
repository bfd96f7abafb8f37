//! Request and response bodies shared by the daemon and the client.

use serde::{Deserialize, Serialize};

use crate::classify::{Suggestion, Verdict};
use crate::policy::PolicyRejection;
use crate::record::{FieldMap, Record};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// `GET /v1/version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: u32,

    /// Where to fetch a matching client.
    pub url: String,
}

/// Realm and token passed as query parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// `GET /v1/search`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub query: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// `POST /v1/update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub entries: Vec<Record>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default)]
    pub force: bool,
}

/// `POST|PUT /v1/entry/{key}`.
///
/// The entry is a raw field map: its ID may be omitted and is then taken
/// from the path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRequest {
    pub entry: FieldMap,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default)]
    pub force: bool,
}

/// `POST /v1/get` and `POST /v1/get_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysRequest {
    /// Citation keys.
    pub entries: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Plain acknowledgement, optionally listing accepted IDs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<Vec<String>>,
}

/// `GET /v1/entry/{key}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryResponse {
    pub success: bool,
    pub entry: Record,
}

/// `GET /v1/suggest/{key}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestResponse {
    pub success: bool,
    pub entries: Vec<Suggestion>,
}

/// Failure body returned with every non-2xx status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Failure {
    pub success: bool,
    pub reason: String,

    #[serde(default)]
    pub message: String,

    /// Verdicts for `duplicate`, annotated records for `policy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<serde_json::Value>,

    /// Stored record for `exists`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<Record>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<Vec<String>>,
}

impl Failure {
    /// Verdicts carried by a `duplicate` failure.
    pub fn verdicts(&self) -> Vec<Verdict> {
        self.entries
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Rejections carried by a `policy` failure.
    pub fn rejections(&self) -> Vec<PolicyRejection> {
        self.entries
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

/// Git hosting push notification; only commit texts matter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub commits: Vec<WebhookCommit>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookCommit {
    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub message: Option<String>,
}

impl WebhookCommit {
    /// Title or message carries the server's marker.
    pub fn is_own(&self) -> bool {
        [&self.title, &self.message]
            .into_iter()
            .flatten()
            .any(|text| crate::realm::is_own_commit(text))
    }
}
