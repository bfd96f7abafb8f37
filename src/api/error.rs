//! Failure responses.

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::auth::{Capability, Decision, DenyReason};
use crate::classify::Verdict;
use crate::policy::PolicyRejection;
use crate::realm::RealmError;
use crate::reconcile::ReconcileError;
use crate::record::{Record, RecordError};
use crate::store::StoreError;
use crate::wire::Failure;

/// Every way a request can fail, one variant per wire reason code.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Your token does not grant the {capability} capability in this realm")]
    AccessDenied { capability: Capability },

    #[error("{0}")]
    ServerProblem(String),

    #[error("{} entries rejected by policy", .rejected.len())]
    Policy {
        rejected: Vec<PolicyRejection>,
        added: Vec<String>,
    },

    #[error("{} submitted entries resemble existing ones", .verdicts.len())]
    Duplicate {
        verdicts: Vec<Verdict>,
        added: Vec<String>,
    },

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists: {}", .0.id())]
    Exists(Box<Record>),

    #[error("Missing or malformed entry: {0}")]
    MissingEntry(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    /// Wire reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            ApiError::AccessDenied { .. } => DenyReason::AccessDenied.code(),
            ApiError::ServerProblem(_) => DenyReason::ServerProblem.code(),
            ApiError::Policy { .. } => "policy",
            ApiError::Duplicate { .. } => "duplicate",
            ApiError::NotFound(_) => "not_found",
            ApiError::Exists(_) => "exists",
            ApiError::MissingEntry(_) => "missing_entry",
            ApiError::InvalidRequest(_) => "invalid_request",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::AccessDenied { .. } => StatusCode::FORBIDDEN,
            ApiError::ServerProblem(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Policy { .. } | ApiError::Duplicate { .. } | ApiError::Exists(_) => {
                StatusCode::CONFLICT
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MissingEntry(_) | ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Turn a denial into an error; grants pass through.
    pub fn from_decision(decision: Decision) -> Result<()> {
        match decision {
            Decision::Grant => Ok(()),
            Decision::Deny {
                reason: DenyReason::AccessDenied,
                capability,
            } => Err(ApiError::AccessDenied { capability }),
            Decision::Deny {
                reason: DenyReason::ServerProblem,
                ..
            } => Err(ApiError::ServerProblem(
                "The realm's token table holds no tokens; contact the server operator".to_string(),
            )),
        }
    }

    /// Body sent to the client.
    pub fn to_failure(&self) -> Failure {
        let mut failure = Failure {
            success: false,
            reason: self.reason().to_string(),
            message: self.to_string(),
            ..Default::default()
        };

        match self {
            ApiError::Policy { rejected, added } => {
                failure.entries = serde_json::to_value(rejected).ok();
                failure.added = Some(added.clone());
            }
            ApiError::Duplicate { verdicts, added } => {
                failure.entries = serde_json::to_value(verdicts).ok();
                failure.added = Some(added.clone());
            }
            ApiError::Exists(record) => failure.entry = Some((**record).clone()),
            _ => {}
        }

        failure
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(reason = self.reason(), error = %self, "Request failed");
        }
        (status, Json(self.to_failure())).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::MissingEntry(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::InvalidRequest(rejection.body_text())
    }
}

impl From<RecordError> for ApiError {
    fn from(e: RecordError) -> Self {
        ApiError::MissingEntry(e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::QueryTooShort(_) => ApiError::InvalidRequest(e.to_string()),
            other => ApiError::ServerProblem(other.to_string()),
        }
    }
}

impl From<RealmError> for ApiError {
    fn from(e: RealmError) -> Self {
        match e {
            RealmError::InvalidName(_) => ApiError::InvalidRequest(e.to_string()),
            other => ApiError::ServerProblem(other.to_string()),
        }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::NotFound(key) => ApiError::NotFound(key),
            ReconcileError::Exists(record) => ApiError::Exists(record),
            ReconcileError::Policy(rejection) => ApiError::Policy {
                rejected: vec![*rejection],
                added: Vec::new(),
            },
            ReconcileError::Commit(e) => ApiError::from(e),
        }
    }
}
