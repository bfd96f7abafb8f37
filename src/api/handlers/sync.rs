//! Resync handlers.

use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    Json,
};

use crate::api::error::Result;
use crate::api::ApiState;
use crate::wire::{AccessParams, Ack, WebhookPayload};

/// Reload a realm from its log.
pub async fn resync(
    State(state): State<Arc<ApiState>>,
    params: std::result::Result<Query<AccessParams>, QueryRejection>,
) -> Result<&'static str> {
    let Query(params) = params?;
    state.library.resync(params.realm.as_deref()).await?;
    Ok("Synced!")
}

/// Push notification from the git host.
///
/// A body that does not parse is treated as carrying no commits.
pub async fn webhook(
    State(state): State<Arc<ApiState>>,
    params: std::result::Result<Query<AccessParams>, QueryRejection>,
    payload: Option<Json<WebhookPayload>>,
) -> Result<Json<Ack>> {
    let Query(params) = params?;
    let payload = payload.map(|Json(p)| p).unwrap_or_default();

    state
        .library
        .webhook(params.realm.as_deref(), &payload.commits)
        .await?;

    Ok(Json(Ack {
        success: true,
        added: None,
    }))
}
