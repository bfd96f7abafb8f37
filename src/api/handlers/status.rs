//! Version and health handlers.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::api::ApiState;
use crate::wire::{VersionInfo, PROTOCOL_VERSION};

/// Health response.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,

    /// Crate version of the daemon.
    pub version: String,

    /// Realms currently resident.
    pub realms: Vec<String>,
}

/// Protocol version handshake.
pub async fn version(State(state): State<Arc<ApiState>>) -> Json<VersionInfo> {
    Json(VersionInfo {
        version: PROTOCOL_VERSION,
        url: state.client_url.clone(),
    })
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        realms: state.library.registry().loaded().await,
    })
}
