//! REST API for the bibsync daemon.
//!
//! Provides HTTP endpoints for:
//! - Search, suggestions and key lookups
//! - Single-entry create, replace and delete
//! - Bulk reconciliation of a client's bibliography
//! - Resync, manual or triggered by a git hosting webhook

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::library::Library;

pub use error::ApiError;

/// Shared state for API handlers.
pub struct ApiState {
    /// Realms and the operations over them.
    pub library: Library,

    /// Advertised by `/v1/version` as the place to get a matching client.
    pub client_url: String,
}

impl ApiState {
    pub fn new(library: Library, client_url: impl Into<String>) -> Self {
        Self {
            library,
            client_url: client_url.into(),
        }
    }
}

/// Build the API router with all routes.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/version", get(handlers::status::version))
        .route("/v1/status", get(handlers::status::health))
        // Lookups
        .route("/v1/search", get(handlers::query::search))
        .route("/v1/suggest/:key", get(handlers::query::suggest))
        .route("/v1/bibentry/:key", get(handlers::query::bibentry))
        .route("/v1/get", post(handlers::query::get_bibtex))
        .route("/v1/get_json", post(handlers::query::get_json))
        // Mutations
        .route(
            "/v1/entry/:key",
            get(handlers::query::entry)
                .post(handlers::entries::create)
                .put(handlers::entries::replace)
                .delete(handlers::entries::delete),
        )
        .route("/v1/update", post(handlers::entries::bulk_update))
        // Resync
        .route("/v1/sync", get(handlers::sync::resync))
        .route("/v1/webhook", post(handlers::sync::webhook))
        // Middleware
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri().path(),
                    )
                })
                // Only log responses that are not 2xx
                .on_request(())
                .on_response(|response: &axum::http::Response<_>, latency: std::time::Duration, _span: &tracing::Span| {
                    let status = response.status();
                    if !status.is_success() {
                        tracing::warn!(
                            status = %status,
                            latency_ms = latency.as_millis(),
                            "request failed"
                        );
                    }
                })
        )
        .with_state(state)
}

/// Start the API server.
pub async fn serve(state: Arc<ApiState>, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;

    tracing::info!("bibsync API listening on {}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
