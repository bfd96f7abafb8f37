//! Mutating handlers.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    Json,
};

use crate::api::error::Result;
use crate::api::ApiState;
use crate::library::Access;
use crate::wire::{AccessParams, Ack, EntryRequest, UpdateRequest};

/// Reconcile a batch of records.
pub async fn bulk_update(
    State(state): State<Arc<ApiState>>,
    body: std::result::Result<Json<UpdateRequest>, JsonRejection>,
) -> Result<Json<Ack>> {
    let Json(req) = body?;
    let who = Access::new(req.realm.as_deref(), req.token.as_deref());

    let added = state.library.bulk_update(who, req.entries, req.force).await?;
    Ok(Json(Ack {
        success: true,
        added: Some(added),
    }))
}

pub async fn create(
    State(state): State<Arc<ApiState>>,
    Path(key): Path<String>,
    body: std::result::Result<Json<EntryRequest>, JsonRejection>,
) -> Result<Json<Ack>> {
    let Json(req) = body?;
    let who = Access::new(req.realm.as_deref(), req.token.as_deref());

    let record = state.library.create(who, &key, req.entry, req.force).await?;
    Ok(Json(Ack {
        success: true,
        added: Some(vec![record.id().to_string()]),
    }))
}

pub async fn replace(
    State(state): State<Arc<ApiState>>,
    Path(key): Path<String>,
    body: std::result::Result<Json<EntryRequest>, JsonRejection>,
) -> Result<Json<Ack>> {
    let Json(req) = body?;
    let who = Access::new(req.realm.as_deref(), req.token.as_deref());

    state.library.replace(who, &key, req.entry, req.force).await?;
    Ok(Json(Ack {
        success: true,
        added: None,
    }))
}

pub async fn delete(
    State(state): State<Arc<ApiState>>,
    Path(key): Path<String>,
    params: std::result::Result<Query<AccessParams>, QueryRejection>,
) -> Result<Json<Ack>> {
    let Query(params) = params?;
    let who = Access::new(params.realm.as_deref(), params.token.as_deref());

    state.library.delete(who, &key).await?;
    Ok(Json(Ack {
        success: true,
        added: None,
    }))
}
