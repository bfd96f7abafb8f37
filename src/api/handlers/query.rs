//! Read-only handlers: search, suggest and key lookups.

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
use crate::record::{bibtex, Record};
use crate::wire::{AccessParams, EntryResponse, KeysRequest, SearchParams, SuggestResponse};

fn access(params: &AccessParams) -> Access<'_> {
    Access::new(params.realm.as_deref(), params.token.as_deref())
}

/// Matching records as BibTeX.
pub async fn search(
    State(state): State<Arc<ApiState>>,
    params: std::result::Result<Query<SearchParams>, QueryRejection>,
) -> Result<String> {
    let Query(params) = params?;
    let who = Access::new(params.realm.as_deref(), params.token.as_deref());

    let found = state.library.search(who, &params.query).await?;
    Ok(bibtex::render_all(&found))
}

pub async fn suggest(
    State(state): State<Arc<ApiState>>,
    Path(key): Path<String>,
    params: std::result::Result<Query<AccessParams>, QueryRejection>,
) -> Result<Json<SuggestResponse>> {
    let Query(params) = params?;

    let entries = state.library.suggest(access(&params), &key).await?;
    Ok(Json(SuggestResponse {
        success: true,
        entries,
    }))
}

pub async fn entry(
    State(state): State<Arc<ApiState>>,
    Path(key): Path<String>,
    params: std::result::Result<Query<AccessParams>, QueryRejection>,
) -> Result<Json<EntryResponse>> {
    let Query(params) = params?;

    let entry = state.library.entry(access(&params), &key).await?;
    Ok(Json(EntryResponse { success: true, entry }))
}

/// One entry as BibTeX.
pub async fn bibentry(
    State(state): State<Arc<ApiState>>,
    Path(key): Path<String>,
    params: std::result::Result<Query<AccessParams>, QueryRejection>,
) -> Result<String> {
    let Query(params) = params?;

    let entry = state.library.entry(access(&params), &key).await?;
    Ok(bibtex::render(&entry))
}

/// Found records for a list of keys, concatenated as BibTeX.
pub async fn get_bibtex(
    State(state): State<Arc<ApiState>>,
    body: std::result::Result<Json<KeysRequest>, JsonRejection>,
) -> Result<String> {
    let Json(req) = body?;
    let who = Access::new(req.realm.as_deref(), req.token.as_deref());

    let found = state.library.get(who, &req.entries).await?;
    Ok(bibtex::render_all(found.iter().flatten()))
}

/// One slot per key, `null` where nothing matches.
pub async fn get_json(
    State(state): State<Arc<ApiState>>,
    body: std::result::Result<Json<KeysRequest>, JsonRejection>,
) -> Result<Json<Vec<Option<Record>>>> {
    let Json(req) = body?;
    let who = Access::new(req.realm.as_deref(), req.token.as_deref());

    Ok(Json(state.library.get(who, &req.entries).await?))
}
