//! Graph query routes (§6.1): the main graph endpoint, cursor pagination,
//! region queries, the community overview, per-community subgraphs,
//! bundles, and the version/diff pair the websocket fallback also uses.
//!
//! Every handler checks the response cache before touching the query
//! layer and populates it on a miss, keyed by operation name plus the
//! normalized query string.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::AppState;
use crate::cache::ResponseCache;
use crate::diff_broadcaster::DiffBroadcaster;
use crate::error::{AppError, AppResult};
use crate::graph::query::GraphQueryParams;
use crate::graph::types::GraphPayload;

#[derive(Debug, Deserialize)]
pub struct GraphQuery {
    max_nodes: Option<i64>,
    max_links: Option<i64>,
    types: Option<String>,
    with_positions: Option<bool>,
    cursor: Option<String>,
    page_size: Option<i64>,
}

pub async fn get_graph(
    State(state): State<AppState>,
    Query(q): Query<GraphQuery>,
) -> AppResult<Json<GraphPayload>> {
    let with_positions = q.with_positions.unwrap_or(false);
    let cache_key = ResponseCache::key(
        "get_graph",
        &format!(
            "max_nodes={:?}&max_links={:?}&types={:?}&cursor={:?}&page_size={:?}",
            q.max_nodes, q.max_links, q.types, q.cursor, q.page_size
        ),
        with_positions,
    );

    if let Some(bytes) = state.cache.get(&cache_key) {
        state.metrics.cache_hits.inc();
        let payload: GraphPayload = serde_json::from_slice(&bytes)
            .map_err(|e| AppError::SystemInternal(e.to_string()))?;
        return Ok(Json(payload));
    }
    state.metrics.cache_misses.inc();

    let payload = if q.cursor.is_some() || q.page_size.is_some() {
        state
            .query_layer
            .get_graph_paginated(q.cursor, q.page_size.unwrap_or(5000), with_positions)
            .await?
    } else {
        let types = q.types.map(|s| s.split(',').map(|t| t.trim().to_string()).collect());
        state
            .query_layer
            .get_graph(GraphQueryParams {
                max_nodes: q.max_nodes.unwrap_or(20_000),
                max_links: q.max_links.unwrap_or(50_000),
                types,
                with_positions,
            })
            .await?
    };

    if let Ok(bytes) = serde_json::to_vec(&payload) {
        state.cache.put(cache_key, bytes);
    }
    Ok(Json(payload))
}

#[derive(Debug, Deserialize)]
pub struct OverviewQuery {
    max_nodes: Option<i64>,
    max_links: Option<i64>,
    with_positions: Option<bool>,
}

pub async fn get_overview(
    State(state): State<AppState>,
    Query(q): Query<OverviewQuery>,
) -> AppResult<Json<GraphPayload>> {
    let with_positions = q.with_positions.unwrap_or(false);
    let cache_key = ResponseCache::key(
        "get_overview",
        &format!("max_nodes={:?}&max_links={:?}", q.max_nodes, q.max_links),
        with_positions,
    );

    if let Some(bytes) = state.cache.get(&cache_key) {
        state.metrics.cache_hits.inc();
        let payload: GraphPayload = serde_json::from_slice(&bytes)
            .map_err(|e| AppError::SystemInternal(e.to_string()))?;
        return Ok(Json(payload));
    }
    state.metrics.cache_misses.inc();

    let payload = state
        .query_layer
        .get_overview(q.max_nodes.unwrap_or(100), q.max_links.unwrap_or(500), with_positions)
        .await?;

    if let Ok(bytes) = serde_json::to_vec(&payload) {
        state.cache.put(cache_key, bytes);
    }
    Ok(Json(payload))
}

#[derive(Debug, Deserialize)]
pub struct RegionQuery {
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
    z_min: f64,
    z_max: f64,
    max_nodes: Option<i64>,
    max_links: Option<i64>,
}

pub async fn get_region(
    State(state): State<AppState>,
    Query(q): Query<RegionQuery>,
) -> AppResult<Json<GraphPayload>> {
    let payload = state
        .query_layer
        .get_region(
            (q.x_min, q.x_max, q.y_min, q.y_max, q.z_min, q.z_max),
            q.max_nodes.unwrap_or(20_000),
            q.max_links.unwrap_or(50_000),
        )
        .await?;
    Ok(Json(payload))
}

#[derive(Debug, Deserialize)]
pub struct CommunityQuery {
    max_nodes: Option<i64>,
    max_links: Option<i64>,
    with_positions: Option<bool>,
}

pub async fn get_community(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<CommunityQuery>,
) -> AppResult<Json<GraphPayload>> {
    let payload = state
        .query_layer
        .get_community_subgraph(
            id,
            q.max_nodes.unwrap_or(20_000),
            q.max_links.unwrap_or(50_000),
            q.with_positions.unwrap_or(false),
        )
        .await?;
    Ok(Json(payload))
}

#[derive(Debug, Deserialize)]
pub struct BundlesQuery {
    min_weight: Option<i64>,
}

pub async fn get_bundles(
    State(state): State<AppState>,
    Query(q): Query<BundlesQuery>,
) -> AppResult<Json<Vec<crate::db::models::Bundle>>> {
    let bundles = state.query_layer.get_bundles(q.min_weight.unwrap_or(1)).await?;
    Ok(Json(bundles))
}

#[derive(Debug, serde::Serialize)]
pub struct VersionResponse {
    version_id: i64,
    node_count: i64,
    link_count: i64,
}

pub async fn get_version(State(state): State<AppState>) -> AppResult<Json<VersionResponse>> {
    let (version_id, node_count, link_count) = state.query_layer.get_version().await?;
    Ok(Json(VersionResponse { version_id, node_count, link_count }))
}

#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    #[serde(rename = "since")]
    since_version: i64,
}

/// HTTP fallback for clients that can't hold a websocket open: the same
/// diff-or-advisory computation the broadcaster performs on each tick.
pub async fn get_diff(
    State(state): State<AppState>,
    Query(q): Query<DiffQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let broadcaster = DiffBroadcaster::new(state.pool.clone(), state.version_rx.clone());
    match broadcaster.compute_diff(q.since_version).await? {
        Some(diff) => Ok(Json(serde_json::json!({ "action": "diff", "payload": diff }))),
        None => Ok(Json(serde_json::json!({
            "action": "advisory",
            "message": "version gap too large, refetch",
        }))),
    }
}
