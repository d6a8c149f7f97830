//! Admin HTTP surface (§4.16, §6.6): thin handlers over `AdminSurface`,
//! each deriving the actor ip for the audit log from the request itself
//! since this router sits behind the bearer-token gate, not a session.

use axum::extract::{Path, Request, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::admin::BackupFile;
use crate::api::{client_ip, AppState};
use crate::cache::CacheStats;
use crate::db::models::{JobStatus, ScheduledJob};
use crate::error::{AppError, AppResult};

#[derive(Debug, Deserialize)]
pub struct BoostBody {
    delta: i32,
}

pub async fn boost_priority(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    req: Request,
) -> AppResult<()> {
    let ip = client_ip(&req);
    let body: BoostBody = read_json(req).await?;
    state.admin.boost_priority(&ip, id, body.delta).await
}

#[derive(Debug, Deserialize)]
pub struct BulkIdsBody {
    ids: Vec<i64>,
}

pub async fn bulk_retry(
    State(state): State<AppState>,
    req: Request,
) -> AppResult<Json<serde_json::Value>> {
    let ip = client_ip(&req);
    let body: BulkIdsBody = read_json(req).await?;
    let n = state.admin.bulk_retry(&ip, &body.ids).await?;
    Ok(Json(serde_json::json!({ "updated": n })))
}

#[derive(Debug, Deserialize)]
pub struct BulkStatusBody {
    ids: Vec<i64>,
    status: JobStatus,
}

pub async fn bulk_status(
    State(state): State<AppState>,
    req: Request,
) -> AppResult<Json<serde_json::Value>> {
    let ip = client_ip(&req);
    let body: BulkStatusBody = read_json(req).await?;
    let n = state.admin.bulk_status(&ip, &body.ids, body.status).await?;
    Ok(Json(serde_json::json!({ "updated": n })))
}

pub async fn list_scheduled_jobs(State(state): State<AppState>) -> AppResult<Json<Vec<ScheduledJob>>> {
    Ok(Json(state.admin.list_scheduled_jobs().await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateScheduledJobBody {
    name: String,
    description: Option<String>,
    subreddit_id: i64,
    cron_expression: String,
    priority: Option<i32>,
}

pub async fn create_scheduled_job(
    State(state): State<AppState>,
    req: Request,
) -> AppResult<Json<serde_json::Value>> {
    let ip = client_ip(&req);
    let body: CreateScheduledJobBody = read_json(req).await?;
    let id = state
        .admin
        .create_scheduled_job(
            &ip,
            &body.name,
            body.description.as_deref(),
            body.subreddit_id,
            &body.cron_expression,
            body.priority.unwrap_or(0),
        )
        .await?;
    Ok(Json(serde_json::json!({ "id": id })))
}

pub async fn delete_scheduled_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    req: Request,
) -> AppResult<()> {
    let ip = client_ip(&req);
    state.admin.delete_scheduled_job(&ip, id).await
}

#[derive(Debug, Deserialize)]
pub struct ToggleBody {
    enabled: bool,
}

pub async fn toggle_scheduled_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    req: Request,
) -> AppResult<()> {
    let ip = client_ip(&req);
    let body: ToggleBody = read_json(req).await?;
    state.admin.toggle_scheduled_job(&ip, id, body.enabled).await
}

pub async fn invalidate_cache(State(state): State<AppState>, req: Request) -> AppResult<()> {
    let ip = client_ip(&req);
    state.admin.invalidate_cache(&ip).await
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.admin.cache_stats())
}

/// §6.9: `{name, size, modified}[]`, ascending by name. No `dir` query
/// param — the backup directory is fixed, not client-supplied.
pub async fn list_backups(State(state): State<AppState>) -> AppResult<Json<Vec<BackupFile>>> {
    Ok(Json(state.admin.list_backup_files()?))
}

pub async fn download_backup(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Response> {
    let path = state.admin.resolve_backup_path(&name)?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| AppError::SystemInternal(e.to_string()))?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/sql".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{name}\"")),
        ],
        bytes,
    )
        .into_response())
}

/// Extracts a typed JSON body from a raw `Request`, mirroring what
/// `axum::Json<T>` would do as an extractor, needed here because the
/// `client_ip` helper also needs the un-consumed request.
async fn read_json<T: serde::de::DeserializeOwned>(req: Request) -> AppResult<T> {
    let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| AppError::ValidationInvalidJson(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| AppError::ValidationInvalidJson(e.to_string()))
}
