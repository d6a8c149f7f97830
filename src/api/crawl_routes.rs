//! Crawl-on-demand route (§6.1): enqueues a job for a subreddit named by
//! the caller, creating the subreddit row if it doesn't exist yet.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::api::AppState;
use crate::error::{AppError, AppResult};

#[derive(Debug, Deserialize)]
pub struct EnqueueCrawlBody {
    subreddit: String,
    priority: Option<i32>,
}

/// Subreddit names are `[A-Za-z0-9_]{3,21}` on Reddit; reject anything
/// else before it reaches the queue or the fetcher.
fn valid_subreddit_name(name: &str) -> bool {
    (3..=21).contains(&name.len())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub async fn enqueue_crawl(
    State(state): State<AppState>,
    Json(body): Json<EnqueueCrawlBody>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    let name = body.subreddit.trim();
    if !valid_subreddit_name(name) {
        return Err(AppError::CrawlInvalidSubreddit(name.to_string()));
    }

    let subreddit_id = sqlx::query_scalar!(
        r#"
        INSERT INTO subreddits (external_id, name, created_at, updated_at)
        VALUES ($1, $1, now(), now())
        ON CONFLICT (name) DO UPDATE SET updated_at = now()
        RETURNING id
        "#,
        name,
    )
    .fetch_one(&state.pool)
    .await
    .map_err(|e| AppError::CrawlQueueFailed(e.to_string()))?;

    let job_id = state
        .queue
        .enqueue(subreddit_id, body.priority.unwrap_or(50))
        .await
        .map_err(|e| AppError::CrawlQueueFailed(e.to_string()))?;

    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "job_id": job_id, "subreddit_id": subreddit_id }))))
}
