//! Plain paginated listings over the normalized entities and the crawl
//! queue (§6.1), `limit`/`offset` only — no cursor, these are small
//! operational views rather than the graph's bulk payloads.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::AppState;
use crate::db::models::{Comment, CrawlJob, Post, Subreddit, User};
use crate::error::AppResult;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

impl ListQuery {
    fn bounds(&self) -> (i64, i64) {
        (self.limit.unwrap_or(50).clamp(1, 500), self.offset.unwrap_or(0).max(0))
    }
}

pub async fn list_subreddits(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> AppResult<Json<Vec<Subreddit>>> {
    let (limit, offset) = q.bounds();
    let rows = sqlx::query_as!(
        Subreddit,
        r#"
        SELECT id, external_id, name, created_at, updated_at, last_crawled_at
        FROM subreddits
        ORDER BY id
        LIMIT $1 OFFSET $2
        "#,
        limit,
        offset,
    )
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

pub async fn list_users(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> AppResult<Json<Vec<User>>> {
    let (limit, offset) = q.bounds();
    let rows = sqlx::query_as!(
        User,
        r#"
        SELECT id, username, created_at, updated_at, last_seen_at
        FROM users
        ORDER BY id
        LIMIT $1 OFFSET $2
        "#,
        limit,
        offset,
    )
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

pub async fn list_posts(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> AppResult<Json<Vec<Post>>> {
    let (limit, offset) = q.bounds();
    let rows = sqlx::query_as!(
        Post,
        r#"
        SELECT id, external_id, subreddit_id, author_id, title, created_at, updated_at
        FROM posts
        ORDER BY id
        LIMIT $1 OFFSET $2
        "#,
        limit,
        offset,
    )
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

pub async fn list_comments(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> AppResult<Json<Vec<Comment>>> {
    let (limit, offset) = q.bounds();
    let rows = sqlx::query_as!(
        Comment,
        r#"
        SELECT id, external_id, post_id, author_id, parent_comment_id, body, created_at, updated_at
        FROM comments
        ORDER BY id
        LIMIT $1 OFFSET $2
        "#,
        limit,
        offset,
    )
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> AppResult<Json<Vec<CrawlJob>>> {
    let (limit, offset) = q.bounds();
    let jobs = state.queue.list(limit, offset).await?;
    Ok(Json(jobs))
}
