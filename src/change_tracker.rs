//! Change tracking (C8, §4.8) and the integrity-sweep maintenance job.
//!
//! Every mutable table carries `updated_at`; this module only adds the
//! aggregate "what changed since version X" queries the incremental graph
//! materializer needs, plus a periodic sweep that repairs the dangling
//! references a crawl-then-delete race can leave behind.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::AppResult;

pub struct ChangeTracker {
    pool: PgPool,
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct ChangeCounts {
    pub subreddits: i64,
    pub users: i64,
    pub posts: i64,
    pub comments: i64,
}

impl ChangeTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Counts rows touched since `since` across the entity tables the graph
    /// materializer cares about (§4.9 incremental decision rule input).
    pub async fn count_changed_since(&self, since: DateTime<Utc>) -> AppResult<ChangeCounts> {
        let subreddits = sqlx::query_scalar!(
            "SELECT count(*) FROM subreddits WHERE updated_at > $1",
            since
        )
        .fetch_one(&self.pool)
        .await?
        .unwrap_or(0);

        let users = sqlx::query_scalar!("SELECT count(*) FROM users WHERE updated_at > $1", since)
            .fetch_one(&self.pool)
            .await?
            .unwrap_or(0);

        let posts = sqlx::query_scalar!("SELECT count(*) FROM posts WHERE updated_at > $1", since)
            .fetch_one(&self.pool)
            .await?
            .unwrap_or(0);

        let comments = sqlx::query_scalar!(
            "SELECT count(*) FROM comments WHERE updated_at > $1",
            since
        )
        .fetch_one(&self.pool)
        .await?
        .unwrap_or(0);

        Ok(ChangeCounts {
            subreddits,
            users,
            posts,
            comments,
        })
    }

    /// Ids of subreddits touched since `since` — the incremental
    /// materializer's UPSERT filter (§4.9).
    pub async fn changed_subreddit_ids(&self, since: DateTime<Utc>) -> AppResult<Vec<i64>> {
        let ids = sqlx::query_scalar!("SELECT id FROM subreddits WHERE updated_at > $1", since)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    pub async fn changed_user_ids(&self, since: DateTime<Utc>) -> AppResult<Vec<i64>> {
        let ids = sqlx::query_scalar!("SELECT id FROM users WHERE updated_at > $1", since)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    pub async fn changed_post_ids(&self, since: DateTime<Utc>) -> AppResult<Vec<i64>> {
        let ids = sqlx::query_scalar!("SELECT id FROM posts WHERE updated_at > $1", since)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    pub async fn changed_comment_ids(&self, since: DateTime<Utc>) -> AppResult<Vec<i64>> {
        let ids = sqlx::query_scalar!("SELECT id FROM comments WHERE updated_at > $1", since)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// `(user_id, subreddit_id)` pairs whose activity row changed since
    /// `since` — the incremental materializer only needs to re-walk these
    /// for activity links and author cross-links.
    pub async fn changed_activity_pairs(
        &self,
        since: DateTime<Utc>,
    ) -> AppResult<Vec<(i64, i64)>> {
        let rows = sqlx::query!(
            "SELECT user_id, subreddit_id FROM user_subreddit_activity WHERE last_activity_at > $1",
            since
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| (r.user_id, r.subreddit_id)).collect())
    }

    pub async fn latest_watermark(&self) -> AppResult<DateTime<Utc>> {
        let watermark = sqlx::query_scalar!(
            r#"
            SELECT GREATEST(
                (SELECT max(updated_at) FROM subreddits),
                (SELECT max(updated_at) FROM users),
                (SELECT max(updated_at) FROM posts),
                (SELECT max(updated_at) FROM comments)
            ) as "watermark!"
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(watermark)
    }

    /// Repairs dangling `graph_links`, orphaned comment-parent pointers, and
    /// comment-parent cycles introduced by concurrent crawl/delete activity.
    /// Runs on its own schedule, independent of crawling and materialization.
    pub async fn run_integrity_sweep(&self) -> AppResult<IntegritySweepReport> {
        let dangling_links = sqlx::query!(
            r#"
            DELETE FROM graph_links gl
            WHERE NOT EXISTS (SELECT 1 FROM graph_nodes n WHERE n.id = gl.source_node_id)
               OR NOT EXISTS (SELECT 1 FROM graph_nodes n WHERE n.id = gl.target_node_id)
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        let orphaned_parents = sqlx::query!(
            r#"
            UPDATE comments c
            SET parent_comment_id = NULL
            WHERE parent_comment_id IS NOT NULL
              AND NOT EXISTS (SELECT 1 FROM comments p WHERE p.id = c.parent_comment_id)
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        let broken_cycles = self.break_comment_parent_cycles().await?;

        let report = IntegritySweepReport {
            dangling_links_removed: dangling_links,
            orphaned_parents_cleared: orphaned_parents,
            cycles_broken: broken_cycles,
        };

        if report.dangling_links_removed > 0
            || report.orphaned_parents_cleared > 0
            || report.cycles_broken > 0
        {
            warn!(?report, "integrity sweep repaired inconsistent rows");
        } else {
            info!("integrity sweep found nothing to repair");
        }

        Ok(report)
    }

    /// A comment chain can only cycle back to itself via crawl races that
    /// UPSERT a parent after its child; walk each chain with a visited set
    /// and null out the edge that would close a cycle.
    async fn break_comment_parent_cycles(&self) -> AppResult<u64> {
        let rows = sqlx::query!("SELECT id, parent_comment_id FROM comments WHERE parent_comment_id IS NOT NULL")
            .fetch_all(&self.pool)
            .await?;

        let parent_of: std::collections::HashMap<i64, i64> = rows
            .iter()
            .filter_map(|r| r.parent_comment_id.map(|p| (r.id, p)))
            .collect();

        let mut broken = 0u64;
        for &start in parent_of.keys() {
            let mut seen = std::collections::HashSet::new();
            let mut cur = start;
            loop {
                if !seen.insert(cur) {
                    // cycle detected; cut the edge leaving `start`.
                    sqlx::query!(
                        "UPDATE comments SET parent_comment_id = NULL WHERE id = $1",
                        start
                    )
                    .execute(&self.pool)
                    .await?;
                    broken += 1;
                    break;
                }
                match parent_of.get(&cur) {
                    Some(&next) => cur = next,
                    None => break,
                }
            }
        }
        Ok(broken)
    }
}

#[derive(Debug, Default, serde::Serialize)]
pub struct IntegritySweepReport {
    pub dangling_links_removed: u64,
    pub orphaned_parents_cleared: u64,
    pub cycles_broken: u64,
}
