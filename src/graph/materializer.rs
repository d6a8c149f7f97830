//! Graph materializer (C9, §4.9): turns normalized entities into
//! `graph_nodes` / `graph_links` rows, owning those tables exclusively.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::info;

use crate::change_tracker::ChangeTracker;
use crate::db::models::PrecalcState;
use crate::error::AppResult;

pub struct MaterializerConfig {
    pub detailed_graph: bool,
    pub posts_per_sub: i64,
    pub comments_per_post: i64,
    pub max_author_links: i64,
    pub node_batch_size: i64,
    pub link_batch_size: i64,
    pub full_rebuild_threshold: f64,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            detailed_graph: false,
            posts_per_sub: 25,
            comments_per_post: 50,
            max_author_links: 20,
            node_batch_size: 1000,
            link_batch_size: 2000,
            full_rebuild_threshold: 0.20,
        }
    }
}

#[derive(Debug)]
pub struct MaterializationReport {
    pub full: bool,
    pub total_nodes: i64,
    pub total_links: i64,
    pub duration_ms: i64,
    pub version_id: i64,
}

pub struct GraphMaterializer {
    pool: PgPool,
    tracker: ChangeTracker,
    config: MaterializerConfig,
    version_tx: watch::Sender<i64>,
}

impl GraphMaterializer {
    pub fn new(pool: PgPool, config: MaterializerConfig) -> (Self, watch::Receiver<i64>) {
        let (version_tx, version_rx) = watch::channel(0);
        let tracker = ChangeTracker::new(pool.clone());
        (
            Self {
                pool,
                tracker,
                config,
                version_tx,
            },
            version_rx,
        )
    }

    /// Decides full vs incremental (§4.9 step 1), runs the chosen path, and
    /// bumps `PrecalcState` on success. `force_full` mirrors the admin
    /// "force flag".
    pub async fn run(&self, force_full: bool) -> AppResult<MaterializationReport> {
        let started = std::time::Instant::now();
        let state = self.fetch_state().await?;

        let full = match &state.last_precalc_at {
            None => true,
            Some(_) if force_full => true,
            Some(last) => {
                let changed = self.tracker.count_changed_since(*last).await?;
                let total = self.total_entity_rows().await?;
                let changed_total =
                    changed.subreddits + changed.users + changed.posts + changed.comments;
                let fraction = if total == 0 {
                    1.0
                } else {
                    changed_total as f64 / total as f64
                };
                fraction > self.config.full_rebuild_threshold
            }
        };

        if full {
            self.run_full().await?;
        } else {
            // `full` is only false when `state.last_precalc_at` matched
            // `Some(last)` above; falling back to `now()` is unreachable in
            // practice but keeps this incremental path panic-free.
            self.run_incremental(state.last_precalc_at.unwrap_or_else(Utc::now)).await?;
        }

        let total_nodes = sqlx::query_scalar!("SELECT count(*) FROM graph_nodes")
            .fetch_one(&self.pool)
            .await?
            .unwrap_or(0);
        let total_links = sqlx::query_scalar!("SELECT count(*) FROM graph_links")
            .fetch_one(&self.pool)
            .await?
            .unwrap_or(0);

        let duration_ms = started.elapsed().as_millis() as i64;
        let now = Utc::now();

        let version_id = sqlx::query_scalar!(
            r#"
            UPDATE precalc_state
            SET last_precalc_at = $1,
                last_full_precalc_at = CASE WHEN $2 THEN $1 ELSE last_full_precalc_at END,
                total_nodes = $3,
                total_links = $4,
                precalc_duration_ms = $5,
                version_id = version_id + 1
            RETURNING version_id
            "#,
            now,
            full,
            total_nodes,
            total_links,
            duration_ms,
        )
        .fetch_one(&self.pool)
        .await?;

        sqlx::query!(
            "INSERT INTO precalc_versions (version_id, created_at, full_rebuild) VALUES ($1, $2, $3)",
            version_id,
            now,
            full,
        )
        .execute(&self.pool)
        .await?;

        self.version_tx.send_replace(version_id);

        info!(full, total_nodes, total_links, duration_ms, version_id, "precalc complete");

        Ok(MaterializationReport {
            full,
            total_nodes,
            total_links,
            duration_ms,
            version_id,
        })
    }

    async fn fetch_state(&self) -> AppResult<PrecalcState> {
        let state = sqlx::query_as!(
            PrecalcState,
            "SELECT last_precalc_at, last_full_precalc_at, total_nodes, total_links, precalc_duration_ms, version_id FROM precalc_state WHERE singleton = true",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(state)
    }

    async fn total_entity_rows(&self) -> AppResult<i64> {
        let n = sqlx::query_scalar!(
            r#"
            SELECT (SELECT count(*) FROM subreddits) + (SELECT count(*) FROM users)
                 + (SELECT count(*) FROM posts) + (SELECT count(*) FROM comments) as "n!"
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    /// Clears and regenerates `graph_nodes`/`graph_links` from scratch.
    async fn run_full(&self) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query!("TRUNCATE graph_links, graph_nodes").execute(&mut *tx).await?;
        tx.commit().await?;

        self.materialize_subreddit_nodes(None).await?;
        self.materialize_user_nodes(None).await?;
        if self.config.detailed_graph {
            self.materialize_post_and_comment_nodes(None).await?;
        }
        self.materialize_activity_links(None).await?;
        if self.config.detailed_graph {
            self.materialize_author_cross_links(None).await?;
        }
        Ok(())
    }

    /// UPSERTs nodes/links for subreddits, users, (optionally) posts and
    /// comments, and activity links touched since `since`. Node ids are
    /// derived deterministically from entity ids, so re-materializing a row
    /// is always idempotent (§4.9 "stable ids"); rows that didn't change
    /// are never read back out, which is what makes this path cheaper than
    /// `run_full`.
    async fn run_incremental(&self, since: DateTime<Utc>) -> AppResult<()> {
        let subreddit_ids = self.tracker.changed_subreddit_ids(since).await?;
        let user_ids = self.tracker.changed_user_ids(since).await?;
        let activity_pairs = self.tracker.changed_activity_pairs(since).await?;

        self.materialize_subreddit_nodes(Some(&subreddit_ids)).await?;
        self.materialize_user_nodes(Some(&user_ids)).await?;

        if self.config.detailed_graph {
            let post_ids = self.tracker.changed_post_ids(since).await?;
            let comment_ids = self.tracker.changed_comment_ids(since).await?;
            self.materialize_post_and_comment_nodes(Some((&post_ids, &comment_ids)))
                .await?;
        }

        self.materialize_activity_links(Some(&activity_pairs)).await?;

        if self.config.detailed_graph {
            let touched_subreddits: Vec<i64> = activity_pairs
                .iter()
                .map(|(_, subreddit_id)| *subreddit_id)
                .collect::<std::collections::HashSet<_>>()
                .into_iter()
                .collect();
            self.materialize_author_cross_links(Some(&touched_subreddits)).await?;
        }
        Ok(())
    }

    async fn materialize_subreddit_nodes(&self, changed_ids: Option<&[i64]>) -> AppResult<()> {
        struct Row {
            id: i64,
            name: String,
        }

        let rows: Vec<Row> = match changed_ids {
            Some(ids) => {
                sqlx::query_as!(Row, "SELECT id, name FROM subreddits WHERE id = ANY($1)", ids)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as!(Row, "SELECT id, name FROM subreddits")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        for batch in rows.chunks(self.config.node_batch_size as usize) {
            let mut tx = self.pool.begin().await?;
            for row in batch {
                let node_id = format!("subreddit_{}", row.id);
                sqlx::query!(
                    r#"
                    INSERT INTO graph_nodes (id, name, val, type)
                    VALUES ($1, $2, '0', 'subreddit')
                    ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, updated_at = now()
                    "#,
                    node_id,
                    row.name,
                )
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    async fn materialize_user_nodes(&self, changed_ids: Option<&[i64]>) -> AppResult<()> {
        struct Row {
            id: i64,
            username: String,
        }

        let rows: Vec<Row> = match changed_ids {
            Some(ids) => {
                sqlx::query_as!(Row, "SELECT id, username FROM users WHERE id = ANY($1)", ids)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as!(Row, "SELECT id, username FROM users")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        for batch in rows.chunks(self.config.node_batch_size as usize) {
            let mut tx = self.pool.begin().await?;
            for row in batch {
                let node_id = format!("user_{}", row.id);
                sqlx::query!(
                    r#"
                    INSERT INTO graph_nodes (id, name, val, type)
                    VALUES ($1, $2, '0', 'user')
                    ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, updated_at = now()
                    "#,
                    node_id,
                    row.username,
                )
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    /// On a full rebuild, caps detail nodes to the top N posts per
    /// subreddit / comments per post via `row_number()`. On an incremental
    /// pass the cap doesn't apply — every changed post/comment id is
    /// UPSERTed regardless of rank, since re-deriving the global ranking
    /// for a handful of changed rows would cost as much as a full rebuild.
    async fn materialize_post_and_comment_nodes(
        &self,
        changed_ids: Option<(&[i64], &[i64])>,
    ) -> AppResult<()> {
        struct PostRow {
            id: i64,
            title: String,
        }

        let posts: Vec<PostRow> = match changed_ids {
            Some((post_ids, _)) => {
                sqlx::query_as!(PostRow, "SELECT id, title FROM posts WHERE id = ANY($1)", post_ids)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let ranked = sqlx::query!(
                    r#"
                    SELECT id, title,
                           row_number() OVER (PARTITION BY subreddit_id ORDER BY created_at DESC) as "rn!"
                    FROM posts
                    "#,
                )
                .fetch_all(&self.pool)
                .await?;
                ranked
                    .into_iter()
                    .filter(|p| p.rn <= self.config.posts_per_sub)
                    .map(|p| PostRow { id: p.id, title: p.title })
                    .collect()
            }
        };

        for batch in posts.chunks(self.config.node_batch_size as usize) {
            let mut tx = self.pool.begin().await?;
            for post in batch {
                let node_id = format!("post_{}", post.id);
                sqlx::query!(
                    r#"
                    INSERT INTO graph_nodes (id, name, val, type)
                    VALUES ($1, $2, '0', 'post')
                    ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, updated_at = now()
                    "#,
                    node_id,
                    post.title,
                )
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }

        struct CommentRow {
            id: i64,
            body: String,
        }

        let comments: Vec<CommentRow> = match changed_ids {
            Some((_, comment_ids)) => sqlx::query_as!(
                CommentRow,
                "SELECT id, body FROM comments WHERE id = ANY($1)",
                comment_ids,
            )
            .fetch_all(&self.pool)
            .await?,
            None => {
                let ranked = sqlx::query!(
                    r#"
                    SELECT id, body,
                           row_number() OVER (PARTITION BY post_id ORDER BY created_at DESC) as "rn!"
                    FROM comments
                    "#,
                )
                .fetch_all(&self.pool)
                .await?;
                ranked
                    .into_iter()
                    .filter(|c| c.rn <= self.config.comments_per_post)
                    .map(|c| CommentRow { id: c.id, body: c.body })
                    .collect()
            }
        };

        for batch in comments.chunks(self.config.node_batch_size as usize) {
            let mut tx = self.pool.begin().await?;
            for comment in batch {
                let node_id = format!("comment_{}", comment.id);
                let label: String = comment.body.chars().take(40).collect();
                sqlx::query!(
                    r#"
                    INSERT INTO graph_nodes (id, name, val, type)
                    VALUES ($1, $2, '0', 'comment')
                    ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, updated_at = now()
                    "#,
                    node_id,
                    label,
                )
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    /// Subreddit-user links weighted by `post_count + comment_count`, and
    /// sets each node's `val` to the sum of its incident link weights so
    /// the capping rule (§4.9) has a numeric weight to rank on.
    async fn materialize_activity_links(&self, changed_pairs: Option<&[(i64, i64)]>) -> AppResult<()> {
        struct ActivityRow {
            user_id: i64,
            subreddit_id: i64,
            post_count: i64,
            comment_count: i64,
        }

        let activity: Vec<ActivityRow> = match changed_pairs {
            Some(pairs) => {
                let user_ids: Vec<i64> = pairs.iter().map(|(u, _)| *u).collect();
                let subreddit_ids: Vec<i64> = pairs.iter().map(|(_, s)| *s).collect();
                sqlx::query_as!(
                    ActivityRow,
                    r#"
                    SELECT user_id, subreddit_id, post_count, comment_count
                    FROM user_subreddit_activity
                    WHERE (user_id, subreddit_id) IN (SELECT * FROM UNNEST($1::bigint[], $2::bigint[]))
                    "#,
                    &user_ids,
                    &subreddit_ids,
                )
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as!(
                    ActivityRow,
                    "SELECT user_id, subreddit_id, post_count, comment_count FROM user_subreddit_activity",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        for batch in activity.chunks(self.config.link_batch_size as usize) {
            let mut tx = self.pool.begin().await?;
            for row in batch {
                let weight = (row.post_count + row.comment_count) as f64;
                let user_node = format!("user_{}", row.user_id);
                let sub_node = format!("subreddit_{}", row.subreddit_id);

                sqlx::query!(
                    r#"
                    INSERT INTO graph_links (source_node_id, target_node_id, val)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (source_node_id, target_node_id) DO UPDATE SET val = EXCLUDED.val, updated_at = now()
                    "#,
                    user_node,
                    sub_node,
                    weight,
                )
                .execute(&mut *tx)
                .await?;

                sqlx::query!(
                    "UPDATE graph_nodes SET val = (val::float8 + $2)::text WHERE id = $1",
                    user_node,
                    weight,
                )
                .execute(&mut *tx)
                .await?;
                sqlx::query!(
                    "UPDATE graph_nodes SET val = (val::float8 + $2)::text WHERE id = $1",
                    sub_node,
                    weight,
                )
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    /// Cross-links between authors who share activity in a subreddit, capped
    /// per author so a prolific user doesn't produce a link explosion. When
    /// `changed_subreddit_ids` is given, only pairs sharing one of those
    /// subreddits are recomputed.
    async fn materialize_author_cross_links(&self, changed_subreddit_ids: Option<&[i64]>) -> AppResult<()> {
        struct CrossPairRow {
            user_a: i64,
            user_b: i64,
            rn: i64,
        }

        let pairs: Vec<CrossPairRow> = match changed_subreddit_ids {
            Some(subreddit_ids) => {
                sqlx::query_as!(
                    CrossPairRow,
                    r#"
                    SELECT a.user_id as "user_a!", b.user_id as "user_b!",
                           row_number() OVER (PARTITION BY a.user_id ORDER BY b.user_id) as "rn!"
                    FROM user_subreddit_activity a
                    JOIN user_subreddit_activity b
                      ON a.subreddit_id = b.subreddit_id AND a.user_id < b.user_id
                    WHERE a.subreddit_id = ANY($1)
                    "#,
                    subreddit_ids,
                )
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as!(
                    CrossPairRow,
                    r#"
                    SELECT a.user_id as "user_a!", b.user_id as "user_b!",
                           row_number() OVER (PARTITION BY a.user_id ORDER BY b.user_id) as "rn!"
                    FROM user_subreddit_activity a
                    JOIN user_subreddit_activity b
                      ON a.subreddit_id = b.subreddit_id AND a.user_id < b.user_id
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        for batch in pairs
            .iter()
            .filter(|p| p.rn <= self.config.max_author_links)
            .collect::<Vec<_>>()
            .chunks(self.config.link_batch_size as usize)
        {
            let mut tx = self.pool.begin().await?;
            for pair in batch {
                let a = format!("user_{}", pair.user_a);
                let b = format!("user_{}", pair.user_b);
                sqlx::query!(
                    r#"
                    INSERT INTO graph_links (source_node_id, target_node_id, val)
                    VALUES ($1, $2, 1)
                    ON CONFLICT (source_node_id, target_node_id) DO NOTHING
                    "#,
                    a,
                    b,
                )
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }
}
