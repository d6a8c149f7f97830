//! Crawl job queue (C5, §4.5).
//!
//! Atomic claim is implemented with `SELECT ... FOR UPDATE SKIP LOCKED`
//! inside a transaction, the same "let Postgres serialize concurrent
//! writers" approach the teacher uses for advisory locks in
//! `database::locks` — here applied to row selection rather than
//! `pg_advisory_xact_lock`, since SKIP LOCKED is the idiomatic primitive
//! for a claim queue.

use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::PgPool;
use std::time::Duration;

use crate::db::models::{CrawlJob, JobStatus};
use crate::error::{AppError, AppResult};

pub struct JobQueue {
    pool: PgPool,
    base_retry_delay: Duration,
}

/// Whether a crawl failure should be retried or is permanent (mirrors the
/// `CRAWL_*` classification in §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    Permanent,
}

impl JobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            base_retry_delay: Duration::from_secs(60),
        }
    }

    /// Idempotent on `subreddit_id`: returns the existing row's id if a
    /// non-terminal job already exists, otherwise inserts a new one.
    pub async fn enqueue(&self, subreddit_id: i64, priority: i32) -> AppResult<i64> {
        let priority = priority.clamp(0, 100);
        let rec = sqlx::query_scalar!(
            r#"
            INSERT INTO crawl_jobs (subreddit_id, status, priority, created_at, visible_at, max_retries)
            VALUES ($1, 'pending', $2, now(), now(), 3)
            ON CONFLICT (subreddit_id) WHERE status IN ('pending', 'crawling')
            DO UPDATE SET subreddit_id = EXCLUDED.subreddit_id
            RETURNING id
            "#,
            subreddit_id,
            priority,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(rec)
    }

    /// Atomically claims the highest-priority visible pending job. `FOR
    /// UPDATE SKIP LOCKED` ensures two concurrent callers never return the
    /// same row (§8 property 2).
    pub async fn claim_next(&self, _worker_id: &str, now: DateTime<Utc>) -> AppResult<Option<CrawlJob>> {
        let mut tx = self.pool.begin().await?;

        let candidate = sqlx::query_as!(
            CrawlJob,
            r#"
            SELECT id, subreddit_id, status as "status: JobStatus", priority,
                   created_at, started_at, completed_at, visible_at,
                   retry_count, max_retries, next_retry_at, error_message
            FROM crawl_jobs
            WHERE status = 'pending' AND visible_at <= $1
            ORDER BY priority DESC, created_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
            now,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        sqlx::query!(
            "UPDATE crawl_jobs SET status = 'crawling', started_at = $2 WHERE id = $1",
            job.id,
            now,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(CrawlJob {
            status: JobStatus::Crawling,
            started_at: Some(now),
            ..job
        }))
    }

    pub async fn complete(&self, id: i64) -> AppResult<()> {
        sqlx::query!(
            "UPDATE crawl_jobs SET status = 'completed', completed_at = now() WHERE id = $1",
            id
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Computes `delay = min(base * 2^retry_count, 24h) * (1 + U[-0.2,
    /// 0.2])` per §4.5/§8 property 3, and either reschedules or marks the
    /// job terminally failed.
    pub async fn fail(&self, id: i64, kind: FailureKind, message: &str) -> AppResult<()> {
        let job = sqlx::query_as!(
            CrawlJob,
            r#"
            SELECT id, subreddit_id, status as "status: JobStatus", priority,
                   created_at, started_at, completed_at, visible_at,
                   retry_count, max_retries, next_retry_at, error_message
            FROM crawl_jobs WHERE id = $1
            "#,
            id
        )
        .fetch_one(&self.pool)
        .await?;

        if kind == FailureKind::Retryable && job.retry_count < job.max_retries {
            let delay = Self::retry_delay(self.base_retry_delay, job.retry_count as u32);
            let next_retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap();

            sqlx::query!(
                r#"
                UPDATE crawl_jobs
                SET status = 'pending', retry_count = retry_count + 1,
                    next_retry_at = $2, visible_at = $2, error_message = $3
                WHERE id = $1
                "#,
                id,
                next_retry_at,
                message,
            )
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query!(
                "UPDATE crawl_jobs SET status = 'failed', error_message = $2 WHERE id = $1",
                id,
                message,
            )
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    fn retry_delay(base: Duration, retry_count: u32) -> Duration {
        let capped = base.as_secs_f64() * 2f64.powi(retry_count as i32);
        let capped = capped.min(Duration::from_secs(24 * 3600).as_secs_f64());
        let jitter: f64 = rand::thread_rng().gen_range(-0.2..0.2);
        Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
    }

    pub async fn boost(&self, id: i64, delta: i32) -> AppResult<()> {
        sqlx::query!(
            "UPDATE crawl_jobs SET priority = LEAST(priority + $2, 100) WHERE id = $1",
            id,
            delta,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Every pending row older than `age_threshold` gets a one-time
    /// priority boost, capped. Run every 5 minutes (§4.5).
    pub async fn age_starved(
        &self,
        now: DateTime<Utc>,
        age_threshold: Duration,
        boost: i32,
        cap: i32,
    ) -> AppResult<u64> {
        let cutoff = now - chrono::Duration::from_std(age_threshold).unwrap();
        let result = sqlx::query!(
            r#"
            UPDATE crawl_jobs
            SET priority = LEAST(priority + $3, $4)
            WHERE status = 'pending' AND created_at < $1 AND priority < $4
            "#,
            cutoff,
            boost,
            boost,
            cap,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Any `crawling` row stuck past `stuck_after` flips back to pending
    /// (§3.2 invariant, §8 scenario 3).
    pub async fn reset_stuck(&self, now: DateTime<Utc>, stuck_after: Duration) -> AppResult<u64> {
        let cutoff = now - chrono::Duration::from_std(stuck_after).unwrap();
        let result = sqlx::query!(
            r#"
            UPDATE crawl_jobs
            SET status = 'pending', started_at = NULL
            WHERE status = 'crawling' AND started_at < $1
            "#,
            cutoff,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Jobs with `next_retry_at <= now` that are already visible; used by
    /// the maintenance loop to log/requeue readiness (the rows are already
    /// claimable via `claim_next`, this just reports the count).
    pub async fn count_requeueable(&self, now: DateTime<Utc>) -> AppResult<i64> {
        let count = sqlx::query_scalar!(
            "SELECT count(*) FROM crawl_jobs WHERE status = 'pending' AND next_retry_at <= $1",
            now
        )
        .fetch_one(&self.pool)
        .await?
        .unwrap_or(0);
        Ok(count)
    }

    pub async fn bulk_retry(&self, ids: &[i64]) -> AppResult<u64> {
        let result = sqlx::query!(
            r#"
            UPDATE crawl_jobs
            SET status = 'pending', visible_at = now(), next_retry_at = NULL
            WHERE id = ANY($1) AND status = 'failed'
            "#,
            ids,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn bulk_status(&self, ids: &[i64], status: JobStatus) -> AppResult<u64> {
        let status_str = match status {
            JobStatus::Pending => "pending",
            JobStatus::Crawling => "crawling",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        let result = sqlx::query!(
            "UPDATE crawl_jobs SET status = $2 WHERE id = ANY($1)",
            ids,
            status_str,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get(&self, id: i64) -> AppResult<CrawlJob> {
        sqlx::query_as!(
            CrawlJob,
            r#"
            SELECT id, subreddit_id, status as "status: JobStatus", priority,
                   created_at, started_at, completed_at, visible_at,
                   retry_count, max_retries, next_retry_at, error_message
            FROM crawl_jobs WHERE id = $1
            "#,
            id
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::CrawlNotFound)
    }

    pub async fn list(&self, limit: i64, offset: i64) -> AppResult<Vec<CrawlJob>> {
        let jobs = sqlx::query_as!(
            CrawlJob,
            r#"
            SELECT id, subreddit_id, status as "status: JobStatus", priority,
                   created_at, started_at, completed_at, visible_at,
                   retry_count, max_retries, next_retry_at, error_message
            FROM crawl_jobs
            ORDER BY id DESC
            LIMIT $1 OFFSET $2
            "#,
            limit,
            offset,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_bounds_match_property_3() {
        let base = Duration::from_secs(60);
        for retry_count in 0..8u32 {
            let d = JobQueue::retry_delay(base, retry_count);
            let unjittered = base.as_secs_f64() * 2f64.powi(retry_count as i32);
            let lower = unjittered * 0.8;
            let upper = (unjittered * 1.2).min(Duration::from_secs(24 * 3600).as_secs_f64() * 1.2);
            assert!(d.as_secs_f64() >= lower - 1e-6, "retry {retry_count}");
            assert!(d.as_secs_f64() <= upper + 1e-6, "retry {retry_count}");
        }
    }

    #[test]
    fn retry_delay_never_exceeds_24h_times_jitter() {
        let base = Duration::from_secs(60);
        let d = JobQueue::retry_delay(base, 20);
        assert!(d.as_secs_f64() <= Duration::from_secs(24 * 3600).as_secs_f64() * 1.2 + 1.0);
    }
}
