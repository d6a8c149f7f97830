//! Admin surface (C16, §4.16): authenticated management over the queue,
//! scheduled jobs, and the cache, with an append-only audit trail.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::cache::ResponseCache;
use crate::db::models::{JobStatus, ScheduledJob};
use crate::error::{AppError, AppResult};
use crate::queue::JobQueue;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Fixed, non-configurable backup directory (§6.9) — not exposed as a
/// client-supplied query parameter, to avoid turning the listing endpoint
/// into an arbitrary-directory-read surface.
const BACKUP_DIR: &str = "./backups";

const BACKUP_FILENAME_PREFIX: &str = "reddit_cluster_";
const BACKUP_FILENAME_SUFFIX: &str = ".sql";

#[derive(Debug, serde::Serialize)]
pub struct BackupFile {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// `reddit_cluster_YYYYMMDD_HHMMSS.sql` — the only filename shape the
/// listing and download endpoints will ever recognize (§6.9).
fn is_valid_backup_filename(name: &str) -> bool {
    let Some(stamp) = name
        .strip_prefix(BACKUP_FILENAME_PREFIX)
        .and_then(|s| s.strip_suffix(BACKUP_FILENAME_SUFFIX))
    else {
        return false;
    };
    stamp.len() == 15 && chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S").is_ok()
}

pub struct AdminSurface {
    pool: PgPool,
    queue: Arc<JobQueue>,
    cache: Arc<ResponseCache>,
}

impl AdminSurface {
    pub fn new(pool: PgPool, queue: Arc<JobQueue>, cache: Arc<ResponseCache>) -> Self {
        Self { pool, queue, cache }
    }

    async fn audit(&self, actor_ip: &str, action: &str, target_id: &str) -> AppResult<()> {
        sqlx::query!(
            "INSERT INTO admin_audit_log (actor_ip, action, target_id, timestamp) VALUES ($1, $2, $3, $4)",
            actor_ip,
            action,
            target_id,
            Utc::now(),
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn boost_priority(&self, actor_ip: &str, job_id: i64, delta: i32) -> AppResult<()> {
        self.queue.boost(job_id, delta).await?;
        self.audit(actor_ip, "boost_priority", &job_id.to_string()).await
    }

    pub async fn bulk_retry(&self, actor_ip: &str, ids: &[i64]) -> AppResult<u64> {
        let n = self.queue.bulk_retry(ids).await?;
        self.audit(actor_ip, "bulk_retry", &format!("{ids:?}")).await?;
        Ok(n)
    }

    pub async fn bulk_status(&self, actor_ip: &str, ids: &[i64], status: JobStatus) -> AppResult<u64> {
        let n = self.queue.bulk_status(ids, status).await?;
        self.audit(actor_ip, "bulk_status", &format!("{ids:?}")).await?;
        Ok(n)
    }

    pub async fn create_scheduled_job(
        &self,
        actor_ip: &str,
        name: &str,
        description: Option<&str>,
        subreddit_id: i64,
        cron_expression: &str,
        priority: i32,
    ) -> AppResult<i64> {
        crate::cron::CronExpression::parse(cron_expression)
            .map_err(|e| crate::error::AppError::ValidationInvalidValue(e.to_string()))?;

        let id = sqlx::query_scalar!(
            r#"
            INSERT INTO scheduled_jobs (name, description, subreddit_id, cron_expression, enabled, priority, next_run_at)
            VALUES ($1, $2, $3, $4, true, $5, now())
            RETURNING id
            "#,
            name,
            description,
            subreddit_id,
            cron_expression,
            priority,
        )
        .fetch_one(&self.pool)
        .await?;

        self.audit(actor_ip, "create_scheduled_job", &id.to_string()).await?;
        Ok(id)
    }

    pub async fn delete_scheduled_job(&self, actor_ip: &str, id: i64) -> AppResult<()> {
        sqlx::query!("DELETE FROM scheduled_jobs WHERE id = $1", id).execute(&self.pool).await?;
        self.audit(actor_ip, "delete_scheduled_job", &id.to_string()).await
    }

    pub async fn toggle_scheduled_job(&self, actor_ip: &str, id: i64, enabled: bool) -> AppResult<()> {
        sqlx::query!("UPDATE scheduled_jobs SET enabled = $2 WHERE id = $1", id, enabled)
            .execute(&self.pool)
            .await?;
        self.audit(actor_ip, "toggle_scheduled_job", &id.to_string()).await
    }

    pub async fn list_scheduled_jobs(&self) -> AppResult<Vec<ScheduledJob>> {
        let jobs = sqlx::query_as!(
            ScheduledJob,
            "SELECT id, name, description, subreddit_id, cron_expression, enabled, priority, next_run_at, last_run_at FROM scheduled_jobs ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    pub async fn invalidate_cache(&self, actor_ip: &str) -> AppResult<()> {
        self.cache.invalidate();
        self.audit(actor_ip, "invalidate_cache", "*").await
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }

    /// Lists backup files under the fixed backup directory, filtered to
    /// the documented filename pattern and sorted ascending by name
    /// (§6.9). Anything else on disk (a stray `.tmp`, a directory) is
    /// silently excluded rather than surfaced.
    pub fn list_backup_files(&self) -> AppResult<Vec<BackupFile>> {
        let mut files = Vec::new();
        if let Ok(entries) = std::fs::read_dir(BACKUP_DIR) {
            for entry in entries.flatten() {
                let Ok(name) = entry.file_name().into_string() else { continue };
                if !is_valid_backup_filename(&name) {
                    continue;
                }
                let Ok(metadata) = entry.metadata() else { continue };
                if !metadata.is_file() {
                    continue;
                }
                let modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                files.push(BackupFile { name, size: metadata.len(), modified });
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Resolves `name` to a path under the fixed backup directory, re-
    /// validating the filename pattern (defense in depth against a
    /// traversal payload like `../../etc/passwd`) and confirming the file
    /// actually exists before the caller streams it.
    pub fn resolve_backup_path(&self, name: &str) -> AppResult<PathBuf> {
        if !is_valid_backup_filename(name) {
            return Err(AppError::ValidationInvalidValue(format!(
                "backup filename must match reddit_cluster_YYYYMMDD_HHMMSS.sql: {name}"
            )));
        }
        let path = Path::new(BACKUP_DIR).join(name);
        if !path.is_file() {
            return Err(AppError::ResourceNotFound(format!("backup {name}")));
        }
        Ok(path)
    }
}
