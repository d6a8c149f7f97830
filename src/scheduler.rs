//! Cron-style recurring job emission (C6, §4.6).

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cron::CronExpression;
use crate::db::models::ScheduledJob;
use crate::queue::JobQueue;

pub struct Scheduler {
    pool: PgPool,
    queue: std::sync::Arc<JobQueue>,
}

impl Scheduler {
    pub fn new(pool: PgPool, queue: std::sync::Arc<JobQueue>) -> Self {
        Self { pool, queue }
    }

    /// Runs forever until `cancel` fires, ticking once a minute.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                _ = cancel.cancelled() => {
                    info!("scheduler shutting down");
                    return;
                }
            }
        }
    }

    async fn tick(&self) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        let due: Vec<ScheduledJob> = sqlx::query_as!(
            ScheduledJob,
            r#"
            SELECT id, name, description, subreddit_id, cron_expression,
                   enabled, priority, next_run_at, last_run_at
            FROM scheduled_jobs
            WHERE enabled = true AND next_run_at <= $1
            "#,
            now,
        )
        .fetch_all(&self.pool)
        .await?;

        for job in due {
            let Ok(expr) = CronExpression::parse(&job.cron_expression) else {
                error!(job_id = job.id, expr = %job.cron_expression, "unparseable cron expression");
                continue;
            };

            if let Err(e) = self.queue.enqueue(job.subreddit_id, job.priority).await {
                error!(job_id = job.id, error = %e, "failed to enqueue scheduled job");
            }

            let next_run_at = expr.next_after(now);
            sqlx::query!(
                "UPDATE scheduled_jobs SET next_run_at = $2, last_run_at = $3 WHERE id = $1",
                job.id,
                next_run_at,
                now,
            )
            .execute(&self.pool)
            .await?;

            info!(job_id = job.id, name = %job.name, next_run_at = %next_run_at, "scheduled job fired");
        }

        Ok(())
    }
}
