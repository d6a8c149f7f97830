//! Database connection and management (C17 ambient, §3 entities).
//!
//! Mirrors the teacher's `database::DatabaseManager`: a typed config,
//! `PgPoolOptions`-based pooling, and a statement-timeout hook so every
//! connection enforces the server-side deadline named in §5.

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, PgPool};
use std::time::Duration;
use tracing::info;

pub mod models;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub statement_timeout: Duration,
}

impl DatabaseConfig {
    pub fn from_app_config(cfg: &crate::config::Config) -> Self {
        Self {
            database_url: cfg.database_url.clone(),
            max_connections: 10,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(600)),
            statement_timeout: Duration::from_millis(cfg.db_statement_timeout_ms),
        }
    }
}

pub struct DatabaseManager {
    pool: PgPool,
}

impl DatabaseManager {
    pub async fn connect(config: DatabaseConfig) -> Result<Self, sqlx::Error> {
        info!(url = %mask_database_url(&config.database_url), "connecting to database");

        let statement_timeout_ms = config.statement_timeout.as_millis() as i64;
        let connect_options: PgConnectOptions = config
            .database_url
            .parse::<PgConnectOptions>()?
            .application_name("reddit-cluster-server");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(config.idle_timeout)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query(&format!("SET statement_timeout = {statement_timeout_ms}"))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("database ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn mask_database_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut u) => {
            let _ = u.set_password(Some("***"));
            u.to_string()
        }
        Err(_) => "<unparseable>".to_string(),
    }
}
