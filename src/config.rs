//! Runtime configuration, read once from the environment at startup and
//! memoized behind an `Arc<Config>` (§6.10).
//!
//! Follows the same `std::env::var(..).ok().and_then(..).unwrap_or(..)`
//! idiom the teacher uses for `DatabaseConfig`.

use std::time::Duration;

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,

    // C1 rate limiter
    pub rate_limit_global: f64,
    pub rate_limit_global_burst: u32,
    pub rate_limit_per_ip: f64,
    pub rate_limit_per_ip_burst: u32,
    pub enable_rate_limit: bool,

    // C2 HTTP fetcher
    pub http_max_retries: u32,
    pub http_retry_base_ms: u64,
    pub http_timeout_ms: u64,

    // C13 graph query layer
    pub graph_query_timeout_ms: u64,
    pub db_statement_timeout_ms: u64,

    // C14 cache
    pub cache_max_size_mb: u64,
    pub cache_max_entries: usize,
    pub cache_ttl_seconds: u64,

    // C9 materializer
    pub detailed_graph: bool,
    pub posts_per_sub_in_graph: u32,
    pub comments_per_post_in_graph: u32,
    pub max_author_content_links: u32,
    pub precalc_interval_secs: u64,
    pub precalc_clear_on_start: bool,
    pub graph_node_batch_size: usize,
    pub graph_link_batch_size: usize,

    // C10 layout
    pub layout_max_nodes: usize,
    pub layout_iterations: u32,
    pub layout_batch_size: usize,
    pub layout_epsilon: f64,

    // C7 crawler
    pub crawler_rps: f64,
    pub crawler_burst_size: u32,
    pub reset_crawling_after_min: i64,
    pub stale_days: i64,

    // C16 admin
    pub admin_api_token: Option<String>,

    // CORS
    pub cors_allowed_origins: Vec<String>,

    // OAuth
    pub reddit_client_id: Option<String>,
    pub reddit_client_secret: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env_str(
                "DATABASE_URL",
                "postgresql://localhost:5432/reddit_cluster_map",
            ),
            bind_addr: env_str("BIND_ADDR", "0.0.0.0:8080"),

            rate_limit_global: env_parse("RATE_LIMIT_GLOBAL", 1.66),
            rate_limit_global_burst: env_parse("RATE_LIMIT_GLOBAL_BURST", 1),
            rate_limit_per_ip: env_parse("RATE_LIMIT_PER_IP", 5.0),
            rate_limit_per_ip_burst: env_parse("RATE_LIMIT_PER_IP_BURST", 10),
            enable_rate_limit: env_bool("ENABLE_RATE_LIMIT", true),

            http_max_retries: env_parse("HTTP_MAX_RETRIES", 3),
            http_retry_base_ms: env_parse("HTTP_RETRY_BASE_MS", 500),
            http_timeout_ms: env_parse("HTTP_TIMEOUT_MS", 15_000),

            graph_query_timeout_ms: env_parse("GRAPH_QUERY_TIMEOUT_MS", 5_000),
            db_statement_timeout_ms: env_parse("DB_STATEMENT_TIMEOUT_MS", 5_000),

            cache_max_size_mb: env_parse("CACHE_MAX_SIZE_MB", 512),
            cache_max_entries: env_parse("CACHE_MAX_ENTRIES", 10_000),
            cache_ttl_seconds: env_parse("CACHE_TTL_SECONDS", 60),

            detailed_graph: env_bool("DETAILED_GRAPH", false),
            posts_per_sub_in_graph: env_parse("POSTS_PER_SUB_IN_GRAPH", 25),
            comments_per_post_in_graph: env_parse("COMMENTS_PER_POST_IN_GRAPH", 10),
            max_author_content_links: env_parse("MAX_AUTHOR_CONTENT_LINKS", 50),
            precalc_interval_secs: env_parse("PRECALC_INTERVAL", 300),
            precalc_clear_on_start: env_bool("PRECALC_CLEAR_ON_START", false),
            graph_node_batch_size: env_parse("GRAPH_NODE_BATCH_SIZE", 1000),
            graph_link_batch_size: env_parse("GRAPH_LINK_BATCH_SIZE", 2000),

            layout_max_nodes: env_parse("LAYOUT_MAX_NODES", 5000),
            layout_iterations: env_parse("LAYOUT_ITERATIONS", 400),
            layout_batch_size: env_parse("LAYOUT_BATCH_SIZE", 5000),
            layout_epsilon: env_parse("LAYOUT_EPSILON", 0.5),

            crawler_rps: env_parse("CRAWLER_RPS", 1.66),
            crawler_burst_size: env_parse("CRAWLER_BURST_SIZE", 1),
            reset_crawling_after_min: env_parse("RESET_CRAWLING_AFTER_MIN", 15),
            stale_days: env_parse("STALE_DAYS", 7),

            admin_api_token: std::env::var("ADMIN_API_TOKEN").ok(),

            cors_allowed_origins: env_str("CORS_ALLOWED_ORIGINS", "")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),

            reddit_client_id: std::env::var("REDDIT_CLIENT_ID").ok(),
            reddit_client_secret: std::env::var("REDDIT_CLIENT_SECRET").ok(),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn graph_query_timeout(&self) -> Duration {
        Duration::from_millis(self.graph_query_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn precalc_interval(&self) -> Duration {
        Duration::from_secs(self.precalc_interval_secs)
    }

    /// Suffix-wildcard CORS match: `*.example.com` matches any origin ending
    /// in `.example.com`. Replicates the source's exact semantics (§9).
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.cors_allowed_origins.iter().any(|allowed| {
            if let Some(suffix) = allowed.strip_prefix("*.") {
                origin
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .ends_with(suffix)
            } else {
                allowed == origin
            }
        })
    }
}
