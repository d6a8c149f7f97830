//! Process entry point: wires config, the database, every background
//! worker, and the HTTP/websocket server, then waits for SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use reddit_cluster_server::admin::AdminSurface;
use reddit_cluster_server::api::{self, AppState};
use reddit_cluster_server::cache::ResponseCache;
use reddit_cluster_server::change_tracker::ChangeTracker;
use reddit_cluster_server::circuit_breaker::CircuitBreaker;
use reddit_cluster_server::config::Config;
use reddit_cluster_server::crawler::reddit_client::RedditClient;
use reddit_cluster_server::crawler::CrawlerWorker;
use reddit_cluster_server::db::{DatabaseConfig, DatabaseManager};
use reddit_cluster_server::graph::bundles::BundleComputer;
use reddit_cluster_server::graph::community::{CommunityConfig, CommunityDetector};
use reddit_cluster_server::graph::layout::{LayoutConfig, LayoutEngine};
use reddit_cluster_server::graph::materializer::{GraphMaterializer, MaterializerConfig};
use reddit_cluster_server::graph::query::GraphQueryLayer;
use reddit_cluster_server::http_fetcher::HttpFetcher;
use reddit_cluster_server::metrics::Metrics;
use reddit_cluster_server::oauth::OAuthTokenManager;
use reddit_cluster_server::queue::JobQueue;
use reddit_cluster_server::rate_limiter::{PerKeyRateLimiter, RateLimiter};
use reddit_cluster_server::scheduler::Scheduler;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const USER_AGENT: &str = "reddit-cluster-server/0.1 (by /u/reddit-cluster-server)";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(Config::from_env());

    let db = DatabaseManager::connect(DatabaseConfig::from_app_config(&config)).await?;
    let pool = db.pool().clone();

    if config.precalc_clear_on_start {
        sqlx::query!("TRUNCATE graph_links, graph_nodes").execute(&pool).await?;
    }

    let metrics = Arc::new(Metrics::default());
    let cancel = CancellationToken::new();

    let http_client = reqwest::Client::builder().timeout(config.http_timeout()).build()?;
    let tokens = OAuthTokenManager::new(
        http_client.clone(),
        config.reddit_client_id.clone(),
        config.reddit_client_secret.clone(),
        USER_AGENT,
    );
    if tokens.validate_credentials().await.is_err() {
        error!("reddit OAuth credentials missing or rejected; crawling will not be able to authenticate");
    }

    let reddit_rate_limiter = Arc::new(RateLimiter::new(config.crawler_rps, config.crawler_burst_size));
    let circuit = Arc::new(CircuitBreaker::new(
        "reddit-api",
        5,
        2,
        Duration::from_secs(60),
    ));
    let fetcher = HttpFetcher::new(
        http_client.clone(),
        config.http_max_retries,
        Duration::from_millis(config.http_retry_base_ms),
    );
    let reddit_client = RedditClient::new(fetcher, reddit_rate_limiter, tokens, circuit.clone(), USER_AGENT);

    let queue = Arc::new(JobQueue::new(pool.clone()));

    let materializer_config = MaterializerConfig {
        detailed_graph: config.detailed_graph,
        posts_per_sub: config.posts_per_sub_in_graph as i64,
        comments_per_post: config.comments_per_post_in_graph as i64,
        max_author_links: config.max_author_content_links as i64,
        node_batch_size: config.graph_node_batch_size as i64,
        link_batch_size: config.graph_link_batch_size as i64,
        ..MaterializerConfig::default()
    };
    let (materializer, version_rx) = GraphMaterializer::new(pool.clone(), materializer_config);
    let materializer = Arc::new(materializer);

    let layout_config = LayoutConfig {
        max_nodes: config.layout_max_nodes as i64,
        iterations: config.layout_iterations,
        write_batch_size: config.layout_batch_size,
        epsilon: config.layout_epsilon,
        ..LayoutConfig::default()
    };
    let layout_engine = Arc::new(LayoutEngine::new(pool.clone(), layout_config));
    let community_detector = Arc::new(CommunityDetector::new(pool.clone(), CommunityConfig::default()));
    let bundle_computer = Arc::new(BundleComputer::new(pool.clone()));
    let change_tracker = Arc::new(ChangeTracker::new(pool.clone()));

    let cache = Arc::new(ResponseCache::new(
        (config.cache_max_size_mb * 1024 * 1024) as usize,
        config.cache_max_entries,
        config.cache_ttl(),
    ));
    let admin = Arc::new(AdminSurface::new(pool.clone(), queue.clone(), cache.clone()));
    let query_layer = Arc::new(GraphQueryLayer::new(pool.clone(), config.graph_query_timeout()));
    let http_rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_global, config.rate_limit_global_burst));
    let per_ip_rate_limiter = Arc::new(PerKeyRateLimiter::new(
        config.rate_limit_per_ip,
        config.rate_limit_per_ip_burst,
        10_000,
    ));

    let crawler = Arc::new(CrawlerWorker::new(
        "worker-1",
        pool.clone(),
        queue.clone(),
        reddit_client,
        metrics.clone(),
        config.detailed_graph,
        config.posts_per_sub_in_graph,
    ));
    let scheduler = Arc::new(Scheduler::new(pool.clone(), queue.clone()));

    let mut tasks = Vec::new();

    tasks.push(tokio::spawn({
        let crawler = crawler.clone();
        let cancel = cancel.clone();
        async move { crawler.run(cancel).await }
    }));
    tasks.push(tokio::spawn({
        let crawler = crawler.clone();
        let cancel = cancel.clone();
        async move { crawler.run_maintenance(cancel).await }
    }));
    tasks.push(tokio::spawn({
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    }));
    tasks.push(tokio::spawn(run_precalc_loop(
        config.clone(),
        materializer,
        layout_engine,
        community_detector,
        bundle_computer,
        change_tracker,
        metrics.clone(),
        cancel.clone(),
    )));

    let state = AppState {
        pool: pool.clone(),
        config: config.clone(),
        queue,
        query_layer,
        cache,
        admin,
        metrics,
        version_rx,
        http_rate_limiter,
        per_ip_rate_limiter,
    };
    let app = api::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");

    let server_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_cancel.cancel();
        })
        .await?;

    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}

/// Runs the C9-C12 precalculation pipeline on a fixed interval: rebuild
/// or incrementally update the graph, lay it out, re-detect communities,
/// recompute bundles, and sweep for orphaned rows (§4.9-§4.12, §4.8).
#[allow(clippy::too_many_arguments)]
async fn run_precalc_loop(
    config: Arc<Config>,
    materializer: Arc<GraphMaterializer>,
    layout_engine: Arc<LayoutEngine>,
    community_detector: Arc<CommunityDetector>,
    bundle_computer: Arc<BundleComputer>,
    change_tracker: Arc<ChangeTracker>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.precalc_interval());
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => return,
        }

        match materializer.run(false).await {
            Ok(report) => {
                metrics.precalc_version_gauge.set(report.version_id as u64);
                metrics.precalc_duration_ms_gauge.set(report.duration_ms as u64);
                info!(?report, "precalc pass complete");
            }
            Err(e) => {
                error!(error = %e, "materializer run failed");
                continue;
            }
        }

        if let Err(e) = layout_engine.run().await {
            error!(error = %e, "layout run failed");
        }
        if let Err(e) = community_detector.run().await {
            error!(error = %e, "community detection failed");
        }
        if let Err(e) = bundle_computer.run().await {
            error!(error = %e, "bundle computation failed");
        }
        if let Err(e) = change_tracker.run_integrity_sweep().await {
            error!(error = %e, "integrity sweep failed");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
