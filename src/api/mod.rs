//! HTTP surface: route assembly, shared application state, and the
//! axum middleware stack (CORS, tracing, request id, rate limiting).

pub mod admin_routes;
pub mod crawl_routes;
pub mod graph_routes;
pub mod listing_routes;
pub mod ws_routes;

use axum::{
    extract::{Request, State},
    http::{header, request::Parts, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::admin::AdminSurface;
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::error::{error_response_with_request_id, AppError, RequestContext};
use crate::graph::query::GraphQueryLayer;
use crate::metrics::Metrics;
use crate::queue::JobQueue;
use crate::rate_limiter::{PerKeyRateLimiter, RateLimiter};
use tokio::sync::watch;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub queue: Arc<JobQueue>,
    pub query_layer: Arc<GraphQueryLayer>,
    pub cache: Arc<ResponseCache>,
    pub admin: Arc<AdminSurface>,
    pub metrics: Arc<Metrics>,
    pub version_rx: watch::Receiver<i64>,
    pub http_rate_limiter: Arc<RateLimiter>,
    pub per_ip_rate_limiter: Arc<PerKeyRateLimiter>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = if state.config.cors_allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new().allow_origin(AllowOrigin::predicate({
            let config = state.config.clone();
            move |origin: &HeaderValue, _: &Parts| {
                origin.to_str().map(|o| config.origin_allowed(o)).unwrap_or(false)
            }
        }))
    };

    let public = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/graph", get(graph_routes::get_graph))
        .route("/api/graph/overview", get(graph_routes::get_overview))
        .route("/api/graph/region", get(graph_routes::get_region))
        .route("/api/graph/community/:id", get(graph_routes::get_community))
        .route("/api/graph/bundles", get(graph_routes::get_bundles))
        .route("/api/graph/version", get(graph_routes::get_version))
        .route("/api/graph/diff", get(graph_routes::get_diff))
        .route("/api/graph/ws", get(ws_routes::ws_handler))
        .route("/api/crawl", post(crawl_routes::enqueue_crawl))
        .route("/subreddits", get(listing_routes::list_subreddits))
        .route("/users", get(listing_routes::list_users))
        .route("/posts", get(listing_routes::list_posts))
        .route("/comments", get(listing_routes::list_comments))
        .route("/jobs", get(listing_routes::list_jobs));

    let admin = Router::new()
        .route("/api/admin/queue/boost/:id", post(admin_routes::boost_priority))
        .route("/api/admin/queue/bulk_retry", post(admin_routes::bulk_retry))
        .route("/api/admin/queue/bulk_status", post(admin_routes::bulk_status))
        .route(
            "/api/admin/scheduled_jobs",
            get(admin_routes::list_scheduled_jobs).post(admin_routes::create_scheduled_job),
        )
        .route(
            "/api/admin/scheduled_jobs/:id",
            axum::routing::delete(admin_routes::delete_scheduled_job),
        )
        .route("/api/admin/scheduled_jobs/:id/toggle", post(admin_routes::toggle_scheduled_job))
        .route("/api/admin/cache/invalidate", post(admin_routes::invalidate_cache))
        .route("/api/admin/cache/stats", get(admin_routes::cache_stats))
        .route("/api/admin/backups", get(admin_routes::list_backups))
        .route("/api/admin/backups/:name/download", get(admin_routes::download_backup))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin_token));

    public
        .merge(admin)
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(request_id_layer))
                .layer(middleware::from_fn_with_state(state.clone(), rate_limit_and_security_headers))
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(tower_http::timeout::TimeoutLayer::new(Duration::from_secs(30))),
        )
        .with_state(state)
}

async fn health() -> &'static str {
    r#"{"status":"ok"}"#
}

async fn metrics_endpoint(State(state): State<AppState>) -> String {
    state.metrics.render()
}

/// Stamps every request with a `RequestContext` carrying a fresh request
/// id, used by error responses and tracing spans alike.
async fn request_id_layer(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(RequestContext { request_id: request_id.clone() });
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(header::HeaderName::from_static("x-request-id"), value);
    }
    response
}

/// Global and per-client-IP token buckets (§6.7), plus the mandated
/// security response headers, applied ahead of every route.
async fn rate_limit_and_security_headers(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if state.config.enable_rate_limit {
        let request_id = req
            .extensions()
            .get::<RequestContext>()
            .map(|c| c.request_id.clone())
            .unwrap_or_default();

        if !state.http_rate_limiter.try_acquire() {
            return with_security_headers(error_response_with_request_id(
                &AppError::RateLimitGlobal,
                &request_id,
            ));
        }

        let ip = client_ip(&req);
        if !state.per_ip_rate_limiter.try_acquire(&ip) {
            return with_security_headers(error_response_with_request_id(
                &AppError::RateLimitIp,
                &request_id,
            ));
        }
    }

    with_security_headers(next.run(req).await)
}

fn with_security_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        header::HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static("default-src 'none'"),
    );
    headers.insert(
        header::HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(
        header::HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );
    headers.insert(
        header::HeaderName::from_static("strict-transport-security"),
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    response
}

/// Bearer-token gate for every `/api/admin/*` route (§6.6).
async fn require_admin_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = &state.config.admin_api_token else {
        return error_response_with_request_id(&AppError::AuthOAuthNotConfigured, "");
    };

    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => next.run(req).await,
        _ => {
            let request_id = req
                .extensions()
                .get::<RequestContext>()
                .map(|c| c.request_id.clone())
                .unwrap_or_default();
            error_response_with_request_id(&AppError::AuthInvalid, &request_id)
        }
    }
}

pub fn client_ip(req: &Request) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("unknown")
        .trim()
        .to_string()
}
