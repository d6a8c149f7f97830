//! Central error taxonomy and request-context propagation (C17).
//!
//! Every prefix in the error taxonomy table maps to one `AppError`
//! variant. Retry logic lives only in the HTTP fetcher and the job queue;
//! everywhere else errors propagate with `?` until a serving handler
//! converts them to the wire envelope here.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

/// Taxonomy of errors the service can surface, grouped by the prefixes in
/// the spec's error table (§7).
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("missing credentials")]
    AuthMissing,
    #[error("invalid credentials")]
    AuthInvalid,
    #[error("forbidden")]
    AuthForbidden,
    #[error("oauth not configured")]
    AuthOAuthNotConfigured,
    #[error("oauth token request failed: {0}")]
    AuthOAuthFailed(String),

    #[error("graph query timed out")]
    GraphTimeout,
    #[error("graph query failed: {0}")]
    GraphQueryFailed(String),
    #[error("no graph data available")]
    GraphNoData,
    #[error("invalid graph query parameters: {0}")]
    GraphInvalidParams(String),

    #[error("invalid subreddit name: {0}")]
    CrawlInvalidSubreddit(String),
    #[error("failed to queue crawl job: {0}")]
    CrawlQueueFailed(String),
    #[error("rate limited by upstream")]
    CrawlRateLimited,
    #[error("job not found")]
    CrawlNotFound,

    #[error("invalid search query: {0}")]
    SearchInvalidQuery(String),
    #[error("search timed out")]
    SearchTimeout,
    #[error("search failed: {0}")]
    SearchFailed(String),

    #[error("internal error: {0}")]
    SystemInternal(String),
    #[error("database error: {0}")]
    SystemDatabase(#[from] sqlx::Error),
    #[error("service unavailable: {0}")]
    SystemUnavailable(String),
    #[error("request timed out")]
    SystemTimeout,

    #[error("invalid json: {0}")]
    ValidationInvalidJson(String),
    #[error("invalid format: {0}")]
    ValidationInvalidFormat(String),
    #[error("missing field: {0}")]
    ValidationMissingField(String),
    #[error("invalid value: {0}")]
    ValidationInvalidValue(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    #[error("resource conflict: {0}")]
    ResourceConflict(String),

    #[error("global rate limit exceeded")]
    RateLimitGlobal,
    #[error("per-ip rate limit exceeded")]
    RateLimitIp,

    #[error("circuit open for {0}")]
    CircuitOpen(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        use AppError::*;
        match self {
            AuthMissing => "AUTH_MISSING",
            AuthInvalid => "AUTH_INVALID",
            AuthForbidden => "AUTH_FORBIDDEN",
            AuthOAuthNotConfigured => "AUTH_OAUTH_NOT_CONFIGURED",
            AuthOAuthFailed(_) => "AUTH_OAUTH_FAILED",
            GraphTimeout => "GRAPH_TIMEOUT",
            GraphQueryFailed(_) => "GRAPH_QUERY_FAILED",
            GraphNoData => "GRAPH_NO_DATA",
            GraphInvalidParams(_) => "GRAPH_INVALID_PARAMS",
            CrawlInvalidSubreddit(_) => "CRAWL_INVALID_SUBREDDIT",
            CrawlQueueFailed(_) => "CRAWL_QUEUE_FAILED",
            CrawlRateLimited => "CRAWL_RATE_LIMITED",
            CrawlNotFound => "CRAWL_NOT_FOUND",
            SearchInvalidQuery(_) => "SEARCH_INVALID_QUERY",
            SearchTimeout => "SEARCH_TIMEOUT",
            SearchFailed(_) => "SEARCH_FAILED",
            SystemInternal(_) => "SYSTEM_INTERNAL",
            SystemDatabase(_) => "SYSTEM_DATABASE",
            SystemUnavailable(_) => "SYSTEM_UNAVAILABLE",
            SystemTimeout => "SYSTEM_TIMEOUT",
            ValidationInvalidJson(_) => "VALIDATION_INVALID_JSON",
            ValidationInvalidFormat(_) => "VALIDATION_INVALID_FORMAT",
            ValidationMissingField(_) => "VALIDATION_MISSING_FIELD",
            ValidationInvalidValue(_) => "VALIDATION_INVALID_VALUE",
            ResourceNotFound(_) => "RESOURCE_NOT_FOUND",
            ResourceConflict(_) => "RESOURCE_CONFLICT",
            RateLimitGlobal => "RATE_LIMIT_GLOBAL",
            RateLimitIp => "RATE_LIMIT_IP",
            CircuitOpen(_) => "CIRCUIT_OPEN",
        }
    }

    pub fn status(&self) -> StatusCode {
        use AppError::*;
        match self {
            AuthMissing | AuthInvalid => StatusCode::UNAUTHORIZED,
            AuthForbidden => StatusCode::FORBIDDEN,
            AuthOAuthNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            AuthOAuthFailed(_) => StatusCode::BAD_GATEWAY,
            GraphTimeout => StatusCode::REQUEST_TIMEOUT,
            GraphQueryFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GraphNoData => StatusCode::NOT_FOUND,
            GraphInvalidParams(_) => StatusCode::BAD_REQUEST,
            CrawlInvalidSubreddit(_) => StatusCode::BAD_REQUEST,
            CrawlQueueFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CrawlRateLimited => StatusCode::TOO_MANY_REQUESTS,
            CrawlNotFound => StatusCode::NOT_FOUND,
            SearchInvalidQuery(_) => StatusCode::BAD_REQUEST,
            SearchTimeout => StatusCode::REQUEST_TIMEOUT,
            SearchFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SystemInternal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SystemDatabase(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SystemUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SystemTimeout => StatusCode::REQUEST_TIMEOUT,
            ValidationInvalidJson(_)
            | ValidationInvalidFormat(_)
            | ValidationMissingField(_)
            | ValidationInvalidValue(_) => StatusCode::BAD_REQUEST,
            ResourceNotFound(_) => StatusCode::NOT_FOUND,
            ResourceConflict(_) => StatusCode::CONFLICT,
            RateLimitGlobal | RateLimitIp => StatusCode::TOO_MANY_REQUESTS,
            CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Per-request context propagated from the request-id layer through to the
/// error envelope. Cheap to clone; carried in axum request extensions.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
                request_id: None,
            },
        };
        (status, Json(json!(body))).into_response()
    }
}

/// Attach a request id to an `AppError` response. Used by the request-id
/// middleware when it has a context to inject.
pub fn error_response_with_request_id(err: &AppError, request_id: &str) -> Response {
    let body = ErrorBody {
        error: ErrorDetail {
            code: err.code(),
            message: err.to_string(),
            request_id: Some(request_id),
        },
    };
    (err.status(), Json(json!(body))).into_response()
}

pub type AppResult<T> = Result<T, AppError>;
