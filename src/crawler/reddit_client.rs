//! Typed Reddit API client assembled from C1 (rate limiter), C2 (fetcher),
//! C3 (OAuth), and C4 (circuit breaker).

use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::CircuitBreaker;
use crate::http_fetcher::{FetchOutcome, FetchRequest, HttpFetcher, PermanentReason};
use crate::oauth::OAuthTokenManager;
use crate::rate_limiter::RateLimiter;

pub struct RedditClient {
    fetcher: HttpFetcher,
    rate_limiter: Arc<RateLimiter>,
    tokens: Arc<OAuthTokenManager>,
    circuit: Arc<CircuitBreaker>,
    user_agent: String,
    base_url: String,
}

#[derive(Debug)]
pub enum RedditError {
    Permanent(PermanentReason),
    Transient(String),
    CircuitOpen,
    Cancelled,
}

#[derive(Debug, Deserialize)]
pub struct SubredditAbout {
    pub data: SubredditAboutData,
}

#[derive(Debug, Deserialize)]
pub struct SubredditAboutData {
    pub id: String,
    pub display_name: String,
    pub created_utc: f64,
    #[serde(default)]
    pub subreddit_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Listing<T> {
    pub data: ListingData<T>,
}

#[derive(Debug, Deserialize)]
pub struct ListingData<T> {
    pub children: Vec<Thing<T>>,
}

#[derive(Debug, Deserialize)]
pub struct Thing<T> {
    pub data: T,
}

#[derive(Debug, Deserialize)]
pub struct PostData {
    pub id: String,
    pub title: String,
    pub author: String,
    pub created_utc: f64,
    pub subreddit: String,
}

#[derive(Debug, Deserialize)]
pub struct CommentData {
    pub id: String,
    pub link_id: String,
    pub parent_id: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub body: String,
    pub created_utc: f64,
}

impl RedditClient {
    pub fn new(
        fetcher: HttpFetcher,
        rate_limiter: Arc<RateLimiter>,
        tokens: Arc<OAuthTokenManager>,
        circuit: Arc<CircuitBreaker>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            rate_limiter,
            tokens,
            circuit,
            user_agent: user_agent.into(),
            base_url: "https://oauth.reddit.com".to_string(),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<T, RedditError> {
        if self.rate_limiter.acquire(cancel).await.is_err() {
            return Err(RedditError::Cancelled);
        }

        let guard = self
            .circuit
            .try_acquire()
            .map_err(|_| RedditError::CircuitOpen)?;

        let token = match self.tokens.get_token().await {
            Ok(t) => t,
            Err(e) => {
                guard.failure();
                return Err(RedditError::Transient(e.to_string()));
            }
        };

        let url = format!("{}{}", self.base_url, path);
        let req = FetchRequest {
            method: reqwest::Method::GET,
            url: &url,
            bearer_token: Some(&token),
            user_agent: &self.user_agent,
        };

        let tokens = self.tokens.clone();
        let outcome = self
            .fetcher
            .fetch(req, cancel, || {
                let tokens = tokens.clone();
                async move { tokens.force_refresh().await.ok() }
            })
            .await;

        match outcome {
            FetchOutcome::Success(resp) => match resp.json::<T>().await {
                Ok(body) => {
                    guard.success();
                    Ok(body)
                }
                Err(e) => {
                    guard.failure();
                    Err(RedditError::Transient(e.to_string()))
                }
            },
            FetchOutcome::Permanent(reason) => {
                guard.success(); // not an infrastructure failure
                Err(RedditError::Permanent(reason))
            }
            FetchOutcome::ExhaustedRetries(msg) => {
                guard.failure();
                Err(RedditError::Transient(msg))
            }
            FetchOutcome::Cancelled => {
                guard.success();
                Err(RedditError::Cancelled)
            }
        }
    }

    pub async fn fetch_subreddit_about(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<SubredditAboutData, RedditError> {
        let path = format!("/r/{name}/about.json");
        let about: SubredditAbout = self.get_json(&path, cancel).await?;
        Ok(about.data)
    }

    pub async fn fetch_hot_posts(
        &self,
        name: &str,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<PostData>, RedditError> {
        let path = format!("/r/{name}/hot.json?limit={limit}");
        let listing: Listing<PostData> = self.get_json(&path, cancel).await?;
        Ok(listing.data.children.into_iter().map(|t| t.data).collect())
    }

    pub async fn fetch_comments(
        &self,
        subreddit: &str,
        post_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommentData>, RedditError> {
        let path = format!("/r/{subreddit}/comments/{post_id}.json");
        // Reddit returns a two-element array [post_listing, comment_listing];
        // we only need the comment tree here.
        let listings: Vec<Listing<CommentData>> = self.get_json(&path, cancel).await?;
        Ok(listings
            .into_iter()
            .nth(1)
            .map(|l| l.data.children.into_iter().map(|t| t.data).collect())
            .unwrap_or_default())
    }
}
