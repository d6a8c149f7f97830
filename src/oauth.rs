//! OAuth token manager for the Reddit API (C3, §4.3).
//!
//! Holds the current `(client_id, client_secret, access_token,
//! expires_at)` behind a mutex so only one refresh is ever in flight,
//! following the single-writer-mutex shape used for advisory locks in
//! `database::locks`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{AppError, AppResult};

const SAFETY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct Credentials {
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

struct State {
    credentials: Option<Credentials>,
    previous_credentials: Option<Credentials>,
    token: Option<CachedToken>,
}

/// Thread-safe OAuth token cache with proactive refresh and credential
/// rotation.
pub struct OAuthTokenManager {
    http: reqwest::Client,
    token_url: String,
    user_agent: String,
    state: Mutex<State>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

impl OAuthTokenManager {
    pub fn new(
        http: reqwest::Client,
        client_id: Option<String>,
        client_secret: Option<String>,
        user_agent: impl Into<String>,
    ) -> Arc<Self> {
        let credentials = match (client_id, client_secret) {
            (Some(id), Some(secret)) => Some(Credentials {
                client_id: id,
                client_secret: secret,
            }),
            _ => None,
        };
        Arc::new(Self {
            http,
            token_url: "https://www.reddit.com/api/v1/access_token".to_string(),
            user_agent: user_agent.into(),
            state: Mutex::new(State {
                credentials,
                previous_credentials: None,
                token: None,
            }),
        })
    }

    /// Fatal at startup if credentials are absent or rejected.
    pub async fn validate_credentials(&self) -> AppResult<()> {
        self.get_token().await.map(|_| ())
    }

    /// Returns the cached token if it is still valid beyond the safety
    /// margin, otherwise refreshes it. Double-checks under the lock so
    /// concurrent callers never issue two refreshes.
    pub async fn get_token(&self) -> AppResult<String> {
        let mut state = self.state.lock().await;

        if let Some(token) = &state.token {
            if token.expires_at > Utc::now() + ChronoDuration::seconds(SAFETY_MARGIN_SECS) {
                return Ok(token.access_token.clone());
            }
        }

        let Some(creds) = state.credentials.clone() else {
            return Err(AppError::AuthOAuthNotConfigured);
        };

        match self.request_token(&creds).await {
            Ok(token) => {
                state.token = Some(token.clone());
                Ok(token.access_token)
            }
            Err(e) => {
                // First fetch under new credentials failed: previous pair
                // remains authoritative (§4.3).
                if let Some(prev) = state.previous_credentials.clone() {
                    state.credentials = Some(prev);
                }
                Err(e)
            }
        }
    }

    async fn request_token(&self, creds: &Credentials) -> AppResult<CachedToken> {
        let resp = self
            .http
            .post(&self.token_url)
            .basic_auth(&creds.client_id, Some(&creds.client_secret))
            .header("User-Agent", &self.user_agent)
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| AppError::AuthOAuthFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AppError::AuthOAuthFailed(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AppError::AuthOAuthFailed(e.to_string()))?;

        Ok(CachedToken {
            access_token: body.access_token,
            expires_at: Utc::now() + ChronoDuration::seconds(body.expires_in),
        })
    }

    /// Atomically swap credentials. The previous pair stays available as a
    /// fallback until a successful fetch under the new pair confirms it.
    pub async fn rotate_credentials(&self, client_id: String, client_secret: String) {
        let mut state = self.state.lock().await;
        state.previous_credentials = state.credentials.clone();
        state.credentials = Some(Credentials {
            client_id,
            client_secret,
        });
        state.token = None;
    }

    /// Force a refresh regardless of cached expiry, used after a 401.
    pub async fn force_refresh(&self) -> AppResult<String> {
        {
            let mut state = self.state.lock().await;
            state.token = None;
        }
        self.get_token().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_credentials_is_not_configured() {
        let http = reqwest::Client::new();
        let mgr = OAuthTokenManager::new(http, None, None, "test-agent/1.0");
        let result = mgr.get_token().await;
        assert!(matches!(result, Err(AppError::AuthOAuthNotConfigured)));
    }
}
