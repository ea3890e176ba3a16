//! Bearer token sources
//!
//! The API client asks a [`TokenSource`] for the current token before every
//! request. When the API answers 401/403 the client calls
//! [`TokenSource::refresh`] once with the token that was rejected; a source
//! that cannot refresh returns an auth error, which fails the run.

use crate::error::{IngestError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Token to send with the next request.
    async fn token(&self) -> Result<String>;

    /// Obtain a new token after `rejected` was refused by the API.
    async fn refresh(&self, rejected: &str) -> Result<String>;
}

/// A fixed API token. Refresh always fails.
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String> {
        Ok(self.token.clone())
    }

    async fn refresh(&self, _rejected: &str) -> Result<String> {
        Err(IngestError::auth(
            "API token was rejected and no refresh endpoint is configured",
        ))
    }
}

struct TokenPair {
    access: String,
    refresh: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(alias = "accessToken", alias = "token")]
    access_token: Option<String>,
    #[serde(alias = "refreshToken")]
    refresh_token: Option<String>,
}

/// Access token that is exchanged for a new one at `refresh_url` when rejected.
pub struct RefreshingToken {
    http: Client,
    refresh_url: String,
    state: RwLock<TokenPair>,
}

impl RefreshingToken {
    pub fn new(
        http: Client,
        refresh_url: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            refresh_url: refresh_url.into(),
            state: RwLock::new(TokenPair {
                access: access_token.into(),
                refresh: refresh_token.into(),
            }),
        }
    }
}

#[async_trait]
impl TokenSource for RefreshingToken {
    async fn token(&self) -> Result<String> {
        Ok(self.state.read().await.access.clone())
    }

    async fn refresh(&self, rejected: &str) -> Result<String> {
        let mut state = self.state.write().await;

        // Another run already refreshed while we waited for the lock
        if state.access != rejected {
            debug!("Token already refreshed by a concurrent request");
            return Ok(state.access.clone());
        }

        let response = self
            .http
            .post(&self.refresh_url)
            .json(&json!({ "refresh_token": state.refresh }))
            .send()
            .await
            .map_err(|e| IngestError::auth(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::auth(format!(
                "token refresh rejected with HTTP {}",
                status.as_u16()
            )));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| IngestError::auth(format!("invalid token refresh response: {e}")))?;

        let access = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| IngestError::auth("token refresh response has no access token"))?;

        state.access = access.clone();
        if let Some(rotated) = body.refresh_token.filter(|t| !t.is_empty()) {
            state.refresh = rotated;
        }

        info!("Refreshed API access token");
        Ok(access)
    }
}
