//! OAuth token exchange (refresh_token grant).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub const TWITCH_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";

/// What the endpoint hands back on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Present only when the endpoint rotates the refresh token.
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenExchangeError {
    #[error("HTTP error refreshing token: {0}")]
    Http(String),
    #[error("token endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed token response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(
        &self,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<TokenGrant, TokenExchangeError>;
}

#[derive(Deserialize)]
struct TwitchTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}

pub struct TwitchTokenEndpoint {
    http: reqwest::Client,
    token_url: String,
}

impl TwitchTokenEndpoint {
    pub fn new() -> Result<Self, TokenExchangeError> {
        Self::with_url(TWITCH_TOKEN_URL)
    }

    pub fn with_url(token_url: impl Into<String>) -> Result<Self, TokenExchangeError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| TokenExchangeError::Http(e.to_string()))?;
        Ok(Self {
            http,
            token_url: token_url.into(),
        })
    }
}

#[async_trait]
impl TokenEndpoint for TwitchTokenEndpoint {
    async fn refresh(
        &self,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<TokenGrant, TokenExchangeError> {
        let params = [
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        let resp = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| TokenExchangeError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TokenExchangeError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let parsed = resp
            .json::<TwitchTokenResponse>()
            .await
            .map_err(|e| TokenExchangeError::Malformed(e.to_string()))?;
        if parsed.access_token.is_empty() {
            return Err(TokenExchangeError::Malformed("empty access_token".into()));
        }

        Ok(TokenGrant {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token.filter(|t| !t.is_empty()),
            expires_in: parsed.expires_in,
        })
    }
}
