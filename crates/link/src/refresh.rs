//! Refresh-token exchange port and its OAuth2 HTTP implementation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::credentials::Credentials;

/// Outcome classes of a failed refresh exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    /// The refresh token is permanently unusable (`invalid_grant` and kin).
    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),

    /// Anything that might succeed on a later attempt.
    #[error("refresh failed: {0}")]
    Transient(String),
}

pub type RefreshFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Credentials, RefreshError>> + Send + 'a>>;

/// Exchanges a refresh token for a new credential pair.
pub trait TokenRefresher: Send + Sync {
    fn refresh<'a>(
        &'a self,
        server_id: &'a str,
        token_url: &'a str,
        refresh_token: &'a str,
    ) -> RefreshFuture<'a>;
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

#[derive(Debug, Default, Deserialize)]
struct OAuthErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// OAuth2 `refresh_token` grant over HTTP.
pub struct HttpTokenRefresher {
    http_client: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl HttpTokenRefresher {
    pub fn new(http_client: reqwest::Client, clock: Arc<dyn Clock>) -> Self {
        Self { http_client, clock }
    }

    async fn exchange(
        &self,
        server_id: &str,
        token_url: &str,
        refresh_token: &str,
    ) -> Result<Credentials, RefreshError> {
        debug!(server = %server_id, url = %token_url, "refreshing access token");
        let body = RefreshRequest {
            grant_type: "refresh_token",
            refresh_token,
        };
        let response = self
            .http_client
            .post(token_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RefreshError::Transient(format!("request to {token_url} failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RefreshError::Transient(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(classify_failure(status.as_u16(), &text));
        }

        let token: TokenResponse = serde_json::from_str(&text)
            .map_err(|e| RefreshError::Transient(format!("malformed token response: {e}")))?;

        Ok(Credentials {
            access_token: token.access_token,
            // Servers that don't rotate refresh tokens omit the field.
            refresh_token: token
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
            expires_at: self.clock.now() + TimeDelta::seconds(token.expires_in.max(0)),
        })
    }
}

impl TokenRefresher for HttpTokenRefresher {
    fn refresh<'a>(
        &'a self,
        server_id: &'a str,
        token_url: &'a str,
        refresh_token: &'a str,
    ) -> RefreshFuture<'a> {
        Box::pin(self.exchange(server_id, token_url, refresh_token))
    }
}

/// Maps a non-2xx token endpoint response onto a [`RefreshError`].
///
/// Only the RFC 6749 errors that mean "this grant will never work" are
/// permanent; everything else, including 5xx and unparseable bodies, is
/// transient.
pub(crate) fn classify_failure(status: u16, body: &str) -> RefreshError {
    let parsed: OAuthErrorBody = serde_json::from_str(body).unwrap_or_default();
    let permanent = matches!(status, 400 | 401)
        && matches!(
            parsed.error.as_str(),
            "invalid_grant" | "invalid_client" | "unauthorized_client"
        );
    let detail = parsed
        .error_description
        .unwrap_or_else(|| format!("HTTP {status} {}", parsed.error));
    if permanent {
        RefreshError::InvalidGrant(format!("{}: {detail}", parsed.error))
    } else {
        RefreshError::Transient(detail)
    }
}
