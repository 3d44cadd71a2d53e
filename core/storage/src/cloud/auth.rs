//! Refresh-token exchange for the cloud drive API.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use driveshare_common::{Error, Result};

use crate::token::{TokenSource, Tokens};

/// Default token endpoint.
pub const DEFAULT_AUTH_URL: &str = "https://auth.aliyundrive.com/v2/account/token";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Error body returned by the cloud drive services.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ApiError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Exchanges refresh tokens against the cloud drive's account service.
pub struct CloudAuth {
    http: Client,
    auth_url: String,
}

impl CloudAuth {
    pub fn new(http: Client, auth_url: impl Into<String>) -> Self {
        Self {
            http,
            auth_url: auth_url.into(),
        }
    }
}

#[async_trait]
impl TokenSource for CloudAuth {
    async fn refresh(&self, refresh_token: &str) -> Result<Tokens> {
        debug!("Refreshing cloud drive access token");
        let response = self
            .http
            .post(&self.auth_url)
            .json(&serde_json::json!({
                "refresh_token": refresh_token,
                "grant_type": "refresh_token",
            }))
            .send()
            .await
            .map_err(|e| Error::RemoteUnavailable(format!("Token refresh failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error: ApiError = serde_json::from_str(&body).unwrap_or_default();
            return Err(if status.is_client_error() {
                Error::PermissionDenied(format!(
                    "Refresh token rejected: {} {}",
                    error.code, error.message
                ))
            } else {
                Error::RemoteUnavailable(format!("Token refresh failed: {} - {}", status, body))
            });
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse token response: {}", e)))?;

        Ok(Tokens {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: Tokens::expiry_from_now(tokens.expires_in.map(Duration::from_secs)),
        })
    }
}
