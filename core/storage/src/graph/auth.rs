//! OAuth2 refresh-token exchange for the Graph drive.

use async_trait::async_trait;
use oauth2::basic::{BasicClient, BasicErrorResponseType};
use oauth2::{
    AuthType, ClientId, ClientSecret, EndpointNotSet, EndpointSet, RedirectUrl, RefreshToken,
    RequestTokenError, TokenResponse, TokenUrl,
};
use tracing::debug;

use driveshare_common::{Error, Result};

use crate::token::{TokenSource, Tokens};

/// Microsoft identity platform token endpoint.
pub const DEFAULT_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

type GraphOAuthClient =
    BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// OAuth2 settings of a Graph application registration.
#[derive(Debug, Clone)]
pub struct GraphAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub token_url: String,
}

/// Exchanges refresh tokens against the Microsoft identity platform.
pub struct GraphAuth {
    client: GraphOAuthClient,
    http: oauth2::reqwest::Client,
    redirect_url: String,
}

impl GraphAuth {
    /// Create a new token source.
    ///
    /// # Errors
    /// - Malformed token or redirect URL
    /// - HTTP client cannot be built
    pub fn new(config: GraphAuthConfig) -> Result<Self> {
        let client = BasicClient::new(ClientId::new(config.client_id))
            .set_client_secret(ClientSecret::new(config.client_secret))
            .set_token_uri(
                TokenUrl::new(config.token_url)
                    .map_err(|e| Error::InvalidInput(format!("Invalid token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(config.redirect_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid redirect URL: {}", e)))?,
            )
            .set_auth_type(AuthType::RequestBody);

        // Token endpoints must not be followed through redirects.
        let http = oauth2::reqwest::ClientBuilder::new()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            http,
            redirect_url: config.redirect_url,
        })
    }
}

#[async_trait]
impl TokenSource for GraphAuth {
    async fn refresh(&self, refresh_token: &str) -> Result<Tokens> {
        debug!("Refreshing Graph access token");
        let token_result = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .add_extra_param("redirect_uri", self.redirect_url.clone())
            .request_async(&self.http)
            .await
            .map_err(|e| match e {
                RequestTokenError::ServerResponse(response) => match response.error() {
                    BasicErrorResponseType::InvalidGrant
                    | BasicErrorResponseType::InvalidClient
                    | BasicErrorResponseType::UnauthorizedClient => Error::PermissionDenied(
                        format!("Refresh token rejected: {}", response),
                    ),
                    _ => Error::RemoteUnavailable(format!("Token refresh failed: {}", response)),
                },
                other => Error::RemoteUnavailable(format!("Token refresh failed: {}", other)),
            })?;

        let access_token = token_result.access_token().secret().clone();

        // Refresh tokens may or may not be returned in refresh response
        let new_refresh_token = token_result
            .refresh_token()
            .map(|t| t.secret().clone())
            .unwrap_or_else(|| refresh_token.to_string());

        Ok(Tokens {
            access_token,
            refresh_token: new_refresh_token,
            expires_at: Tokens::expiry_from_now(token_result.expires_in()),
        })
    }
}
