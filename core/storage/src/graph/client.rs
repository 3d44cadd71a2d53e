//! Microsoft Graph drive API client.

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use driveshare_common::{DrivePath, Error, Result};

use crate::token::TokenManager;
use crate::transfer::Chunk;

/// Graph API v1.0 base URL.
pub const DEFAULT_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Characters escaped inside one path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// A drive item as returned by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphItem {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    /// Present on folders only.
    #[serde(default)]
    pub folder: Option<serde_json::Value>,
    #[serde(rename = "@microsoft.graph.downloadUrl", default)]
    pub download_url: Option<String>,
}

impl GraphItem {
    /// Check if this is a folder.
    pub fn is_folder(&self) -> bool {
        self.folder.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct ItemPage {
    value: Vec<GraphItem>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadSessionResponse {
    #[serde(rename = "uploadUrl")]
    upload_url: String,
}

#[derive(Debug, Default, Deserialize)]
struct GraphErrorBody {
    #[serde(default)]
    error: GraphErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
struct GraphErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Graph drive API client.
///
/// All paths are relative to `root`, the folder the driver serves.
pub struct GraphClient {
    http: Client,
    api_base: String,
    tokens: Arc<TokenManager>,
    root: DrivePath,
}

impl GraphClient {
    /// Create a new client.
    pub fn new(
        http: Client,
        api_base: impl Into<String>,
        tokens: Arc<TokenManager>,
        root: DrivePath,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            tokens,
            root,
        }
    }

    /// URL of `path`'s item, followed by `suffix` (`/children`, `/content`...).
    pub fn item_url(&self, path: &DrivePath, suffix: &str) -> String {
        let components: Vec<&String> = self
            .root
            .components()
            .iter()
            .chain(path.components())
            .collect();

        if components.is_empty() {
            return format!("{}/me/drive/root{}", self.api_base, suffix);
        }

        let encoded: String = components
            .iter()
            .map(|c| format!("/{}", utf8_percent_encode(c, PATH_SEGMENT)))
            .collect();
        if suffix.is_empty() {
            format!("{}/me/drive/root:{}", self.api_base, encoded)
        } else {
            format!("{}/me/drive/root:{}:{}", self.api_base, encoded, suffix)
        }
    }

    /// Metadata of the drive, used as a connectivity check.
    pub async fn drive(&self) -> Result<serde_json::Value> {
        let url = format!("{}/me/drive", self.api_base);
        self.get_json(&url).await
    }

    /// List the children of `path`, following `@odata.nextLink`.
    pub async fn list_children(&self, path: &DrivePath) -> Result<Vec<GraphItem>> {
        let mut items = Vec::new();
        let mut next = Some(self.item_url(path, "/children"));

        while let Some(url) = next {
            let page: ItemPage = self.get_json(&url).await?;
            items.extend(page.value);
            next = page.next_link;
        }

        debug!("Listed {}: {} items", path, items.len());
        Ok(items)
    }

    /// Metadata of the item at `path`.
    pub async fn item(&self, path: &DrivePath) -> Result<GraphItem> {
        let url = self.item_url(path, "");
        self.get_json(&url).await
    }

    /// Upload a small file in one request.
    pub async fn upload_small(&self, path: &DrivePath, data: Bytes) -> Result<()> {
        let url = self.item_url(path, "/content");
        self.send(|token| {
            self.http
                .put(&url)
                .bearer_auth(token)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(data.clone())
        })
        .await?;
        Ok(())
    }

    /// Open a resumable upload session that replaces any existing file.
    pub async fn create_upload_session(&self, path: &DrivePath) -> Result<String> {
        let url = self.item_url(path, "/createUploadSession");
        let body = json!({
            "item": { "@microsoft.graph.conflictBehavior": "replace" }
        });
        let response = self
            .send(|token| self.http.post(&url).bearer_auth(token).json(&body))
            .await?;
        let session: UploadSessionResponse = parse(response).await?;
        Ok(session.upload_url)
    }

    /// PUT one chunk to an upload session and return the response status.
    ///
    /// Session URLs are pre-authenticated, so no access token is sent.
    pub async fn put_chunk(&self, upload_url: &str, chunk: Chunk) -> Result<StatusCode> {
        let response = self
            .http
            .put(upload_url)
            .header(header::CONTENT_RANGE, chunk.content_range())
            .body(chunk.data)
            .send()
            .await
            .map_err(|e| Error::RemoteUnavailable(format!("Chunk upload failed: {}", e)))?;
        Ok(response.status())
    }

    /// Cancel an upload session. Failures are logged and ignored.
    pub async fn delete_upload_session(&self, upload_url: &str) {
        match self.http.delete(upload_url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Cancelled upload session");
            }
            Ok(response) => warn!("Failed to cancel upload session: {}", response.status()),
            Err(e) => warn!("Failed to cancel upload session: {}", e),
        }
    }

    /// Delete the item at `path`.
    pub async fn delete(&self, path: &DrivePath) -> Result<()> {
        let url = self.item_url(path, "");
        self.send(|token| self.http.request(Method::DELETE, &url).bearer_auth(token))
            .await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .send(|token| self.http.get(url).bearer_auth(token))
            .await?;
        parse(response).await
    }

    /// Send the request built by `build`, replaying it once on a rejected token.
    async fn send<B>(&self, build: B) -> Result<Response>
    where
        B: Fn(String) -> RequestBuilder + Send + Sync,
    {
        self.tokens
            .with_auth_retry(|token| {
                let request = build(token);
                async move {
                    let response = request
                        .send()
                        .await
                        .map_err(|e| Error::RemoteUnavailable(format!("Request failed: {}", e)))?;
                    check_response(response).await
                }
            })
            .await
    }
}

async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| Error::Serialization(format!("Failed to parse response: {}", e)))
}

/// Classify a non-2xx response.
async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let error: GraphErrorBody = serde_json::from_str(&body).unwrap_or_default();
    let detail = format!("{} {}: {}", status, error.error.code, error.error.message);

    Err(match status {
        StatusCode::UNAUTHORIZED => Error::AuthExpired(detail),
        StatusCode::NOT_FOUND => Error::NotFound(detail),
        StatusCode::FORBIDDEN => Error::PermissionDenied(detail),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => Error::AlreadyExists(detail),
        StatusCode::BAD_REQUEST => Error::InvalidInput(detail),
        _ => Error::RemoteUnavailable(detail),
    })
}
