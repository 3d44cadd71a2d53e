//! Microsoft Graph drive storage driver.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driveshare_common::{DrivePath, Error, Result, SignedUrl, SigningKey, DOWNLOAD_TTL, WRITE_TTL};

use super::auth::{GraphAuth, GraphAuthConfig, DEFAULT_TOKEN_URL};
use super::client::{GraphClient, DEFAULT_API_BASE};
use crate::driver::{
    with_mirrors, DownloadMirror, DownloadUrl, Driver, GateMethod, ObjectBody, ObjectRead,
};
use crate::retry::RetryConfig;
use crate::schema::{DriverSchema, PropType, PropertySchema};
use crate::token::{TokenManager, TokenStatus};
use crate::transfer::{cancellable, upload_chunks, CHUNK_SIZE};
use crate::tree::FileNode;
use crate::walker::{walk_tree, DirectoryLister, ListedEntry};

const DRIVER_NAME: &str = "graphdrive";

/// Largest file sent in a single request.
pub const SMALL_UPLOAD_LIMIT: u64 = 3 * 1024 * 1024;

fn default_root() -> String {
    "/".to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

/// Configuration of the Graph drive driver.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphDriveConfig {
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub key: String,
    pub host: String,
    /// Folder served as `/`.
    #[serde(default = "default_root")]
    pub path: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
}

/// Configuration schema of the Graph drive driver.
pub fn schema() -> DriverSchema {
    DriverSchema {
        kind: DRIVER_NAME,
        display_name: "OneDrive",
        properties: vec![
            PropertySchema::required("refresh_token", PropType::String, "Refresh token"),
            PropertySchema::required("client_id", PropType::String, "Client ID"),
            PropertySchema::required("client_secret", PropType::String, "Client secret"),
            PropertySchema::required("redirect_url", PropType::String, "Redirect URL"),
            PropertySchema::required("key", PropType::String, "Signing key"),
            PropertySchema::required("host", PropType::String, "Public base URL")
                .with_usage("Gate URLs are {host}/driver/graphdrive"),
            PropertySchema::optional("path", PropType::String, "Root folder")
                .with_usage("Defaults to /"),
        ],
    }
}

/// Graph drive storage driver.
///
/// Items are addressed by path. Files up to [`SMALL_UPLOAD_LIMIT`] are sent
/// in one request; larger ones through a resumable upload session.
pub struct GraphDrive {
    client: GraphClient,
    tokens: Arc<TokenManager>,
    key: SigningKey,
    gate_url: String,
    retry: RetryConfig,
}

impl GraphDrive {
    /// Create a new Graph drive driver.
    ///
    /// # Errors
    /// - Empty refresh token or signing key
    /// - Malformed root path or OAuth URLs
    pub fn new(config: GraphDriveConfig) -> Result<Self> {
        if config.refresh_token.is_empty() {
            return Err(Error::InvalidInput("refresh_token must not be empty".to_string()));
        }
        let key = SigningKey::new(config.key)?;
        let root = DrivePath::parse(&config.path)?;
        let source = Arc::new(GraphAuth::new(GraphAuthConfig {
            client_id: config.client_id,
            client_secret: config.client_secret,
            redirect_url: config.redirect_url,
            token_url: config.token_url,
        })?);
        let tokens = Arc::new(TokenManager::new(source, config.refresh_token));
        let client = GraphClient::new(reqwest::Client::new(), config.api_base, tokens.clone(), root);

        Ok(Self {
            client,
            tokens,
            key,
            gate_url: format!("{}/driver/{}", config.host.trim_end_matches('/'), DRIVER_NAME),
            retry: RetryConfig::default(),
        })
    }

    /// Create from an untyped configuration map.
    pub fn from_value(config: Value) -> Result<Self> {
        let config: GraphDriveConfig = serde_json::from_value(config)
            .map_err(|e| Error::InvalidInput(format!("Invalid Graph drive config: {}", e)))?;
        Self::new(config)
    }

    /// Override the per-chunk retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Token lifecycle status, for display.
    pub async fn status(&self) -> TokenStatus {
        self.tokens.status().await
    }

    /// Upload `body` to `path`. Missing parent folders are created by the
    /// service.
    ///
    /// # Errors
    /// - `InvalidInput` if the body has no declared length
    /// - `TransferFailed` if a chunk exhausts its retries
    /// - `Cancelled` if `cancel` fires
    pub async fn upload(
        &self,
        path: &DrivePath,
        mut body: ObjectBody,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot upload to the root".to_string()));
        }
        let size = body.required_length()?;

        if size <= SMALL_UPLOAD_LIMIT {
            let mut data = Vec::with_capacity(size as usize);
            let read = cancellable(cancel, async {
                (&mut body.reader)
                    .take(size)
                    .read_to_end(&mut data)
                    .await
                    .map_err(Error::Io)
            })
            .await?;
            if read as u64 != size {
                return Err(Error::TransferFailed(format!(
                    "Body ended early: expected {} bytes, got {}",
                    size, read
                )));
            }
            cancellable(cancel, self.client.upload_small(path, Bytes::from(data))).await?;
            info!("Uploaded {} ({} bytes)", path, size);
            return Ok(());
        }

        let upload_url = cancellable(cancel, self.client.create_upload_session(path)).await?;
        let client = &self.client;
        let session = upload_url.as_str();
        let sent = upload_chunks(
            &mut body.reader,
            size,
            CHUNK_SIZE,
            &self.retry,
            cancel,
            move |chunk| client.put_chunk(session, chunk),
        )
        .await;

        match sent {
            Ok(chunks) => {
                info!("Uploaded {} ({} bytes in {} chunks)", path, size, chunks);
                Ok(())
            }
            Err(e) => {
                warn!("Upload of {} aborted: {}", path, e);
                self.client.delete_upload_session(&upload_url).await;
                Err(e)
            }
        }
    }

    /// Service-issued download link of the file at `path`.
    pub async fn link(&self, path: &DrivePath) -> Result<String> {
        let item = self.client.item(path).await?;
        if item.is_folder() {
            return Err(Error::InvalidInput(format!("{} is a folder", path)));
        }
        item.download_url
            .ok_or_else(|| Error::RemoteUnavailable(format!("No download URL for {}", path)))
    }
}

#[async_trait]
impl DirectoryLister for GraphDrive {
    async fn list_children(&self, path: &DrivePath) -> Result<Vec<ListedEntry>> {
        let items = self.client.list_children(path).await?;
        Ok(items
            .into_iter()
            .map(|item| {
                if item.is_folder() {
                    ListedEntry::directory(item.name)
                } else {
                    ListedEntry::file(item.name, item.size)
                }
            })
            .collect())
    }
}

#[async_trait]
impl Driver for GraphDrive {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn check(&self) -> Result<()> {
        self.client.drive().await?;
        debug!("Graph drive check passed");
        Ok(())
    }

    async fn pre_upload_url(&self, path: &DrivePath) -> Result<String> {
        SignedUrl::sign(&self.key, &self.gate_url, path, WRITE_TTL)
    }

    async fn pre_delete_url(&self, path: &DrivePath) -> Result<String> {
        SignedUrl::sign(&self.key, &self.gate_url, path, WRITE_TTL)
    }

    async fn download_url(
        &self,
        path: &DrivePath,
        mirrors: &[DownloadMirror],
    ) -> Result<Vec<DownloadUrl>> {
        let direct = DownloadUrl {
            title: "Direct".to_string(),
            url: SignedUrl::sign(&self.key, &self.gate_url, path, DOWNLOAD_TTL)?,
        };
        Ok(with_mirrors(vec![direct], path, mirrors))
    }

    async fn walk_dir(&self, path: &DrivePath) -> Result<FileNode> {
        if !path.is_root() && !self.client.item(path).await?.is_folder() {
            return Err(Error::NotADirectory(path.to_string_path()));
        }
        walk_tree(self, path).await
    }

    fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    fn routes(&self) -> &'static [GateMethod] {
        &[GateMethod::Put, GateMethod::Get, GateMethod::Delete]
    }

    async fn put_object(
        &self,
        path: &DrivePath,
        body: ObjectBody,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.upload(path, body, cancel).await
    }

    async fn delete_object(&self, path: &DrivePath) -> Result<()> {
        if path.is_root() {
            return Err(Error::PermissionDenied("Cannot delete the root".to_string()));
        }
        self.client.delete(path).await?;
        info!("Deleted {}", path);
        Ok(())
    }

    async fn read_object(&self, path: &DrivePath) -> Result<ObjectRead> {
        Ok(ObjectRead::Redirect(self.link(path).await?))
    }

    fn spawn_token_refresh(&self, period: Duration) -> Option<JoinHandle<()>> {
        Some(self.tokens.spawn_periodic_refresh(period))
    }

    fn subscribe_refresh_token(&self) -> Option<watch::Receiver<String>> {
        Some(self.tokens.subscribe_refresh_token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Value {
        serde_json::json!({
            "refresh_token": "r0",
            "client_id": "id",
            "client_secret": "secret",
            "redirect_url": "http://localhost/callback",
            "key": "k",
            "host": "https://share.example.com",
        })
    }

    #[test]
    fn test_config_defaults() {
        let config: GraphDriveConfig = serde_json::from_value(config()).unwrap();
        assert_eq!(config.path, "/");
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.token_url, DEFAULT_TOKEN_URL);
    }

    #[test]
    fn test_bad_root_rejected() {
        let mut value = config();
        value["path"] = serde_json::json!("/a/../b");
        assert!(matches!(
            GraphDrive::from_value(value),
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_length_rejected() {
        let drive = GraphDrive::from_value(config()).unwrap();
        let body = ObjectBody::new(Box::pin(tokio::io::empty()), None);
        let result = drive
            .upload(
                &DrivePath::parse("/a.txt").unwrap(),
                body,
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
