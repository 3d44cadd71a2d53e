//! Cloud drive storage driver.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use driveshare_common::{DrivePath, Error, Result, SignedUrl, SigningKey, DOWNLOAD_TTL, WRITE_TTL};

use super::auth::{CloudAuth, DEFAULT_AUTH_URL};
use super::client::{CloudClient, CloudFile, DEFAULT_API_BASE};
use crate::cache::DirectoryCache;
use crate::driver::{
    with_mirrors, DownloadMirror, DownloadUrl, Driver, GateMethod, ObjectBody, ObjectRead,
};
use crate::retry::RetryConfig;
use crate::schema::{DriverSchema, PropType, PropertySchema};
use crate::token::{TokenManager, TokenStatus};
use crate::transfer::{cancellable, chunk_count, upload_chunks, CHUNK_SIZE};
use crate::tree::FileNode;
use crate::walker::{walk_tree, DirectoryLister, ListedEntry};

const DRIVER_NAME: &str = "clouddrive";

fn default_root_id() -> String {
    "root".to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_auth_url() -> String {
    DEFAULT_AUTH_URL.to_string()
}

fn default_cache_ttl() -> u64 {
    30
}

/// Configuration of the cloud drive driver.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudDriveConfig {
    pub refresh_token: String,
    /// Id of the folder served as `/`.
    #[serde(default = "default_root_id")]
    pub root_id: String,
    pub key: String,
    pub host: String,
    /// Skips drive discovery when set.
    #[serde(default)]
    pub drive_id: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

/// Configuration schema of the cloud drive driver.
pub fn schema() -> DriverSchema {
    DriverSchema {
        kind: DRIVER_NAME,
        display_name: "Cloud drive",
        properties: vec![
            PropertySchema::required("refresh_token", PropType::String, "Refresh token"),
            PropertySchema::optional("root_id", PropType::String, "Root folder id")
                .with_usage("Defaults to the drive root"),
            PropertySchema::required("key", PropType::String, "Signing key"),
            PropertySchema::required("host", PropType::String, "Public base URL")
                .with_usage("Gate URLs are {host}/driver/clouddrive"),
            PropertySchema::optional("drive_id", PropType::String, "Drive id"),
            PropertySchema::optional("cache_ttl_secs", PropType::Int, "Listing cache TTL")
                .with_usage("Seconds, default 30"),
        ],
    }
}

/// Cloud drive storage driver.
///
/// Paths are resolved to file ids by walking the cached listings of every
/// ancestor. Uploads are proxied by the transfer gate and sent to the
/// service in sequential parts.
pub struct CloudDrive {
    client: CloudClient,
    tokens: Arc<TokenManager>,
    cache: DirectoryCache<CloudFile>,
    root_id: String,
    key: SigningKey,
    gate_url: String,
    retry: RetryConfig,
}

impl CloudDrive {
    /// Create a new cloud drive driver.
    ///
    /// No network call is made; the first access token is obtained lazily.
    ///
    /// # Errors
    /// - Empty refresh token or signing key
    pub fn new(config: CloudDriveConfig) -> Result<Self> {
        if config.refresh_token.is_empty() {
            return Err(Error::InvalidInput("refresh_token must not be empty".to_string()));
        }
        let key = SigningKey::new(config.key)?;
        let http = reqwest::Client::new();
        let source = Arc::new(CloudAuth::new(http.clone(), config.auth_url));
        let tokens = Arc::new(TokenManager::new(source, config.refresh_token));
        let client = CloudClient::new(http, config.api_base, tokens.clone(), config.drive_id);

        Ok(Self {
            client,
            tokens,
            cache: DirectoryCache::new(Duration::from_secs(config.cache_ttl_secs)),
            root_id: config.root_id,
            key,
            gate_url: format!("{}/driver/{}", config.host.trim_end_matches('/'), DRIVER_NAME),
            retry: RetryConfig::default(),
        })
    }

    /// Create from an untyped configuration map.
    pub fn from_value(config: Value) -> Result<Self> {
        let config: CloudDriveConfig = serde_json::from_value(config)
            .map_err(|e| Error::InvalidInput(format!("Invalid cloud drive config: {}", e)))?;
        Self::new(config)
    }

    /// Override the per-part retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Token lifecycle status, for display.
    pub async fn status(&self) -> TokenStatus {
        self.tokens.status().await
    }

    fn root(&self) -> CloudFile {
        CloudFile::folder(self.root_id.clone(), "")
    }

    /// Children of the folder `folder_id` located at `dir`.
    async fn children_of(&self, dir: &DrivePath, folder_id: &str) -> Result<Arc<Vec<CloudFile>>> {
        self.cache
            .get_or_populate(dir, || self.client.list_folder(folder_id))
            .await
    }

    /// Resolve `path` to its file metadata.
    ///
    /// # Errors
    /// - `NotFound` if any component is missing
    /// - `NotADirectory` if an ancestor is a file
    pub async fn resolve(&self, path: &DrivePath) -> Result<CloudFile> {
        let mut current = self.root();
        let mut dir = DrivePath::root();

        for name in path.components() {
            if !current.is_folder() {
                return Err(Error::NotADirectory(dir.to_string_path()));
            }
            let children = self.children_of(&dir, &current.file_id).await?;
            current = children
                .iter()
                .find(|f| &f.name == name)
                .cloned()
                .ok_or_else(|| Error::NotFound(path.to_string_path()))?;
            dir = dir.join(name)?;
        }
        Ok(current)
    }

    /// List the direct children of the folder at `path`.
    pub async fn files(&self, path: &DrivePath) -> Result<Arc<Vec<CloudFile>>> {
        let folder = self.resolve(path).await?;
        if !folder.is_folder() {
            return Err(Error::NotADirectory(path.to_string_path()));
        }
        self.children_of(path, &folder.file_id).await
    }

    /// Ensure the folder at `path` exists, creating missing ancestors.
    ///
    /// # Errors
    /// - `ConflictNotADirectory` if a component exists as a file
    pub async fn make_dir(&self, path: &DrivePath) -> Result<CloudFile> {
        let mut current = self.root();
        let mut dir = DrivePath::root();

        for prefix in path.prefixes() {
            let name = prefix.display_name().to_string();
            let children = self.children_of(&dir, &current.file_id).await?;
            let existing = children.iter().find(|f| f.name == name).cloned();

            current = match existing {
                Some(file) if file.is_folder() => file,
                Some(_) => return Err(Error::ConflictNotADirectory(prefix.to_string_path())),
                None => self.create_child_folder(&dir, &current.file_id, &name).await?,
            };
            dir = prefix;
        }
        Ok(current)
    }

    async fn create_child_folder(
        &self,
        dir: &DrivePath,
        parent_id: &str,
        name: &str,
    ) -> Result<CloudFile> {
        let created = self.client.create_folder(parent_id, name).await;
        self.cache.invalidate(dir);

        match created {
            Ok(folder) => {
                debug!("Created folder {} in {}", name, dir);
                Ok(folder)
            }
            Err(Error::AlreadyExists(reason)) => {
                // Someone else created it between our listing and the create.
                debug!("Folder {} appeared concurrently: {}", name, reason);
                let children = self.children_of(dir, parent_id).await?;
                match children.iter().find(|f| f.name == name) {
                    Some(file) if file.is_folder() => Ok(file.clone()),
                    Some(_) => Err(Error::ConflictNotADirectory(dir.join(name)?.to_string_path())),
                    None => Err(Error::AlreadyExists(reason)),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Upload `body` to `path`, creating parent folders as needed.
    ///
    /// # Errors
    /// - `InvalidInput` if the body has no declared length
    /// - `TransferFailed` if a part exhausts its retries or completion
    ///   returns a different file
    /// - `Cancelled` if `cancel` fires
    pub async fn upload(
        &self,
        path: &DrivePath,
        mut body: ObjectBody,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let size = body.required_length()?;
        let (Some(name), Some(parent)) = (path.name(), path.parent()) else {
            return Err(Error::InvalidInput("Cannot upload to the root".to_string()));
        };
        let folder = cancellable(cancel, self.make_dir(&parent)).await?;

        let parts = chunk_count(size, CHUNK_SIZE);
        let session = cancellable(
            cancel,
            self.client.create_upload(&folder.file_id, name, size, parts),
        )
        .await?;
        let urls = session.part_urls();
        if urls.len() != parts {
            return Err(Error::TransferFailed(format!(
                "Requested {} part URLs, got {}",
                parts,
                urls.len()
            )));
        }

        let client = &self.client;
        let urls = &urls;
        upload_chunks(
            &mut body.reader,
            size,
            CHUNK_SIZE,
            &self.retry,
            cancel,
            move |chunk| async move {
                let url = urls.get(chunk.index).ok_or_else(|| {
                    Error::TransferFailed(format!("No URL for part {}", chunk.index + 1))
                })?;
                client.put_part(url, chunk.data).await
            },
        )
        .await?;

        let file_id = cancellable(
            cancel,
            self.client.complete(&session.file_id, &session.upload_id),
        )
        .await?;
        if file_id != session.file_id {
            return Err(Error::TransferFailed(format!(
                "Completed file {} does not match registered file {}",
                file_id, session.file_id
            )));
        }

        self.cache.invalidate_parent(path);
        info!("Uploaded {} ({} bytes in {} parts)", path, size, parts);
        Ok(file_id)
    }

    /// Move the file or folder at `path` to the recycle bin.
    pub async fn delete(&self, path: &DrivePath) -> Result<()> {
        if path.is_root() {
            return Err(Error::PermissionDenied("Cannot delete the root".to_string()));
        }
        let file = self.resolve(path).await?;
        self.client.trash(&file.file_id).await?;

        self.cache.invalidate_parent(path);
        if file.is_folder() {
            self.cache.invalidate(path);
        }
        info!("Trashed {}", path);
        Ok(())
    }

    /// Backend-issued download link of the file at `path`.
    pub async fn link(&self, path: &DrivePath) -> Result<String> {
        let file = self.resolve(path).await?;
        if file.is_folder() {
            return Err(Error::InvalidInput(format!("{} is a folder", path)));
        }
        self.client.download_link(&file.file_id).await
    }
}

#[async_trait]
impl DirectoryLister for CloudDrive {
    async fn list_children(&self, path: &DrivePath) -> Result<Vec<ListedEntry>> {
        let files = self.files(path).await?;
        Ok(files
            .iter()
            .map(|f| {
                if f.is_folder() {
                    ListedEntry::directory(f.name.clone())
                } else {
                    ListedEntry::file(f.name.clone(), f.size)
                }
            })
            .collect())
    }
}

#[async_trait]
impl Driver for CloudDrive {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn check(&self) -> Result<()> {
        let drive_id = self.client.drive_id().await?;
        let root = self.client.list_folder(&self.root_id).await?;
        debug!(
            "Cloud drive check passed: drive {}, {} root entries",
            drive_id,
            root.len()
        );
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
        self.upload(path, body, cancel).await.map(|_| ())
    }

    async fn delete_object(&self, path: &DrivePath) -> Result<()> {
        self.delete(path).await
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
