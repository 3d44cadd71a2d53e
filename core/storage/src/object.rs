//! S3-compatible object storage driver.

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::{ObjectStore, PutPayload};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use driveshare_common::{
    DrivePath, Error, Result, SignedUrl, SigningKey, DOWNLOAD_TTL, READ_TTL, WRITE_TTL,
};

use crate::driver::{
    with_mirrors, DownloadMirror, DownloadUrl, Driver, GateMethod, ObjectRead,
};
use crate::schema::{DriverSchema, PropType, PropertySchema};
use crate::tree::{tree_from_keys, FileNode};

const DRIVER_NAME: &str = "s3";

/// Configuration of the object storage driver.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreConfig {
    #[serde(alias = "secretID")]
    pub secret_id: String,
    #[serde(alias = "secretKey")]
    pub secret_key: String,
    pub region: String,
    pub endpoint: String,
    pub bucket: String,
    /// Address the bucket as `{endpoint}/{bucket}` instead of a subdomain.
    #[serde(default, alias = "forces3path")]
    pub force_path_style: bool,
    /// Signing key of the gate URLs.
    pub key: String,
    /// Externally reachable base URL of the gate's route group.
    pub host: String,
}

/// Configuration schema of the object storage driver.
pub fn schema() -> DriverSchema {
    DriverSchema {
        kind: DRIVER_NAME,
        display_name: "Object storage (S3)",
        properties: vec![
            PropertySchema::required("secret_id", PropType::String, "Access key ID"),
            PropertySchema::required("secret_key", PropType::String, "Secret access key"),
            PropertySchema::required("region", PropType::String, "Region"),
            PropertySchema::required("endpoint", PropType::String, "Endpoint URL"),
            PropertySchema::required("bucket", PropType::String, "Bucket"),
            PropertySchema::optional("force_path_style", PropType::Boolean, "Path-style access")
                .with_usage("Required by some S3-compatible services"),
            PropertySchema::required("key", PropType::String, "Signing key"),
            PropertySchema::required("host", PropType::String, "Public base URL"),
        ],
    }
}

/// S3-compatible object storage driver.
///
/// Uploads and deletes use SDK-presigned URLs that go straight to the
/// bucket. Downloads use a signed gate URL whose GET redirects to a
/// short-lived presigned GET.
pub struct ObjectStoreDriver {
    store: Arc<dyn ObjectStore>,
    signer: Arc<dyn Signer>,
    key: SigningKey,
    gate_url: String,
}

impl ObjectStoreDriver {
    /// Create a new object storage driver.
    ///
    /// # Errors
    /// - Empty signing key
    /// - Invalid endpoint or credentials configuration
    pub fn new(config: ObjectStoreConfig) -> Result<Self> {
        let store: Arc<AmazonS3> = Arc::new(
            AmazonS3Builder::new()
                .with_endpoint(&config.endpoint)
                .with_access_key_id(&config.secret_id)
                .with_secret_access_key(&config.secret_key)
                .with_bucket_name(&config.bucket)
                .with_region(&config.region)
                .with_virtual_hosted_style_request(!config.force_path_style)
                .with_allow_http(config.endpoint.starts_with("http://"))
                .build()
                .map_err(|e| Error::InvalidInput(format!("Invalid object store config: {}", e)))?,
        );
        Self::from_parts(store.clone(), store, &config.key, &config.host)
    }

    /// Create from an untyped configuration map.
    pub fn from_value(config: Value) -> Result<Self> {
        let config: ObjectStoreConfig = serde_json::from_value(config)
            .map_err(|e| Error::InvalidInput(format!("Invalid object store config: {}", e)))?;
        Self::new(config)
    }

    /// Create from an existing store and signer.
    pub fn from_parts(
        store: Arc<dyn ObjectStore>,
        signer: Arc<dyn Signer>,
        key: &str,
        host: &str,
    ) -> Result<Self> {
        Ok(Self {
            store,
            signer,
            key: SigningKey::new(key)?,
            gate_url: format!("{}/driver/{}", host.trim_end_matches('/'), DRIVER_NAME),
        })
    }

    async fn presign(&self, method: Method, path: &DrivePath, ttl: Duration) -> Result<String> {
        let location = object_path(path)?;
        let url = self
            .signer
            .signed_url(method, &location, ttl)
            .await
            .map_err(map_store_error)?;
        Ok(url.to_string())
    }
}

fn object_path(path: &DrivePath) -> Result<ObjectPath> {
    if path.is_root() {
        return Err(Error::InvalidInput("The bucket root is not an object".to_string()));
    }
    ObjectPath::parse(path.to_key())
        .map_err(|e| Error::InvalidInput(format!("Invalid object key {}: {}", path, e)))
}

fn map_store_error(e: object_store::Error) -> Error {
    match e {
        object_store::Error::NotFound { path, .. } => Error::NotFound(path),
        object_store::Error::AlreadyExists { path, .. } => Error::AlreadyExists(path),
        other => Error::RemoteUnavailable(other.to_string()),
    }
}

#[async_trait]
impl Driver for ObjectStoreDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn check(&self) -> Result<()> {
        let probe = ObjectPath::from(format!(
            "driveshare-check-{}",
            chrono::Utc::now().timestamp_millis()
        ));
        self.store
            .put(&probe, PutPayload::from_static(b"data"))
            .await
            .map_err(map_store_error)?;
        self.store.delete(&probe).await.map_err(map_store_error)?;
        debug!("Object store check passed");
        Ok(())
    }

    async fn pre_upload_url(&self, path: &DrivePath) -> Result<String> {
        self.presign(Method::PUT, path, WRITE_TTL).await
    }

    async fn pre_delete_url(&self, path: &DrivePath) -> Result<String> {
        self.presign(Method::DELETE, path, READ_TTL).await
    }

    async fn download_url(
        &self,
        path: &DrivePath,
        mirrors: &[DownloadMirror],
    ) -> Result<Vec<DownloadUrl>> {
        let urls = vec![DownloadUrl {
            title: "Direct".to_string(),
            url: SignedUrl::sign(&self.key, &self.gate_url, path, DOWNLOAD_TTL)?,
        }];
        Ok(with_mirrors(urls, path, mirrors))
    }

    async fn walk_dir(&self, path: &DrivePath) -> Result<FileNode> {
        let prefix = if path.is_root() {
            None
        } else {
            Some(object_path(path)?)
        };
        let objects: Vec<_> = self
            .store
            .list(prefix.as_ref())
            .try_collect()
            .await
            .map_err(map_store_error)?;

        if objects.is_empty() {
            if let Some(location) = &prefix {
                return match self.store.head(location).await {
                    Ok(meta) if meta.size > 0 => Err(Error::NotADirectory(path.to_string_path())),
                    Ok(_) => Ok(FileNode::directory(path.clone())),
                    Err(object_store::Error::NotFound { .. }) => {
                        Err(Error::NotFound(path.to_string_path()))
                    }
                    Err(e) => Err(map_store_error(e)),
                };
            }
        }

        debug!("Listed {} objects below {}", objects.len(), path);
        let keys = objects
            .into_iter()
            .map(|meta| (meta.location.to_string(), meta.size as u64));
        Ok(tree_from_keys(path, keys))
    }

    fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    fn routes(&self) -> &'static [GateMethod] {
        &[GateMethod::Get]
    }

    async fn read_object(&self, path: &DrivePath) -> Result<ObjectRead> {
        let url = self.presign(Method::GET, path, READ_TTL).await?;
        Ok(ObjectRead::Redirect(url))
    }
}
