//! Storage driver trait definition.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use driveshare_common::{DrivePath, Error, Result, SigningKey};

use crate::tree::FileNode;

/// A download link offered to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadUrl {
    /// Display label.
    pub title: String,
    /// Absolute URL, possibly signed.
    #[serde(rename = "downloadUrl")]
    pub url: String,
}

/// An extra download mirror configured by the site operator.
///
/// The file path is appended verbatim to `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadMirror {
    pub title: String,
    pub url: String,
}

impl DownloadMirror {
    /// Link to `path` on this mirror.
    pub fn link(&self, path: &DrivePath) -> DownloadUrl {
        DownloadUrl {
            title: self.title.clone(),
            url: format!("{}{}", self.url.trim_end_matches('/'), path),
        }
    }
}

/// Append one link per mirror.
pub fn with_mirrors(
    mut urls: Vec<DownloadUrl>,
    path: &DrivePath,
    mirrors: &[DownloadMirror],
) -> Vec<DownloadUrl> {
    urls.extend(mirrors.iter().map(|m| m.link(path)));
    urls
}

/// Byte stream type for download operations.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Request body handed to a driver by the transfer gate.
pub struct ObjectBody {
    /// Raw file bytes.
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
    /// Declared length (`Content-Length`), when the client sent one.
    pub length: Option<u64>,
}

impl ObjectBody {
    pub fn new(reader: Pin<Box<dyn AsyncRead + Send>>, length: Option<u64>) -> Self {
        Self { reader, length }
    }

    /// Declared length, required by drivers that pre-register uploads.
    pub fn required_length(&self) -> Result<u64> {
        self.length.ok_or_else(|| {
            Error::InvalidInput("Content-Length is required for this driver".to_string())
        })
    }
}

/// What the gate should answer to a signed GET.
pub enum ObjectRead {
    /// Redirect the client to a backend-issued link.
    Redirect(String),
    /// Stream the bytes through the gate.
    Stream {
        body: ByteStream,
        length: u64,
        content_type: String,
        file_name: String,
    },
}

impl std::fmt::Debug for ObjectRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectRead::Redirect(url) => f.debug_tuple("Redirect").field(url).finish(),
            ObjectRead::Stream {
                length,
                content_type,
                file_name,
                ..
            } => f
                .debug_struct("Stream")
                .field("length", length)
                .field("content_type", content_type)
                .field("file_name", file_name)
                .finish_non_exhaustive(),
        }
    }
}

/// Methods a driver serves on its signed proxy endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateMethod {
    Put,
    Get,
    Delete,
}

/// Storage driver trait for the four backends.
///
/// The first five operations are the capability set consumed by the rest of
/// the system. The remaining ones are the raw I/O the transfer gate performs
/// after it has verified a signed URL; a driver only needs to implement the
/// ones it lists in [`Driver::routes`].
///
/// Every path is backend-root-relative.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Driver identifier, also the `{name}` of `/driver/{name}`.
    fn name(&self) -> &str;

    /// Connectivity self-test.
    ///
    /// # Errors
    /// - Credentials rejected
    /// - Backend unreachable
    async fn check(&self) -> Result<()>;

    /// URL a client can `PUT` the file bytes to.
    async fn pre_upload_url(&self, path: &DrivePath) -> Result<String>;

    /// URL a client can send `DELETE` to.
    async fn pre_delete_url(&self, path: &DrivePath) -> Result<String>;

    /// Download links for a file, followed by one link per mirror.
    async fn download_url(
        &self,
        path: &DrivePath,
        mirrors: &[DownloadMirror],
    ) -> Result<Vec<DownloadUrl>>;

    /// Materialize the complete tree below `path`.
    ///
    /// # Errors
    /// - `NotFound` if `path` does not exist
    /// - `NotADirectory` if `path` is a file
    async fn walk_dir(&self, path: &DrivePath) -> Result<FileNode>;

    /// Key the gate verifies this driver's signed URLs with.
    fn signing_key(&self) -> &SigningKey;

    /// Proxy endpoints this driver serves.
    fn routes(&self) -> &'static [GateMethod];

    /// Store the body at `path`, creating parent directories as needed.
    async fn put_object(
        &self,
        path: &DrivePath,
        _body: ObjectBody,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Err(Error::UnsupportedOperation(format!(
            "{} does not accept proxied uploads of {}",
            self.name(),
            path
        )))
    }

    /// Remove the file at `path`.
    async fn delete_object(&self, path: &DrivePath) -> Result<()> {
        Err(Error::UnsupportedOperation(format!(
            "{} does not accept proxied deletes of {}",
            self.name(),
            path
        )))
    }

    /// Resolve a signed GET of `path`.
    async fn read_object(&self, path: &DrivePath) -> Result<ObjectRead> {
        Err(Error::UnsupportedOperation(format!(
            "{} does not serve proxied reads of {}",
            self.name(),
            path
        )))
    }

    /// Start the proactive access-token refresh, for OAuth drivers.
    fn spawn_token_refresh(&self, _period: Duration) -> Option<JoinHandle<()>> {
        None
    }

    /// Receive rotated refresh tokens, for OAuth drivers.
    ///
    /// The current refresh token is the initial value; every rotation must be
    /// persisted by the owner of the configuration to keep access.
    fn subscribe_refresh_token(&self) -> Option<watch::Receiver<String>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_url_serialization() {
        let url = DownloadUrl {
            title: "Direct".to_string(),
            url: "https://example.com/a".to_string(),
        };
        let json = serde_json::to_value(&url).unwrap();
        assert_eq!(json["title"], "Direct");
        assert_eq!(json["downloadUrl"], "https://example.com/a");
    }

    #[test]
    fn test_mirror_links_append_path() {
        let mirrors = vec![
            DownloadMirror {
                title: "CDN".to_string(),
                url: "https://cdn.example.com/".to_string(),
            },
            DownloadMirror {
                title: "Backup".to_string(),
                url: "https://backup.example.com/files".to_string(),
            },
        ];
        let path = DrivePath::parse("/docs/a.pdf").unwrap();
        let urls = with_mirrors(Vec::new(), &path, &mirrors);

        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0].url, "https://cdn.example.com/docs/a.pdf");
        assert_eq!(urls[1].title, "Backup");
        assert_eq!(urls[1].url, "https://backup.example.com/files/docs/a.pdf");
    }

    #[test]
    fn test_required_length() {
        let body = ObjectBody::new(Box::pin(tokio::io::empty()), None);
        assert!(matches!(body.required_length(), Err(Error::InvalidInput(_))));
        let body = ObjectBody::new(Box::pin(tokio::io::empty()), Some(0));
        assert_eq!(body.required_length().unwrap(), 0);
    }
}
