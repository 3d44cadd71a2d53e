//! Local filesystem storage driver.

use async_trait::async_trait;
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driveshare_common::{
    DrivePath, Error, Result, SignedUrl, SigningKey, DOWNLOAD_TTL, WRITE_TTL,
};

use crate::driver::{
    with_mirrors, DownloadMirror, DownloadUrl, Driver, GateMethod, ObjectBody, ObjectRead,
};
use crate::schema::{DriverSchema, PropType, PropertySchema};
use crate::transfer::cancellable;
use crate::tree::{FileNode, TreeBuilder};

const DRIVER_NAME: &str = "local";

/// Configuration of the local filesystem driver.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Root directory served by this driver.
    pub path: PathBuf,
    /// Signing key of the gate URLs.
    pub key: String,
    /// Externally reachable base URL of the gate's route group.
    pub host: String,
    /// Offer a signed gate link among the download URLs.
    #[serde(default)]
    pub self_download: bool,
}

/// Configuration schema of the local filesystem driver.
pub fn schema() -> DriverSchema {
    DriverSchema {
        kind: DRIVER_NAME,
        display_name: "Local disk",
        properties: vec![
            PropertySchema::required("path", PropType::String, "Root directory"),
            PropertySchema::required("key", PropType::String, "Signing key"),
            PropertySchema::required("host", PropType::String, "Public base URL")
                .with_usage("Gate URLs are {host}/driver/local"),
            PropertySchema::optional("self_download", PropType::Boolean, "Serve downloads")
                .with_usage("Offer a signed link served by this host"),
        ],
    }
}

/// Local filesystem storage driver.
///
/// Uploads, deletes and downloads go through the transfer gate, which calls
/// back into the raw I/O below once the signed URL checks out.
pub struct LocalFs {
    root: PathBuf,
    key: SigningKey,
    gate_url: String,
    self_download: bool,
}

impl LocalFs {
    /// Create a new local driver.
    ///
    /// # Preconditions
    /// - `config.path` must be a valid directory path
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Empty signing key
    /// - Root cannot be created
    pub fn new(config: LocalConfig) -> Result<Self> {
        let key = SigningKey::new(config.key)?;
        if !config.path.exists() {
            std::fs::create_dir_all(&config.path)?;
        }
        Ok(Self {
            root: config.path,
            key,
            gate_url: format!("{}/driver/{}", config.host.trim_end_matches('/'), DRIVER_NAME),
            self_download: config.self_download,
        })
    }

    /// Create from an untyped configuration map.
    pub fn from_value(config: Value) -> Result<Self> {
        let config: LocalConfig = serde_json::from_value(config)
            .map_err(|e| Error::InvalidInput(format!("Invalid local driver config: {}", e)))?;
        Self::new(config)
    }

    /// Convert a DrivePath to a filesystem path.
    fn to_fs_path(&self, path: &DrivePath) -> PathBuf {
        let mut fs_path = self.root.clone();
        for component in path.components() {
            fs_path.push(component);
        }
        fs_path
    }

    /// Map a filesystem path below the root back to a DrivePath.
    fn to_drive_path(&self, fs_path: &Path) -> Result<DrivePath> {
        let relative = fs_path.strip_prefix(&self.root).map_err(|_| {
            Error::InvalidInput(format!("{} is outside of {}", fs_path.display(), self.root.display()))
        })?;
        let components = relative
            .components()
            .map(|c| {
                c.as_os_str().to_str().map(String::from).ok_or_else(|| {
                    Error::InvalidInput(format!("Non UTF-8 file name: {}", fs_path.display()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        DrivePath::from_components(components)
    }

    /// Fail if any ancestor of `path` exists as a file.
    async fn check_parent_chain(&self, path: &DrivePath) -> Result<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        for prefix in parent.prefixes() {
            match fs::metadata(self.to_fs_path(&prefix)).await {
                Ok(meta) if !meta.is_dir() => {
                    return Err(Error::ConflictNotADirectory(prefix.to_string_path()));
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(map_io(e, &prefix)),
            }
        }
        Ok(())
    }
}

fn map_io(e: std::io::Error, path: &DrivePath) -> Error {
    match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(path.to_string_path()),
        std::io::ErrorKind::PermissionDenied => Error::PermissionDenied(path.to_string_path()),
        _ => Error::Io(e),
    }
}

#[async_trait]
impl Driver for LocalFs {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn check(&self) -> Result<()> {
        let meta = fs::metadata(&self.root).await?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(self.root.display().to_string()));
        }
        let probe = self.root.join(format!(".driveshare-check-{}", std::process::id()));
        fs::write(&probe, b"check").await?;
        fs::remove_file(&probe).await?;
        debug!("Local driver check passed for {}", self.root.display());
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
        let mut urls = Vec::new();
        if self.self_download {
            urls.push(DownloadUrl {
                title: "Direct".to_string(),
                url: SignedUrl::sign(&self.key, &self.gate_url, path, DOWNLOAD_TTL)?,
            });
        }
        Ok(with_mirrors(urls, path, mirrors))
    }

    async fn walk_dir(&self, path: &DrivePath) -> Result<FileNode> {
        let base = self.to_fs_path(path);
        let meta = fs::metadata(&base).await.map_err(|e| map_io(e, path))?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(path.to_string_path()));
        }

        let mut builder = TreeBuilder::new(path.clone());
        let mut pending = vec![base];
        while let Some(dir) = pending.pop() {
            let mut entries = Vec::new();
            let mut read_dir = fs::read_dir(&dir).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                entries.push(entry);
            }
            entries.sort_by_key(|e| e.file_name());

            let mut subdirs = Vec::new();
            for entry in entries {
                let fs_path = entry.path();
                let drive_path = match self.to_drive_path(&fs_path) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Skipping {}: {}", fs_path.display(), e);
                        continue;
                    }
                };
                let meta = entry.metadata().await?;
                builder.insert(drive_path, meta.is_dir(), meta.len())?;
                if meta.is_dir() {
                    subdirs.push(fs_path);
                }
            }
            pending.extend(subdirs.into_iter().rev());
        }

        let tree = builder.build();
        debug!("Walked {}: {} entries", path, tree.descendant_count());
        Ok(tree)
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
        mut body: ObjectBody,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot upload to the root".to_string()));
        }
        self.check_parent_chain(path).await?;

        let fs_path = self.to_fs_path(path);
        if let Some(parent) = fs_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| map_io(e, path))?;
        }
        if fs::metadata(&fs_path).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(Error::AlreadyExists(format!(
                "A directory exists at {}",
                path
            )));
        }

        let mut file = fs::File::create(&fs_path).await.map_err(|e| map_io(e, path))?;
        let copied = cancellable(cancel, async {
            tokio::io::copy(&mut body.reader, &mut file)
                .await
                .map_err(Error::Io)
        })
        .await;

        match copied {
            Ok(bytes) => {
                info!("Stored {} ({} bytes)", path, bytes);
                Ok(())
            }
            Err(e) => {
                drop(file);
                if let Err(cleanup) = fs::remove_file(&fs_path).await {
                    warn!("Failed to remove partial upload {}: {}", path, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn delete_object(&self, path: &DrivePath) -> Result<()> {
        if path.is_root() {
            return Err(Error::PermissionDenied("Cannot delete the root".to_string()));
        }
        let fs_path = self.to_fs_path(path);
        let meta = fs::metadata(&fs_path).await.map_err(|e| map_io(e, path))?;

        if meta.is_dir() {
            let mut entries = fs::read_dir(&fs_path).await?;
            if entries.next_entry().await?.is_some() {
                return Err(Error::NotEmptyDirectory(path.to_string_path()));
            }
            fs::remove_dir(&fs_path).await.map_err(|e| map_io(e, path))?;
        } else {
            fs::remove_file(&fs_path).await.map_err(|e| map_io(e, path))?;
        }
        info!("Deleted {}", path);
        Ok(())
    }

    async fn read_object(&self, path: &DrivePath) -> Result<ObjectRead> {
        let fs_path = self.to_fs_path(path);
        let file = fs::File::open(&fs_path).await.map_err(|e| map_io(e, path))?;
        let meta = file.metadata().await?;
        if meta.is_dir() {
            return Err(Error::InvalidInput(format!("{} is a directory", path)));
        }

        let file_name = path.display_name().to_string();
        let content_type = mime_guess::from_path(&file_name)
            .first_or_octet_stream()
            .to_string();
        let body = ReaderStream::new(file).map_err(Error::Io);

        Ok(ObjectRead::Stream {
            body: Box::pin(body),
            length: meta.len(),
            content_type,
            file_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::TempDir;

    fn driver(temp: &TempDir, self_download: bool) -> LocalFs {
        LocalFs::new(LocalConfig {
            path: temp.path().to_path_buf(),
            key: "local-key".to_string(),
            host: "https://share.example.com/api/".to_string(),
            self_download,
        })
        .unwrap()
    }

    fn path(p: &str) -> DrivePath {
        DrivePath::parse(p).unwrap()
    }

    fn body(data: &'static [u8]) -> ObjectBody {
        ObjectBody::new(Box::pin(data), Some(data.len() as u64))
    }

    #[tokio::test]
    async fn test_walk_dir_shape() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("a")).unwrap();
        std::fs::write(temp.path().join("a/b.txt"), [0u8; 10]).unwrap();
        std::fs::write(temp.path().join("c.txt"), [0u8; 5]).unwrap();

        let tree = driver(&temp, false).walk_dir(&DrivePath::root()).await.unwrap();

        assert_eq!(tree.absolute_path, DrivePath::root());
        assert_eq!(tree.children.len(), 2);
        let a = tree.child("a").unwrap();
        assert!(a.is_directory);
        assert_eq!(a.size, None);
        assert_eq!(a.children.len(), 1);
        assert_eq!(a.children[0].absolute_path, path("/a/b.txt"));
        assert_eq!(a.children[0].size, Some(10));
        assert_eq!(tree.child("c.txt").unwrap().size, Some(5));
    }

    #[tokio::test]
    async fn test_walk_dir_subtree_and_errors() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("x/y")).unwrap();
        std::fs::write(temp.path().join("x/y/z.bin"), b"zz").unwrap();
        let driver = driver(&temp, false);

        let tree = driver.walk_dir(&path("/x")).await.unwrap();
        assert_eq!(tree.name, "x");
        let y = tree.child("y").unwrap();
        assert_eq!(y.child("z.bin").unwrap().absolute_path, path("/x/y/z.bin"));

        assert!(matches!(
            driver.walk_dir(&path("/missing")).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            driver.walk_dir(&path("/x/y/z.bin")).await,
            Err(Error::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_put_creates_parents() {
        let temp = TempDir::new().unwrap();
        let driver = driver(&temp, false);

        driver
            .put_object(&path("/deep/er/file.txt"), body(b"hello"), &CancellationToken::new())
            .await
            .unwrap();

        let stored = std::fs::read(temp.path().join("deep/er/file.txt")).unwrap();
        assert_eq!(stored, b"hello");
    }

    #[tokio::test]
    async fn test_put_under_file_conflicts() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("blocker"), b"x").unwrap();
        let driver = driver(&temp, false);

        let result = driver
            .put_object(&path("/blocker/child.txt"), body(b"data"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::ConflictNotADirectory(_))));
    }

    #[tokio::test]
    async fn test_cancelled_put_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let driver = driver(&temp, false);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = driver.put_object(&path("/f.txt"), body(b"data"), &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!temp.path().join("f.txt").exists());
    }

    #[tokio::test]
    async fn test_delete() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("dir")).unwrap();
        std::fs::write(temp.path().join("dir/f.txt"), b"x").unwrap();
        let driver = driver(&temp, false);

        assert!(matches!(
            driver.delete_object(&path("/dir")).await,
            Err(Error::NotEmptyDirectory(_))
        ));
        driver.delete_object(&path("/dir/f.txt")).await.unwrap();
        driver.delete_object(&path("/dir")).await.unwrap();
        assert!(!temp.path().join("dir").exists());
        assert!(matches!(
            driver.delete_object(&path("/dir")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_read_object_streams_with_mime() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("page.html"), b"<html></html>").unwrap();
        let driver = driver(&temp, false);

        match driver.read_object(&path("/page.html")).await.unwrap() {
            ObjectRead::Stream {
                mut body,
                length,
                content_type,
                file_name,
            } => {
                assert_eq!(length, 13);
                assert_eq!(content_type, "text/html");
                assert_eq!(file_name, "page.html");
                let mut data = Vec::new();
                while let Some(chunk) = body.next().await {
                    data.extend_from_slice(&chunk.unwrap());
                }
                assert_eq!(data, b"<html></html>");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_signed_urls_verify() {
        let temp = TempDir::new().unwrap();
        let driver = driver(&temp, false);
        let url = driver.pre_upload_url(&path("/docs/a b.txt")).await.unwrap();

        assert!(url.starts_with("https://share.example.com/api/driver/local?path=/docs/a%20b.txt&expireTime="));
        let parsed = url::Url::parse(&url).unwrap();
        let query: std::collections::HashMap<String, String> =
            parsed.query_pairs().into_owned().collect();
        let token = SignedUrl::from_query(&query).unwrap();
        assert_eq!(token.verify(driver.signing_key()).unwrap(), path("/docs/a b.txt"));
    }

    #[tokio::test]
    async fn test_download_urls() {
        let temp = TempDir::new().unwrap();
        let mirrors = vec![DownloadMirror {
            title: "CDN".to_string(),
            url: "https://cdn.example.com".to_string(),
        }];

        let urls = driver(&temp, false)
            .download_url(&path("/a.txt"), &mirrors)
            .await
            .unwrap();
        assert_eq!(urls.len(), 1);
        assert_eq!(urls[0].url, "https://cdn.example.com/a.txt");

        let urls = driver(&temp, true)
            .download_url(&path("/a.txt"), &mirrors)
            .await
            .unwrap();
        assert_eq!(urls.len(), 2);
        assert!(urls[0].url.contains("/driver/local?path=/a.txt"));
    }

    #[tokio::test]
    async fn test_check() {
        let temp = TempDir::new().unwrap();
        driver(&temp, false).check().await.unwrap();
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_from_value() {
        let temp = TempDir::new().unwrap();
        let driver = LocalFs::from_value(serde_json::json!({
            "path": temp.path(),
            "key": "k",
            "host": "http://localhost:8080"
        }))
        .unwrap();
        assert!(!driver.self_download);
        assert!(LocalFs::from_value(serde_json::json!({ "path": "/tmp" })).is_err());
    }
}
