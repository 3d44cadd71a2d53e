//! Cloud drive API client.

use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

use driveshare_common::{Error, Result};

use super::auth::ApiError;
use crate::token::TokenManager;

/// Default API base URL.
pub const DEFAULT_API_BASE: &str = "https://api.aliyundrive.com";

/// Page size of folder listings.
const LIST_LIMIT: u32 = 200;

/// Validity of download links issued by the service, in seconds.
const LINK_EXPIRE_SECS: u64 = 14400;

/// File or folder metadata from the API.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudFile {
    pub file_id: String,
    pub name: String,
    /// `"folder"` or `"file"`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub size: u64,
}

impl CloudFile {
    /// Folder placeholder for a known folder id.
    pub fn folder(file_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            name: name.into(),
            kind: "folder".to_string(),
            size: 0,
        }
    }

    /// Check if this is a folder.
    pub fn is_folder(&self) -> bool {
        self.kind == "folder"
    }
}

#[derive(Debug, Deserialize)]
struct FileList {
    items: Vec<CloudFile>,
    #[serde(default)]
    next_marker: String,
}

#[derive(Debug, Deserialize)]
struct CreatedFolder {
    file_id: String,
    #[serde(default)]
    file_name: String,
}

#[derive(Debug, Deserialize)]
struct PartInfo {
    upload_url: String,
}

/// A pre-registered multi-part upload.
#[derive(Debug, Deserialize)]
pub struct UploadSession {
    pub file_id: String,
    pub upload_id: String,
    #[serde(default)]
    part_info_list: Vec<PartInfo>,
}

impl UploadSession {
    /// Backend-issued URL of each part, in order.
    pub fn part_urls(&self) -> Vec<String> {
        self.part_info_list
            .iter()
            .map(|p| p.upload_url.clone())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct Completed {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct DownloadLink {
    url: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    default_drive_id: String,
}

/// Cloud drive API client.
///
/// Every authenticated call goes through the token manager, which replays it
/// once if the service reports `AccessTokenInvalid`.
pub struct CloudClient {
    http: Client,
    api_base: String,
    tokens: Arc<TokenManager>,
    drive_id: OnceCell<String>,
}

impl CloudClient {
    /// Create a new client.
    ///
    /// `drive_id` skips the discovery call when the drive is known.
    pub fn new(
        http: Client,
        api_base: impl Into<String>,
        tokens: Arc<TokenManager>,
        drive_id: Option<String>,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            tokens,
            drive_id: drive_id.map(OnceCell::from).unwrap_or_default(),
        }
    }

    /// The drive all file ids belong to, discovered from the user profile.
    pub async fn drive_id(&self) -> Result<String> {
        self.drive_id
            .get_or_try_init(|| async {
                let user: UserInfo = self.post("/v2/user/get", &json!({})).await?;
                debug!("Using drive {}", user.default_drive_id);
                Ok::<_, Error>(user.default_drive_id)
            })
            .await
            .cloned()
    }

    /// List all children of a folder, following the page marker.
    pub async fn list_folder(&self, parent_id: &str) -> Result<Vec<CloudFile>> {
        let drive_id = self.drive_id().await?;
        let mut files = Vec::new();
        let mut marker = String::new();

        loop {
            let page: FileList = self
                .post(
                    "/v2/file/list",
                    &json!({
                        "drive_id": drive_id,
                        "parent_file_id": parent_id,
                        "limit": LIST_LIMIT,
                        "marker": marker,
                        "order_by": "name",
                        "order_direction": "ASC",
                        "fields": "*",
                    }),
                )
                .await?;
            files.extend(page.items);

            if page.next_marker.is_empty() {
                break;
            }
            marker = page.next_marker;
        }

        debug!("Listed folder {}: {} items", parent_id, files.len());
        Ok(files)
    }

    /// Create a folder, refusing to rename on a name clash.
    pub async fn create_folder(&self, parent_id: &str, name: &str) -> Result<CloudFile> {
        let drive_id = self.drive_id().await?;
        let created: CreatedFolder = self
            .post(
                "/adrive/v2/file/createWithFolders",
                &json!({
                    "check_name_mode": "refuse",
                    "drive_id": drive_id,
                    "name": name,
                    "parent_file_id": parent_id,
                    "type": "folder",
                }),
            )
            .await?;

        if created.file_name != name {
            return Err(Error::RemoteUnavailable(format!(
                "Folder {} was created as {:?}",
                name, created.file_name
            )));
        }
        Ok(CloudFile::folder(created.file_id, name))
    }

    /// Pre-register a multi-part upload of `size` bytes in `parts` parts.
    pub async fn create_upload(
        &self,
        parent_id: &str,
        name: &str,
        size: u64,
        parts: usize,
    ) -> Result<UploadSession> {
        let drive_id = self.drive_id().await?;
        let part_info_list: Vec<Value> = (1..=parts)
            .map(|n| json!({ "part_number": n }))
            .collect();
        self.post(
            "/adrive/v2/file/createWithFolders",
            &json!({
                "check_name_mode": "auto_rename",
                "content_hash_name": "none",
                "drive_id": drive_id,
                "name": name,
                "parent_file_id": parent_id,
                "part_info_list": part_info_list,
                "proof_version": "v1",
                "size": size,
                "type": "file",
            }),
        )
        .await
    }

    /// PUT one part to its backend-issued URL.
    ///
    /// Part URLs are presigned, so no access token is sent. Returns the
    /// response status; transport failures are transient.
    pub async fn put_part(&self, url: &str, data: Bytes) -> Result<StatusCode> {
        let response = self
            .http
            .put(url)
            .body(data)
            .send()
            .await
            .map_err(|e| Error::RemoteUnavailable(format!("Part upload failed: {}", e)))?;
        Ok(response.status())
    }

    /// Finalize an upload and return the id of the stored file.
    pub async fn complete(&self, file_id: &str, upload_id: &str) -> Result<String> {
        let drive_id = self.drive_id().await?;
        let completed: Completed = self
            .post(
                "/v2/file/complete",
                &json!({
                    "drive_id": drive_id,
                    "file_id": file_id,
                    "upload_id": upload_id,
                }),
            )
            .await?;
        Ok(completed.file_id)
    }

    /// Move a file or folder to the recycle bin.
    pub async fn trash(&self, file_id: &str) -> Result<()> {
        let drive_id = self.drive_id().await?;
        self.send(
            "/v2/recyclebin/trash",
            &json!({
                "drive_id": drive_id,
                "file_id": file_id,
            }),
        )
        .await?;
        Ok(())
    }

    /// Temporary direct download link of a file.
    pub async fn download_link(&self, file_id: &str) -> Result<String> {
        let drive_id = self.drive_id().await?;
        let link: DownloadLink = self
            .post(
                "/v2/file/get_download_url",
                &json!({
                    "drive_id": drive_id,
                    "file_id": file_id,
                    "expire_sec": LINK_EXPIRE_SECS,
                }),
            )
            .await?;
        Ok(link.url)
    }

    async fn post<T: DeserializeOwned>(&self, endpoint: &str, body: &Value) -> Result<T> {
        let response = self.send(endpoint, body).await?;
        response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse {} response: {}", endpoint, e)))
    }

    async fn send(&self, endpoint: &str, body: &Value) -> Result<Response> {
        let url = format!("{}{}", self.api_base, endpoint);
        self.tokens
            .with_auth_retry(|token| {
                let request = self.http.post(&url).bearer_auth(token).json(body);
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

/// Classify a non-2xx response.
async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let error: ApiError = serde_json::from_str(&body).unwrap_or_default();
    let detail = if error.message.is_empty() {
        format!("{} {}", status, body)
    } else {
        format!("{}: {}", error.code, error.message)
    };

    Err(match (status, error.code.as_str()) {
        (_, "AccessTokenInvalid") | (_, "AccessTokenExpired") | (StatusCode::UNAUTHORIZED, _) => {
            Error::AuthExpired(detail)
        }
        (StatusCode::NOT_FOUND, _) => Error::NotFound(detail),
        (_, code) if code.starts_with("NotFound") => Error::NotFound(detail),
        (StatusCode::FORBIDDEN, _) => Error::PermissionDenied(detail),
        (StatusCode::CONFLICT, _) => Error::AlreadyExists(detail),
        (_, code) if code.starts_with("AlreadyExist") => Error::AlreadyExists(detail),
        _ => Error::RemoteUnavailable(detail),
    })
}
