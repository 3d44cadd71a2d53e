//! Cloud drive driver against a mock API server.

mod common;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use common::{bearer, bind, body, payload, serve, MIB};
use driveshare_common::{DrivePath, Error};
use driveshare_storage::{CloudDrive, Driver, ObjectRead, RetryConfig};

const PAGE_SIZE: usize = 2;

#[derive(Clone)]
struct Item {
    file_id: String,
    name: String,
    kind: &'static str,
    size: u64,
    parent: String,
}

struct Pending {
    file_id: String,
    name: String,
    parent: String,
    size: u64,
}

#[derive(Default)]
struct MockState {
    next_id: usize,
    items: Vec<Item>,
    valid_token: Option<String>,
    token_calls: usize,
    list_calls: usize,
    uploads: HashMap<String, Pending>,
    part_attempts: HashMap<usize, usize>,
    part_failures: HashMap<usize, usize>,
    complete_calls: usize,
}

struct CloudMock {
    base: String,
    state: Mutex<MockState>,
}

impl CloudMock {
    fn add(&self, parent: &str, name: &str, kind: &'static str, size: u64) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let file_id = format!("f{}", state.next_id);
        state.items.push(Item {
            file_id: file_id.clone(),
            name: name.to_string(),
            kind,
            size,
            parent: parent.to_string(),
        });
        file_id
    }

    fn folder(&self, parent: &str, name: &str) -> String {
        self.add(parent, name, "folder", 0)
    }

    fn file(&self, parent: &str, name: &str, size: u64) -> String {
        self.add(parent, name, "file", size)
    }

    /// Reject the current access token until the next refresh.
    fn revoke(&self) {
        self.state.lock().unwrap().valid_token = None;
    }

    fn fail_part(&self, part: usize, times: usize) {
        self.state.lock().unwrap().part_failures.insert(part, times);
    }

    fn with_state<T>(&self, f: impl FnOnce(&MockState) -> T) -> T {
        f(&self.state.lock().unwrap())
    }
}

fn api_error(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "code": code, "message": code }))).into_response()
}

fn authorize(mock: &CloudMock, headers: &HeaderMap) -> Option<Response> {
    let state = mock.state.lock().unwrap();
    match (bearer(headers), state.valid_token.as_ref()) {
        (Some(token), Some(valid)) if &token == valid => None,
        _ => Some(api_error(StatusCode::UNAUTHORIZED, "AccessTokenInvalid")),
    }
}

async fn token(State(mock): State<Arc<CloudMock>>, Json(body): Json<Value>) -> Response {
    assert_eq!(body["grant_type"], "refresh_token");
    let mut state = mock.state.lock().unwrap();
    state.token_calls += 1;
    let n = state.token_calls;
    if body["refresh_token"] != format!("r{}", n - 1) {
        return api_error(StatusCode::BAD_REQUEST, "InvalidParameter.RefreshToken");
    }
    let access = format!("a{}", n);
    state.valid_token = Some(access.clone());
    Json(json!({
        "access_token": access,
        "refresh_token": format!("r{}", n),
        "expires_in": 7200,
    }))
    .into_response()
}

async fn user_get(State(mock): State<Arc<CloudMock>>, headers: HeaderMap) -> Response {
    if let Some(denied) = authorize(&mock, &headers) {
        return denied;
    }
    Json(json!({ "default_drive_id": "d1" })).into_response()
}

async fn file_list(
    State(mock): State<Arc<CloudMock>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(denied) = authorize(&mock, &headers) {
        return denied;
    }
    assert_eq!(body["drive_id"], "d1");
    let parent = body["parent_file_id"].as_str().unwrap_or_default().to_string();
    let start: usize = body["marker"].as_str().unwrap_or_default().parse().unwrap_or(0);

    let mut state = mock.state.lock().unwrap();
    state.list_calls += 1;
    let mut children: Vec<&Item> = state.items.iter().filter(|i| i.parent == parent).collect();
    children.sort_by(|a, b| a.name.cmp(&b.name));

    let page: Vec<Value> = children
        .iter()
        .skip(start)
        .take(PAGE_SIZE)
        .map(|i| {
            json!({
                "file_id": i.file_id,
                "name": i.name,
                "type": i.kind,
                "size": i.size,
                "parent_file_id": i.parent,
            })
        })
        .collect();
    let next = if start + PAGE_SIZE < children.len() {
        (start + PAGE_SIZE).to_string()
    } else {
        String::new()
    };
    Json(json!({ "items": page, "next_marker": next })).into_response()
}

async fn create(
    State(mock): State<Arc<CloudMock>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(denied) = authorize(&mock, &headers) {
        return denied;
    }
    let parent = body["parent_file_id"].as_str().unwrap_or_default().to_string();
    let name = body["name"].as_str().unwrap_or_default().to_string();

    if body["type"] == "folder" {
        assert_eq!(body["check_name_mode"], "refuse");
        let exists = mock.with_state(|s| {
            s.items.iter().any(|i| i.parent == parent && i.name == name)
        });
        if exists {
            return api_error(StatusCode::CONFLICT, "AlreadyExist.File");
        }
        let file_id = mock.folder(&parent, &name);
        return Json(json!({ "file_id": file_id, "file_name": name })).into_response();
    }

    assert_eq!(body["check_name_mode"], "auto_rename");
    let parts = body["part_info_list"].as_array().map(Vec::len).unwrap_or(0);
    let mut state = mock.state.lock().unwrap();
    state.next_id += 1;
    let file_id = format!("f{}", state.next_id);
    let upload_id = format!("u{}", state.next_id);
    state.uploads.insert(
        upload_id.clone(),
        Pending {
            file_id: file_id.clone(),
            name,
            parent,
            size: body["size"].as_u64().unwrap_or(0),
        },
    );
    let part_info_list: Vec<Value> = (1..=parts)
        .map(|n| json!({ "part_number": n, "upload_url": format!("{}/part/{}/{}", mock.base, upload_id, n) }))
        .collect();
    Json(json!({
        "file_id": file_id,
        "upload_id": upload_id,
        "part_info_list": part_info_list,
    }))
    .into_response()
}

async fn put_part(
    State(mock): State<Arc<CloudMock>>,
    Path((_upload_id, part)): Path<(String, usize)>,
    headers: HeaderMap,
    data: Bytes,
) -> StatusCode {
    assert!(bearer(&headers).is_none(), "part URLs are presigned");
    let mut state = mock.state.lock().unwrap();
    *state.part_attempts.entry(part).or_default() += 1;
    if let Some(remaining) = state.part_failures.get_mut(&part) {
        if *remaining > 0 {
            *remaining -= 1;
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    }
    assert!(data.len() as u64 <= 10 * MIB);
    StatusCode::OK
}

async fn complete(
    State(mock): State<Arc<CloudMock>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(denied) = authorize(&mock, &headers) {
        return denied;
    }
    let upload_id = body["upload_id"].as_str().unwrap_or_default();
    let mut state = mock.state.lock().unwrap();
    state.complete_calls += 1;
    let Some(pending) = state.uploads.remove(upload_id) else {
        return api_error(StatusCode::NOT_FOUND, "NotFound.UploadId");
    };
    assert_eq!(body["file_id"], pending.file_id.as_str());
    state.items.push(Item {
        file_id: pending.file_id.clone(),
        name: pending.name,
        kind: "file",
        size: pending.size,
        parent: pending.parent,
    });
    Json(json!({ "file_id": pending.file_id })).into_response()
}

async fn trash(
    State(mock): State<Arc<CloudMock>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(denied) = authorize(&mock, &headers) {
        return denied;
    }
    let file_id = body["file_id"].as_str().unwrap_or_default();
    let mut state = mock.state.lock().unwrap();
    let before = state.items.len();
    state.items.retain(|i| i.file_id != file_id);
    if state.items.len() == before {
        return api_error(StatusCode::NOT_FOUND, "NotFound.File");
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn download_url(
    State(mock): State<Arc<CloudMock>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(denied) = authorize(&mock, &headers) {
        return denied;
    }
    assert_eq!(body["expire_sec"], 14400);
    let file_id = body["file_id"].as_str().unwrap_or_default();
    Json(json!({ "url": format!("https://dl.example.com/{}", file_id) })).into_response()
}

/// Start a mock seeded with `{a/, a/b.txt (10), c.txt (5)}`.
async fn start() -> (Arc<CloudMock>, CloudDrive) {
    let (listener, base) = bind().await;
    let mock = Arc::new(CloudMock {
        base: base.clone(),
        state: Mutex::new(MockState::default()),
    });
    let a = mock.folder("root", "a");
    mock.file(&a, "b.txt", 10);
    mock.file("root", "c.txt", 5);

    let router = Router::new()
        .route("/token", post(token))
        .route("/v2/user/get", post(user_get))
        .route("/v2/file/list", post(file_list))
        .route("/adrive/v2/file/createWithFolders", post(create))
        .route("/part/{upload_id}/{part}", put(put_part))
        .route("/v2/file/complete", post(complete))
        .route("/v2/recyclebin/trash", post(trash))
        .route("/v2/file/get_download_url", post(download_url))
        .layer(DefaultBodyLimit::disable())
        .with_state(mock.clone());
    serve(listener, router);

    let drive = CloudDrive::from_value(json!({
        "refresh_token": "r0",
        "key": "k",
        "host": "http://gate.test",
        "api_base": base,
        "auth_url": format!("{}/token", base),
    }))
    .unwrap()
    .with_retry(RetryConfig::immediate(5));
    (mock, drive)
}

fn path(p: &str) -> DrivePath {
    DrivePath::parse(p).unwrap()
}

fn names(files: &[driveshare_storage::cloud::CloudFile]) -> Vec<String> {
    files.iter().map(|f| f.name.clone()).collect()
}

#[tokio::test]
async fn test_walk_dir() {
    let (_mock, drive) = start().await;
    let tree = drive.walk_dir(&DrivePath::root()).await.unwrap();

    assert!(tree.is_directory);
    assert_eq!(tree.children.len(), 2);
    let a = tree.child("a").unwrap();
    assert!(a.is_directory);
    assert_eq!(a.children.len(), 1);
    assert_eq!(a.child("b.txt").unwrap().size, Some(10));
    assert_eq!(tree.child("c.txt").unwrap().size, Some(5));
}

#[tokio::test]
async fn test_walk_dir_errors() {
    let (_mock, drive) = start().await;
    assert!(matches!(
        drive.walk_dir(&path("/missing")).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        drive.walk_dir(&path("/c.txt")).await,
        Err(Error::NotADirectory(_))
    ));
}

#[tokio::test]
async fn test_listing_follows_marker() {
    let (mock, drive) = start().await;
    let docs = mock.folder("root", "docs");
    for n in 0..5 {
        mock.file(&docs, &format!("{}.txt", n), n);
    }

    let files = drive.files(&path("/docs")).await.unwrap();
    assert_eq!(files.len(), 5);
    // Root fits in two pages, docs needs three.
    assert_eq!(mock.with_state(|s| s.list_calls), 5);

    // Served from the cache the second time.
    drive.files(&path("/docs")).await.unwrap();
    assert_eq!(mock.with_state(|s| s.list_calls), 5);
}

#[tokio::test]
async fn test_chunked_upload_recovers_failed_part() {
    let (mock, drive) = start().await;
    mock.fail_part(2, 4);

    let data = payload(25 * MIB);
    drive
        .upload(&path("/big.bin"), body(data), &CancellationToken::new())
        .await
        .unwrap();

    mock.with_state(|s| {
        assert_eq!(s.part_attempts.len(), 3);
        assert_eq!(s.part_attempts[&1], 1);
        assert_eq!(s.part_attempts[&2], 5);
        assert_eq!(s.part_attempts[&3], 1);
        assert_eq!(s.complete_calls, 1);
    });
}

#[tokio::test]
async fn test_exhausted_part_never_completes() {
    let (mock, drive) = start().await;
    mock.fail_part(2, 6);

    let result = drive
        .upload(&path("/big.bin"), body(payload(25 * MIB)), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::TransferFailed(_))));
    mock.with_state(|s| {
        assert_eq!(s.part_attempts[&2], 5);
        assert!(!s.part_attempts.contains_key(&3));
        assert_eq!(s.complete_calls, 0);
    });
    let root = drive.files(&DrivePath::root()).await.unwrap();
    assert!(!names(&root).contains(&"big.bin".to_string()));
}

#[tokio::test]
async fn test_cancelled_upload_touches_nothing_remote() {
    let (mock, drive) = start().await;
    let items_before = mock.with_state(|s| s.items.len());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = drive
        .upload(&path("/x/y/new.txt"), body(payload(7)), &cancel)
        .await;

    assert!(matches!(result, Err(Error::Cancelled)));
    mock.with_state(|s| {
        assert_eq!(s.items.len(), items_before);
        assert!(s.uploads.is_empty());
        assert!(s.part_attempts.is_empty());
        assert_eq!(s.complete_calls, 0);
    });
}

#[tokio::test]
async fn test_listing_not_stale_after_upload() {
    let (mock, drive) = start().await;
    let docs = mock.folder("root", "docs");
    mock.file(&docs, "old.txt", 3);

    assert_eq!(names(&drive.files(&path("/docs")).await.unwrap()), vec!["old.txt"]);

    drive
        .upload(&path("/docs/new.txt"), body(payload(100)), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        names(&drive.files(&path("/docs")).await.unwrap()),
        vec!["new.txt", "old.txt"]
    );
}

#[tokio::test]
async fn test_upload_creates_missing_folders() {
    let (_mock, drive) = start().await;
    drive
        .upload(&path("/x/y/z.txt"), body(payload(7)), &CancellationToken::new())
        .await
        .unwrap();

    let tree = drive.walk_dir(&path("/x")).await.unwrap();
    let y = tree.child("y").unwrap();
    assert!(y.is_directory);
    assert_eq!(y.child("z.txt").unwrap().size, Some(7));

    // Creating an existing folder again is a no-op.
    let again = drive.make_dir(&path("/x/y")).await.unwrap();
    assert!(again.is_folder());
}

#[tokio::test]
async fn test_upload_below_file_conflicts() {
    let (_mock, drive) = start().await;
    let result = drive
        .upload(&path("/c.txt/d.txt"), body(payload(1)), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(Error::ConflictNotADirectory(_))));
}

#[tokio::test]
async fn test_delete_invalidates_listing() {
    let (mock, drive) = start().await;
    assert!(names(&drive.files(&DrivePath::root()).await.unwrap()).contains(&"c.txt".to_string()));

    drive.delete_object(&path("/c.txt")).await.unwrap();
    assert_eq!(names(&drive.files(&DrivePath::root()).await.unwrap()), vec!["a"]);

    assert!(matches!(
        drive.delete_object(&path("/c.txt")).await,
        Err(Error::NotFound(_))
    ));
    assert_eq!(mock.with_state(|s| s.items.len()), 2);
}

#[tokio::test]
async fn test_failed_delete_keeps_listing() {
    let (mock, drive) = start().await;
    drive.files(&DrivePath::root()).await.unwrap();
    let calls = mock.with_state(|s| s.list_calls);

    // Gone remotely but still cached: the trash call fails.
    mock.state.lock().unwrap().items.retain(|i| i.name != "c.txt");
    assert!(matches!(
        drive.delete_object(&path("/c.txt")).await,
        Err(Error::NotFound(_))
    ));

    drive.files(&DrivePath::root()).await.unwrap();
    assert_eq!(mock.with_state(|s| s.list_calls), calls);
}

#[tokio::test]
async fn test_rejected_token_refreshed_and_replayed() {
    let (mock, drive) = start().await;
    let mut rotations = drive.subscribe_refresh_token().unwrap();

    drive.check().await.unwrap();
    assert_eq!(mock.with_state(|s| s.token_calls), 1);
    assert_eq!(drive.status().await.to_string(), "work");

    mock.revoke();
    drive.files(&path("/a")).await.unwrap();
    assert_eq!(mock.with_state(|s| s.token_calls), 2);

    rotations.changed().await.unwrap();
    assert_eq!(*rotations.borrow(), "r2");
}

#[tokio::test]
async fn test_concurrent_rejections_refresh_once() {
    let (mock, drive) = start().await;
    drive.check().await.unwrap();
    mock.revoke();

    let root = DrivePath::root();
    let results = futures::future::join_all((0..8).map(|_| drive.walk_dir(&root))).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(mock.with_state(|s| s.token_calls), 2);
}

#[tokio::test]
async fn test_read_object_redirects_to_link() {
    let (mock, drive) = start().await;
    let id = mock.with_state(|s| {
        s.items
            .iter()
            .find(|i| i.name == "c.txt")
            .map(|i| i.file_id.clone())
            .unwrap()
    });

    match drive.read_object(&path("/c.txt")).await.unwrap() {
        ObjectRead::Redirect(url) => assert_eq!(url, format!("https://dl.example.com/{}", id)),
        other => panic!("expected redirect, got {:?}", other),
    }
}
