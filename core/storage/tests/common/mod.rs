//! Helpers shared by the mock-server tests.

#![allow(dead_code)]

use axum::Router;
use std::io::Cursor;
use tokio::net::TcpListener;

use driveshare_storage::ObjectBody;

pub const MIB: u64 = 1024 * 1024;

/// Bind an ephemeral port and return the listener with its base URL.
pub async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, format!("http://{}", addr))
}

/// Serve `router` on `listener` in the background.
pub fn serve(listener: TcpListener, router: Router) {
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
}

/// Deterministic test payload.
pub fn payload(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Request body carrying `data` with its length declared.
pub fn body(data: Vec<u8>) -> ObjectBody {
    let len = data.len() as u64;
    ObjectBody::new(Box::pin(Cursor::new(data)), Some(len))
}

/// Bearer token of a request, if any.
pub fn bearer(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(String::from)
}
