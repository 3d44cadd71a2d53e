//! Signed PUT / GET / DELETE handlers.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driveshare_common::{DrivePath, Error, Result, SignedUrl};
use driveshare_storage::{Driver, ObjectBody, ObjectRead};

use crate::error::GateError;

/// Per-driver handler state.
pub(crate) struct RouteContext {
    pub driver: Arc<dyn Driver>,
    pub transfer_timeout: Option<Duration>,
}

impl RouteContext {
    /// Check the signed parameters and return the authorized path.
    fn authorize(&self, query: &HashMap<String, String>) -> Result<DrivePath> {
        let signed = SignedUrl::from_query(query)?;
        signed.verify(self.driver.signing_key()).inspect_err(|e| {
            warn!(
                "Rejected signed URL for {} on {}: {}",
                signed.path,
                self.driver.name(),
                e
            );
        })
    }

    /// Cancellation token of one transfer.
    ///
    /// The returned guard cancels the token when the handler finishes or is
    /// dropped because the client went away. With a transfer timeout the
    /// token is also cancelled once it elapses.
    fn transfer_token(&self) -> (CancellationToken, tokio_util::sync::DropGuard) {
        let cancel = CancellationToken::new();
        if let Some(limit) = self.transfer_timeout {
            let timer = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = timer.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        warn!("Transfer exceeded {:?}, cancelling", limit);
                        timer.cancel();
                    }
                }
            });
        }
        (cancel.clone(), cancel.drop_guard())
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// `PUT /driver/{name}`: store the request body at the signed path.
pub(crate) async fn upload(
    State(ctx): State<Arc<RouteContext>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> std::result::Result<StatusCode, GateError> {
    let path = ctx.authorize(&query)?;
    let length = content_length(&headers);
    debug!("Upload of {} ({:?} bytes) via {}", path, length, ctx.driver.name());

    let stream = body.into_data_stream().map_err(std::io::Error::other);
    let body = ObjectBody::new(Box::pin(StreamReader::new(stream)), length);

    let (cancel, _guard) = ctx.transfer_token();
    ctx.driver.put_object(&path, body, &cancel).await?;
    info!("Upload of {} via {} complete", path, ctx.driver.name());
    Ok(StatusCode::CREATED)
}

/// `DELETE /driver/{name}`: remove the signed path.
pub(crate) async fn remove(
    State(ctx): State<Arc<RouteContext>>,
    Query(query): Query<HashMap<String, String>>,
) -> std::result::Result<StatusCode, GateError> {
    let path = ctx.authorize(&query)?;
    ctx.driver.delete_object(&path).await?;
    Ok(StatusCode::OK)
}

/// `GET /driver/{name}`: redirect to, or stream, the signed path.
pub(crate) async fn download(
    State(ctx): State<Arc<RouteContext>>,
    Query(query): Query<HashMap<String, String>>,
) -> std::result::Result<Response, GateError> {
    let path = ctx.authorize(&query)?;

    match ctx.driver.read_object(&path).await? {
        ObjectRead::Redirect(url) => {
            debug!("Redirecting download of {}", path);
            let location = HeaderValue::from_str(&url)
                .map_err(|e| Error::RemoteUnavailable(format!("Unusable download URL: {}", e)))?;
            Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
        }
        ObjectRead::Stream {
            body,
            length,
            content_type,
            file_name,
        } => {
            let name = utf8_percent_encode(&file_name, NON_ALPHANUMERIC).to_string();
            let disposition = format!("attachment; filename=\"{}\"; filename*=UTF-8''{}", name, name);
            let headers = [
                (header::CONTENT_TYPE, content_type),
                (header::CONTENT_LENGTH, length.to_string()),
                (header::CONTENT_DISPOSITION, disposition),
            ];
            Ok((headers, Body::from_stream(body)).into_response())
        }
    }
}
