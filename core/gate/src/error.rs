//! HTTP mapping of driver errors.

use axum::response::{IntoResponse, Response};
use http::StatusCode;
use tracing::{error, warn};

use driveshare_common::Error;

/// Status code a gate response carries for `err`.
pub fn status_code(err: &Error) -> StatusCode {
    match err {
        Error::MissingParameter(_) | Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::SignatureInvalid | Error::LinkExpired | Error::PermissionDenied(_) => {
            StatusCode::FORBIDDEN
        }
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::AlreadyExists(_)
        | Error::NotADirectory(_)
        | Error::ConflictNotADirectory(_)
        | Error::NotEmptyDirectory(_) => StatusCode::CONFLICT,
        Error::UnsupportedOperation(_) => StatusCode::METHOD_NOT_ALLOWED,
        Error::TransferFailed(_) | Error::RemoteUnavailable(_) => StatusCode::BAD_GATEWAY,
        Error::Cancelled => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// A driver error on its way out of a gate handler.
#[derive(Debug)]
pub struct GateError(pub Error);

impl From<Error> for GateError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = status_code(&self.0);
        if status.is_server_error() {
            error!("Gate request failed: {}", self.0);
        } else {
            warn!("Gate request rejected: {}", self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}
