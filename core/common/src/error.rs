//! Common error types for driveshare.

use thiserror::Error;

/// Top-level error type for storage driver and transfer gate operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Path does not exist on the backend.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A directory operation was attempted on a file.
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// A directory could not be created because a file occupies a parent path.
    #[error("Directory conflict, parent is not a directory: {0}")]
    ConflictNotADirectory(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Directory still has children.
    #[error("Directory not empty: {0}")]
    NotEmptyDirectory(String),

    /// Operation not permitted.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The backend has no way to perform this operation.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The backend rejected the access token.
    ///
    /// Recovered by the token manager's single refresh-and-replay and never
    /// handed to callers of a driver.
    #[error("Access token rejected: {0}")]
    AuthExpired(String),

    /// A required signed URL parameter is absent.
    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    /// Signed URL signature does not match.
    #[error("Invalid signature")]
    SignatureInvalid,

    /// Signed URL is past its expiry.
    #[error("Link expired")]
    LinkExpired,

    /// A chunked transfer exhausted its retry budget or finished inconsistently.
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// Network failure or an unclassified non-2xx response.
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether a transfer step failing with this error may be attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::RemoteUnavailable(_) | Error::Io(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
