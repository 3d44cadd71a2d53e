//! Cloud drive backend.
//!
//! File-id based storage reached through a JSON-over-POST API. Access tokens
//! come from a refresh-token exchange and are replayed once on
//! `AccessTokenInvalid`.

mod auth;
mod client;
mod driver;

pub use auth::{CloudAuth, DEFAULT_AUTH_URL};
pub use client::{CloudClient, CloudFile, UploadSession, DEFAULT_API_BASE};
pub use driver::{schema, CloudDrive, CloudDriveConfig};
