//! Microsoft Graph (OneDrive) backend.
//!
//! Items are addressed by path below a configurable root folder. Access
//! tokens come from a standard OAuth2 refresh-token grant.

mod auth;
mod client;
mod driver;

pub use auth::{GraphAuth, GraphAuthConfig, DEFAULT_TOKEN_URL};
pub use client::{GraphClient, GraphItem, DEFAULT_API_BASE};
pub use driver::{schema, GraphDrive, GraphDriveConfig, SMALL_UPLOAD_LIMIT};
