//! Common utilities and types shared across the driveshare crates.
//!
//! This module provides the error taxonomy every storage driver reports in,
//! the normalized path type all driver operations take, and the signed URL
//! codec that gates proxied transfers.

pub mod error;
pub mod signing;
pub mod types;

pub use error::{Error, Result};
pub use signing::{SignedUrl, SigningKey, DOWNLOAD_TTL, READ_TTL, WRITE_TTL};
pub use types::{DrivePath, SensitiveBytes};
