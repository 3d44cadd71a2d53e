//! Storage drivers for driveshare.
//!
//! This module provides the capability interface shared by every storage
//! backend (local disk, S3-compatible object storage, a file-id cloud drive
//! and a Microsoft Graph drive) together with the machinery they share:
//! depth-first tree walks, OAuth token management, a short-lived listing
//! cache and a chunked upload engine.
//!
//! # Design Principles
//! - Closed variant set: drivers are selected by name through a registry
//! - Instance-owned state: tokens and caches belong to one driver instance
//! - Async operations: all I/O operations are async
//! - Unified error semantics: every backend reports in the common taxonomy

pub mod cache;
pub mod cloud;
pub mod driver;
pub mod graph;
pub mod local;
pub mod object;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod token;
pub mod transfer;
pub mod tree;
pub mod walker;

pub use cache::DirectoryCache;
pub use cloud::{CloudDrive, CloudDriveConfig};
pub use driver::{
    ByteStream, DownloadMirror, DownloadUrl, Driver, GateMethod, ObjectBody, ObjectRead,
};
pub use graph::{GraphDrive, GraphDriveConfig};
pub use local::{LocalConfig, LocalFs};
pub use object::{ObjectStoreConfig, ObjectStoreDriver};
pub use registry::{create_default_registry, DriverFactory, DriverKind, DriverRegistry};
pub use retry::RetryConfig;
pub use schema::{DriverSchema, PropType, PropertySchema};
pub use token::{TokenManager, TokenSource, TokenStatus, Tokens};
pub use tree::FileNode;
pub use walker::{walk, walk_tree, DirectoryLister, ListedEntry};
