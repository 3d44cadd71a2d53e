//! Process configuration and driver construction.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use driveshare_storage::{create_default_registry, DownloadMirror, Driver, DriverRegistry};

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_route_prefix() -> String {
    "/api".to_string()
}

/// Contents of the JSON configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Listen address of the gate.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Route group the `/driver/{name}` endpoints are mounted under.
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,
    /// Backend configurations keyed by driver kind.
    #[serde(default)]
    pub drivers: BTreeMap<String, Value>,
    /// Cancel a single proxied upload after this many seconds.
    #[serde(default)]
    pub transfer_timeout_secs: Option<u64>,
    /// Extra download links appended to every `download_url` answer.
    #[serde(default)]
    pub mirrors: Vec<DownloadMirror>,
}

impl AppConfig {
    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: AppConfig = serde_json::from_str(raw)?;
        let registry = create_default_registry();
        for name in config.drivers.keys() {
            if !registry.has_driver(name) {
                anyhow::bail!("Unknown driver kind '{}'", name);
            }
        }
        Ok(config)
    }

    pub fn transfer_timeout(&self) -> Option<Duration> {
        self.transfer_timeout_secs.map(Duration::from_secs)
    }

    /// Route prefix in the form `Router::nest` accepts, `None` for the root.
    pub fn nest_prefix(&self) -> Option<String> {
        let trimmed = self.route_prefix.trim_matches('/');
        if trimmed.is_empty() {
            None
        } else {
            Some(format!("/{}", trimmed))
        }
    }

    /// Construct every configured driver through the driver registry.
    pub fn load_drivers(&self) -> Result<Vec<Arc<dyn Driver>>> {
        let registry = create_default_registry();
        self.drivers
            .iter()
            .map(|(name, config)| build(&registry, name, config))
            .collect()
    }

    /// Construct one configured driver.
    pub fn load_driver(&self, name: &str) -> Result<Arc<dyn Driver>> {
        let config = self
            .drivers
            .get(name)
            .ok_or_else(|| anyhow!("Driver '{}' is not configured", name))?;
        build(&create_default_registry(), name, config)
    }
}

fn build(registry: &DriverRegistry, name: &str, config: &Value) -> Result<Arc<dyn Driver>> {
    registry
        .resolve(name, config.clone())
        .with_context(|| format!("Failed to configure driver '{}'", name))
}
