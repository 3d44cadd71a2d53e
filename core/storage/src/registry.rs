//! Driver registry for configuration-selected driver construction.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use driveshare_common::{Error, Result};

use crate::driver::Driver;
use crate::schema::DriverSchema;

/// Factory function type for creating drivers.
pub type DriverFactory = Box<dyn Fn(Value) -> Result<Arc<dyn Driver>> + Send + Sync>;

/// The closed set of built-in backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    Local,
    ObjectStore,
    CloudDrive,
    GraphDrive,
}

impl DriverKind {
    pub const ALL: [DriverKind; 4] = [
        DriverKind::Local,
        DriverKind::ObjectStore,
        DriverKind::CloudDrive,
        DriverKind::GraphDrive,
    ];

    /// Configuration name, also the gate route name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Local => "local",
            DriverKind::ObjectStore => "s3",
            DriverKind::CloudDrive => "clouddrive",
            DriverKind::GraphDrive => "graphdrive",
        }
    }

    /// Hand-written configuration schema.
    pub fn schema(&self) -> DriverSchema {
        match self {
            DriverKind::Local => crate::local::schema(),
            DriverKind::ObjectStore => crate::object::schema(),
            DriverKind::CloudDrive => crate::cloud::schema(),
            DriverKind::GraphDrive => crate::graph::schema(),
        }
    }

    /// Construct a driver of this kind from its configuration map.
    pub fn create(&self, config: Value) -> Result<Arc<dyn Driver>> {
        Ok(match self {
            DriverKind::Local => Arc::new(crate::local::LocalFs::from_value(config)?),
            DriverKind::ObjectStore => {
                Arc::new(crate::object::ObjectStoreDriver::from_value(config)?)
            }
            DriverKind::CloudDrive => Arc::new(crate::cloud::CloudDrive::from_value(config)?),
            DriverKind::GraphDrive => Arc::new(crate::graph::GraphDrive::from_value(config)?),
        })
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DriverKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::NotFound(format!("Unknown driver kind '{}'", s)))
    }
}

struct Entry {
    schema: DriverSchema,
    factory: DriverFactory,
}

/// Registry of driver factories.
///
/// Maps a configuration-selected name to a constructor and the schema of
/// the configuration that constructor accepts.
pub struct DriverRegistry {
    entries: BTreeMap<String, Entry>,
}

impl DriverRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register a driver factory.
    ///
    /// # Preconditions
    /// - `name` must be unique within the registry
    ///
    /// # Postconditions
    /// - Factory is registered and can be resolved by name
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(
        &mut self,
        name: impl Into<String>,
        schema: DriverSchema,
        factory: DriverFactory,
    ) -> Result<()> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Driver '{}' is already registered",
                name
            )));
        }
        self.entries.insert(name, Entry { schema, factory });
        Ok(())
    }

    /// Construct a driver by name from its configuration map.
    ///
    /// # Errors
    /// - Driver not registered
    /// - Configuration invalid
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn Driver>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Driver '{}' is not registered", name)))?;
        (entry.factory)(config)
    }

    /// Registered driver names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Configuration schemas of every registered driver, sorted by name.
    pub fn schemas(&self) -> Vec<&DriverSchema> {
        self.entries.values().map(|e| &e.schema).collect()
    }

    /// Check if a driver is registered.
    pub fn has_driver(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the four built-in drivers.
pub fn create_default_registry() -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    for kind in DriverKind::ALL {
        registry.entries.insert(
            kind.as_str().to_string(),
            Entry {
                schema: kind.schema(),
                factory: Box::new(move |config| kind.create(config)),
            },
        );
    }
    registry
}
