//! Transfer gate for driveshare.
//!
//! Serves the signed proxy endpoints `/driver/{name}` through which clients
//! upload, delete and download files on drivers that cannot hand out
//! backend-native URLs. Every request carries `path`, `expireTime` and
//! `sign` query parameters; a request that fails verification is answered
//! with a client error before the driver is touched.

pub mod error;
mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::routing::MethodRouter;
use axum::Router;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use driveshare_common::{Error, Result};
use driveshare_storage::{Driver, GateMethod};

pub use error::{status_code, GateError};

use handlers::RouteContext;

/// Route of a driver's proxy endpoint.
pub fn driver_route(name: &str) -> String {
    format!("/driver/{}", name)
}

/// Collects the drivers whose proxy endpoints are served.
#[derive(Default)]
pub struct TransferGate {
    drivers: BTreeMap<String, Arc<dyn Driver>>,
    transfer_timeout: Option<Duration>,
}

impl TransferGate {
    /// Create a gate with no drivers and no transfer timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any single upload still running after `timeout`.
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = Some(timeout);
        self
    }

    /// Mount `driver`'s proxy endpoints.
    ///
    /// # Postconditions
    /// - Registering the same driver instance again changes nothing
    ///
    /// # Errors
    /// - `AlreadyExists` if a different driver is registered under the name
    pub fn register_routes(&mut self, driver: Arc<dyn Driver>) -> Result<()> {
        let name = driver.name().to_string();
        if let Some(existing) = self.drivers.get(&name) {
            if Arc::ptr_eq(existing, &driver) {
                debug!("Routes of {} already registered", name);
                return Ok(());
            }
            return Err(Error::AlreadyExists(format!(
                "Another driver is registered as '{}'",
                name
            )));
        }
        if driver.routes().is_empty() {
            debug!("Driver {} serves no proxy endpoints", name);
        }
        self.drivers.insert(name, driver);
        Ok(())
    }

    /// Names of the registered drivers.
    pub fn driver_names(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }

    /// Build the router serving every registered driver's endpoints.
    ///
    /// Methods a driver does not serve are answered with `405`.
    pub fn router(&self) -> Router {
        let mut router = Router::new();

        for (name, driver) in &self.drivers {
            if driver.routes().is_empty() {
                continue;
            }
            let ctx = Arc::new(RouteContext {
                driver: driver.clone(),
                transfer_timeout: self.transfer_timeout,
            });

            let mut methods: MethodRouter<Arc<RouteContext>> = MethodRouter::new();
            for method in driver.routes() {
                methods = match method {
                    GateMethod::Put => methods.put(handlers::upload),
                    GateMethod::Get => methods.get(handlers::download),
                    GateMethod::Delete => methods.delete(handlers::remove),
                };
            }

            info!("Serving {:?} on {}", driver.routes(), driver_route(name));
            router = router.route(&driver_route(name), methods.with_state(ctx));
        }

        router.layer(DefaultBodyLimit::disable())
    }
}
