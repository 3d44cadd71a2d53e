//! Short-lived cache of directory listings.
//!
//! Uses moka for concurrent caching with automatic TTL expiry. Entries are
//! never evicted proactively; writes invalidate the parent directory's entry.

use moka::sync::Cache;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use driveshare_common::{DrivePath, Result};

/// Default time-to-live for a cached listing.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

const MAX_ENTRIES: u64 = 10_000;

/// Directory path -> children listing.
pub struct DirectoryCache<V: Clone + Send + Sync + 'static> {
    entries: Cache<DrivePath, Arc<Vec<V>>>,
    /// Bumped on every invalidation; a fetch that raced with one is not cached.
    generation: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> DirectoryCache<V> {
    /// Create a cache whose entries expire `ttl` after insertion.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(MAX_ENTRIES)
                .time_to_live(ttl)
                .build(),
            generation: AtomicU64::new(0),
        }
    }

    /// Cached children of `dir`, if present and not expired.
    pub fn get(&self, dir: &DrivePath) -> Option<Arc<Vec<V>>> {
        self.entries.get(dir)
    }

    /// Store a listing. Empty listings are not cached.
    pub fn populate(&self, dir: DrivePath, children: Vec<V>) -> Arc<Vec<V>> {
        let children = Arc::new(children);
        if !children.is_empty() {
            self.entries.insert(dir, children.clone());
        }
        children
    }

    /// Return the cached listing or fetch and cache it.
    ///
    /// Misses and expired entries are not errors; they trigger `fetch`.
    pub async fn get_or_populate<F, Fut>(&self, dir: &DrivePath, fetch: F) -> Result<Arc<Vec<V>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<V>>>,
    {
        if let Some(children) = self.get(dir) {
            debug!("Listing cache hit: {}", dir);
            return Ok(children);
        }
        debug!("Listing cache miss: {}", dir);

        let generation = self.generation.load(Ordering::Acquire);
        let children = fetch().await?;
        if self.generation.load(Ordering::Acquire) == generation {
            Ok(self.populate(dir.clone(), children))
        } else {
            Ok(Arc::new(children))
        }
    }

    /// Drop the entry for `dir`.
    pub fn invalidate(&self, dir: &DrivePath) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.invalidate(dir);
    }

    /// Drop the entry of the directory containing `path`.
    pub fn invalidate_parent(&self, path: &DrivePath) {
        let parent = path.parent().unwrap_or_else(DrivePath::root);
        debug!("Invalidating listing of {}", parent);
        self.invalidate(&parent);
    }
}

impl<V: Clone + Send + Sync + 'static> Default for DirectoryCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
