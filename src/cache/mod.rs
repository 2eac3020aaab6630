//! Caching layer for Handoff
//!
//! Denormalized read views (donation lists, task lists, tracking views,
//! notification feeds) cached under deterministic [`ViewKey`]s.
//!
//! The cache is never authoritative. Every read falls back to the store on a
//! miss or an outage, every write invalidates the views it touches before the
//! operation returns, and cache failures are logged and swallowed here.

pub mod keys;
pub mod store;

pub use keys::ViewKey;
pub use store::{spawn_cleanup_task, CacheBackend, CacheStats, LocalCache};

use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::CacheArgs;
use crate::types::Result;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries in the cache
    pub max_entries: usize,
    /// TTL for shared lists (donations, open tasks) and single donations
    pub list_ttl: Duration,
    /// TTL for user-specific views (feeds, tracking, task lists)
    pub user_ttl: Duration,
    /// Cleanup interval
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            list_ttl: Duration::from_secs(300),
            user_ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl From<&CacheArgs> for CacheConfig {
    fn from(args: &CacheArgs) -> Self {
        Self {
            max_entries: args.cache_max_entries,
            list_ttl: Duration::from_secs(args.cache_list_ttl_secs),
            user_ttl: Duration::from_secs(args.cache_user_ttl_secs),
            ..Default::default()
        }
    }
}

/// Read-through view cache over a [`CacheBackend`]
#[derive(Clone)]
pub struct ViewLayer {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
}

impl ViewLayer {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self { backend, config }
    }

    /// In-memory cache with the given configuration
    pub fn local(config: CacheConfig) -> Self {
        Self::new(Arc::new(LocalCache::new(config.clone())), config)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn list_ttl(&self) -> Duration {
        self.config.list_ttl
    }

    pub fn user_ttl(&self) -> Duration {
        self.config.user_ttl
    }

    /// Cached value, or `None` on miss, decode failure or outage
    pub async fn get_json<T: DeserializeOwned>(&self, key: &ViewKey) -> Option<T> {
        let storage_key = key.to_storage_key();
        match self.backend.get(&storage_key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key = %storage_key, error = %e, "Dropping undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Cache read failed, using store");
                None
            }
        }
    }

    /// Store a view; failures are logged only
    pub async fn put_json<T: Serialize>(&self, key: &ViewKey, value: &T, ttl: Duration) {
        let storage_key = key.to_storage_key();
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Failed to encode view for cache");
                return;
            }
        };
        if let Err(e) = self.backend.set(&storage_key, bytes, ttl).await {
            warn!(key = %storage_key, error = %e, "Cache write failed");
        }
    }

    /// Serve from cache, else load from the store and populate. The loaded
    /// value is not cached if any invalidation ran while it was loading.
    pub async fn read_through<T, F, Fut>(&self, key: ViewKey, ttl: Duration, load: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(hit) = self.get_json(&key).await {
            return Ok(hit);
        }
        let seen = match self.backend.generation().await {
            Ok(generation) => Some(generation),
            Err(e) => {
                debug!(error = %e, "Cache generation unavailable, not populating");
                None
            }
        };

        let value = load().await?;
        if let Some(seen) = seen {
            self.put_if_current(&key, &value, ttl, seen).await;
        }
        Ok(value)
    }

    async fn put_if_current<T: Serialize>(
        &self,
        key: &ViewKey,
        value: &T,
        ttl: Duration,
        seen: u64,
    ) {
        let storage_key = key.to_storage_key();
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Failed to encode view for cache");
                return;
            }
        };
        match self.backend.set_if_current(&storage_key, bytes, ttl, seen).await {
            Ok(true) => {}
            Ok(false) => debug!(key = %storage_key, "View changed while loading, not cached"),
            Err(e) => warn!(key = %storage_key, error = %e, "Cache write failed"),
        }
    }

    /// Drop every view under the given key prefixes
    pub async fn invalidate(&self, prefixes: &[String]) {
        for prefix in prefixes {
            match self.backend.invalidate_prefix(prefix).await {
                Ok(count) => debug!(prefix = %prefix, count, "Views invalidated"),
                Err(e) => warn!(prefix = %prefix, error = %e, "Cache invalidation failed"),
            }
        }
    }
}

/// Key prefixes affected by writes, grouped by what changed
pub mod affected {
    use super::keys::*;

    /// A donation's status or fields changed
    pub fn donation(donation_id: &str) -> Vec<String> {
        vec![
            ViewKey::prefix(SCOPE_DONATION, Some(donation_id)),
            ViewKey::prefix(SCOPE_DONATIONS, None),
        ]
    }

    pub fn tracking(claim_id: &str) -> String {
        ViewKey::prefix(SCOPE_TRACKING, Some(claim_id))
    }

    pub fn open_tasks() -> String {
        ViewKey::prefix(SCOPE_OPEN_TASKS, None)
    }

    pub fn volunteer_tasks(volunteer_id: &str) -> String {
        ViewKey::prefix(SCOPE_VOLUNTEER_TASKS, Some(volunteer_id))
    }

    /// A user received a notification or read one
    pub fn feed(user_id: &str) -> Vec<String> {
        vec![
            ViewKey::prefix(SCOPE_NOTIFICATIONS, Some(user_id)),
            ViewKey::prefix(SCOPE_UNREAD, Some(user_id)),
        ]
    }
}
