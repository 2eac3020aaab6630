//! View cache backends
//!
//! `CacheBackend` is what the view layer talks to. `LocalCache` keeps
//! serialized views in memory with a TTL each. Over capacity it sheds the
//! views closest to expiry.
//!
//! Every invalidation bumps a generation counter. A loader that started
//! before an invalidation must not publish what it read, so read-through
//! callers take the generation before loading and store with
//! `set_if_current`.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::CacheConfig;
use crate::types::Result;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Reported by `/health`
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, data: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Drop every view whose key starts with `prefix`. Bumps the generation.
    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize>;

    /// Invalidations seen so far
    async fn generation(&self) -> Result<u64>;

    /// Store `data` unless an invalidation ran after `seen` was read.
    /// Returns whether the view was kept.
    async fn set_if_current(
        &self,
        key: &str,
        data: Vec<u8>,
        ttl: Duration,
        seen: u64,
    ) -> Result<bool>;
}

/// A serialized view and its deadline
#[derive(Debug, Clone)]
struct CacheEntry {
    data: Vec<u8>,
    expires_at: Instant,
    /// Generation the loader started under
    born: u64,
}

impl CacheEntry {
    fn live_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Point-in-time counters, serialized into `/health`
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

impl CacheStats {
    /// Percentage of lookups served from cache
    pub fn hit_rate(&self) -> f64 {
        match self.hits + self.misses {
            0 => 0.0,
            lookups => self.hits as f64 * 100.0 / lookups as f64,
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: usize) {
        counter.fetch_add(by as u64, Ordering::Relaxed);
    }
}

pub struct LocalCache {
    views: DashMap<String, CacheEntry>,
    generation: AtomicU64,
    counters: Counters,
    config: CacheConfig,
}

impl LocalCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            views: DashMap::new(),
            generation: AtomicU64::new(0),
            counters: Counters::default(),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            entries: self.views.len(),
            hits: read(&self.counters.hits),
            misses: read(&self.counters.misses),
            evictions: read(&self.counters.evictions),
            invalidations: read(&self.counters.invalidations),
        }
    }

    /// Sweep expired views, returning how many went
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.views.len();
        self.views.retain(|_, entry| entry.live_at(now));
        before.saturating_sub(self.views.len())
    }

    fn read(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let hit = self
            .views
            .get(key)
            .filter(|entry| entry.live_at(now))
            .map(|entry| entry.data.clone());

        match hit {
            Some(data) => {
                Counters::bump(&self.counters.hits, 1);
                Some(data)
            }
            None => {
                self.views.remove_if(key, |_, entry| !entry.live_at(now));
                Counters::bump(&self.counters.misses, 1);
                None
            }
        }
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn write(&self, key: &str, data: Vec<u8>, ttl: Duration, born: u64) {
        let entry = CacheEntry {
            data,
            expires_at: Instant::now() + ttl,
            born,
        };
        self.views.insert(key.to_string(), entry);
        if self.views.len() > self.config.max_entries {
            self.shed();
        }
    }

    /// An invalidation bumps the generation before it sweeps. Checking again
    /// after the insert covers one that slipped in between: either it swept
    /// our entry, or we see the bump here and take the entry back out.
    fn write_if_current(&self, key: &str, data: Vec<u8>, ttl: Duration, seen: u64) -> bool {
        if self.current_generation() != seen {
            return false;
        }
        self.write(key, data, ttl, seen);
        if self.current_generation() != seen {
            self.views.remove_if(key, |_, entry| entry.born == seen);
            debug!(key, "Discarded view loaded across an invalidation");
            return false;
        }
        true
    }

    fn drop_prefix(&self, prefix: &str) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let before = self.views.len();
        self.views.retain(|key, _| !key.starts_with(prefix));
        let dropped = before.saturating_sub(self.views.len());
        if dropped > 0 {
            Counters::bump(&self.counters.invalidations, dropped);
            debug!(prefix, dropped, "View cache invalidated");
        }
        dropped
    }

    /// Bring the cache back under capacity, leaving 1% headroom
    fn shed(&self) {
        let cap = self.config.max_entries;
        let excess = self.views.len().saturating_sub(cap) + cap / 100;

        let mut by_deadline: Vec<(Instant, String)> = self
            .views
            .iter()
            .map(|view| (view.expires_at, view.key().clone()))
            .collect();
        by_deadline.sort_unstable();

        let mut shed = 0;
        for (_, key) in by_deadline.into_iter().take(excess) {
            if self.views.remove(&key).is_some() {
                shed += 1;
            }
        }
        Counters::bump(&self.counters.evictions, shed);
        debug!(shed, cap, "View cache over capacity");
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl CacheBackend for LocalCache {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read(key))
    }

    async fn set(&self, key: &str, data: Vec<u8>, ttl: Duration) -> Result<()> {
        self.write(key, data, ttl, self.current_generation());
        Ok(())
    }

    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize> {
        Ok(self.drop_prefix(prefix))
    }

    async fn generation(&self) -> Result<u64> {
        Ok(self.current_generation())
    }

    async fn set_if_current(
        &self,
        key: &str,
        data: Vec<u8>,
        ttl: Duration,
        seen: u64,
    ) -> Result<bool> {
        Ok(self.write_if_current(key, data, ttl, seen))
    }
}

/// Sweep expired views on `cleanup_interval` for the life of the process
pub fn spawn_cleanup_task(cache: Arc<LocalCache>) {
    let mut ticker = tokio::time::interval(cache.config.cleanup_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::spawn(async move {
        // The first tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let swept = cache.cleanup();
            if swept > 0 {
                let stats = cache.stats();
                debug!(
                    swept,
                    entries = stats.entries,
                    hit_rate = format!("{:.1}%", stats.hit_rate()),
                    "Expired views swept"
                );
            }
        }
    });

    info!("View cache sweeper running");
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn test_miss_then_hit_counts() {
        let cache = LocalCache::with_defaults();
        let key = "donation:d1|";

        assert!(cache.get(key).await.unwrap().is_none());
        cache.set(key, b"{}".to_vec(), TTL).await.unwrap();
        assert_eq!(cache.get(key).await.unwrap().unwrap(), b"{}");

        let stats = cache.stats();
        assert_eq!((stats.entries, stats.hits, stats.misses), (1, 1, 1));
        assert_eq!(stats.hit_rate(), 50.0);
    }

    #[tokio::test]
    async fn test_expired_view_is_a_miss_and_removed() {
        let cache = LocalCache::with_defaults();
        cache
            .set("k", b"x".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(cache.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_only_expired() {
        let cache = LocalCache::with_defaults();
        cache.set("short", vec![1], Duration::from_millis(5)).await.unwrap();
        cache.set("long", vec![2], TTL).await.unwrap();

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(cache.cleanup(), 1);
        assert!(cache.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_prefix_scopes_to_user() {
        let cache = LocalCache::with_defaults();
        cache.set("notifications:u1|limit=20|offset=0", b"a".to_vec(), TTL).await.unwrap();
        cache.set("notifications:u1|limit=20|offset=20", b"b".to_vec(), TTL).await.unwrap();
        cache.set("notifications:u2|limit=20|offset=0", b"c".to_vec(), TTL).await.unwrap();

        assert_eq!(cache.invalidate_prefix("notifications:u1|").await.unwrap(), 2);
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.invalidations, 2);
    }

    #[tokio::test]
    async fn test_set_if_current_refuses_after_invalidation() {
        let cache = LocalCache::with_defaults();
        let seen = cache.generation().await.unwrap();

        // A write elsewhere invalidates while the loader is still reading
        cache.invalidate_prefix("donation:d1|").await.unwrap();

        let kept = cache
            .set_if_current("donation:d1|", b"stale".to_vec(), TTL, seen)
            .await
            .unwrap();
        assert!(!kept);
        assert!(cache.get("donation:d1|").await.unwrap().is_none());

        let seen = cache.generation().await.unwrap();
        assert!(cache
            .set_if_current("donation:d1|", b"fresh".to_vec(), TTL, seen)
            .await
            .unwrap());
        assert_eq!(cache.get("donation:d1|").await.unwrap().unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_over_capacity_sheds_nearest_expiry() {
        let cache = LocalCache::new(CacheConfig {
            max_entries: 3,
            ..Default::default()
        });
        cache.set("soon", vec![0], Duration::from_secs(1)).await.unwrap();
        for i in 1..4u8 {
            cache.set(&format!("k{i}"), vec![i], TTL).await.unwrap();
        }

        let stats = cache.stats();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.evictions, 1);
        assert!(cache.get("soon").await.unwrap().is_none());
    }
}
