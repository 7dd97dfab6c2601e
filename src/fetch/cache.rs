use moka::future::Cache;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// A request/response cache that recovery may purge
pub trait PurgeableCache: Send + Sync {
    fn name(&self) -> &str;
    fn purge(&self);
}

/// Caches purged together by the cache-purge recovery strategy
#[derive(Clone, Default)]
pub struct CacheRegistry {
    caches: Arc<Mutex<Vec<Arc<dyn PurgeableCache>>>>,
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry").field("caches", &self.len()).finish()
    }
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cache: Arc<dyn PurgeableCache>) {
        debug!(cache = cache.name(), "Registered response cache");
        self.caches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(cache);
    }

    pub fn len(&self) -> usize {
        self.caches.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Purge every registered cache; returns how many were purged
    pub fn purge_all(&self) -> usize {
        let caches = self
            .caches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for cache in &caches {
            cache.purge();
        }
        info!(count = caches.len(), "Purged response caches");
        caches.len()
    }
}

/// Short-lived in-memory cache of decoded response payloads
#[derive(Debug, Clone)]
pub struct ResponseCache {
    name: String,
    cache: Cache<String, Value>,
}

impl ResponseCache {
    pub fn new(name: impl Into<String>, ttl: Duration, capacity: u64) -> Self {
        let cache = Cache::builder().max_capacity(capacity).time_to_live(ttl).build();
        Self {
            name: name.into(),
            cache,
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: &str, value: Value) {
        self.cache.insert(key.to_string(), value).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }
}

impl PurgeableCache for ResponseCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn purge(&self) {
        self.cache.invalidate_all();
    }
}
