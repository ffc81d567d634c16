use crate::config::CacheConfig;
use crate::constants::cache as cache_constants;
use crate::services::logger::Logger;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

struct LocalEntry {
    value: Value,
    inserted_at: Instant,
    ttl: Duration,
    hits: u64,
}

impl LocalEntry {
    fn new(value: Value, ttl: Duration) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
            ttl,
            hits: 0,
        }
    }

    fn expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

/// Two-tier TTL cache: a bounded in-process map in front of a shared Redis
/// store. Shared-tier failures degrade individual operations to local-only
/// behavior instead of failing the caller.
pub struct CacheService {
    logger: Logger,
    config: CacheConfig,
    local: DashMap<String, LocalEntry>,
    shared: Option<ConnectionManager>,
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    misses: AtomicU64,
    shared_errors: AtomicU64,
}

impl CacheService {
    /// Connects the shared tier if a Redis URL is configured. A failed
    /// initial connection leaves the service in local-only degraded mode.
    pub async fn initialize(logger: Logger, config: CacheConfig) -> Self {
        let logger = logger.child("cache");
        let shared = match config.redis_url.as_deref() {
            Some(url) => match Self::connect_shared(url, config.shared_timeout).await {
                Ok(manager) => Some(manager),
                Err(err) => {
                    logger.warn(
                        "Shared cache tier unavailable, running local-only",
                        Some(&serde_json::json!({"error": err.to_string()})),
                    );
                    None
                }
            },
            None => None,
        };
        Self {
            logger,
            config,
            local: DashMap::new(),
            shared,
            local_hits: AtomicU64::new(0),
            shared_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            shared_errors: AtomicU64::new(0),
        }
    }

    /// Local-only construction for deployments without a shared tier.
    pub fn local_only(logger: Logger, config: CacheConfig) -> Self {
        Self {
            logger: logger.child("cache"),
            config,
            local: DashMap::new(),
            shared: None,
            local_hits: AtomicU64::new(0),
            shared_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            shared_errors: AtomicU64::new(0),
        }
    }

    async fn connect_shared(
        url: &str,
        timeout: Duration,
    ) -> Result<ConnectionManager, redis::RedisError> {
        let client = redis::Client::open(url)?;
        tokio::time::timeout(timeout.max(Duration::from_secs(5)), ConnectionManager::new(client))
            .await
            .map_err(|_| {
                redis::RedisError::from((redis::ErrorKind::IoError, "connect timed out"))
            })?
    }

    pub fn has_shared_tier(&self) -> bool {
        self.shared.is_some()
    }

    fn namespaced(key: &str) -> String {
        format!("{}{}", cache_constants::KEY_NAMESPACE, key)
    }

    fn local_ttl_for(&self, requested: Duration) -> Duration {
        requested.min(self.config.local_default_ttl)
    }

    fn local_insert(&self, key: &str, value: Value, ttl: Duration) {
        if !self.local.contains_key(key) && self.local.len() >= self.config.local_max_entries {
            self.evict_oldest();
        }
        self.local
            .insert(key.to_string(), LocalEntry::new(value, ttl));
    }

    /// Capacity eviction removes the single entry with the oldest insertion
    /// timestamp, not the least recently read one.
    fn evict_oldest(&self) {
        let mut oldest: Option<(String, Instant)> = None;
        for entry in self.local.iter() {
            match &oldest {
                Some((_, inserted)) if *inserted <= entry.inserted_at => {}
                _ => oldest = Some((entry.key().clone(), entry.inserted_at)),
            }
        }
        if let Some((key, _)) = oldest {
            self.local.remove(&key);
        }
    }

    fn bump_shared_error(&self, op: &str, err: &redis::RedisError) {
        self.shared_errors.fetch_add(1, Ordering::Relaxed);
        self.logger.warn(
            "Shared cache tier operation failed",
            Some(&serde_json::json!({"op": op, "error": err.to_string()})),
        );
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        if let Some(mut entry) = self.local.get_mut(key) {
            if !entry.expired() {
                entry.hits += 1;
                self.local_hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            drop(entry);
            self.local.remove(key);
        }

        if let Some(manager) = self.shared.as_ref() {
            let mut conn = manager.clone();
            let ns_key = Self::namespaced(key);
            let fetched: Result<Option<String>, _> = tokio::time::timeout(
                self.config.shared_timeout,
                conn.get::<_, Option<String>>(&ns_key),
            )
            .await
            .unwrap_or_else(|_| {
                Err(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "get timed out",
                )))
            });
            match fetched {
                Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
                    Ok(value) => {
                        let remaining: i64 = conn.ttl(&ns_key).await.unwrap_or(-1);
                        let mirror_ttl = if remaining > 0 {
                            self.local_ttl_for(Duration::from_secs(remaining as u64))
                        } else {
                            self.config.local_default_ttl
                        };
                        self.local_insert(key, value.clone(), mirror_ttl);
                        self.shared_hits.fetch_add(1, Ordering::Relaxed);
                        return Some(value);
                    }
                    Err(_) => {
                        // Corrupt payloads are removed so they cannot keep
                        // masking future writes.
                        let _: Result<(), _> = conn.del(&ns_key).await;
                        self.logger.warn(
                            "Dropped undeserializable shared cache entry",
                            Some(&serde_json::json!({"key": key})),
                        );
                    }
                },
                Ok(None) => {}
                Err(err) => self.bump_shared_error("get", &err),
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Duration) {
        self.local_insert(key, value.clone(), self.local_ttl_for(ttl));
        if let Some(manager) = self.shared.as_ref() {
            let mut conn = manager.clone();
            let ns_key = Self::namespaced(key);
            let raw = match serde_json::to_string(&value) {
                Ok(raw) => raw,
                Err(err) => {
                    self.logger.warn(
                        "Failed to serialize cache value",
                        Some(&serde_json::json!({"key": key, "error": err.to_string()})),
                    );
                    return;
                }
            };
            let result: Result<(), _> = tokio::time::timeout(
                self.config.shared_timeout,
                conn.set_ex(&ns_key, raw, ttl.as_secs().max(1)),
            )
            .await
            .unwrap_or_else(|_| {
                Err(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "set timed out",
                )))
            });
            if let Err(err) = result {
                self.bump_shared_error("set", &err);
            }
        }
    }

    pub async fn delete(&self, key: &str) {
        self.local.remove(key);
        if let Some(manager) = self.shared.as_ref() {
            let mut conn = manager.clone();
            let result: Result<(), _> = conn.del(Self::namespaced(key)).await;
            if let Err(err) = result {
                self.bump_shared_error("del", &err);
            }
        }
    }

    /// Clears both tiers. The shared tier is scanned by key prefix so only
    /// this system's namespace is touched.
    pub async fn clear(&self) {
        self.local.clear();
        let Some(manager) = self.shared.as_ref() else {
            return;
        };
        let mut conn = manager.clone();
        let pattern = format!("{}*", cache_constants::KEY_NAMESPACE);
        let mut cursor: u64 = 0;
        loop {
            let scanned: Result<(u64, Vec<String>), _> = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100u32)
                .query_async(&mut conn)
                .await;
            let (next_cursor, keys) = match scanned {
                Ok(pair) => pair,
                Err(err) => {
                    self.bump_shared_error("scan", &err);
                    return;
                }
            };
            if !keys.is_empty() {
                let result: Result<(), _> = conn.del(keys).await;
                if let Err(err) = result {
                    self.bump_shared_error("del", &err);
                    return;
                }
            }
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
    }

    /// Fixed-window counter used by the rate limiter: INCR with the window
    /// TTL attached on first increment. Falls back to a local counter entry
    /// when the shared tier is unreachable.
    pub async fn incr(&self, key: &str, window: Duration) -> u64 {
        if let Some(manager) = self.shared.as_ref() {
            let mut conn = manager.clone();
            let ns_key = Self::namespaced(key);
            let count: Result<u64, _> = tokio::time::timeout(
                self.config.shared_timeout,
                conn.incr(&ns_key, 1u64),
            )
            .await
            .unwrap_or_else(|_| {
                Err(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "incr timed out",
                )))
            });
            match count {
                Ok(count) => {
                    if count == 1 {
                        let result: Result<(), _> =
                            conn.expire(&ns_key, window.as_secs().max(1) as i64).await;
                        if let Err(err) = result {
                            self.bump_shared_error("expire", &err);
                        }
                    }
                    return count;
                }
                Err(err) => self.bump_shared_error("incr", &err),
            }
        }
        self.incr_local(key, window)
    }

    fn incr_local(&self, key: &str, window: Duration) -> u64 {
        let mut entry = self
            .local
            .entry(key.to_string())
            .or_insert_with(|| LocalEntry::new(Value::from(0u64), window));
        if entry.expired() {
            *entry = LocalEntry::new(Value::from(0u64), window);
        }
        let next = entry.value.as_u64().unwrap_or(0) + 1;
        entry.value = Value::from(next);
        next
    }

    /// Drops expired local entries. Run on an interval by the app so entries
    /// that are never re-read still get reclaimed.
    pub fn sweep_local(&self) -> usize {
        let before = self.local.len();
        self.local.retain(|_, entry| !entry.expired());
        before - self.local.len()
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    pub async fn stats(&self) -> Value {
        let shared_memory = self.shared_memory_bytes().await;
        serde_json::json!({
            "local_hits": self.local_hits.load(Ordering::Relaxed),
            "shared_hits": self.shared_hits.load(Ordering::Relaxed),
            "misses": self.misses.load(Ordering::Relaxed),
            "shared_errors": self.shared_errors.load(Ordering::Relaxed),
            "local_entries": self.local.len(),
            "shared_connected": self.shared.is_some(),
            "shared_memory_bytes": shared_memory,
        })
    }

    /// Best-effort probe; returns null rather than blocking the stats call
    /// when the shared tier is slow or absent.
    async fn shared_memory_bytes(&self) -> Value {
        let Some(manager) = self.shared.as_ref() else {
            return Value::Null;
        };
        let mut conn = manager.clone();
        let info: Result<String, _> = tokio::time::timeout(
            self.config.shared_timeout,
            redis::cmd("INFO").arg("memory").query_async(&mut conn),
        )
        .await
        .unwrap_or_else(|_| {
            Err(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "info timed out",
            )))
        });
        match info {
            Ok(raw) => raw
                .lines()
                .find_map(|line| line.strip_prefix("used_memory:"))
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Value::from)
                .unwrap_or(Value::Null),
            Err(_) => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn test_config(local_max: usize) -> CacheConfig {
        CacheConfig {
            redis_url: None,
            local_max_entries: local_max,
            local_default_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            shared_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = CacheService::local_only(Logger::new("test"), test_config(16));
        cache
            .set("k1", serde_json::json!({"v": 1}), Duration::from_secs(30))
            .await;
        assert_eq!(cache.get("k1").await, Some(serde_json::json!({"v": 1})));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_miss() {
        let cache = CacheService::local_only(Logger::new("test"), test_config(16));
        cache
            .set("k1", Value::from("v"), Duration::from_millis(10))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k1").await, None);
    }

    #[tokio::test]
    async fn capacity_eviction_drops_oldest_insertion() {
        let cache = CacheService::local_only(Logger::new("test"), test_config(2));
        cache.set("a", Value::from(1), Duration::from_secs(60)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set("b", Value::from(2), Duration::from_secs(60)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set("c", Value::from(3), Duration::from_secs(60)).await;
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, Some(Value::from(2)));
        assert_eq!(cache.get("c").await, Some(Value::from(3)));
    }

    #[tokio::test]
    async fn sweep_reclaims_expired_entries() {
        let cache = CacheService::local_only(Logger::new("test"), test_config(16));
        cache
            .set("gone", Value::from("x"), Duration::from_millis(5))
            .await;
        cache
            .set("kept", Value::from("y"), Duration::from_secs(60))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = cache.sweep_local();
        assert_eq!(removed, 1);
        assert_eq!(cache.local_len(), 1);
    }

    #[tokio::test]
    async fn local_counter_resets_after_window() {
        let cache = CacheService::local_only(Logger::new("test"), test_config(16));
        assert_eq!(cache.incr("w", Duration::from_millis(20)).await, 1);
        assert_eq!(cache.incr("w", Duration::from_millis(20)).await, 2);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.incr("w", Duration::from_millis(20)).await, 1);
    }
}
