//! Response cache: bounded LRU with TTL and cache-control awareness
//!
//! Entries are keyed by a request fingerprint (see [`key`]) and live until
//! their resolved TTL lapses. An auxiliary access-order sequence drives LRU
//! eviction: reads move a key to the tail, inserts evict from the head once
//! the cache is full. Expired entries found at read time are deleted and
//! counted as both a miss and an expiration.

pub mod key;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::transport::{HttpMethod, TransportResponse};
use key::{canonical_fingerprint, hash_fingerprint, KeyGenerator, KeyHash, KeyInput};

/// One cached response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Value,
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,

    /// Epoch ms at insert time
    pub timestamp: i64,

    /// Epoch ms; always strictly greater than `timestamp` for stored entries
    pub expires_at: i64,
}

/// Observable cache counters. Persisted with the entries so a reloaded cache
/// keeps its history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub total_get_time_ms: u64,
    pub total_set_time_ms: u64,
}

/// Derived statistics snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    #[serde(flatten)]
    pub counters: CacheCounters,

    pub size: usize,
    pub max_size: usize,

    pub hit_rate: f64,
    pub miss_rate: f64,
    pub utilization_percentage: f64,

    pub average_cache_age_ms: f64,
    pub oldest_entry_age_ms: i64,
    pub newest_entry_age_ms: i64,
}

/// Persistable cache state: entries, access order and counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub entries: HashMap<String, CacheEntry>,
    pub access_order: Vec<String>,
    pub counters: CacheCounters,
}

/// Persistence hook for the cache. Failures are logged and ignored.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn load(&self) -> std::result::Result<Option<CacheSnapshot>, String>;
    async fn store(&self, snapshot: &CacheSnapshot) -> std::result::Result<(), String>;
}

/// Configuration for a [`ResponseCache`].
#[derive(Clone)]
pub struct ResponseCacheConfig {
    /// Maximum number of entries; the least-recently-used entry is evicted
    /// when an insert would exceed it
    pub max_size: usize,

    /// TTL applied when response headers resolve no other lifetime
    pub default_ttl_ms: u64,

    /// Honor `Cache-Control` / `Expires` response headers
    pub respect_cache_control: bool,

    /// Methods that never read from or write to the cache
    pub exclude_methods: Vec<HttpMethod>,

    /// Response statuses eligible for storage
    pub cacheable_status_codes: Vec<u16>,

    pub key_hash: KeyHash,

    /// Overrides the built-in fingerprint when set
    pub key_generator: Option<KeyGenerator>,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            default_ttl_ms: 300_000,
            respect_cache_control: true,
            exclude_methods: vec![
                HttpMethod::Post,
                HttpMethod::Put,
                HttpMethod::Patch,
                HttpMethod::Delete,
            ],
            cacheable_status_codes: vec![
                200, 203, 204, 206, 300, 301, 404, 405, 410, 414, 501,
            ],
            key_hash: KeyHash::default(),
            key_generator: None,
        }
    }
}

impl std::fmt::Debug for ResponseCacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCacheConfig")
            .field("max_size", &self.max_size)
            .field("default_ttl_ms", &self.default_ttl_ms)
            .field("respect_cache_control", &self.respect_cache_control)
            .field("exclude_methods", &self.exclude_methods)
            .field("cacheable_status_codes", &self.cacheable_status_codes)
            .field("key_hash", &self.key_hash)
            .field("key_generator", &self.key_generator.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    access_order: VecDeque<String>,
    counters: CacheCounters,
}

impl CacheState {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.access_order.iter().position(|k| k == key) {
            self.access_order.remove(pos);
        }
        self.access_order.push_back(key.to_string());
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        if let Some(pos) = self.access_order.iter().position(|k| k == key) {
            self.access_order.remove(pos);
        }
    }

    fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            entries: self.entries.clone(),
            access_order: self.access_order.iter().cloned().collect(),
            counters: self.counters,
        }
    }
}

/// Bounded LRU response cache.
pub struct ResponseCache {
    config: ResponseCacheConfig,
    state: Mutex<CacheState>,
    store: Option<Arc<dyn CacheStore>>,
}

impl ResponseCache {
    pub fn new(config: ResponseCacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            store: None,
        }
    }

    pub fn with_store(config: ResponseCacheConfig, store: Arc<dyn CacheStore>) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            store: Some(store),
        }
    }

    pub fn config(&self) -> &ResponseCacheConfig {
        &self.config
    }

    /// Load persisted entries, access order and counters, when a store is
    /// attached. Load failures are logged and leave the cache empty.
    pub async fn initialize(&self) {
        let Some(store) = &self.store else { return };

        match store.load().await {
            Ok(Some(snapshot)) => {
                let mut state = self.state.lock().await;
                state.entries = snapshot.entries;
                state.access_order = snapshot.access_order.into_iter().collect();
                state.counters = snapshot.counters;
                debug!(entries = state.entries.len(), "cache state restored");
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "cache load failed, starting empty"),
        }
    }

    /// True unless the method is excluded from caching.
    pub fn is_cacheable_method(&self, method: HttpMethod) -> bool {
        !self.config.exclude_methods.contains(&method)
    }

    /// Compute the cache key for a request.
    pub fn cache_key(
        &self,
        method: HttpMethod,
        url: &str,
        params: &HashMap<String, String>,
        headers: &HashMap<String, String>,
    ) -> String {
        let input = KeyInput {
            method,
            url,
            params,
            headers,
        };
        match &self.config.key_generator {
            Some(generator) => generator(&input),
            None => hash_fingerprint(&canonical_fingerprint(&input), self.config.key_hash),
        }
    }

    /// Look up an entry. Expired entries are deleted and counted as a miss
    /// plus an expiration; hits refresh the LRU position.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let started = Instant::now();
        let now = Utc::now().timestamp_millis();
        let mut state = self.state.lock().await;

        let mut expired_now = false;
        let outcome = match state.entries.get(key) {
            Some(entry) if entry.expires_at <= now => {
                state.remove(key);
                state.counters.misses += 1;
                state.counters.expirations += 1;
                expired_now = true;
                None
            }
            Some(entry) => {
                let entry = entry.clone();
                state.touch(key);
                state.counters.hits += 1;
                Some(entry)
            }
            None => {
                state.counters.misses += 1;
                None
            }
        };

        state.counters.total_get_time_ms += started.elapsed().as_millis() as u64;

        let snapshot = (expired_now && self.store.is_some()).then(|| state.snapshot());
        drop(state);

        if let Some(snapshot) = snapshot {
            self.persist(&snapshot).await;
        }

        outcome
    }

    /// Store a response when its status and headers allow it.
    ///
    /// Returns true when the entry was stored.
    pub async fn set(&self, key: &str, response: &TransportResponse) -> bool {
        let started = Instant::now();

        if !self
            .config
            .cacheable_status_codes
            .contains(&response.status)
        {
            return false;
        }

        let Some(ttl_ms) = self.resolve_ttl_ms(&response.headers) else {
            return false;
        };

        let now = Utc::now().timestamp_millis();
        let entry = CacheEntry {
            data: response.data.clone(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers: response.headers.clone(),
            timestamp: now,
            expires_at: now + ttl_ms.max(1),
        };

        let mut state = self.state.lock().await;

        if !state.entries.contains_key(key) && state.entries.len() >= self.config.max_size {
            if let Some(oldest) = state.access_order.pop_front() {
                state.entries.remove(&oldest);
                state.counters.evictions += 1;
            }
        }

        state.entries.insert(key.to_string(), entry);
        state.touch(key);
        state.counters.sets += 1;
        state.counters.total_set_time_ms += started.elapsed().as_millis() as u64;

        let snapshot = self.store.is_some().then(|| state.snapshot());
        drop(state);

        if let Some(snapshot) = snapshot {
            self.persist(&snapshot).await;
        }

        true
    }

    /// Resolve the TTL for a response from its headers.
    ///
    /// `None` means the response must not be cached.
    fn resolve_ttl_ms(&self, headers: &HashMap<String, String>) -> Option<i64> {
        if !self.config.respect_cache_control {
            return Some(self.config.default_ttl_ms as i64);
        }

        let header = |name: &str| {
            headers
                .iter()
                .find(|(header, _)| header.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        };

        if let Some(cache_control) = header("cache-control") {
            let directives = cache_control.to_ascii_lowercase();
            if directives.contains("no-cache") || directives.contains("no-store") {
                return None;
            }
            for directive in directives.split(',') {
                if let Some(seconds) = directive.trim().strip_prefix("max-age=") {
                    if let Ok(seconds) = seconds.trim().parse::<i64>() {
                        return Some(seconds.saturating_mul(1_000));
                    }
                }
            }
        }

        if let Some(expires) = header("expires") {
            if let Ok(parsed) = chrono::DateTime::parse_from_rfc2822(expires) {
                let remaining = parsed.timestamp_millis() - Utc::now().timestamp_millis();
                if remaining <= 0 {
                    return None;
                }
                return Some(remaining);
            }
        }

        Some(self.config.default_ttl_ms as i64)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Statistics snapshot with derived rates and entry ages.
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        let counters = state.counters;
        let now = Utc::now().timestamp_millis();

        let lookups = counters.hits + counters.misses;
        let (mut oldest, mut newest, mut age_sum) = (0i64, i64::MAX, 0i64);
        for entry in state.entries.values() {
            let age = now - entry.timestamp;
            oldest = oldest.max(age);
            newest = newest.min(age);
            age_sum += age;
        }

        CacheStats {
            counters,
            size: state.entries.len(),
            max_size: self.config.max_size,
            hit_rate: ratio(counters.hits, lookups),
            miss_rate: ratio(counters.misses, lookups),
            utilization_percentage: if self.config.max_size == 0 {
                0.0
            } else {
                state.entries.len() as f64 / self.config.max_size as f64 * 100.0
            },
            average_cache_age_ms: if state.entries.is_empty() {
                0.0
            } else {
                age_sum as f64 / state.entries.len() as f64
            },
            oldest_entry_age_ms: oldest,
            newest_entry_age_ms: if newest == i64::MAX { 0 } else { newest },
        }
    }

    async fn persist(&self, snapshot: &CacheSnapshot) {
        if let Some(store) = &self.store {
            if let Err(err) = store.store(snapshot).await {
                warn!(error = %err, "cache store failed");
            }
        }
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.config)
            .field("store", &self.store.is_some())
            .finish()
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;

    fn response(status: u16, body: &str) -> TransportResponse {
        TransportResponse {
            data: Value::from(body),
            status,
            status_text: "OK".to_string(),
            headers: HashMap::new(),
        }
    }

    fn response_with_headers(headers: &[(&str, &str)]) -> TransportResponse {
        TransportResponse {
            data: Value::from("body"),
            status: 200,
            status_text: "OK".to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_set_and_get_round_trip() {
        let cache = ResponseCache::new(ResponseCacheConfig::default());
        assert!(cache.set("k1", &response(200, "hello")).await);

        let entry = cache.get("k1").await.unwrap();
        assert_eq!(entry.data, Value::from("hello"));
        assert!(entry.expires_at > entry.timestamp);

        let stats = cache.stats().await;
        assert_eq!(stats.counters.hits, 1);
        assert_eq!(stats.counters.sets, 1);
    }

    #[tokio::test]
    async fn test_uncacheable_status_not_stored() {
        let cache = ResponseCache::new(ResponseCacheConfig::default());
        assert!(!cache.set("k1", &response(500, "error")).await);
        assert!(cache.is_empty().await);

        // 404 is in the default cacheable list.
        assert!(cache.set("k2", &response(404, "missing")).await);
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_used() {
        let config = ResponseCacheConfig {
            max_size: 2,
            ..Default::default()
        };
        let cache = ResponseCache::new(config);

        cache.set("a", &response(200, "a")).await;
        cache.set("b", &response(200, "b")).await;

        // Touch "a" so "b" becomes the LRU key.
        cache.get("a").await.unwrap();

        cache.set("c", &response(200, "c")).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("c").await.is_some());
        assert_eq!(cache.stats().await.counters.evictions, 1);
    }

    #[tokio::test]
    async fn test_size_never_exceeds_max() {
        let config = ResponseCacheConfig {
            max_size: 3,
            ..Default::default()
        };
        let cache = ResponseCache::new(config);

        for i in 0..10 {
            cache.set(&format!("k{}", i), &response(200, "x")).await;
            assert!(cache.len().await <= 3);
        }
    }

    #[tokio::test]
    async fn test_expired_entry_deleted_and_counted() {
        let config = ResponseCacheConfig {
            default_ttl_ms: 20,
            ..Default::default()
        };
        let cache = ResponseCache::new(config);

        cache.set("k1", &response(200, "short-lived")).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(cache.get("k1").await.is_none());
        assert!(cache.is_empty().await);

        let stats = cache.stats().await;
        assert_eq!(stats.counters.misses, 1);
        assert_eq!(stats.counters.expirations, 1);
    }

    #[tokio::test]
    async fn test_no_store_directive_prevents_caching() {
        let cache = ResponseCache::new(ResponseCacheConfig::default());
        assert!(
            !cache
                .set("k1", &response_with_headers(&[("Cache-Control", "no-store")]))
                .await
        );
        assert!(
            !cache
                .set("k2", &response_with_headers(&[("Cache-Control", "no-cache")]))
                .await
        );
    }

    #[tokio::test]
    async fn test_max_age_resolves_ttl() {
        let cache = ResponseCache::new(ResponseCacheConfig::default());
        cache
            .set(
                "k1",
                &response_with_headers(&[("Cache-Control", "public, max-age=120")]),
            )
            .await;

        let entry = cache.get("k1").await.unwrap();
        let ttl = entry.expires_at - entry.timestamp;
        assert_eq!(ttl, 120_000);
    }

    #[tokio::test]
    async fn test_expires_header_resolves_ttl() {
        let cache = ResponseCache::new(ResponseCacheConfig::default());

        let future = (Utc::now() + chrono::Duration::seconds(60)).to_rfc2822();
        cache
            .set("k1", &response_with_headers(&[("Expires", &future)]))
            .await;

        let entry = cache.get("k1").await.unwrap();
        let ttl = entry.expires_at - entry.timestamp;
        assert!((50_000..=60_500).contains(&ttl), "unexpected ttl {}", ttl);

        // An already-expired Expires header prevents caching.
        let past = (Utc::now() - chrono::Duration::seconds(60)).to_rfc2822();
        assert!(
            !cache
                .set("k2", &response_with_headers(&[("Expires", &past)]))
                .await
        );
    }

    #[tokio::test]
    async fn test_ignore_headers_when_cache_control_disabled() {
        let config = ResponseCacheConfig {
            respect_cache_control: false,
            default_ttl_ms: 10_000,
            ..Default::default()
        };
        let cache = ResponseCache::new(config);

        assert!(
            cache
                .set("k1", &response_with_headers(&[("Cache-Control", "no-store")]))
                .await
        );
    }

    #[tokio::test]
    async fn test_excluded_methods() {
        let cache = ResponseCache::new(ResponseCacheConfig::default());
        assert!(cache.is_cacheable_method(HttpMethod::Get));
        assert!(!cache.is_cacheable_method(HttpMethod::Post));
        assert!(!cache.is_cacheable_method(HttpMethod::Delete));
    }

    #[derive(Default)]
    struct MemoryStore {
        snapshot: StdMutex<Option<CacheSnapshot>>,
        fail_store: bool,
    }

    #[async_trait]
    impl CacheStore for MemoryStore {
        async fn load(&self) -> std::result::Result<Option<CacheSnapshot>, String> {
            Ok(self.snapshot.lock().unwrap().clone())
        }

        async fn store(&self, snapshot: &CacheSnapshot) -> std::result::Result<(), String> {
            if self.fail_store {
                return Err("disk full".to_string());
            }
            *self.snapshot.lock().unwrap() = Some(snapshot.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let store = Arc::new(MemoryStore::default());

        let cache = ResponseCache::with_store(ResponseCacheConfig::default(), store.clone());
        cache.set("k1", &response(200, "persisted")).await;
        cache.get("k1").await.unwrap();

        // A second cache instance restores entries and counters.
        let restored = ResponseCache::with_store(ResponseCacheConfig::default(), store);
        restored.initialize().await;

        let entry = restored.get("k1").await.unwrap();
        assert_eq!(entry.data, Value::from("persisted"));
        assert_eq!(restored.stats().await.counters.sets, 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed() {
        let store = Arc::new(MemoryStore {
            fail_store: true,
            ..Default::default()
        });

        let cache = ResponseCache::with_store(ResponseCacheConfig::default(), store);
        assert!(cache.set("k1", &response(200, "kept")).await);
        assert!(cache.get("k1").await.is_some());
    }
}
