// src/api/middleware.rs
//! Optional layers around the `execute` seam
//!
//! Layers are chosen when the manager is built and wrap every pooled
//! connection the same way. The first listed layer sits closest to the
//! network.

use crate::api::transport::{ApiCall, ApiConnection, Connector};
use crate::api::types::HttpMethod;
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
    /// Serve repeated unsigned GETs from memory for `ttl`
    Cache { ttl: Duration },
    /// Per-path latency statistics
    Profile,
}

/// Entries held before an insert sweeps expired ones
pub const DEFAULT_CACHE_CAPACITY: usize = 1_024;

/// TTL cache of unsigned GET responses, shared across connections
pub struct ResponseCache {
    ttl: Duration,
    capacity: usize,
    entries: DashMap<String, (Instant, Value)>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            capacity: DEFAULT_CACHE_CAPACITY,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    fn key(call: &ApiCall) -> Option<String> {
        if call.signed || call.method != HttpMethod::Get {
            return None;
        }
        Some(format!("{}?{}", call.path, call.query_string()))
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let fresh = self
            .entries
            .get(key)
            .filter(|entry| entry.0.elapsed() < self.ttl)
            .map(|entry| entry.1.clone());

        match fresh {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a response. At capacity, expired entries are swept first and,
    /// if that frees nothing, the oldest entry is evicted.
    pub fn insert(&self, key: String, value: Value) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            let ttl = self.ttl;
            self.entries.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);

            if self.entries.len() >= self.capacity {
                let oldest = self
                    .entries
                    .iter()
                    .min_by_key(|entry| entry.value().0)
                    .map(|entry| entry.key().clone());
                if let Some(oldest) = oldest {
                    debug!("🗑️ Cache full, evicting {}", oldest);
                    self.entries.remove(&oldest);
                }
            }
        }
        self.entries.insert(key, (Instant::now(), value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct PathStats {
    calls: u64,
    errors: u64,
    total_ms: f64,
    max_ms: f64,
}

/// Per-path call profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub calls: u64,
    pub errors: u64,
    pub avg_ms: f64,
    pub max_ms: f64,
}

#[derive(Default)]
pub struct CallProfiler {
    stats: DashMap<String, PathStats>,
}

impl CallProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, path: &str, elapsed: Duration, ok: bool) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let mut entry = self.stats.entry(path.to_string()).or_default();
        entry.calls += 1;
        entry.total_ms += ms;
        entry.max_ms = entry.max_ms.max(ms);
        if !ok {
            entry.errors += 1;
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, ProfileEntry> {
        self.stats
            .iter()
            .map(|entry| {
                let s = entry.value();
                let avg_ms = if s.calls > 0 {
                    s.total_ms / s.calls as f64
                } else {
                    0.0
                };
                (
                    entry.key().clone(),
                    ProfileEntry {
                        calls: s.calls,
                        errors: s.errors,
                        avg_ms,
                        max_ms: s.max_ms,
                    },
                )
            })
            .collect()
    }
}

pub struct CachedConnection {
    inner: Arc<dyn ApiConnection>,
    cache: Arc<ResponseCache>,
}

#[async_trait]
impl ApiConnection for CachedConnection {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn execute(&self, call: &ApiCall) -> Result<Value> {
        let key = match ResponseCache::key(call) {
            Some(key) => key,
            None => return self.inner.execute(call).await,
        };

        if let Some(value) = self.cache.get(&key) {
            debug!("💾 Cache hit for {}", key);
            return Ok(value);
        }

        let value = self.inner.execute(call).await?;
        self.cache.insert(key, value.clone());
        Ok(value)
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

pub struct ProfiledConnection {
    inner: Arc<dyn ApiConnection>,
    profiler: Arc<CallProfiler>,
}

#[async_trait]
impl ApiConnection for ProfiledConnection {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn execute(&self, call: &ApiCall) -> Result<Value> {
        let started = Instant::now();
        let result = self.inner.execute(call).await;
        self.profiler
            .record(&call.path, started.elapsed(), result.is_ok());
        result
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

/// Connector that wraps every produced connection in the configured layers
pub struct LayeredConnector {
    inner: Arc<dyn Connector>,
    layers: Vec<Layer>,
    cache: Option<Arc<ResponseCache>>,
    profiler: Option<Arc<CallProfiler>>,
}

impl LayeredConnector {
    pub fn new(inner: Arc<dyn Connector>, layers: Vec<Layer>) -> Self {
        let cache = layers.iter().find_map(|layer| match layer {
            Layer::Cache { ttl } => Some(Arc::new(ResponseCache::new(*ttl))),
            Layer::Profile => None,
        });
        let profiler = layers
            .iter()
            .any(|layer| *layer == Layer::Profile)
            .then(|| Arc::new(CallProfiler::new()));

        Self {
            inner,
            layers,
            cache,
            profiler,
        }
    }

    pub fn cache(&self) -> Option<Arc<ResponseCache>> {
        self.cache.clone()
    }

    pub fn profiler(&self) -> Option<Arc<CallProfiler>> {
        self.profiler.clone()
    }
}

#[async_trait]
impl Connector for LayeredConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ApiConnection>> {
        let mut connection = self.inner.connect(endpoint).await?;

        for layer in &self.layers {
            connection = match (layer, &self.cache, &self.profiler) {
                (Layer::Cache { .. }, Some(cache), _) => Arc::new(CachedConnection {
                    inner: connection,
                    cache: cache.clone(),
                }),
                (Layer::Profile, _, Some(profiler)) => Arc::new(ProfiledConnection {
                    inner: connection,
                    profiler: profiler.clone(),
                }),
                _ => connection,
            };
        }

        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockExchange;
    use serde_json::json;

    fn call(method: HttpMethod, signed: bool) -> ApiCall {
        ApiCall {
            method,
            path: "/fapi/v1/ticker/price".into(),
            params: vec![("symbol".into(), "BTCUSDT".into())],
            headers: Vec::new(),
            signed,
        }
    }

    #[tokio::test]
    async fn test_cache_serves_repeated_unsigned_gets() {
        let mock = Arc::new(MockExchange::new());
        mock.set_reply("/fapi/v1/ticker/price", json!({"price": "1"}));

        let connector = LayeredConnector::new(
            mock.clone(),
            vec![Layer::Cache {
                ttl: Duration::from_secs(5),
            }],
        );
        let conn = connector.connect("https://a").await.unwrap();

        conn.execute(&call(HttpMethod::Get, false)).await.unwrap();
        conn.execute(&call(HttpMethod::Get, false)).await.unwrap();
        assert_eq!(mock.call_count(), 1);

        // signed and non-GET calls bypass the cache
        conn.execute(&call(HttpMethod::Get, true)).await.unwrap();
        conn.execute(&call(HttpMethod::Post, false)).await.unwrap();
        assert_eq!(mock.call_count(), 3);

        let cache = connector.cache().unwrap();
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_entries_expire() {
        let mock = Arc::new(MockExchange::new());
        let connector = LayeredConnector::new(
            mock.clone(),
            vec![Layer::Cache {
                ttl: Duration::from_millis(20),
            }],
        );
        let conn = connector.connect("https://a").await.unwrap();

        conn.execute(&call(HttpMethod::Get, false)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        conn.execute(&call(HttpMethod::Get, false)).await.unwrap();
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_cache_sweeps_expired_keys_at_capacity() {
        let cache = ResponseCache::new(Duration::from_millis(20)).with_capacity(4);
        for i in 0..4 {
            cache.insert(format!("/fapi/v1/klines?limit={}", i), json!(i));
        }
        assert_eq!(cache.len(), 4);

        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.insert("/fapi/v1/klines?limit=9".into(), json!(9));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_evicts_oldest_when_full_of_fresh_entries() {
        let cache = ResponseCache::new(Duration::from_secs(60)).with_capacity(2);
        cache.insert("a".into(), json!(1));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b".into(), json!(2));
        cache.insert("c".into(), json!(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("c"), Some(json!(3)));
    }

    #[tokio::test]
    async fn test_profiler_records_per_path() {
        let mock = Arc::new(MockExchange::new());
        mock.set_status("/fapi/v2/balance", 500, "boom");

        let connector = LayeredConnector::new(mock.clone(), vec![Layer::Profile]);
        let conn = connector.connect("https://a").await.unwrap();

        conn.execute(&call(HttpMethod::Get, false)).await.unwrap();
        let mut failing = call(HttpMethod::Get, true);
        failing.path = "/fapi/v2/balance".into();
        assert!(conn.execute(&failing).await.is_err());

        let profile = connector.profiler().unwrap().snapshot();
        assert_eq!(profile["/fapi/v1/ticker/price"].calls, 1);
        assert_eq!(profile["/fapi/v2/balance"].errors, 1);
    }
}
