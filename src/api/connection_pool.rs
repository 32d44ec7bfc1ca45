// src/api/connection_pool.rs
//! Pooled Exchange Connections with Health Monitoring and Adaptive Scaling
//!
//! Provides:
//! - Lazily created connections bound to one endpoint each
//! - Warm-up calls before a new connection serves traffic
//! - Background health checks that retire failing connections
//! - Utilization-driven scaling between the configured min and max
//!
//! Every client is in exactly one of three places, all guarded by one lock:
//! the available queue, the busy set, or the `creating` reservation count.

use crate::api::endpoints::EndpointRegistry;
use crate::api::transport::{ApiConnection, Connector};
use crate::error::{GatewayError, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout_ms: u64,
    pub warmup_calls: u32,
    pub health_check_interval_ms: u64,
    pub health_check_timeout_ms: u64,
    pub max_health_check_failures: u32,
    pub scaling_interval_ms: u64,
    pub scale_up_utilization: f64,
    pub scale_down_utilization: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            acquire_timeout_ms: 5_000,
            warmup_calls: 1,
            health_check_interval_ms: 30_000,
            health_check_timeout_ms: 5_000,
            max_health_check_failures: 3,
            scaling_interval_ms: 60_000,
            scale_up_utilization: 0.8,
            scale_down_utilization: 0.2,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// A pooled handle bound to one endpoint
pub struct ManagedClient {
    pub id: u64,
    pub endpoint: String,
    pub connection: Arc<dyn ApiConnection>,
    pub state: ConnectionState,
    pub health: ClientHealth,
    pub failure_count: u32,
    pub created_at: Instant,
    pub last_used: Instant,
}

impl std::fmt::Debug for ManagedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedClient")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("health", &self.health)
            .field("failure_count", &self.failure_count)
            .finish()
    }
}

struct PoolInner {
    available: VecDeque<ManagedClient>,
    busy: HashMap<u64, String>,
    creating: usize,
    closed: bool,
}

impl PoolInner {
    fn total(&self) -> usize {
        self.available.len() + self.busy.len() + self.creating
    }
}

enum AcquirePlan {
    Create,
    Rebind(ManagedClient),
    Wait,
}

/// Outcome of one scaling evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    Grew,
    Shrank,
    Unchanged,
}

pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<EndpointRegistry>,
    inner: Mutex<PoolInner>,
    released: Notify,
    next_id: AtomicU64,
    created_total: AtomicU64,
    retired_total: AtomicU64,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        registry: Arc<EndpointRegistry>,
    ) -> Self {
        info!(
            "🏊 Creating connection pool (min {}, max {})",
            config.min_connections, config.max_connections
        );

        Self {
            config,
            connector,
            registry,
            inner: Mutex::new(PoolInner {
                available: VecDeque::new(),
                busy: HashMap::new(),
                creating: 0,
                closed: true,
            }),
            released: Notify::new(),
            next_id: AtomicU64::new(1),
            created_total: AtomicU64::new(0),
            retired_total: AtomicU64::new(0),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Open the pool and create the minimum number of connections
    pub async fn initialize(&self) {
        self.inner.lock().await.closed = false;
        let created = self.ensure_min().await;
        info!("✅ Connection pool initialized with {} connections", created);
    }

    /// Open the pool and spawn the health-check and scaling loops
    pub async fn start(self: &Arc<Self>) {
        self.initialize().await;

        let (tx, rx) = watch::channel(false);
        *self.shutdown.lock().await = Some(tx);

        let health = {
            let pool = self.clone();
            let mut shutdown = rx.clone();
            let period = Duration::from_millis(self.config.health_check_interval_ms.max(1));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => pool.health_check_once().await,
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("🛑 Pool health-check loop stopped");
            })
        };

        let scaling = {
            let pool = self.clone();
            let mut shutdown = rx;
            let period = Duration::from_millis(self.config.scaling_interval_ms.max(1));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            pool.scale_once().await;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("🛑 Pool scaling loop stopped");
            })
        };

        self.tasks.lock().await.extend([health, scaling]);
    }

    /// Stop background loops and close every connection
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("⚠️ Pool background task ended abnormally: {}", e);
            }
        }
        self.close_all().await;
    }

    /// Borrow a connection bound to `endpoint`
    pub async fn acquire(&self, endpoint: &str, timeout: Duration) -> Result<ManagedClient> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let plan = {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return Err(GatewayError::ShuttingDown);
                }

                if let Some(pos) = inner.available.iter().position(|c| c.endpoint == endpoint) {
                    if let Some(mut client) = inner.available.remove(pos) {
                        client.last_used = Instant::now();
                        inner.busy.insert(client.id, client.endpoint.clone());
                        return Ok(client);
                    }
                }

                if inner.total() < self.config.max_connections {
                    inner.creating += 1;
                    AcquirePlan::Create
                } else if let Some(victim) = inner.available.pop_front() {
                    inner.creating += 1;
                    AcquirePlan::Rebind(victim)
                } else {
                    AcquirePlan::Wait
                }
            };

            match plan {
                AcquirePlan::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(GatewayError::PoolExhausted {
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                }
                AcquirePlan::Create => {
                    let created = self.create_client(endpoint).await;
                    let mut inner = self.inner.lock().await;
                    inner.creating -= 1;
                    return match created {
                        Ok(client) => Ok(Self::lend(&mut inner, client)),
                        Err(e) => {
                            drop(inner);
                            self.released.notify_one();
                            Err(e)
                        }
                    };
                }
                AcquirePlan::Rebind(victim) => {
                    // the victim's slot is held by the `creating` reservation
                    // until its replacement exists
                    let created = self.create_client(endpoint).await;
                    let mut inner = self.inner.lock().await;
                    inner.creating -= 1;
                    return match created {
                        Ok(client) => {
                            let client = Self::lend(&mut inner, client);
                            drop(inner);
                            debug!(
                                "🔄 Rebound idle connection {} from {} to {}",
                                victim.id, victim.endpoint, endpoint
                            );
                            self.retire(victim).await;
                            Ok(client)
                        }
                        Err(e) => {
                            if inner.closed {
                                drop(inner);
                                self.retire(victim).await;
                            } else {
                                inner.available.push_front(victim);
                                drop(inner);
                            }
                            self.released.notify_one();
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    fn lend(inner: &mut PoolInner, mut client: ManagedClient) -> ManagedClient {
        client.last_used = Instant::now();
        inner.busy.insert(client.id, client.endpoint.clone());
        client
    }

    /// Return a borrowed connection. `healthy` is false when the call failed
    /// at the transport level. A retired connection that leaves the pool
    /// below minimum is replaced in the background.
    pub async fn release(self: &Arc<Self>, mut client: ManagedClient, healthy: bool) {
        if healthy {
            client.failure_count = 0;
            client.health = ClientHealth::Healthy;
        } else {
            client.failure_count += 1;
            client.health = if client.failure_count >= self.config.max_health_check_failures {
                ClientHealth::Unhealthy
            } else {
                ClientHealth::Degraded
            };
        }

        let (to_retire, replace) = {
            let mut inner = self.inner.lock().await;
            inner.busy.remove(&client.id);
            if inner.closed {
                (Some(client), false)
            } else if client.health == ClientHealth::Unhealthy {
                let replace = inner.total() < self.config.min_connections;
                if replace {
                    inner.creating += 1;
                }
                (Some(client), replace)
            } else {
                inner.available.push_back(client);
                (None, false)
            }
        };
        self.released.notify_one();

        if replace {
            let pool = self.clone();
            tokio::spawn(async move {
                pool.fill_reserved(1).await;
            });
        }

        if let Some(client) = to_retire {
            if client.health == ClientHealth::Unhealthy {
                warn!(
                    "❌ Retiring unhealthy connection {} to {} after {} failures",
                    client.id, client.endpoint, client.failure_count
                );
            }
            self.retire(client).await;
        }
    }

    async fn create_client(&self, endpoint: &str) -> Result<ManagedClient> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!("📞 Connecting pooled client {} to {}", id, endpoint);

        let connection = self.connector.connect(endpoint).await.map_err(|e| {
            warn!("❌ Failed to connect to {}: {}", endpoint, e);
            e
        })?;

        let mut health = ClientHealth::Healthy;
        for _ in 0..self.config.warmup_calls {
            if let Err(e) = connection.ping().await {
                debug!("⚠️ Warm-up call to {} failed: {}", endpoint, e);
                health = ClientHealth::Unknown;
            }
        }

        self.created_total.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        Ok(ManagedClient {
            id,
            endpoint: endpoint.to_string(),
            connection,
            state: ConnectionState::Connected,
            health,
            failure_count: 0,
            created_at: now,
            last_used: now,
        })
    }

    async fn retire(&self, mut client: ManagedClient) {
        client.state = ConnectionState::Disconnected;
        client.connection.close().await;
        self.retired_total.fetch_add(1, Ordering::Relaxed);
        debug!("🔌 Closed pooled connection {} to {}", client.id, client.endpoint);
    }

    /// Create connections until the pool holds at least `min_connections`.
    /// Returns the number created.
    pub async fn ensure_min(&self) -> usize {
        let deficit = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return 0;
            }
            let deficit = self.config.min_connections.saturating_sub(inner.total());
            inner.creating += deficit;
            deficit
        };
        self.fill_reserved(deficit).await
    }

    /// Create `reserved` connections against freshly selected endpoints,
    /// consuming that many `creating` reservations
    async fn fill_reserved(&self, reserved: usize) -> usize {
        let mut created = 0;
        for _ in 0..reserved {
            let result = match self.registry.select_endpoint() {
                Some(endpoint) => self.create_client(&endpoint).await,
                None => Err(GatewayError::ConfigError("no endpoints configured".into())),
            };

            let mut inner = self.inner.lock().await;
            inner.creating -= 1;
            match result {
                Ok(client) if !inner.closed => {
                    inner.available.push_back(client);
                    created += 1;
                }
                Ok(client) => {
                    drop(inner);
                    self.retire(client).await;
                }
                Err(e) => error!("❌ Failed to create replacement connection: {}", e),
            }
        }

        if created > 0 {
            self.released.notify_waiters();
        }
        created
    }

    /// Ping every idle connection once and retire the ones that keep failing
    pub async fn health_check_once(&self) {
        let targets: Vec<(u64, String, Arc<dyn ApiConnection>)> = {
            let inner = self.inner.lock().await;
            inner
                .available
                .iter()
                .map(|c| (c.id, c.endpoint.clone(), c.connection.clone()))
                .collect()
        };

        let timeout = Duration::from_millis(self.config.health_check_timeout_ms);
        let mut results = Vec::with_capacity(targets.len());
        for (id, endpoint, connection) in targets {
            let ok = matches!(tokio::time::timeout(timeout, connection.ping()).await, Ok(Ok(())));
            if ok {
                self.registry.record_success(&endpoint);
            } else {
                self.registry.record_failure(&endpoint);
                debug!("❌ Health check failed for connection {} ({})", id, endpoint);
            }
            results.push((id, ok));
        }

        let retired = {
            let mut inner = self.inner.lock().await;
            for (id, ok) in &results {
                if let Some(client) = inner.available.iter_mut().find(|c| c.id == *id) {
                    if *ok {
                        client.failure_count = 0;
                        client.health = ClientHealth::Healthy;
                    } else {
                        client.failure_count += 1;
                        client.health = if client.failure_count >= self.config.max_health_check_failures {
                            ClientHealth::Unhealthy
                        } else {
                            ClientHealth::Degraded
                        };
                    }
                }
            }

            let (keep, retire): (VecDeque<_>, VecDeque<_>) = inner
                .available
                .drain(..)
                .partition(|c| c.health != ClientHealth::Unhealthy);
            inner.available = keep;
            retire
        };

        if !retired.is_empty() {
            warn!("🔌 Health check retiring {} connections", retired.len());
        }
        for client in retired {
            self.retire(client).await;
        }
        self.ensure_min().await;
    }

    /// Evaluate utilization once and grow or shrink by one connection
    pub async fn scale_once(&self) -> ScaleAction {
        enum Plan {
            Grow,
            Shrink(ManagedClient),
            Hold,
        }

        let (plan, utilization) = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return ScaleAction::Unchanged;
            }
            let total = inner.total();
            let utilization = if total == 0 {
                0.0
            } else {
                inner.busy.len() as f64 / total as f64
            };

            let plan = if utilization > self.config.scale_up_utilization
                && total < self.config.max_connections
            {
                inner.creating += 1;
                Plan::Grow
            } else if utilization < self.config.scale_down_utilization
                && total > self.config.min_connections
            {
                // least recently used idle client
                let idx = inner
                    .available
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, c)| c.last_used)
                    .map(|(i, _)| i);
                match idx.and_then(|i| inner.available.remove(i)) {
                    Some(client) => Plan::Shrink(client),
                    None => Plan::Hold,
                }
            } else {
                Plan::Hold
            };
            (plan, utilization)
        };

        match plan {
            Plan::Grow => {
                let result = match self.registry.select_endpoint() {
                    Some(endpoint) => self.create_client(&endpoint).await,
                    None => Err(GatewayError::ConfigError("no endpoints configured".into())),
                };
                let mut inner = self.inner.lock().await;
                inner.creating -= 1;
                match result {
                    Ok(client) => {
                        info!(
                            "📈 Scaling up pool, utilization {:.0}%",
                            utilization * 100.0
                        );
                        inner.available.push_back(client);
                        drop(inner);
                        self.released.notify_one();
                        ScaleAction::Grew
                    }
                    Err(e) => {
                        warn!("❌ Scale-up failed: {}", e);
                        ScaleAction::Unchanged
                    }
                }
            }
            Plan::Shrink(client) => {
                info!(
                    "📉 Scaling down pool, utilization {:.0}%",
                    utilization * 100.0
                );
                self.retire(client).await;
                ScaleAction::Shrank
            }
            Plan::Hold => ScaleAction::Unchanged,
        }
    }

    /// Close every idle connection and refuse further acquisitions
    pub async fn close_all(&self) {
        let idle: Vec<_> = {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
            // ids of clients dropped by aborted workers would otherwise keep
            // counting against max_connections after a restart
            if !inner.busy.is_empty() {
                debug!("🔌 Forgetting {} borrowed connections", inner.busy.len());
                inner.busy.clear();
            }
            inner.available.drain(..).collect()
        };
        let count = idle.len();
        for client in idle {
            self.retire(client).await;
        }
        self.released.notify_waiters();
        info!("🔌 Connection pool closed ({} idle connections)", count);
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        let total = inner.total();
        PoolStats {
            total,
            available: inner.available.len(),
            busy: inner.busy.len(),
            creating: inner.creating,
            min_connections: self.config.min_connections,
            max_connections: self.config.max_connections,
            created_total: self.created_total.load(Ordering::Relaxed),
            retired_total: self.retired_total.load(Ordering::Relaxed),
        }
    }
}

/// Pool occupancy snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub busy: usize,
    pub creating: usize,
    pub min_connections: usize,
    pub max_connections: usize,
    pub created_total: u64,
    pub retired_total: u64,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} total ({} available, {} busy) within [{}, {}], created {} retired {}",
            self.total,
            self.available,
            self.busy,
            self.min_connections,
            self.max_connections,
            self.created_total,
            self.retired_total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
    use crate::testing::MockExchange;
    use rand::Rng;

    fn pool_with(config: PoolConfig, endpoints: &[&str]) -> (Arc<ConnectionPool>, Arc<MockExchange>) {
        let mock = Arc::new(MockExchange::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let registry = Arc::new(EndpointRegistry::new(
            endpoints.iter().map(|e| e.to_string()).collect(),
            breakers,
        ));
        let pool = Arc::new(ConnectionPool::new(config, mock.clone(), registry));
        (pool, mock)
    }

    async fn wait_for_available(pool: &ConnectionPool, n: usize) {
        for _ in 0..200 {
            if pool.stats().await.available >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pool never reached {} available connections", n);
    }

    fn small_config() -> PoolConfig {
        PoolConfig {
            min_connections: 1,
            max_connections: 2,
            warmup_calls: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_initialize_creates_minimum() {
        let (pool, mock) = pool_with(
            PoolConfig {
                min_connections: 2,
                ..small_config()
            },
            &["https://a"],
        );
        pool.initialize().await;

        let stats = pool.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.available, 2);
        assert_eq!(mock.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_warmup_calls_ping_new_connections() {
        let (pool, mock) = pool_with(
            PoolConfig {
                warmup_calls: 2,
                ..small_config()
            },
            &["https://a"],
        );
        pool.initialize().await;
        assert_eq!(mock.ping_count(), 2);
    }

    #[tokio::test]
    async fn test_acquire_waits_then_exhausts() {
        let (pool, _mock) = pool_with(small_config(), &["https://a"]);
        pool.initialize().await;

        let a = pool.acquire("https://a", Duration::from_millis(100)).await.unwrap();
        let b = pool.acquire("https://a", Duration::from_millis(100)).await.unwrap();
        assert_eq!(pool.stats().await.busy, 2);

        let err = pool
            .acquire("https://a", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PoolExhausted { .. }));

        pool.release(a, true).await;
        pool.release(b, true).await;
        assert_eq!(pool.stats().await.available, 2);
    }

    #[tokio::test]
    async fn test_release_wakes_waiting_acquirer() {
        let (pool, _mock) = pool_with(
            PoolConfig {
                max_connections: 1,
                ..small_config()
            },
            &["https://a"],
        );
        pool.initialize().await;

        let held = pool.acquire("https://a", Duration::from_millis(100)).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("https://a", Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let held_id = held.id;
        pool.release(held, true).await;

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.id, held_id);
    }

    #[tokio::test]
    async fn test_idle_connection_is_rebound_at_capacity() {
        let (pool, mock) = pool_with(
            PoolConfig {
                max_connections: 1,
                ..small_config()
            },
            &["https://a", "https://b"],
        );
        pool.initialize().await;

        let client = pool.acquire("https://b", Duration::from_millis(100)).await.unwrap();
        assert_eq!(client.endpoint, "https://b");
        assert_eq!(mock.close_count(), 1);
        assert_eq!(pool.stats().await.total, 1);
        pool.release(client, true).await;
    }

    #[tokio::test]
    async fn test_failed_rebind_keeps_idle_connection() {
        let (pool, mock) = pool_with(
            PoolConfig {
                max_connections: 1,
                ..small_config()
            },
            &["https://a", "https://b"],
        );
        pool.initialize().await;
        let original = pool.acquire("https://a", Duration::from_millis(100)).await.unwrap();
        let original_id = original.id;
        pool.release(original, true).await;

        mock.set_fail_connects(true);
        assert!(pool.acquire("https://b", Duration::from_millis(100)).await.is_err());

        let stats = pool.stats().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.available, 1);
        assert_eq!(mock.close_count(), 0);

        mock.set_fail_connects(false);
        let again = pool.acquire("https://a", Duration::from_millis(100)).await.unwrap();
        assert_eq!(again.id, original_id);
    }

    #[tokio::test]
    async fn test_unhealthy_release_retires_and_replaces() {
        let (pool, mock) = pool_with(
            PoolConfig {
                max_health_check_failures: 1,
                ..small_config()
            },
            &["https://a"],
        );
        pool.initialize().await;

        let client = pool.acquire("https://a", Duration::from_millis(100)).await.unwrap();
        let id = client.id;
        pool.release(client, false).await;

        // the replacement slot is reserved before release returns
        assert_eq!(pool.stats().await.total, 1);
        wait_for_available(&pool, 1).await;
        let stats = pool.stats().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.retired_total, 1);
        assert_eq!(mock.connect_count(), 2);

        let replacement = pool.acquire("https://a", Duration::from_millis(100)).await.unwrap();
        assert_ne!(replacement.id, id);
    }

    #[tokio::test]
    async fn test_replacement_uses_reselected_endpoint() {
        let (pool, mock) = pool_with(
            PoolConfig {
                max_health_check_failures: 1,
                ..small_config()
            },
            &["https://a", "https://b"],
        );
        pool.initialize().await;

        let client = pool.acquire("https://a", Duration::from_millis(100)).await.unwrap();
        for _ in 0..crate::api::endpoints::MAX_CONSECUTIVE_FAILURES {
            pool.registry.record_failure("https://a");
        }
        pool.release(client, false).await;
        wait_for_available(&pool, 1).await;

        let replacement = pool.acquire("https://b", Duration::from_millis(100)).await.unwrap();
        assert_eq!(replacement.endpoint, "https://b");
        // served by the replacement, no extra connect
        assert_eq!(mock.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_restart_forgets_connections_lost_by_aborted_callers() {
        let (pool, _mock) = pool_with(
            PoolConfig {
                max_connections: 1,
                ..small_config()
            },
            &["https://a"],
        );
        pool.start().await;
        let lost = pool.acquire("https://a", Duration::from_millis(100)).await.unwrap();
        drop(lost);
        pool.stop().await;

        pool.start().await;
        let stats = pool.stats().await;
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.total, 1);
        assert!(pool.acquire("https://a", Duration::from_millis(50)).await.is_ok());
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_health_check_retires_after_repeated_failures() {
        let (pool, mock) = pool_with(small_config(), &["https://a"]);
        pool.initialize().await;
        mock.set_fail_pings(true);

        pool.health_check_once().await;
        pool.health_check_once().await;
        assert_eq!(pool.stats().await.retired_total, 0);

        pool.health_check_once().await;
        let stats = pool.stats().await;
        assert_eq!(stats.retired_total, 1);
        // replenished back to minimum
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn test_health_check_feeds_endpoint_registry() {
        let (pool, mock) = pool_with(small_config(), &["https://a"]);
        pool.initialize().await;

        mock.set_fail_pings(true);
        pool.health_check_once().await;
        assert_eq!(pool.registry.consecutive_failures("https://a"), 1);

        mock.set_fail_pings(false);
        pool.health_check_once().await;
        assert_eq!(pool.registry.consecutive_failures("https://a"), 0);
    }

    #[tokio::test]
    async fn test_scaling_up_and_down() {
        let (pool, _mock) = pool_with(
            PoolConfig {
                min_connections: 1,
                max_connections: 3,
                warmup_calls: 0,
                ..Default::default()
            },
            &["https://a"],
        );
        pool.initialize().await;

        let held = pool.acquire("https://a", Duration::from_millis(100)).await.unwrap();
        assert_eq!(pool.scale_once().await, ScaleAction::Grew);
        assert_eq!(pool.stats().await.total, 2);
        pool.release(held, true).await;

        assert_eq!(pool.scale_once().await, ScaleAction::Shrank);
        assert_eq!(pool.stats().await.total, 1);
        assert_eq!(pool.scale_once().await, ScaleAction::Unchanged);
    }

    #[tokio::test]
    async fn test_total_stays_within_bounds() {
        let config = PoolConfig {
            min_connections: 2,
            max_connections: 4,
            warmup_calls: 0,
            ..Default::default()
        };
        let (pool, _mock) = pool_with(config, &["https://a", "https://b"]);
        pool.initialize().await;

        let mut held = Vec::new();
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            match rng.gen_range(0..4) {
                0 | 1 => {
                    let endpoint = if rng.gen_bool(0.5) { "https://a" } else { "https://b" };
                    if let Ok(c) = pool.acquire(endpoint, Duration::from_millis(5)).await {
                        held.push(c);
                    }
                }
                2 => {
                    if !held.is_empty() {
                        let idx = rng.gen_range(0..held.len());
                        let c = held.swap_remove(idx);
                        pool.release(c, rng.gen_bool(0.8)).await;
                    }
                }
                _ => {
                    pool.scale_once().await;
                }
            }
            let stats = pool.stats().await;
            assert!(stats.total >= 2 && stats.total <= 4, "total {} out of bounds", stats.total);
        }
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_acquire() {
        let (pool, mock) = pool_with(small_config(), &["https://a"]);
        pool.start().await;
        pool.stop().await;

        assert!(matches!(
            pool.acquire("https://a", Duration::from_millis(10)).await,
            Err(GatewayError::ShuttingDown)
        ));
        assert_eq!(mock.close_count(), 1);
        assert_eq!(pool.stats().await.total, 0);
    }
}
