// src/api/manager.rs
//! Central API Manager
//!
//! One handle owning the ledger, breakers, endpoint registry, connection pool,
//! request queue, worker pool and stream manager. Built once at startup and
//! passed to whatever needs exchange access.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use super::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use super::connection_pool::{ConnectionPool, PoolStats};
use super::dispatcher::{DispatchContext, PendingRequest};
use super::endpoints::{EndpointRegistry, EndpointSnapshot};
use super::middleware::{CallProfiler, Layer, LayeredConnector, ProfileEntry, ResponseCache};
use super::queue::{PriorityRequestQueue, QueueDepth};
use super::rate_limiter::{RateLimitLedger, RateLimitStats};
use super::signer::{HmacSha256Signer, RequestSigner};
use super::transport::{Connector, HttpConnector};
use super::types::{ApiRequest, ApiResponse, HttpMethod, OrderSide, RequestPriority};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::monitoring::{ApiMetrics, ApiMetricsSnapshot};
use crate::websocket::{StreamCallback, SubscriptionInfo, WebSocketManager};

/// Kline request weight by `limit`
pub fn kline_weight(limit: u32) -> u32 {
    match limit {
        0..=99 => 1,
        100..=499 => 2,
        500..=1000 => 5,
        _ => 10,
    }
}

pub struct ApiManagerBuilder {
    config: GatewayConfig,
    connector: Option<Arc<dyn Connector>>,
    signer: Option<Arc<dyn RequestSigner>>,
    layers: Vec<Layer>,
}

impl ApiManagerBuilder {
    /// Replace the HTTP transport, e.g. with a mock exchange
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn build(self) -> Result<ApiManager> {
        let config = self.config;
        config.validate()?;

        info!("🏗️ Initializing API Manager");

        let base: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(HttpConnector::new(
                Duration::from_millis(config.endpoints.request_timeout_ms),
                &config.endpoints.ping_path,
            )),
        };

        let mut layers = self.layers;
        if let Some(ttl_ms) = config.cache_ttl_ms {
            layers.push(Layer::Cache {
                ttl: Duration::from_millis(ttl_ms),
            });
        }
        if config.profile_calls && !layers.contains(&Layer::Profile) {
            layers.push(Layer::Profile);
        }

        let (connector, cache, profiler): (Arc<dyn Connector>, _, _) = if layers.is_empty() {
            (base, None, None)
        } else {
            let layered = LayeredConnector::new(base, layers);
            let cache = layered.cache();
            let profiler = layered.profiler();
            (Arc::new(layered), cache, profiler)
        };

        let signer = match self.signer {
            Some(signer) => Some(signer),
            None => config.credentials.clone().map(|creds| {
                let signer = HmacSha256Signer::new(creds);
                let signer = match config.recv_window_ms {
                    Some(ms) => signer.with_recv_window(ms),
                    None => signer,
                };
                Arc::new(signer) as Arc<dyn RequestSigner>
            }),
        };

        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let registry = Arc::new(EndpointRegistry::new(
            config.endpoints.rest_endpoints.clone(),
            breakers.clone(),
        ));
        let pool = Arc::new(ConnectionPool::new(
            config.pool.clone(),
            connector,
            registry.clone(),
        ));

        Ok(ApiManager {
            ledger: Arc::new(RateLimitLedger::new(config.rate_limits.clone())),
            queue: Arc::new(PriorityRequestQueue::new(config.queue.max_queue_size)),
            metrics: Arc::new(ApiMetrics::default()),
            websocket: WebSocketManager::new(config.websocket.clone()),
            breakers,
            registry,
            pool,
            signer,
            cache,
            profiler,
            workers: Mutex::new(None),
            created_at: Instant::now(),
            config,
        })
    }
}

struct WorkerSet {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    context: Arc<DispatchContext>,
}

/// Central API manager coordinating all exchange access
pub struct ApiManager {
    config: GatewayConfig,
    ledger: Arc<RateLimitLedger>,
    breakers: Arc<CircuitBreakerRegistry>,
    registry: Arc<EndpointRegistry>,
    pool: Arc<ConnectionPool>,
    queue: Arc<PriorityRequestQueue<PendingRequest>>,
    metrics: Arc<ApiMetrics>,
    signer: Option<Arc<dyn RequestSigner>>,
    websocket: WebSocketManager,
    cache: Option<Arc<ResponseCache>>,
    profiler: Option<Arc<CallProfiler>>,
    workers: Mutex<Option<WorkerSet>>,
    created_at: Instant,
}

impl ApiManager {
    pub fn builder(config: GatewayConfig) -> ApiManagerBuilder {
        ApiManagerBuilder {
            config,
            connector: None,
            signer: None,
            layers: Vec::new(),
        }
    }

    /// Manager over the real HTTP transport
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    pub async fn is_running(&self) -> bool {
        self.workers.lock().await.is_some()
    }

    /// Open the pool and spawn `num_workers` dispatch workers
    pub async fn start(&self, num_workers: usize) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            warn!("⚠️ API Manager already running");
            return Ok(());
        }
        if num_workers == 0 {
            return Err(GatewayError::ConfigError("at least one worker is required".into()));
        }

        self.pool.start().await;

        let context = Arc::new(DispatchContext {
            queue: self.queue.clone(),
            ledger: self.ledger.clone(),
            breakers: self.breakers.clone(),
            registry: self.registry.clone(),
            pool: self.pool.clone(),
            metrics: self.metrics.clone(),
            signer: self.signer.clone(),
            config: self.config.dispatcher.clone(),
            backoff: self.config.backoff.clone(),
            queue_timeout: self.config.queue.queue_timeout(),
            acquire_timeout: self.config.pool.acquire_timeout(),
            retries: Mutex::new(JoinSet::new()),
        });

        let (shutdown, rx) = watch::channel(false);
        let handles = (0..num_workers)
            .map(|id| tokio::spawn(context.clone().run_worker(id, rx.clone())))
            .collect();

        *workers = Some(WorkerSet {
            shutdown,
            handles,
            context,
        });
        info!("🚀 API Manager started with {} workers", num_workers);
        Ok(())
    }

    /// Stop workers, fail queued requests, close pooled connections and
    /// streams. The manager can be started again afterwards.
    pub async fn stop(&self) {
        let Some(set) = self.workers.lock().await.take() else {
            debug!("API Manager not running");
            return;
        };

        info!("🛑 Stopping API Manager");
        let _ = set.shutdown.send(true);

        let grace = Duration::from_millis(self.config.dispatcher.shutdown_grace_ms);
        let deadline = tokio::time::Instant::now() + grace;
        for mut handle in set.handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("⚠️ Worker did not finish within {:?}, aborting", grace);
                handle.abort();
            }
        }
        set.context.finish_retries().await;

        let drained = self.queue.drain().await;
        if !drained.is_empty() {
            info!("🗑️ Failing {} queued requests on shutdown", drained.len());
        }
        for queued in drained {
            let _ = queued.item.responder.send(Err(GatewayError::ShuttingDown));
        }

        self.pool.stop().await;
        self.websocket.close_all().await;
        info!("✅ API Manager stopped");
    }

    /// Queue a request and wait for its final outcome
    pub async fn submit(&self, request: ApiRequest) -> Result<ApiResponse> {
        if !self.is_running().await {
            return Err(GatewayError::NotRunning);
        }
        if request.signed && self.signer.is_none() {
            return Err(GatewayError::Signing("no API credentials configured".into()));
        }

        let weight = request
            .weight
            .unwrap_or_else(|| self.ledger.config().weight_for(&request.path));
        self.ledger.check_weight(weight)?;

        let timeout = request.timeout;
        let priority = request.priority;
        debug!("📨 Submitting {} {} [{}] weight {}", request.method, request.path, priority, weight);

        let (tx, rx) = oneshot::channel();
        self.queue
            .push(priority, PendingRequest::new(request, weight, tx))
            .await
            .map_err(|rejected| rejected.error)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // responder dropped by an aborted worker
            Ok(Err(_)) => Err(GatewayError::ShuttingDown),
            Err(_) => Err(GatewayError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Submit every request concurrently under one shared timeout.
    /// One result per request, in order.
    pub async fn submit_batch(
        &self,
        requests: Vec<ApiRequest>,
        timeout: Duration,
    ) -> Vec<Result<ApiResponse>> {
        let futures = requests
            .into_iter()
            .map(|request| self.submit(request.timeout(timeout)));
        futures::future::join_all(futures).await
    }

    pub async fn get_account_balance(&self) -> Result<ApiResponse> {
        self.submit(ApiRequest::account("/fapi/v2/balance")).await
    }

    pub async fn get_position_info(&self, symbol: Option<&str>) -> Result<ApiResponse> {
        let mut request = ApiRequest::account("/fapi/v2/positionRisk");
        if let Some(symbol) = symbol {
            request = request.param("symbol", symbol);
        }
        self.submit(request).await
    }

    /// Place an order. A price makes it a GTC limit order.
    pub async fn create_order(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: &str,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<ApiResponse> {
        let mut request = ApiRequest::order(HttpMethod::Post, "/fapi/v1/order")
            .param("symbol", symbol)
            .param("side", side)
            .param("type", order_type)
            .param("quantity", quantity);
        if let Some(price) = price {
            request = request.param("price", price).param("timeInForce", "GTC");
        }
        self.submit(request).await
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<ApiResponse> {
        let request = ApiRequest::order(HttpMethod::Delete, "/fapi/v1/order")
            .param("symbol", symbol)
            .param("orderId", order_id)
            .priority(RequestPriority::Critical);
        self.submit(request).await
    }

    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<ApiResponse> {
        let request = ApiRequest::market_data("/fapi/v1/klines")
            .param("symbol", symbol)
            .param("interval", interval)
            .param("limit", limit)
            .weight(kline_weight(limit));
        self.submit(request).await
    }

    /// Latest price for one symbol, or for all symbols at a higher weight
    pub async fn get_ticker_price(&self, symbol: Option<&str>) -> Result<ApiResponse> {
        let request = ApiRequest::market_data("/fapi/v1/ticker/price");
        let request = match symbol {
            Some(symbol) => request.param("symbol", symbol).weight(1),
            None => request.weight(2),
        };
        self.submit(request).await
    }

    pub async fn subscribe_stream(
        &self,
        stream: &str,
        callback: StreamCallback,
        auto_reconnect: bool,
    ) -> Result<String> {
        self.websocket.subscribe(stream, callback, auto_reconnect).await
    }

    pub async fn unsubscribe_stream(&self, id: &str) -> Result<()> {
        self.websocket.unsubscribe(id).await
    }

    /// Read-only snapshot of every component
    pub async fn get_metrics(&self) -> GatewayMetrics {
        let workers = self
            .workers
            .lock()
            .await
            .as_ref()
            .map(|set| set.handles.len());

        GatewayMetrics {
            uptime_secs: self.created_at.elapsed().as_secs(),
            running: workers.is_some(),
            workers: workers.unwrap_or(0),
            circuits: self.breakers.snapshot(),
            endpoints: self.registry.snapshot(),
            rate_limiter: self.ledger.stats().await,
            api: self.metrics.snapshot(),
            queue_depth: self.queue.depth().await,
            pool: self.pool.stats().await,
            streams: self.websocket.subscriptions().await,
            profile: self
                .profiler
                .as_ref()
                .map(|p| p.snapshot())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMetrics {
    pub uptime_secs: u64,
    pub running: bool,
    pub workers: usize,
    pub circuits: BTreeMap<String, CircuitState>,
    pub endpoints: Vec<EndpointSnapshot>,
    pub rate_limiter: RateLimitStats,
    pub api: ApiMetricsSnapshot,
    pub queue_depth: QueueDepth,
    pub pool: PoolStats,
    pub streams: Vec<SubscriptionInfo>,
    pub profile: BTreeMap<String, ProfileEntry>,
}

impl std::fmt::Display for GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "📊 Gateway up {}s, {} ({} workers)",
            self.uptime_secs,
            if self.running { "running" } else { "stopped" },
            self.workers
        )?;
        writeln!(f, "   API: {}", self.api)?;
        writeln!(f, "   Rate limits: {}", self.rate_limiter)?;
        writeln!(
            f,
            "   Queue: {} critical, {} high, {} normal, {} low",
            self.queue_depth.critical,
            self.queue_depth.high,
            self.queue_depth.normal,
            self.queue_depth.low
        )?;
        writeln!(f, "   Pool: {}", self.pool)?;
        for endpoint in &self.endpoints {
            writeln!(f, "   Endpoint {}", endpoint)?;
        }
        for stream in &self.streams {
            writeln!(
                f,
                "   Stream {} [{:?}] {} messages, {} reconnects",
                stream.stream, stream.status, stream.messages_received, stream.reconnects
            )?;
        }
        for (path, entry) in &self.profile {
            writeln!(
                f,
                "   {} {} calls, {} errors, avg {:.1}ms, max {}ms",
                path, entry.calls, entry.errors, entry.avg_ms, entry.max_ms
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockExchange;
    use serde_json::json;

    fn test_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.endpoints.rest_endpoints = vec!["https://primary.test".into()];
        config.pool.min_connections = 1;
        config.pool.max_connections = 2;
        config.rate_limits.base_request_interval_ms = 0;
        config.dispatcher.dequeue_poll_ms = 10;
        config
    }

    fn manager_with(mock: &MockExchange, config: GatewayConfig) -> ApiManager {
        ApiManager::builder(config)
            .connector(Arc::new(mock.clone()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_kline_weight_table() {
        assert_eq!(kline_weight(50), 1);
        assert_eq!(kline_weight(100), 2);
        assert_eq!(kline_weight(499), 2);
        assert_eq!(kline_weight(500), 5);
        assert_eq!(kline_weight(1000), 5);
        assert_eq!(kline_weight(1500), 10);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = test_config();
        config.pool.min_connections = 3;
        config.pool.max_connections = 1;
        assert!(ApiManager::builder(config).build().is_err());
    }

    #[tokio::test]
    async fn test_submit_requires_running_manager() {
        let mock = MockExchange::new();
        let manager = manager_with(&mock, test_config());

        let err = manager
            .submit(ApiRequest::market_data("/fapi/v1/time"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotRunning));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_signed_request_without_credentials_fails_fast() {
        let mock = MockExchange::new();
        let manager = manager_with(&mock, test_config());
        manager.start(1).await.unwrap();

        let err = manager.get_account_balance().await.unwrap_err();
        assert!(matches!(err, GatewayError::Signing(_)));
        assert_eq!(mock.call_count(), 0);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_oversized_weight_rejected_before_queueing() {
        let mock = MockExchange::new();
        let mut config = test_config();
        config.rate_limits.weight_per_second = 5;
        let manager = manager_with(&mock, config);
        manager.start(1).await.unwrap();

        let err = manager.get_klines("BTCUSDT", "1m", 1500).await.unwrap_err();
        assert!(matches!(err, GatewayError::WeightExceedsLimit { weight: 10, .. }));
        assert_eq!(manager.get_metrics().await.queue_depth.total(), 0);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_ticker_wrapper_round_trip() {
        let mock = MockExchange::new();
        mock.set_reply(
            "/fapi/v1/ticker/price",
            json!({"symbol": "BTCUSDT", "price": "50000.0"}),
        );
        let manager = manager_with(&mock, test_config());
        manager.start(2).await.unwrap();

        let response = manager.get_ticker_price(Some("BTCUSDT")).await.unwrap();
        assert_eq!(response.data["price"], "50000.0");
        assert_eq!(response.endpoint, "https://primary.test");
        assert_eq!(response.retries, 0);

        let calls = mock.recorded_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].param("symbol"), Some("BTCUSDT"));

        let metrics = manager.get_metrics().await;
        assert!(metrics.running);
        assert_eq!(metrics.workers, 2);
        assert_eq!(metrics.api.successful_requests, 1);

        manager.stop().await;
        assert!(!manager.get_metrics().await.running);
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let mock = MockExchange::new();
        let manager = manager_with(&mock, test_config());
        manager.start(2).await.unwrap();
        manager.start(4).await.unwrap();
        assert_eq!(manager.get_metrics().await.workers, 2);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_metrics_display_mentions_components() {
        let mock = MockExchange::new();
        let manager = manager_with(&mock, test_config());
        let text = manager.get_metrics().await.to_string();
        assert!(text.contains("stopped"));
        assert!(text.contains("Pool:"));
        assert!(text.contains("https://primary.test"));
    }
}
