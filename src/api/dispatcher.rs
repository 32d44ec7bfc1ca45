// src/api/dispatcher.rs
//! Worker pool draining the priority queue
//!
//! Each worker takes the next request, waits for ledger capacity, picks an
//! endpoint, checks its breaker, borrows a pooled connection and performs
//! the call. Every outcome is classified here, and only here: success and
//! terminal errors resolve the caller, retryable errors are re-enqueued after
//! a backoff delay.

use crate::api::backoff::BackoffConfig;
use crate::api::circuit_breaker::CircuitBreakerRegistry;
use crate::api::connection_pool::ConnectionPool;
use crate::api::endpoints::EndpointRegistry;
use crate::api::queue::{PriorityRequestQueue, QueuedItem};
use crate::api::rate_limiter::RateLimitLedger;
use crate::api::signer::RequestSigner;
use crate::api::transport::ApiCall;
use crate::api::types::{ApiRequest, ApiResponse};
use crate::error::{GatewayError, Result};
use crate::monitoring::ApiMetrics;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub num_workers: usize,
    pub max_retries: u32,
    /// How long an idle worker waits on the queue before re-checking shutdown
    pub dequeue_poll_ms: u64,
    /// Grace period for workers to finish in-flight calls on stop
    pub shutdown_grace_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            num_workers: 5,
            max_retries: 3,
            dequeue_poll_ms: 100,
            shutdown_grace_ms: 5_000,
        }
    }
}

/// A submitted request travelling through queue and workers
pub struct PendingRequest {
    pub request: ApiRequest,
    pub weight: u32,
    pub retries: u32,
    pub submitted_at: Instant,
    pub responder: oneshot::Sender<Result<ApiResponse>>,
}

impl PendingRequest {
    pub fn new(
        request: ApiRequest,
        weight: u32,
        responder: oneshot::Sender<Result<ApiResponse>>,
    ) -> Self {
        Self {
            request,
            weight,
            retries: 0,
            submitted_at: Instant::now(),
            responder,
        }
    }
}

/// Everything a worker needs, shared by all workers
pub struct DispatchContext {
    pub queue: Arc<PriorityRequestQueue<PendingRequest>>,
    pub ledger: Arc<RateLimitLedger>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub registry: Arc<EndpointRegistry>,
    pub pool: Arc<ConnectionPool>,
    pub metrics: Arc<ApiMetrics>,
    pub signer: Option<Arc<dyn RequestSigner>>,
    pub config: DispatcherConfig,
    pub backoff: BackoffConfig,
    pub queue_timeout: Duration,
    pub acquire_timeout: Duration,
    /// Requests sleeping in backoff before re-entering the queue
    pub retries: Mutex<JoinSet<()>>,
}

impl DispatchContext {
    /// Wait for every backoff sleeper. Called after shutdown was signalled, so
    /// sleepers resolve their callers with `ShuttingDown` or have re-queued.
    pub async fn finish_retries(&self) {
        let mut pending = std::mem::take(&mut *self.retries.lock().await);
        if !pending.is_empty() {
            debug!("⏳ Waiting for {} requests in backoff", pending.len());
        }
        while pending.join_next().await.is_some() {}
    }

    fn resolve_terminal(&self, job: PendingRequest, endpoint: Option<&str>, err: GatewayError) {
        self.metrics.record_failure(job.submitted_at.elapsed());
        let err = match endpoint {
            Some(endpoint) => err.into_terminal(endpoint, job.retries),
            None => err,
        };
        debug!("❌ {} {} failed: {}", job.request.method, job.request.path, err);
        let _ = job.responder.send(Err(err));
    }

    /// One worker's lifetime
    pub async fn run_worker(self: Arc<Self>, id: usize, mut shutdown: watch::Receiver<bool>) {
        info!("👷 Worker {} started", id);
        let poll = Duration::from_millis(self.config.dequeue_poll_ms.max(1));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                item = self.queue.pop(poll) => item,
                _ = shutdown.changed() => break,
            };

            if let Some(item) = next {
                self.process(item, &mut shutdown).await;
            }
        }

        info!("🛑 Worker {} stopped", id);
    }

    async fn process(self: &Arc<Self>, queued: QueuedItem<PendingRequest>, shutdown: &mut watch::Receiver<bool>) {
        let mut job = queued.item;

        if job.responder.is_closed() {
            debug!("🗑️ Dropping abandoned request {}", job.request.path);
            return;
        }

        let waited = queued.enqueued_at.elapsed();
        if waited > self.queue_timeout {
            warn!(
                "⏰ {} waited {}ms in queue, failing without dispatch",
                job.request.path,
                waited.as_millis()
            );
            self.metrics.record_queue_timeout();
            let err = GatewayError::QueueTimeout {
                waited_ms: waited.as_millis() as u64,
                limit_ms: self.queue_timeout.as_millis() as u64,
            };
            self.resolve_terminal(job, None, err);
            return;
        }

        // Ledger wait: never holds the queue, abandoned on caller timeout or stop
        let path = job.request.path.clone();
        let category = job.request.category;
        let acquired = tokio::select! {
            r = self.ledger.acquire(&path, category, job.weight) => r,
            _ = job.responder.closed() => {
                debug!("🗑️ Caller gave up on {} while waiting for capacity", path);
                return;
            }
            _ = shutdown.changed() => Err(GatewayError::ShuttingDown),
        };
        if let Err(err) = acquired {
            self.resolve_terminal(job, None, err);
            return;
        }

        let endpoint = match self.registry.select_endpoint() {
            Some(endpoint) => endpoint,
            None => {
                let err = GatewayError::ConfigError("no endpoints configured".into());
                self.resolve_terminal(job, None, err);
                return;
            }
        };

        if !self.breakers.allow(&endpoint) {
            let err = GatewayError::CircuitOpen {
                endpoint: endpoint.clone(),
            };
            self.handle_failure(job, endpoint, err, shutdown).await;
            return;
        }

        let client = match self.pool.acquire(&endpoint, self.acquire_timeout).await {
            Ok(client) => client,
            Err(err) => {
                if err.counts_as_endpoint_failure() {
                    self.breakers.record_failure(&endpoint);
                    self.registry.record_failure(&endpoint);
                } else {
                    self.breakers.release_trial(&endpoint);
                }
                self.handle_failure(job, endpoint, err, shutdown).await;
                return;
            }
        };

        let call = match self.prepare_call(&job.request) {
            Ok(call) => call,
            Err(err) => {
                self.pool.release(client, true).await;
                self.breakers.release_trial(&endpoint);
                self.resolve_terminal(job, Some(&endpoint), err);
                return;
            }
        };

        let started = Instant::now();
        let result = client.connection.execute(&call).await;
        let latency = started.elapsed();

        match result {
            Ok(data) => {
                self.pool.release(client, true).await;
                self.breakers.record_success(&endpoint);
                self.registry.record_success(&endpoint);
                self.ledger.record_outcome(true, latency).await;
                self.metrics.record_success(job.submitted_at.elapsed());

                debug!(
                    "✅ {} {} via {} in {}ms",
                    call.method,
                    call.path,
                    endpoint,
                    latency.as_millis()
                );
                let response =
                    ApiResponse::new(data, endpoint, latency.as_millis() as u64, job.retries);
                let _ = job.responder.send(Ok(response));
            }
            Err(err) => {
                let transport_fault = matches!(err, GatewayError::Network { .. });
                self.pool.release(client, !transport_fault).await;

                if err.counts_as_endpoint_failure() {
                    self.breakers.record_failure(&endpoint);
                    self.registry.record_failure(&endpoint);
                } else if matches!(err, GatewayError::Rejected { .. }) {
                    // the endpoint answered, the request was wrong
                    self.breakers.record_success(&endpoint);
                    self.registry.record_success(&endpoint);
                } else {
                    self.breakers.release_trial(&endpoint);
                }

                self.ledger
                    .record_outcome(!err.counts_as_endpoint_failure(), latency)
                    .await;
                if let GatewayError::RateLimited { .. } = err {
                    self.metrics.record_rate_limited();
                    self.ledger.record_rate_limited().await;
                }

                self.handle_failure(job, endpoint, err, shutdown).await;
            }
        }
    }

    fn prepare_call(&self, request: &ApiRequest) -> Result<ApiCall> {
        let mut params = request.params.clone();
        let mut headers = Vec::new();

        if request.signed {
            let signer = self
                .signer
                .as_ref()
                .ok_or_else(|| GatewayError::Signing("no API credentials configured".into()))?;
            signer.sign(&mut params, chrono::Utc::now().timestamp_millis())?;
            headers = signer.headers();
        }

        Ok(ApiCall {
            method: request.method,
            path: request.path.clone(),
            params,
            headers,
            signed: request.signed,
        })
    }

    /// Retry with backoff or resolve the caller with the terminal error
    async fn handle_failure(
        self: &Arc<Self>,
        mut job: PendingRequest,
        endpoint: String,
        err: GatewayError,
        shutdown: &watch::Receiver<bool>,
    ) {
        let retryable = err.is_retryable()
            && job.retries < self.config.max_retries
            && !job.responder.is_closed();

        if !retryable {
            self.resolve_terminal(job, Some(&endpoint), err);
            return;
        }

        job.retries += 1;
        self.metrics.record_retry();

        let mut delay = self
            .backoff
            .delay_for(job.retries, self.ledger.throttle_factor().await);
        if let GatewayError::RateLimited {
            retry_after_ms: Some(ms),
            ..
        } = &err
        {
            delay = delay
                .max(Duration::from_millis(*ms))
                .min(Duration::from_millis(self.backoff.max_backoff_ms));
        }

        warn!(
            "🔄 Retrying {} {} ({}/{}) in {:?}: {}",
            job.request.method,
            job.request.path,
            job.retries,
            self.config.max_retries,
            delay,
            err
        );

        let ctx = self.clone();
        let mut shutdown = shutdown.clone();
        let mut retries = self.retries.lock().await;
        while retries.try_join_next().is_some() {}
        retries.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = job.responder.closed() => return,
                _ = shutdown.wait_for(|stopping| *stopping) => {}
            }
            if *shutdown.borrow() {
                debug!("🛑 Dropping retry of {} on shutdown", job.request.path);
                let _ = job.responder.send(Err(GatewayError::ShuttingDown));
                return;
            }
            let priority = job.request.priority;
            if let Err(rejected) = ctx.queue.push(priority, job).await {
                ctx.resolve_terminal(rejected.item, Some(&endpoint), rejected.error);
            }
        });
    }
}
