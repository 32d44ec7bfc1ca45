// src/api/mod.rs
//! API Management Module
//!
//! Outbound exchange access for production-scale operations:
//! - Sliding-window rate limit ledger with adaptive throttling
//! - Per-endpoint circuit breakers and fallback selection
//! - Connection pooling with health checks and scaling
//! - Priority request queue drained by a retrying worker pool

pub mod backoff;
pub mod circuit_breaker;
pub mod connection_pool;
pub mod dispatcher;
pub mod endpoints;
pub mod manager;
pub mod middleware;
pub mod queue;
pub mod rate_limiter;
pub mod signer;
pub mod transport;
pub mod types;

pub use backoff::{BackoffConfig, BackoffStrategy};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use connection_pool::{ConnectionPool, PoolConfig, PoolStats, ScaleAction};
pub use dispatcher::DispatcherConfig;
pub use endpoints::{EndpointRegistry, EndpointSnapshot};
pub use manager::{kline_weight, ApiManager, ApiManagerBuilder, GatewayMetrics};
pub use middleware::{CallProfiler, Layer, LayeredConnector, ResponseCache};
pub use queue::{PriorityRequestQueue, QueueConfig, QueueDepth};
pub use rate_limiter::{RateLimitConfig, RateLimitLedger, RateLimitStats};
pub use signer::{HmacSha256Signer, RequestSigner};
pub use transport::{ApiCall, ApiConnection, Connector, HttpConnector};
pub use types::{
    ApiRequest, ApiResponse, HttpMethod, OrderSide, RequestCategory, RequestPriority,
};
