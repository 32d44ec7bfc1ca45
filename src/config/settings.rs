// src/config/settings.rs
use crate::api::backoff::{BackoffConfig, BackoffStrategy};
use crate::api::circuit_breaker::CircuitBreakerConfig;
use crate::api::connection_pool::PoolConfig;
use crate::api::dispatcher::DispatcherConfig;
use crate::api::queue::QueueConfig;
use crate::api::rate_limiter::RateLimitConfig;
use crate::error::{GatewayError, Result};
use crate::websocket::WebSocketConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// REST endpoint candidates, primary first
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub rest_endpoints: Vec<String>,
    pub request_timeout_ms: u64,
    /// Path used for warm-up calls and health checks
    pub ping_path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            rest_endpoints: vec!["https://fapi.binance.com".to_string()],
            request_timeout_ms: 10_000,
            ping_path: "/fapi/v1/ping".to_string(),
        }
    }
}

/// API key pair. The secret is never printed or serialized.
#[derive(Clone, Deserialize, Serialize)]
pub struct ApiCredentials {
    pub api_key: String,
    #[serde(skip_serializing, default)]
    api_secret: String,
}

impl ApiCredentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn expose_secret(&self) -> &str {
        &self.api_secret
    }
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let key_hint = if self.api_key.len() > 4 {
            format!("{}…", &self.api_key[..4])
        } else {
            "****".to_string()
        };
        f.debug_struct("ApiCredentials")
            .field("api_key", &key_hint)
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub endpoints: EndpointConfig,
    pub rate_limits: RateLimitConfig,
    pub backoff: BackoffConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub queue: QueueConfig,
    pub pool: PoolConfig,
    pub dispatcher: DispatcherConfig,
    pub websocket: WebSocketConfig,
    pub credentials: Option<ApiCredentials>,
    pub recv_window_ms: Option<u64>,
    /// TTL of the response cache layer, disabled when unset
    pub cache_ttl_ms: Option<u64>,
    pub profile_calls: bool,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|s| {
        s.split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect()
    })
}

fn parse_strategy(value: &str) -> Option<BackoffStrategy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "exponential" => Some(BackoffStrategy::Exponential),
        "linear" => Some(BackoffStrategy::Linear),
        "fixed" => Some(BackoffStrategy::Fixed),
        "adaptive" => Some(BackoffStrategy::Adaptive),
        _ => None,
    }
}

impl GatewayConfig {
    /// Defaults overridden by any `GATEWAY_*` variable that parses
    pub fn from_env() -> Self {
        let d = GatewayConfig::default();

        let endpoints = EndpointConfig {
            rest_endpoints: env_list("GATEWAY_REST_ENDPOINTS").unwrap_or(d.endpoints.rest_endpoints),
            request_timeout_ms: env_parse("GATEWAY_REQUEST_TIMEOUT_MS")
                .unwrap_or(d.endpoints.request_timeout_ms),
            ping_path: env::var("GATEWAY_PING_PATH").unwrap_or(d.endpoints.ping_path),
        };

        let rate_limits = RateLimitConfig {
            requests_per_second: env_parse("GATEWAY_REQUESTS_PER_SECOND")
                .or(d.rate_limits.requests_per_second),
            requests_per_minute: env_parse("GATEWAY_REQUESTS_PER_MINUTE")
                .unwrap_or(d.rate_limits.requests_per_minute),
            requests_per_day: env_parse("GATEWAY_REQUESTS_PER_DAY").or(d.rate_limits.requests_per_day),
            weight_per_second: env_parse("GATEWAY_WEIGHT_PER_SECOND")
                .unwrap_or(d.rate_limits.weight_per_second),
            weight_per_minute: env_parse("GATEWAY_WEIGHT_PER_MINUTE")
                .unwrap_or(d.rate_limits.weight_per_minute),
            orders_per_second: env_parse("GATEWAY_ORDERS_PER_SECOND")
                .unwrap_or(d.rate_limits.orders_per_second),
            orders_per_day: env_parse("GATEWAY_ORDERS_PER_DAY").unwrap_or(d.rate_limits.orders_per_day),
            base_request_interval_ms: env_parse("GATEWAY_BASE_REQUEST_INTERVAL_MS")
                .unwrap_or(d.rate_limits.base_request_interval_ms),
            target_success_rate: env_parse("GATEWAY_TARGET_SUCCESS_RATE")
                .unwrap_or(d.rate_limits.target_success_rate),
            success_window_size: env_parse("GATEWAY_SUCCESS_WINDOW")
                .unwrap_or(d.rate_limits.success_window_size),
            ..d.rate_limits
        };

        let backoff = BackoffConfig {
            strategy: env::var("GATEWAY_BACKOFF_STRATEGY")
                .ok()
                .and_then(|s| parse_strategy(&s))
                .unwrap_or(d.backoff.strategy),
            base_delay_ms: env_parse("GATEWAY_BACKOFF_BASE_MS").unwrap_or(d.backoff.base_delay_ms),
            max_backoff_ms: env_parse("GATEWAY_MAX_BACKOFF_MS").unwrap_or(d.backoff.max_backoff_ms),
            jitter: env_parse("GATEWAY_BACKOFF_JITTER").unwrap_or(d.backoff.jitter),
            ..d.backoff
        };

        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: env_parse("GATEWAY_FAILURE_THRESHOLD")
                .unwrap_or(d.circuit_breaker.failure_threshold),
            recovery_timeout_ms: env_parse("GATEWAY_RECOVERY_TIMEOUT_MS")
                .unwrap_or(d.circuit_breaker.recovery_timeout_ms),
        };

        let queue = QueueConfig {
            max_queue_size: env_parse("GATEWAY_MAX_QUEUE_SIZE").unwrap_or(d.queue.max_queue_size),
            queue_timeout_ms: env_parse("GATEWAY_QUEUE_TIMEOUT_MS").unwrap_or(d.queue.queue_timeout_ms),
        };

        let pool = PoolConfig {
            min_connections: env_parse("GATEWAY_MIN_CONNECTIONS").unwrap_or(d.pool.min_connections),
            max_connections: env_parse("GATEWAY_MAX_CONNECTIONS").unwrap_or(d.pool.max_connections),
            health_check_interval_ms: env_parse("GATEWAY_HEALTH_CHECK_INTERVAL_MS")
                .unwrap_or(d.pool.health_check_interval_ms),
            health_check_timeout_ms: env_parse("GATEWAY_HEALTH_CHECK_TIMEOUT_MS")
                .unwrap_or(d.pool.health_check_timeout_ms),
            max_health_check_failures: env_parse("GATEWAY_MAX_HEALTH_CHECK_FAILURES")
                .unwrap_or(d.pool.max_health_check_failures),
            ..d.pool
        };

        let dispatcher = DispatcherConfig {
            num_workers: env_parse("GATEWAY_WORKERS").unwrap_or(d.dispatcher.num_workers),
            max_retries: env_parse("GATEWAY_MAX_RETRIES").unwrap_or(d.dispatcher.max_retries),
            ..d.dispatcher
        };

        let websocket = WebSocketConfig {
            endpoints: env_list("GATEWAY_WS_ENDPOINTS").unwrap_or(d.websocket.endpoints),
            max_reconnection_attempts: env_parse("GATEWAY_MAX_RECONNECT_ATTEMPTS")
                .unwrap_or(d.websocket.max_reconnection_attempts),
            ..d.websocket
        };

        let credentials = match (env::var("GATEWAY_API_KEY"), env::var("GATEWAY_API_SECRET")) {
            (Ok(key), Ok(secret)) if !key.is_empty() && !secret.is_empty() => {
                Some(ApiCredentials::new(key, secret))
            }
            _ => None,
        };

        GatewayConfig {
            endpoints,
            rate_limits,
            backoff,
            circuit_breaker,
            queue,
            pool,
            dispatcher,
            websocket,
            credentials,
            recv_window_ms: env_parse("GATEWAY_RECV_WINDOW_MS"),
            cache_ttl_ms: env_parse("GATEWAY_CACHE_TTL_MS"),
            profile_calls: env_parse("GATEWAY_PROFILE_CALLS").unwrap_or(false),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(GatewayError::ConfigError(msg.to_string()));

        if self.endpoints.rest_endpoints.is_empty() {
            return fail("at least one REST endpoint is required");
        }
        if self.pool.max_connections == 0 {
            return fail("pool max_connections must be positive");
        }
        if self.pool.min_connections > self.pool.max_connections {
            return fail("pool min_connections cannot exceed max_connections");
        }
        let rate = self.rate_limits.target_success_rate;
        if !(rate > 0.0 && rate <= 1.0) {
            return fail("target_success_rate must be in (0, 1]");
        }
        if self.rate_limits.weight_per_second == 0 || self.rate_limits.weight_per_minute == 0 {
            return fail("weight limits must be positive");
        }
        if self.rate_limits.requests_per_minute == 0 {
            return fail("requests_per_minute must be positive");
        }
        if self.rate_limits.endpoint_weights.values().any(|w| *w == 0) {
            return fail("endpoint weights must be positive");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return fail("failure_threshold must be positive");
        }
        if self.queue.max_queue_size == 0 {
            return fail("max_queue_size must be positive");
        }
        if self.dispatcher.num_workers == 0 {
            return fail("at least one worker is required");
        }
        Ok(())
    }

    /// Log the effective configuration, secrets redacted
    pub fn log_settings(&self) {
        log::info!("⚙️ Gateway endpoints: {:?}", self.endpoints.rest_endpoints);
        log::info!("⚙️ Stream endpoints: {:?}", self.websocket.endpoints);
        log::info!(
            "⚙️ Limits: {} req/m, weight {}/s {}/m, orders {}/s {}/d",
            self.rate_limits.requests_per_minute,
            self.rate_limits.weight_per_second,
            self.rate_limits.weight_per_minute,
            self.rate_limits.orders_per_second,
            self.rate_limits.orders_per_day
        );
        log::info!(
            "⚙️ Workers: {}, max retries: {}, backoff: {:?}, pool: [{}, {}]",
            self.dispatcher.num_workers,
            self.dispatcher.max_retries,
            self.backoff.strategy,
            self.pool.min_connections,
            self.pool.max_connections
        );
        match &self.credentials {
            Some(creds) => log::info!("⚙️ Credentials: {:?}", creds),
            None => log::info!("⚙️ No API credentials, signed endpoints disabled"),
        }
    }
}
