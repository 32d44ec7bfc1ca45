// src/api/rate_limiter.rs
//! Weighted Rate Limit Ledger
//!
//! Tracks request count and request weight over fixed 1s / 1m / 1d windows,
//! plus the order-specific second/day sub-limits, and layers a voluntary
//! adaptive throttle on top of the hard counters:
//! - grants never exceed any configured window limit
//! - a denied attempt consumes nothing
//! - recent success rate below target slows every grant down
//! - a remote 429 doubles the slowdown immediately

use crate::api::types::RequestCategory;
use crate::error::{GatewayError, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Hard exchange limits plus adaptive-throttling tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: Option<u32>,
    pub requests_per_minute: u32,
    pub requests_per_day: Option<u32>,
    pub weight_per_second: u32,
    pub weight_per_minute: u32,
    pub orders_per_second: u32,
    pub orders_per_day: u32,
    /// Unit of the voluntary slowdown, multiplied by (throttle factor - 1)
    pub base_request_interval_ms: u64,
    pub target_success_rate: f64,
    pub success_window_size: usize,
    pub max_throttle_factor: f64,
    /// Sleep between denied acquisition attempts
    pub acquire_poll_interval_ms: u64,
    pub default_weight: u32,
    /// Per-path request weights, exact path match
    pub endpoint_weights: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let endpoint_weights = [
            ("/fapi/v1/ping", 1),
            ("/fapi/v1/time", 1),
            ("/fapi/v1/order", 1),
            ("/fapi/v1/allOpenOrders", 1),
            ("/fapi/v1/openOrders", 1),
            ("/fapi/v1/ticker/price", 1),
            ("/fapi/v1/klines", 5),
            ("/fapi/v1/depth", 10),
            ("/fapi/v2/balance", 5),
            ("/fapi/v2/account", 5),
            ("/fapi/v2/positionRisk", 5),
        ]
        .into_iter()
        .map(|(path, weight)| (path.to_string(), weight))
        .collect();

        Self {
            requests_per_second: None,
            requests_per_minute: 1200,
            requests_per_day: None,
            weight_per_second: 50,
            weight_per_minute: 1200,
            orders_per_second: 10,
            orders_per_day: 200_000,
            base_request_interval_ms: 50,
            target_success_rate: 0.95,
            success_window_size: 100,
            max_throttle_factor: 10.0,
            acquire_poll_interval_ms: 10,
            default_weight: 1,
            endpoint_weights,
        }
    }
}

impl RateLimitConfig {
    /// Configured weight for a request path
    pub fn weight_for(&self, path: &str) -> u32 {
        self.endpoint_weights
            .get(path)
            .copied()
            .unwrap_or(self.default_weight)
    }
}

/// Counters of one fixed window
#[derive(Debug, Clone)]
struct Window {
    duration: Duration,
    started: Instant,
    requests: u32,
    weight: u32,
    orders: u32,
}

impl Window {
    fn new(duration: Duration, now: Instant) -> Self {
        Self {
            duration,
            started: now,
            requests: 0,
            weight: 0,
            orders: 0,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.started) >= self.duration
    }

    /// Reset all counters at once when the boundary has been crossed
    fn roll(&mut self, now: Instant) {
        if self.expired(now) {
            self.started = now;
            self.requests = 0;
            self.weight = 0;
            self.orders = 0;
        }
    }

    fn record(&mut self, weight: u32, is_order: bool) {
        self.requests += 1;
        self.weight += weight;
        if is_order {
            self.orders += 1;
        }
    }

    /// Usage as it would be seen by the next attempt, without rolling
    fn usage(&self, now: Instant) -> WindowUsage {
        if self.expired(now) {
            WindowUsage::default()
        } else {
            WindowUsage {
                requests: self.requests,
                weight: self.weight,
                orders: self.orders,
            }
        }
    }
}

#[derive(Debug)]
struct LedgerState {
    second: Window,
    minute: Window,
    day: Window,
    granted: u64,
    denied: u64,
}

#[derive(Debug)]
struct ThrottleState {
    outcomes: VecDeque<(bool, Duration)>,
    factor: f64,
}

impl ThrottleState {
    fn success_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        let ok = self.outcomes.iter().filter(|(success, _)| *success).count();
        ok as f64 / self.outcomes.len() as f64
    }

    fn average_latency_ms(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .outcomes
            .iter()
            .map(|(_, latency)| latency.as_secs_f64() * 1000.0)
            .sum();
        total / self.outcomes.len() as f64
    }
}

/// Process-wide ledger of consumed request capacity
pub struct RateLimitLedger {
    config: RateLimitConfig,
    state: Mutex<LedgerState>,
    throttle: Mutex<ThrottleState>,
}

impl RateLimitLedger {
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();

        info!(
            "🚦 Initializing rate limit ledger: {}req/m, weight {}/s {}/m, orders {}/s {}/d",
            config.requests_per_minute,
            config.weight_per_second,
            config.weight_per_minute,
            config.orders_per_second,
            config.orders_per_day
        );

        Self {
            config,
            state: Mutex::new(LedgerState {
                second: Window::new(SECOND, now),
                minute: Window::new(MINUTE, now),
                day: Window::new(DAY, now),
                granted: 0,
                denied: 0,
            }),
            throttle: Mutex::new(ThrottleState {
                outcomes: VecDeque::new(),
                factor: 1.0,
            }),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Reject weights that no window could ever grant
    pub fn check_weight(&self, weight: u32) -> Result<()> {
        let windows = [
            ("per-second weight", self.config.weight_per_second),
            ("per-minute weight", self.config.weight_per_minute),
        ];
        for (window, limit) in windows {
            if weight > limit {
                return Err(GatewayError::WeightExceedsLimit {
                    weight,
                    window: window.to_string(),
                    limit,
                });
            }
        }
        Ok(())
    }

    /// Grant or deny one request. A grant increments every applicable
    /// counter under the same lock; a denial changes nothing but the
    /// denied tally.
    pub async fn try_acquire(&self, endpoint: &str, category: RequestCategory, weight: u32) -> bool {
        let now = Instant::now();
        let is_order = category == RequestCategory::Order;
        let mut state = self.state.lock().await;

        state.second.roll(now);
        state.minute.roll(now);
        state.day.roll(now);

        if let Some(limit) = self.first_exceeded(&state, weight, is_order) {
            state.denied += 1;
            debug!(
                "⏳ Rate limit {} reached, deferring {} request to {} (weight {})",
                limit,
                category.as_str(),
                endpoint,
                weight
            );
            return false;
        }

        state.second.record(weight, is_order);
        state.minute.record(weight, is_order);
        state.day.record(weight, is_order);
        state.granted += 1;
        true
    }

    fn first_exceeded(&self, state: &LedgerState, weight: u32, is_order: bool) -> Option<&'static str> {
        let c = &self.config;

        if let Some(limit) = c.requests_per_second {
            if state.second.requests + 1 > limit {
                return Some("requests/second");
            }
        }
        if state.minute.requests + 1 > c.requests_per_minute {
            return Some("requests/minute");
        }
        if let Some(limit) = c.requests_per_day {
            if state.day.requests + 1 > limit {
                return Some("requests/day");
            }
        }
        if state.second.weight + weight > c.weight_per_second {
            return Some("weight/second");
        }
        if state.minute.weight + weight > c.weight_per_minute {
            return Some("weight/minute");
        }
        if is_order {
            if state.second.orders + 1 > c.orders_per_second {
                return Some("orders/second");
            }
            if state.day.orders + 1 > c.orders_per_day {
                return Some("orders/day");
            }
        }
        None
    }

    /// Poll until granted, then apply the voluntary throttle delay.
    /// Returns the total time spent waiting.
    pub async fn acquire(&self, endpoint: &str, category: RequestCategory, weight: u32) -> Result<Duration> {
        self.check_weight(weight)?;

        let started = Instant::now();
        let poll = Duration::from_millis(self.config.acquire_poll_interval_ms.max(1));

        while !self.try_acquire(endpoint, category, weight).await {
            sleep(poll).await;
        }

        let delay = self.throttle_delay().await;
        if !delay.is_zero() {
            debug!("🐢 Adaptive throttle delaying {} by {:?}", endpoint, delay);
            sleep(delay).await;
        }

        Ok(started.elapsed())
    }

    /// Record the outcome of a dispatched call for adaptive throttling
    pub async fn record_outcome(&self, success: bool, latency: Duration) {
        let mut throttle = self.throttle.lock().await;
        throttle.outcomes.push_back((success, latency));
        while throttle.outcomes.len() > self.config.success_window_size.max(1) {
            throttle.outcomes.pop_front();
        }

        let rate = throttle.success_rate();
        let previous = throttle.factor;
        throttle.factor = if rate < self.config.target_success_rate {
            (previous * 1.5).min(self.config.max_throttle_factor)
        } else {
            (previous * 0.9).max(1.0)
        };

        if previous == 1.0 && throttle.factor > 1.0 {
            warn!(
                "🐢 Success rate {:.1}% below target {:.1}%, throttle factor now {:.2}",
                rate * 100.0,
                self.config.target_success_rate * 100.0,
                throttle.factor
            );
        } else if previous > 1.0 && throttle.factor == 1.0 {
            info!("✅ Adaptive throttle released (success rate {:.1}%)", rate * 100.0);
        }
    }

    /// Remote 429: escalate immediately, independent of the rolling window
    pub async fn record_rate_limited(&self) {
        let mut throttle = self.throttle.lock().await;
        throttle.factor = (throttle.factor * 2.0).min(self.config.max_throttle_factor);
        warn!(
            "🚫 Remote rate limit hit, throttle factor escalated to {:.2}",
            throttle.factor
        );
    }

    pub async fn throttle_factor(&self) -> f64 {
        self.throttle.lock().await.factor
    }

    /// Voluntary delay applied after each grant
    pub async fn throttle_delay(&self) -> Duration {
        let factor = self.throttle_factor().await;
        let ms = self.config.base_request_interval_ms as f64 * (factor - 1.0);
        Duration::from_millis(ms.max(0.0) as u64)
    }

    pub async fn success_rate(&self) -> f64 {
        self.throttle.lock().await.success_rate()
    }

    /// Current usage snapshot. Reading never rolls a window.
    pub async fn stats(&self) -> RateLimitStats {
        let now = Instant::now();
        let (second, minute, day, granted_total, denied_total) = {
            let state = self.state.lock().await;
            (
                state.second.usage(now),
                state.minute.usage(now),
                state.day.usage(now),
                state.granted,
                state.denied,
            )
        };
        let throttle = self.throttle.lock().await;

        RateLimitStats {
            second,
            minute,
            day,
            requests_per_minute_limit: self.config.requests_per_minute,
            weight_per_second_limit: self.config.weight_per_second,
            weight_per_minute_limit: self.config.weight_per_minute,
            granted_total,
            denied_total,
            throttle_factor: throttle.factor,
            success_rate: throttle.success_rate(),
            average_latency_ms: throttle.average_latency_ms(),
            samples: throttle.outcomes.len(),
        }
    }
}

/// Counters of one window as seen by the next attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowUsage {
    pub requests: u32,
    pub weight: u32,
    pub orders: u32,
}

/// Rate limiting statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStats {
    pub second: WindowUsage,
    pub minute: WindowUsage,
    pub day: WindowUsage,
    pub requests_per_minute_limit: u32,
    pub weight_per_second_limit: u32,
    pub weight_per_minute_limit: u32,
    pub granted_total: u64,
    pub denied_total: u64,
    pub throttle_factor: f64,
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub samples: usize,
}

impl std::fmt::Display for RateLimitStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} req/m, weight {}/{}/s {}/{}/m, orders {}/s {}/d, throttle x{:.2}, success {:.1}%",
            self.minute.requests,
            self.requests_per_minute_limit,
            self.second.weight,
            self.weight_per_second_limit,
            self.minute.weight,
            self.weight_per_minute_limit,
            self.second.orders,
            self.day.orders,
            self.throttle_factor,
            self.success_rate * 100.0
        )
    }
}
