// src/api/circuit_breaker.rs
//! Per-endpoint circuit breakers
//!
//! Closed → Open after `failure_threshold` consecutive failures, Open →
//! HalfOpen once the recovery timeout has elapsed since the last failure.
//! HalfOpen admits exactly one trial request; its outcome closes the circuit
//! or re-opens it.

use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,   // Normal operation
    Open,     // Failing fast
    HalfOpen, // Testing recovery
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    state: CircuitState,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            failure_count: 0,
            last_failure_time: None,
            state: CircuitState::Closed,
            trial_in_flight: false,
        }
    }

    fn recovery_elapsed(&self) -> bool {
        self.last_failure_time
            .map(|t| t.elapsed() >= self.recovery_timeout)
            .unwrap_or(true)
    }

    /// Admission check. Moves an expired Open circuit to HalfOpen and hands
    /// out the single trial slot.
    pub fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.recovery_elapsed() {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    info!("🔄 Circuit breaker: transitioning to HalfOpen for a trial request");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!("✅ Circuit breaker: trial succeeded, closing circuit");
        }
        self.failure_count = 0;
        self.state = CircuitState::Closed;
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self) {
        self.last_failure_time = Some(Instant::now());
        self.trial_in_flight = false;

        match self.state {
            CircuitState::HalfOpen => {
                self.failure_count = self.failure_threshold;
                self.state = CircuitState::Open;
                warn!("🚫 Circuit breaker: trial failed, re-opening circuit");
            }
            _ => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold && self.state != CircuitState::Open {
                    self.state = CircuitState::Open;
                    warn!(
                        "🚫 Circuit breaker: OPENED after {} failures",
                        self.failure_count
                    );
                }
            }
        }
    }

    /// Give back a trial slot that never reached the network
    pub fn release_trial(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    /// Open and still inside the recovery timeout
    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open && !self.recovery_elapsed()
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

/// One breaker per endpoint, created lazily
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, CircuitBreaker>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    fn with_breaker<R>(&self, endpoint: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut entry = self
            .breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                CircuitBreaker::new(self.config.failure_threshold, self.config.recovery_timeout())
            });
        f(entry.value_mut())
    }

    pub fn allow(&self, endpoint: &str) -> bool {
        let allowed = self.with_breaker(endpoint, |b| b.allow_request());
        if !allowed {
            debug!("🚫 Circuit open for {}, request denied locally", endpoint);
        }
        allowed
    }

    pub fn record_success(&self, endpoint: &str) {
        self.with_breaker(endpoint, |b| b.record_success());
    }

    pub fn record_failure(&self, endpoint: &str) {
        self.with_breaker(endpoint, |b| b.record_failure());
    }

    pub fn release_trial(&self, endpoint: &str) {
        self.with_breaker(endpoint, |b| b.release_trial());
    }

    pub fn is_open(&self, endpoint: &str) -> bool {
        self.breakers
            .get(endpoint)
            .map(|b| b.is_open())
            .unwrap_or(false)
    }

    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.breakers
            .get(endpoint)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(30));

        assert!(!cb.is_open());
        assert!(cb.allow_request());

        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_open());

        cb.record_failure();
        assert!(cb.is_open());
        assert!(!cb.allow_request());

        cb.record_success();
        assert!(!cb.is_open());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(20));
        cb.record_failure();
        assert!(!cb.allow_request());

        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.allow_request());

        // trial fails: back to open with the count pinned at threshold
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 1);
        assert!(!cb.allow_request());

        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.allow_request());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_released_trial_can_be_reused() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(10));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        assert!(cb.allow_request());
        cb.release_trial();
        assert!(cb.allow_request());
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_registry_tracks_endpoints_independently() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout_ms: 60_000,
        });

        registry.record_failure("https://a");
        registry.record_failure("https://a");
        registry.record_failure("https://b");

        assert!(registry.is_open("https://a"));
        assert!(!registry.allow("https://a"));
        assert!(registry.allow("https://b"));
        assert_eq!(registry.state("https://unknown"), CircuitState::Closed);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.get("https://a"), Some(&CircuitState::Open));
        assert_eq!(snapshot.get("https://b"), Some(&CircuitState::Closed));
    }
}
