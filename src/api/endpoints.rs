// src/api/endpoints.rs
//! Endpoint Health Registry
//!
//! Static ordered list of base URLs with per-endpoint failure tracking.
//! Selection walks the list round-robin from the last used endpoint and
//! skips candidates whose circuit is open or that keep failing. When nothing
//! qualifies it fails open to the first configured endpoint.

use crate::api::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Consecutive failures after which an endpoint is skipped by selection
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone, Default)]
struct EndpointState {
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
}

pub struct EndpointRegistry {
    endpoints: Vec<String>,
    states: Vec<Mutex<EndpointState>>,
    last_used: Mutex<usize>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl EndpointRegistry {
    pub fn new(endpoints: Vec<String>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        let states = endpoints
            .iter()
            .map(|_| Mutex::new(EndpointState::default()))
            .collect();

        info!("🏊 Endpoint registry with {} candidates", endpoints.len());

        Self {
            endpoints,
            states,
            last_used: Mutex::new(0),
            breakers,
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    fn index_of(&self, endpoint: &str) -> Option<usize> {
        self.endpoints.iter().position(|e| e == endpoint)
    }

    fn consecutive_failures_at(&self, idx: usize) -> u32 {
        self.states[idx]
            .lock()
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }

    fn is_eligible(&self, idx: usize) -> bool {
        !self.breakers.is_open(&self.endpoints[idx])
            && self.consecutive_failures_at(idx) < MAX_CONSECUTIVE_FAILURES
    }

    /// Pick the endpoint for the next attempt
    pub fn select_endpoint(&self) -> Option<String> {
        if self.endpoints.is_empty() {
            return None;
        }

        let start = self.last_used.lock().map(|i| *i).unwrap_or(0);
        let count = self.endpoints.len();

        for offset in 0..count {
            let idx = (start + offset) % count;
            if self.is_eligible(idx) {
                if let Ok(mut last) = self.last_used.lock() {
                    if *last != idx {
                        info!("🔄 Switched active endpoint to {}", self.endpoints[idx]);
                    }
                    *last = idx;
                }
                return Some(self.endpoints[idx].clone());
            }
        }

        warn!(
            "⚠️ No healthy endpoint among {}, falling back to {}",
            count, self.endpoints[0]
        );
        Some(self.endpoints[0].clone())
    }

    pub fn record_success(&self, endpoint: &str) {
        if let Some(idx) = self.index_of(endpoint) {
            if let Ok(mut state) = self.states[idx].lock() {
                if state.consecutive_failures > 0 {
                    debug!("✅ {} recovered after {} failures", endpoint, state.consecutive_failures);
                }
                state.consecutive_failures = 0;
                state.total_successes += 1;
                state.last_success = Some(Instant::now());
            }
        }
    }

    pub fn record_failure(&self, endpoint: &str) {
        if let Some(idx) = self.index_of(endpoint) {
            if let Ok(mut state) = self.states[idx].lock() {
                state.consecutive_failures += 1;
                state.total_failures += 1;
                state.last_failure = Some(Instant::now());
                if state.consecutive_failures == MAX_CONSECUTIVE_FAILURES {
                    warn!(
                        "❌ {} reached {} consecutive failures, skipping in selection",
                        endpoint, state.consecutive_failures
                    );
                }
            }
        }
    }

    pub fn consecutive_failures(&self, endpoint: &str) -> u32 {
        self.index_of(endpoint)
            .map(|idx| self.consecutive_failures_at(idx))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<EndpointSnapshot> {
        let now = Instant::now();
        self.endpoints
            .iter()
            .zip(self.states.iter())
            .map(|(url, state)| {
                let state = state.lock().map(|s| s.clone()).unwrap_or_default();
                EndpointSnapshot {
                    url: url.clone(),
                    circuit: self.breakers.state(url),
                    consecutive_failures: state.consecutive_failures,
                    total_successes: state.total_successes,
                    total_failures: state.total_failures,
                    last_success_ago_secs: state
                        .last_success
                        .map(|t| now.duration_since(t).as_secs()),
                    last_failure_ago_secs: state
                        .last_failure
                        .map(|t| now.duration_since(t).as_secs()),
                }
            })
            .collect()
    }
}

/// Serializable view of one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    pub url: String,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_success_ago_secs: Option<u64>,
    pub last_failure_ago_secs: Option<u64>,
}

impl std::fmt::Display for EndpointSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} ({} consecutive failures, success: {}/{})",
            self.url,
            self.circuit,
            self.consecutive_failures,
            self.total_successes,
            self.total_successes + self.total_failures
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::circuit_breaker::CircuitBreakerConfig;

    fn registry(threshold: u32) -> EndpointRegistry {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout_ms: 60_000,
        }));
        EndpointRegistry::new(
            vec!["https://a".into(), "https://b".into(), "https://c".into()],
            breakers,
        )
    }

    #[test]
    fn test_selection_is_sticky_while_healthy() {
        let reg = registry(5);
        assert_eq!(reg.select_endpoint().as_deref(), Some("https://a"));
        assert_eq!(reg.select_endpoint().as_deref(), Some("https://a"));
    }

    #[test]
    fn test_selection_skips_failing_and_open_endpoints() {
        let reg = registry(5);
        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            reg.record_failure("https://a");
        }
        assert_eq!(reg.select_endpoint().as_deref(), Some("https://b"));

        for _ in 0..5 {
            reg.breakers().record_failure("https://b");
        }
        assert_eq!(reg.select_endpoint().as_deref(), Some("https://c"));

        // a recovered endpoint becomes eligible again once the cursor wraps
        reg.record_success("https://a");
        reg.record_failure("https://c");
        reg.record_failure("https://c");
        reg.record_failure("https://c");
        assert_eq!(reg.select_endpoint().as_deref(), Some("https://a"));
    }

    #[test]
    fn test_fails_open_to_first_endpoint() {
        let reg = registry(1);
        for url in ["https://a", "https://b", "https://c"] {
            reg.breakers().record_failure(url);
        }
        assert_eq!(reg.select_endpoint().as_deref(), Some("https://a"));
    }

    #[test]
    fn test_snapshot_reports_counts() {
        let reg = registry(5);
        reg.record_failure("https://b");
        reg.record_success("https://a");

        let snap = reg.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].total_successes, 1);
        assert_eq!(snap[1].consecutive_failures, 1);
        assert_eq!(snap[1].circuit, CircuitState::Closed);
        assert!(snap[2].last_success_ago_secs.is_none());
    }
}
