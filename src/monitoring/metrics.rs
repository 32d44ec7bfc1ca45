// src/monitoring/metrics.rs
//! Request outcome counters
//!
//! Observability only: nothing in the dispatch path reads these back to make
//! decisions.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const DEFAULT_LATENCY_WINDOW: usize = 1000;

pub struct ApiMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    rate_limited_requests: AtomicU64,
    retried_requests: AtomicU64,
    queue_timeouts: AtomicU64,
    // Mutex-protected rolling window (no atomic deque)
    response_times_ms: Mutex<VecDeque<f64>>,
    window: usize,
}

impl Default for ApiMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_WINDOW)
    }
}

impl ApiMetrics {
    pub fn new(window: usize) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            rate_limited_requests: AtomicU64::new(0),
            retried_requests: AtomicU64::new(0),
            queue_timeouts: AtomicU64::new(0),
            response_times_ms: Mutex::new(VecDeque::with_capacity(window)),
            window: window.max(1),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.push_latency(latency);
    }

    /// Terminal failure delivered to a caller
    pub fn record_failure(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.push_latency(latency);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_timeout(&self) {
        self.queue_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn push_latency(&self, latency: Duration) {
        if let Ok(mut times) = self.response_times_ms.lock() {
            times.push_back(latency.as_secs_f64() * 1000.0);
            while times.len() > self.window {
                times.pop_front();
            }
        }
    }

    pub fn snapshot(&self) -> ApiMetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let successful = self.successful_requests.load(Ordering::Relaxed);
        let average_latency_ms = self
            .response_times_ms
            .lock()
            .ok()
            .filter(|t| !t.is_empty())
            .map(|t| t.iter().sum::<f64>() / t.len() as f64)
            .unwrap_or(0.0);

        ApiMetricsSnapshot {
            total_requests: total,
            successful_requests: successful,
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            rate_limited_requests: self.rate_limited_requests.load(Ordering::Relaxed),
            retried_requests: self.retried_requests.load(Ordering::Relaxed),
            queue_timeouts: self.queue_timeouts.load(Ordering::Relaxed),
            average_latency_ms,
            success_rate: if total == 0 {
                1.0
            } else {
                successful as f64 / total as f64
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limited_requests: u64,
    pub retried_requests: u64,
    pub queue_timeouts: u64,
    pub average_latency_ms: f64,
    pub success_rate: f64,
}

impl std::fmt::Display for ApiMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} requests ({} ok, {} failed, {} rate limited, {} retries, {} queue timeouts), {:.1}ms avg, {:.1}% success",
            self.total_requests,
            self.successful_requests,
            self.failed_requests,
            self.rate_limited_requests,
            self.retried_requests,
            self.queue_timeouts,
            self.average_latency_ms,
            self.success_rate * 100.0
        )
    }
}
