// src/api/backoff.rs
//! Retry backoff policy shared by every worker

use log::debug;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// base × multiplier^retry
    Exponential,
    /// base × retry
    Linear,
    /// base
    Fixed,
    /// base × throttle factor × retry
    Adaptive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
    /// Scale each delay by a random factor in [0.5, 1.5)
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_backoff_ms: 60_000,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `retry` (1 for the first retry)
    pub fn delay_for(&self, retry: u32, throttle_factor: f64) -> Duration {
        let base = self.base_delay_ms as f64;
        let retry = retry.max(1);

        let mut delay_ms = match self.strategy {
            BackoffStrategy::Exponential => base * self.multiplier.powi(retry as i32),
            BackoffStrategy::Linear => base * retry as f64,
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Adaptive => base * throttle_factor.max(1.0) * retry as f64,
        };

        if self.jitter {
            delay_ms *= 0.5 + fastrand::f64();
        }

        let delay = Duration::from_millis(delay_ms.min(self.max_backoff_ms as f64).max(0.0) as u64);
        debug!("🕐 Backoff {:?} for retry {} ({:?})", delay, retry, self.strategy);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: BackoffStrategy) -> BackoffConfig {
        BackoffConfig {
            strategy,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_backoff_ms: 1000,
            jitter: false,
        }
    }

    #[test]
    fn test_strategies() {
        let exp = config(BackoffStrategy::Exponential);
        assert_eq!(exp.delay_for(1, 1.0), Duration::from_millis(200));
        assert_eq!(exp.delay_for(3, 1.0), Duration::from_millis(800));
        assert_eq!(exp.delay_for(10, 1.0), Duration::from_millis(1000));

        let linear = config(BackoffStrategy::Linear);
        assert_eq!(linear.delay_for(3, 1.0), Duration::from_millis(300));

        let fixed = config(BackoffStrategy::Fixed);
        assert_eq!(fixed.delay_for(5, 4.0), Duration::from_millis(100));

        let adaptive = config(BackoffStrategy::Adaptive);
        assert_eq!(adaptive.delay_for(2, 3.0), Duration::from_millis(600));
        assert_eq!(adaptive.delay_for(2, 0.5), Duration::from_millis(200));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut cfg = config(BackoffStrategy::Fixed);
        cfg.jitter = true;

        let delays: Vec<_> = (0..50).map(|_| cfg.delay_for(1, 1.0)).collect();
        for d in &delays {
            assert!(*d >= Duration::from_millis(50));
            assert!(*d < Duration::from_millis(150));
        }
        // With jitter enabled, delays should differ
        assert!(delays.iter().any(|d| *d != delays[0]));
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let mut cfg = config(BackoffStrategy::Exponential);
        cfg.jitter = true;
        for _ in 0..50 {
            assert!(cfg.delay_for(8, 1.0) <= Duration::from_millis(1000));
        }
    }
}
