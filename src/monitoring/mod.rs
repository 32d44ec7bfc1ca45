//! Monitoring Module
//!
//! Request outcome counters and the aggregated gateway metrics snapshot.

pub mod metrics;

pub use metrics::{ApiMetrics, ApiMetricsSnapshot};
