// src/error/mod.rs
//! Error taxonomy for the exchange gateway.
//!
//! Every failure that can come out of a dispatch attempt is a `GatewayError`.
//! Workers never match on messages: they ask the error for its `ErrorKind`
//! and decide retry vs. terminal from that alone.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Submission rejected at the edge, the queue is at capacity
    #[error("Queue full: {depth}/{capacity} pending requests")]
    QueueFull { depth: usize, capacity: usize },

    /// Request sat in the queue longer than the queue timeout
    #[error("Request waited {waited_ms}ms in queue (limit {limit_ms}ms)")]
    QueueTimeout { waited_ms: u64, limit_ms: u64 },

    /// Caller-specified overall timeout elapsed
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// No pooled connection became available in time
    #[error("Connection pool exhausted after waiting {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    /// Request weight can never fit into the configured windows
    #[error("Request weight {weight} exceeds the {window} limit of {limit}")]
    WeightExceedsLimit {
        weight: u32,
        window: String,
        limit: u32,
    },

    /// Endpoint circuit is open, request denied locally
    #[error("Circuit breaker is open for {endpoint}")]
    CircuitOpen { endpoint: String },

    /// Remote answered 429
    #[error("Rate limited by {endpoint}")]
    RateLimited {
        endpoint: String,
        retry_after_ms: Option<u64>,
    },

    /// Remote answered with a server-side error (5xx and other non-4xx codes)
    #[error("HTTP {status} from {endpoint}: {message}")]
    Http {
        status: u16,
        endpoint: String,
        message: String,
    },

    /// Remote refused the request (auth/validation 4xx other than 429)
    #[error("Request rejected by {endpoint} (HTTP {status}): {message}")]
    Rejected {
        status: u16,
        endpoint: String,
        message: String,
    },

    /// Transport-level failure: connect, reset, read timeout
    #[error("Network Error at {endpoint}: {message}")]
    Network { endpoint: String, message: String },

    /// Terminal outcome of a dispatched request, after classification
    #[error("Request to {endpoint} failed after {retries} retries: {cause}")]
    RequestFailed {
        endpoint: String,
        status: Option<u16>,
        retries: u32,
        cause: Box<GatewayError>,
    },

    #[error("Signing Error: {0}")]
    Signing(String),

    #[error("Parse Error: {0}")]
    ParseError(String),

    #[error("WebSocket Error: {0}")]
    WebSocketError(String),

    #[error("Config Error: {0}")]
    ConfigError(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Gateway is not running")]
    NotRunning,

    #[error("Gateway is shutting down")]
    ShuttingDown,

    #[error("Internal Error: {0}")]
    Internal(String),
}

/// Coarse classification used by the dispatcher's retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Local capacity: queue, pool, ledger. Never an endpoint failure.
    Capacity,
    /// Connection reset, read timeout, 5xx
    Transient,
    /// Remote 429
    RemoteRateLimited,
    /// Auth/validation 4xx
    Rejected,
    /// Local circuit breaker denial
    CircuitOpen,
    /// Caller or queue deadline
    Timeout,
    /// Everything that retrying cannot fix
    Internal,
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::ParseError(format!("JSON serialization/deserialization error: {}", err))
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::QueueFull { .. } => ErrorKind::Capacity,
            GatewayError::PoolExhausted { .. } => ErrorKind::Capacity,
            GatewayError::WeightExceedsLimit { .. } => ErrorKind::Internal,
            GatewayError::QueueTimeout { .. } => ErrorKind::Timeout,
            GatewayError::Timeout { .. } => ErrorKind::Timeout,
            GatewayError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            GatewayError::RateLimited { .. } => ErrorKind::RemoteRateLimited,
            GatewayError::Http { .. } => ErrorKind::Transient,
            GatewayError::Network { .. } => ErrorKind::Transient,
            GatewayError::Rejected { .. } => ErrorKind::Rejected,
            GatewayError::RequestFailed { cause, .. } => cause.kind(),
            GatewayError::Signing(_) => ErrorKind::Internal,
            GatewayError::ParseError(_) => ErrorKind::Internal,
            GatewayError::WebSocketError(_) => ErrorKind::Transient,
            GatewayError::ConfigError(_) => ErrorKind::Internal,
            GatewayError::SubscriptionNotFound(_) => ErrorKind::Internal,
            GatewayError::NotRunning => ErrorKind::Internal,
            GatewayError::ShuttingDown => ErrorKind::Internal,
            GatewayError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a worker may re-enqueue the request after this error
    pub fn is_retryable(&self) -> bool {
        if let GatewayError::RequestFailed { .. } = self {
            // already terminal
            return false;
        }
        matches!(
            self.kind(),
            ErrorKind::Transient
                | ErrorKind::RemoteRateLimited
                | ErrorKind::CircuitOpen
                | ErrorKind::Capacity
        )
    }

    /// Whether this outcome should count against the endpoint's breaker and
    /// failure count. Validation errors and local denials do not.
    pub fn counts_as_endpoint_failure(&self) -> bool {
        match self {
            GatewayError::RequestFailed { cause, .. } => cause.counts_as_endpoint_failure(),
            GatewayError::RateLimited { .. }
            | GatewayError::Http { .. }
            | GatewayError::Network { .. } => true,
            _ => false,
        }
    }

    /// HTTP status carried by the error, if the remote answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::RateLimited { .. } => Some(429),
            GatewayError::Http { status, .. } | GatewayError::Rejected { status, .. } => {
                Some(*status)
            }
            GatewayError::RequestFailed { status, cause, .. } => status.or_else(|| cause.status()),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        match self {
            GatewayError::CircuitOpen { endpoint }
            | GatewayError::RateLimited { endpoint, .. }
            | GatewayError::Http { endpoint, .. }
            | GatewayError::Rejected { endpoint, .. }
            | GatewayError::Network { endpoint, .. }
            | GatewayError::RequestFailed { endpoint, .. } => Some(endpoint.as_str()),
            _ => None,
        }
    }

    /// Retry count of a terminal dispatch error, zero otherwise
    pub fn retries(&self) -> u32 {
        match self {
            GatewayError::RequestFailed { retries, .. } => *retries,
            _ => 0,
        }
    }

    /// Wrap a classified attempt error into the caller-facing terminal error
    pub fn into_terminal(self, endpoint: &str, retries: u32) -> GatewayError {
        match self {
            GatewayError::RequestFailed { .. } => self,
            other => GatewayError::RequestFailed {
                endpoint: endpoint.to_string(),
                status: other.status(),
                retries,
                cause: Box::new(other),
            },
        }
    }
}

/// Map a non-success HTTP status into the taxonomy
pub fn classify_status(
    status: u16,
    endpoint: &str,
    body: &str,
    retry_after_ms: Option<u64>,
) -> GatewayError {
    match status {
        429 => GatewayError::RateLimited {
            endpoint: endpoint.to_string(),
            retry_after_ms,
        },
        400..=499 => GatewayError::Rejected {
            status,
            endpoint: endpoint.to_string(),
            message: truncate_body(body),
        },
        _ => GatewayError::Http {
            status,
            endpoint: endpoint.to_string(),
            message: truncate_body(body),
        },
    }
}

fn truncate_body(body: &str) -> String {
    const MAX_BODY_CHARS: usize = 512;
    if body.chars().count() <= MAX_BODY_CHARS {
        body.to_string()
    } else {
        let cut: String = body.chars().take(MAX_BODY_CHARS).collect();
        format!("{}...", cut)
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let e = classify_status(429, "https://a", "", Some(1000));
        assert_eq!(e.kind(), ErrorKind::RemoteRateLimited);
        assert!(e.is_retryable());
        assert!(e.counts_as_endpoint_failure());

        let e = classify_status(401, "https://a", "bad key", None);
        assert_eq!(e.kind(), ErrorKind::Rejected);
        assert!(!e.is_retryable());
        assert!(!e.counts_as_endpoint_failure());

        let e = classify_status(503, "https://a", "down", None);
        assert_eq!(e.kind(), ErrorKind::Transient);
        assert!(e.is_retryable());
        assert_eq!(e.status(), Some(503));
    }

    #[test]
    fn test_capacity_errors_are_not_endpoint_failures() {
        let e = GatewayError::PoolExhausted { waited_ms: 10 };
        assert!(e.is_retryable());
        assert!(!e.counts_as_endpoint_failure());

        let e = GatewayError::CircuitOpen {
            endpoint: "https://a".into(),
        };
        assert!(e.is_retryable());
        assert!(!e.counts_as_endpoint_failure());
    }

    #[test]
    fn test_terminal_wrapping_keeps_context() {
        let e = classify_status(502, "https://b", "gateway", None).into_terminal("https://b", 3);
        assert_eq!(e.status(), Some(502));
        assert_eq!(e.endpoint(), Some("https://b"));
        assert_eq!(e.retries(), 3);
        assert!(!e.is_retryable());
        assert_eq!(e.kind(), ErrorKind::Transient);

        // wrapping twice is a no-op
        let again = e.clone().into_terminal("https://other", 9);
        assert_eq!(again.retries(), 3);
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "x".repeat(2000);
        let e = classify_status(500, "https://a", &body, None);
        if let GatewayError::Http { message, .. } = e {
            assert!(message.len() < 600);
            assert!(message.ends_with("..."));
        } else {
            panic!("expected Http error");
        }
    }
}
