// src/api/types.rs
//! Request/response shapes shared by the queue, dispatcher and manager.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Default caller timeout when a request does not specify one
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request priority tiers, dequeued strictly highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RequestPriority {
    Low = 0,      // Analytics, historical data
    Normal = 1,   // Market data polling
    High = 2,     // Position and balance reads, order placement
    Critical = 3, // Cancellations, emergency exits
}

impl RequestPriority {
    pub const ALL: [RequestPriority; 4] = [
        RequestPriority::Critical,
        RequestPriority::High,
        RequestPriority::Normal,
        RequestPriority::Low,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPriority::Critical => "CRITICAL",
            RequestPriority::High => "HIGH",
            RequestPriority::Normal => "NORMAL",
            RequestPriority::Low => "LOW",
        }
    }
}

impl fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical class of a request, drives category sub-limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestCategory {
    General,
    Order,
    MarketData,
    Account,
}

impl RequestCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestCategory::General => "general",
            RequestCategory::Order => "order",
            RequestCategory::MarketData => "market_data",
            RequestCategory::Account => "account",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single call submitted to the gateway
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    pub params: Vec<(String, String)>,
    pub signed: bool,
    pub category: RequestCategory,
    pub priority: RequestPriority,
    pub timeout: Duration,
    /// Explicit weight; falls back to the configured per-path weight
    pub weight: Option<u32>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            params: Vec::new(),
            signed: false,
            category: RequestCategory::General,
            priority: RequestPriority::Normal,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            weight: None,
        }
    }

    /// Unsigned market-data read at normal priority
    pub fn market_data(path: &str) -> Self {
        Self::new(HttpMethod::Get, path).category(RequestCategory::MarketData)
    }

    /// Signed account read at high priority
    pub fn account(path: &str) -> Self {
        Self::new(HttpMethod::Get, path)
            .signed()
            .category(RequestCategory::Account)
            .priority(RequestPriority::High)
    }

    /// Signed order mutation at high priority
    pub fn order(method: HttpMethod, path: &str) -> Self {
        Self::new(method, path)
            .signed()
            .category(RequestCategory::Order)
            .priority(RequestPriority::High)
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub fn category(mut self, category: RequestCategory) -> Self {
        self.category = category;
        self
    }

    pub fn priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// Successful outcome of a submitted request
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub data: serde_json::Value,
    pub endpoint: String,
    pub latency_ms: u64,
    pub retries: u32,
}

impl ApiResponse {
    pub fn new(data: serde_json::Value, endpoint: String, latency_ms: u64, retries: u32) -> Self {
        Self {
            data,
            endpoint,
            latency_ms,
            retries,
        }
    }

    /// Deserialize the payload into a typed response
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(GatewayError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_presets() {
        let order = ApiRequest::order(HttpMethod::Post, "/fapi/v1/order");
        assert!(order.signed);
        assert_eq!(order.category, RequestCategory::Order);
        assert_eq!(order.priority, RequestPriority::High);

        let md = ApiRequest::market_data("/fapi/v1/klines").param("symbol", "BTCUSDT");
        assert!(!md.signed);
        assert_eq!(md.priority, RequestPriority::Normal);
        assert_eq!(md.params, vec![("symbol".to_string(), "BTCUSDT".to_string())]);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(RequestPriority::Critical > RequestPriority::High);
        assert!(RequestPriority::High > RequestPriority::Normal);
        assert!(RequestPriority::Normal > RequestPriority::Low);
        assert_eq!(RequestPriority::Critical.index(), 3);
    }

    #[test]
    fn test_response_parse() {
        #[derive(Deserialize)]
        struct Ticker {
            symbol: String,
        }
        let resp = ApiResponse::new(
            serde_json::json!({"symbol": "BTCUSDT", "price": "1"}),
            "https://a".into(),
            5,
            0,
        );
        let t: Ticker = resp.parse().unwrap();
        assert_eq!(t.symbol, "BTCUSDT");
    }
}
