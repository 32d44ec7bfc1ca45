// src/api/transport.rs
//! Connection seam between the dispatcher and the network.
//!
//! The pool only knows `Connector` and `ApiConnection`. The production
//! implementation is reqwest over HTTPS; tests plug in the mock exchange and
//! middleware wraps either one.

use crate::api::types::HttpMethod;
use crate::error::{classify_status, GatewayError, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// One fully prepared call, parameters already signed if needed
#[derive(Debug, Clone)]
pub struct ApiCall {
    pub method: HttpMethod,
    pub path: String,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub signed: bool,
}

impl ApiCall {
    pub fn query_string(&self) -> String {
        encode_query(&self.params)
    }
}

/// Url-encode parameters in order. Signing and sending share this encoding.
pub fn encode_query(params: &[(String, String)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish()
}

/// A live handle bound to one endpoint
#[async_trait]
pub trait ApiConnection: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn execute(&self, call: &ApiCall) -> Result<Value>;

    /// Cheap liveness probe used by warm-up and health checks
    async fn ping(&self) -> Result<()>;

    async fn close(&self) {}
}

/// Factory for connections, used by the pool
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ApiConnection>>;
}

/// reqwest-backed connector
#[derive(Debug, Clone)]
pub struct HttpConnector {
    request_timeout: Duration,
    ping_path: String,
}

impl HttpConnector {
    pub fn new(request_timeout: Duration, ping_path: &str) -> Self {
        Self {
            request_timeout,
            ping_path: ping_path.to_string(),
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ApiConnection>> {
        let connection = HttpConnection::new(endpoint, self.request_timeout, &self.ping_path)?;
        Ok(Arc::new(connection))
    }
}

pub struct HttpConnection {
    client: Client,
    base_url: String,
    ping_path: String,
}

impl HttpConnection {
    pub fn new(base_url: &str, timeout: Duration, ping_path: &str) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| GatewayError::ConfigError(format!("invalid endpoint {}: {}", base_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(GatewayError::ConfigError(format!(
                "endpoint {} must be http(s)",
                base_url
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Network {
                endpoint: base_url.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            ping_path: ping_path.to_string(),
        })
    }

    fn build_url(&self, path: &str, query: Option<&str>) -> String {
        match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.base_url, path, q),
            _ => format!("{}{}", self.base_url, path),
        }
    }

    fn network_error(&self, err: reqwest::Error) -> GatewayError {
        GatewayError::Network {
            endpoint: self.base_url.clone(),
            message: err.to_string(),
        }
    }

    async fn handle_response(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();

        if status.is_success() {
            let body = response.text().await.map_err(|e| self.network_error(e))?;
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&body).map_err(GatewayError::from);
        }

        let retry_after_ms = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|secs| secs * 1000);
        let body = response.text().await.unwrap_or_default();

        Err(classify_status(
            status.as_u16(),
            &self.base_url,
            &body,
            retry_after_ms,
        ))
    }
}

#[async_trait]
impl ApiConnection for HttpConnection {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn execute(&self, call: &ApiCall) -> Result<Value> {
        let query = call.query_string();

        let mut request = match call.method {
            HttpMethod::Get => self.client.get(self.build_url(&call.path, Some(&query))),
            HttpMethod::Delete => self.client.delete(self.build_url(&call.path, Some(&query))),
            HttpMethod::Post => self
                .client
                .post(self.build_url(&call.path, None))
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(query),
            HttpMethod::Put => self
                .client
                .put(self.build_url(&call.path, None))
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(query),
        };

        for (key, value) in &call.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        debug!("📡 {} {}{}", call.method, self.base_url, call.path);
        let response = request.send().await.map_err(|e| self.network_error(e))?;
        self.handle_response(response).await
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(self.build_url(&self.ping_path, None))
            .send()
            .await
            .map_err(|e| self.network_error(e))?;
        self.handle_response(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_encode_query_preserves_order_and_escapes() {
        let q = encode_query(&params(&[("symbol", "BTCUSDT"), ("note", "a b&c")]));
        assert_eq!(q, "symbol=BTCUSDT&note=a+b%26c");
    }

    #[test]
    fn test_build_url() {
        let conn = HttpConnection::new("https://api.example.com/", Duration::from_secs(5), "/ping")
            .unwrap();
        assert_eq!(
            conn.build_url("/api/v1/time", None),
            "https://api.example.com/api/v1/time"
        );
        assert_eq!(
            conn.build_url("/api/v1/order", Some("symbol=BTCUSDT")),
            "https://api.example.com/api/v1/order?symbol=BTCUSDT"
        );
        assert_eq!(conn.endpoint(), "https://api.example.com");
    }

    #[test]
    fn test_rejects_invalid_endpoints() {
        assert!(HttpConnection::new("not a url", Duration::from_secs(1), "/ping").is_err());
        assert!(HttpConnection::new("ftp://host", Duration::from_secs(1), "/ping").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_network_error() {
        let connector = HttpConnector::new(Duration::from_millis(500), "/ping");
        let conn = connector.connect("http://127.0.0.1:9").await.unwrap();
        let err = conn.ping().await.unwrap_err();
        assert!(matches!(err, GatewayError::Network { .. }));
        assert!(err.is_retryable());
    }
}
