// src/testing/mock_exchange.rs
//! Mock exchange connector
//!
//! Stands in for the HTTP transport in unit and integration tests:
//! - scripted per-path replies (one-shot sequences, then sticky replies)
//! - injected latency
//! - failure switches per endpoint, for pings and for connects
//! - call recording

use crate::api::transport::{ApiCall, ApiConnection, Connector};
use crate::api::types::HttpMethod;
use crate::error::{classify_status, GatewayError, Result};
use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the mock answers for one call
#[derive(Debug, Clone)]
pub enum MockReply {
    Ok(Value),
    Status(u16, String),
    Network(String),
}

/// A call as seen by the mock
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub endpoint: String,
    pub method: HttpMethod,
    pub path: String,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl RecordedCall {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

struct MockState {
    scripted: Mutex<HashMap<String, VecDeque<MockReply>>>,
    sticky: Mutex<HashMap<String, MockReply>>,
    default_reply: Mutex<MockReply>,
    latency_ms: AtomicU64,
    failing_endpoints: Mutex<HashSet<String>>,
    fail_pings: AtomicBool,
    fail_connects: AtomicBool,
    calls: AtomicU64,
    pings: AtomicU64,
    connects: AtomicU64,
    closes: AtomicU64,
    calls_per_endpoint: Mutex<HashMap<String, u64>>,
    recorded: Mutex<Vec<RecordedCall>>,
}

#[derive(Clone)]
pub struct MockExchange {
    state: Arc<MockState>,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                scripted: Mutex::new(HashMap::new()),
                sticky: Mutex::new(HashMap::new()),
                default_reply: Mutex::new(MockReply::Ok(json!({}))),
                latency_ms: AtomicU64::new(0),
                failing_endpoints: Mutex::new(HashSet::new()),
                fail_pings: AtomicBool::new(false),
                fail_connects: AtomicBool::new(false),
                calls: AtomicU64::new(0),
                pings: AtomicU64::new(0),
                connects: AtomicU64::new(0),
                closes: AtomicU64::new(0),
                calls_per_endpoint: Mutex::new(HashMap::new()),
                recorded: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Always answer `path` with `value`
    pub fn set_reply(&self, path: &str, value: Value) {
        self.set_sticky(path, MockReply::Ok(value));
    }

    /// Always answer `path` with an HTTP error status
    pub fn set_status(&self, path: &str, status: u16, body: &str) {
        self.set_sticky(path, MockReply::Status(status, body.to_string()));
    }

    fn set_sticky(&self, path: &str, reply: MockReply) {
        if let Ok(mut sticky) = self.state.sticky.lock() {
            sticky.insert(path.to_string(), reply);
        }
    }

    /// Answer every unscripted path with `reply`
    pub fn set_default(&self, reply: MockReply) {
        if let Ok(mut default_reply) = self.state.default_reply.lock() {
            *default_reply = reply;
        }
    }

    /// One-shot replies consumed in order before the sticky reply applies
    pub fn script(&self, path: &str, replies: Vec<MockReply>) {
        if let Ok(mut scripted) = self.state.scripted.lock() {
            scripted
                .entry(path.to_string())
                .or_default()
                .extend(replies);
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every call and ping against `endpoint` fails at the transport level
    pub fn fail_endpoint(&self, endpoint: &str, failing: bool) {
        if let Ok(mut set) = self.state.failing_endpoints.lock() {
            if failing {
                set.insert(endpoint.to_string());
            } else {
                set.remove(endpoint);
            }
        }
    }

    pub fn set_fail_pings(&self, failing: bool) {
        self.state.fail_pings.store(failing, Ordering::SeqCst);
    }

    pub fn set_fail_connects(&self, failing: bool) {
        self.state.fail_connects.store(failing, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> u64 {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> u64 {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u64 {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, endpoint: &str) -> u64 {
        self.state
            .calls_per_endpoint
            .lock()
            .map(|m| m.get(endpoint).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.state
            .recorded
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl MockState {
    fn endpoint_failing(&self, endpoint: &str) -> bool {
        self.failing_endpoints
            .lock()
            .map(|set| set.contains(endpoint))
            .unwrap_or(false)
    }

    fn next_reply(&self, path: &str) -> MockReply {
        if let Ok(mut scripted) = self.scripted.lock() {
            if let Some(reply) = scripted.get_mut(path).and_then(VecDeque::pop_front) {
                return reply;
            }
        }
        if let Ok(sticky) = self.sticky.lock() {
            if let Some(reply) = sticky.get(path) {
                return reply.clone();
            }
        }
        self.default_reply
            .lock()
            .map(|r| r.clone())
            .unwrap_or(MockReply::Ok(Value::Null))
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

pub struct MockConnection {
    endpoint: String,
    state: Arc<MockState>,
}

#[async_trait]
impl ApiConnection for MockConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn execute(&self, call: &ApiCall) -> Result<Value> {
        let state = &self.state;
        state.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut per_endpoint) = state.calls_per_endpoint.lock() {
            *per_endpoint.entry(self.endpoint.clone()).or_insert(0) += 1;
        }
        if let Ok(mut recorded) = state.recorded.lock() {
            recorded.push(RecordedCall {
                endpoint: self.endpoint.clone(),
                method: call.method,
                path: call.path.clone(),
                params: call.params.clone(),
                headers: call.headers.clone(),
            });
        }

        state.simulate_latency().await;

        if state.endpoint_failing(&self.endpoint) {
            return Err(GatewayError::Network {
                endpoint: self.endpoint.clone(),
                message: "connection reset by peer".into(),
            });
        }

        debug!("🧪 Mock {} {}{}", call.method, self.endpoint, call.path);
        match state.next_reply(&call.path) {
            MockReply::Ok(value) => Ok(value),
            MockReply::Status(status, body) => {
                let retry_after = (status == 429).then_some(1000);
                Err(classify_status(status, &self.endpoint, &body, retry_after))
            }
            MockReply::Network(message) => Err(GatewayError::Network {
                endpoint: self.endpoint.clone(),
                message,
            }),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_pings.load(Ordering::SeqCst) || self.state.endpoint_failing(&self.endpoint) {
            return Err(GatewayError::Network {
                endpoint: self.endpoint.clone(),
                message: "ping failed".into(),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockExchange {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ApiConnection>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_connects.load(Ordering::SeqCst) {
            return Err(GatewayError::Network {
                endpoint: endpoint.to_string(),
                message: "connect refused".into(),
            });
        }
        Ok(Arc::new(MockConnection {
            endpoint: endpoint.to_string(),
            state: self.state.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> ApiCall {
        ApiCall {
            method: HttpMethod::Get,
            path: path.into(),
            params: Vec::new(),
            headers: Vec::new(),
            signed: false,
        }
    }

    #[tokio::test]
    async fn test_scripted_replies_then_sticky() {
        let mock = MockExchange::new();
        mock.set_reply("/p", json!({"ok": true}));
        mock.script(
            "/p",
            vec![MockReply::Status(503, "down".into()), MockReply::Network("reset".into())],
        );

        let conn = mock.connect("https://a").await.unwrap();
        assert_eq!(conn.execute(&get("/p")).await.unwrap_err().status(), Some(503));
        assert!(matches!(
            conn.execute(&get("/p")).await.unwrap_err(),
            GatewayError::Network { .. }
        ));
        assert_eq!(conn.execute(&get("/p")).await.unwrap(), json!({"ok": true}));
        assert_eq!(mock.call_count(), 3);
        assert_eq!(mock.calls_to("https://a"), 3);
    }

    #[tokio::test]
    async fn test_failure_switches() {
        let mock = MockExchange::new();
        let conn = mock.connect("https://a").await.unwrap();

        mock.fail_endpoint("https://a", true);
        assert!(conn.ping().await.is_err());
        assert!(conn.execute(&get("/x")).await.is_err());

        mock.fail_endpoint("https://a", false);
        assert!(conn.ping().await.is_ok());

        mock.set_fail_connects(true);
        assert!(mock.connect("https://a").await.is_err());
        assert_eq!(mock.connect_count(), 2);
    }
}
