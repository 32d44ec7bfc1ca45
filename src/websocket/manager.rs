// src/websocket/manager.rs
//! WebSocket stream subscriptions with automatic reconnection
//!
//! Each subscription owns one socket and one task. The task parses every
//! message as JSON and hands it to the subscriber's callback; callback errors
//! are logged and never end the stream. With auto-reconnect enabled, a
//! dropped socket is re-established with doubling backoff until the attempt
//! budget is spent, after which the subscription removes itself.

use crate::error::{GatewayError, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Subscriber callback, invoked once per parsed message
pub type StreamCallback = Arc<dyn Fn(Value) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Stream base URLs, tried in order
    pub endpoints: Vec<String>,
    pub connect_timeout_ms: u64,
    pub initial_reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub max_reconnection_attempts: u32,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["wss://fstream.binance.com/ws".to_string()],
            connect_timeout_ms: 10_000,
            initial_reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 300_000,
            max_reconnection_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug)]
struct SubscriptionState {
    status: Mutex<ConnectionStatus>,
    endpoint: Mutex<String>,
    messages: AtomicU64,
    reconnects: AtomicU32,
}

impl SubscriptionState {
    fn set_status(&self, status: ConnectionStatus) {
        if let Ok(mut s) = self.status.lock() {
            *s = status;
        }
    }

    fn status(&self) -> ConnectionStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionStatus::Failed)
    }
}

struct Subscription {
    stream: String,
    auto_reconnect: bool,
    state: Arc<SubscriptionState>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Read-only view of one subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub stream: String,
    pub endpoint: String,
    pub status: ConnectionStatus,
    pub auto_reconnect: bool,
    pub messages_received: u64,
    pub reconnects: u32,
}

enum ReadEnd {
    Closed,
    Shutdown,
}

type SubscriptionMap = Arc<RwLock<HashMap<String, Subscription>>>;

pub struct WebSocketManager {
    config: WebSocketConfig,
    subscriptions: SubscriptionMap,
}

impl WebSocketManager {
    pub fn new(config: WebSocketConfig) -> Self {
        Self {
            config,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Open a stream on the first endpoint that accepts it
    pub async fn subscribe(
        &self,
        stream: &str,
        callback: StreamCallback,
        auto_reconnect: bool,
    ) -> Result<String> {
        let (socket, endpoint) = connect_first(&self.config, stream).await?;
        let id = Uuid::new_v4().to_string();

        let state = Arc::new(SubscriptionState {
            status: Mutex::new(ConnectionStatus::Connected),
            endpoint: Mutex::new(endpoint.clone()),
            messages: AtomicU64::new(0),
            reconnects: AtomicU32::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // held across spawn so a failing task cannot remove itself before it is listed
        let mut subscriptions = self.subscriptions.write().await;
        let handle = tokio::spawn(run_subscription(
            self.config.clone(),
            Listing {
                id: id.clone(),
                stream: stream.to_string(),
                subscriptions: self.subscriptions.clone(),
            },
            socket,
            callback,
            auto_reconnect,
            state.clone(),
            shutdown_rx,
        ));

        info!("📡 Subscribed to {} via {} ({})", stream, endpoint, id);
        subscriptions.insert(
            id.clone(),
            Subscription {
                stream: stream.to_string(),
                auto_reconnect,
                state,
                shutdown: shutdown_tx,
                handle,
            },
        );
        Ok(id)
    }

    /// Cancel reconnection and close the socket
    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        let subscription = self
            .subscriptions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| GatewayError::SubscriptionNotFound(id.to_string()))?;

        let _ = subscription.shutdown.send(true);
        let mut handle = subscription.handle;
        if tokio::time::timeout(Duration::from_secs(2), &mut handle)
            .await
            .is_err()
        {
            handle.abort();
        }
        subscription.state.set_status(ConnectionStatus::Disconnected);
        info!("🔌 Unsubscribed from {} ({})", subscription.stream, id);
        Ok(())
    }

    pub async fn close_all(&self) {
        let ids: Vec<String> = self.subscriptions.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.unsubscribe(&id).await {
                debug!("Subscription {} already gone: {}", id, e);
            }
        }
    }

    pub async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let subs = self.subscriptions.read().await;
        let mut infos: Vec<_> = subs
            .iter()
            .map(|(id, sub)| SubscriptionInfo {
                id: id.clone(),
                stream: sub.stream.clone(),
                endpoint: sub
                    .state
                    .endpoint
                    .lock()
                    .map(|e| e.clone())
                    .unwrap_or_default(),
                status: sub.state.status(),
                auto_reconnect: sub.auto_reconnect,
                messages_received: sub.state.messages.load(Ordering::Relaxed),
                reconnects: sub.state.reconnects.load(Ordering::Relaxed),
            })
            .collect();
        infos.sort_by(|a, b| a.stream.cmp(&b.stream).then(a.id.cmp(&b.id)));
        infos
    }
}

async fn connect_first(config: &WebSocketConfig, stream: &str) -> Result<(Socket, String)> {
    let timeout = Duration::from_millis(config.connect_timeout_ms);
    let mut last_error = String::from("no stream endpoints configured");

    for endpoint in &config.endpoints {
        let url = format!("{}/{}", endpoint.trim_end_matches('/'), stream);
        match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
            Ok(Ok((socket, _))) => return Ok((socket, endpoint.clone())),
            Ok(Err(e)) => {
                warn!("❌ WebSocket connect to {} failed: {}", url, e);
                last_error = e.to_string();
            }
            Err(_) => {
                warn!("⏰ WebSocket connect to {} timed out", url);
                last_error = format!("connect to {} timed out", url);
            }
        }
    }

    Err(GatewayError::WebSocketError(format!(
        "could not open stream {}: {}",
        stream, last_error
    )))
}

fn dispatch(text: &str, callback: &StreamCallback, state: &SubscriptionState) {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => {
            state.messages.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = callback(value) {
                warn!("⚠️ Stream callback error: {}", e);
            }
        }
        Err(e) => warn!("⚠️ Unparseable stream message: {}", e),
    }
}

async fn read_until_closed(
    socket: &mut Socket,
    callback: &StreamCallback,
    state: &SubscriptionState,
    shutdown: &mut watch::Receiver<bool>,
) -> ReadEnd {
    loop {
        tokio::select! {
            msg = socket.next() => match msg {
                Some(Ok(Message::Text(text))) => dispatch(&text, callback, state),
                Some(Ok(Message::Binary(bin))) => {
                    if let Ok(text) = String::from_utf8(bin) {
                        dispatch(&text, callback, state);
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = socket.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    warn!("🔌 Stream closed by server: {:?}", frame);
                    return ReadEnd::Closed;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("❌ Stream error: {}", e);
                    return ReadEnd::Closed;
                }
                None => return ReadEnd::Closed,
            },
            _ = shutdown.changed() => {
                let _ = socket.close(None).await;
                return ReadEnd::Shutdown;
            }
        }
    }
}

/// Where a subscription task is listed, so it can delist itself
struct Listing {
    id: String,
    stream: String,
    subscriptions: SubscriptionMap,
}

async fn run_subscription(
    config: WebSocketConfig,
    listing: Listing,
    mut socket: Socket,
    callback: StreamCallback,
    auto_reconnect: bool,
    state: Arc<SubscriptionState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let initial_delay = Duration::from_millis(config.initial_reconnect_delay_ms.max(1));
    let max_delay = Duration::from_millis(config.max_reconnect_delay_ms);
    let stream = listing.stream.as_str();

    loop {
        if let ReadEnd::Shutdown = read_until_closed(&mut socket, &callback, &state, &mut shutdown).await {
            state.set_status(ConnectionStatus::Disconnected);
            return;
        }
        if !auto_reconnect {
            info!("🔌 Stream {} closed, auto-reconnect disabled", stream);
            state.set_status(ConnectionStatus::Disconnected);
            return;
        }

        state.set_status(ConnectionStatus::Reconnecting);
        let mut delay = initial_delay;
        let mut attempts = 0u32;

        socket = loop {
            if attempts >= config.max_reconnection_attempts {
                error!(
                    "❌ Stream {} failed permanently after {} reconnection attempts",
                    stream, attempts
                );
                state.set_status(ConnectionStatus::Failed);
                if listing.subscriptions.write().await.remove(&listing.id).is_some() {
                    info!("🗑️ Removed failed subscription {} ({})", stream, listing.id);
                }
                return;
            }
            attempts += 1;

            info!(
                "🔄 Reconnecting {} in {:?} (attempt {}/{})",
                stream, delay, attempts, config.max_reconnection_attempts
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    state.set_status(ConnectionStatus::Disconnected);
                    return;
                }
            }
            delay = (delay * 2).min(max_delay);

            state.set_status(ConnectionStatus::Connecting);
            match connect_first(&config, stream).await {
                Ok((socket, endpoint)) => {
                    if let Ok(mut current) = state.endpoint.lock() {
                        *current = endpoint;
                    }
                    state.reconnects.fetch_add(1, Ordering::Relaxed);
                    state.set_status(ConnectionStatus::Connected);
                    info!("✅ Stream {} reconnected", stream);
                    break socket;
                }
                Err(e) => {
                    warn!("❌ Reconnect of {} failed: {}", stream, e);
                    state.set_status(ConnectionStatus::Reconnecting);
                }
            }
        };
    }
}
