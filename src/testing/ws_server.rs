// src/testing/ws_server.rs
//! Local WebSocket stream server for reconnect tests

use futures_util::SinkExt;
use log::debug;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Pushes `{"seq": n, "conn": c}` to every client at a fixed interval.
/// When `close_first_after` is set, the first connection is closed by the
/// server after that many messages.
pub struct LocalStreamServer {
    addr: SocketAddr,
    connections: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl LocalStreamServer {
    pub async fn start(interval: Duration, close_first_after: Option<u64>) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));

        let counter = connections.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn_id = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut ws = match accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(e) => {
                            debug!("🧪 Handshake failed: {}", e);
                            return;
                        }
                    };

                    let mut seq = 0u64;
                    loop {
                        if conn_id == 0 && close_first_after.map_or(false, |n| seq >= n) {
                            let _ = ws.close(None).await;
                            debug!("🧪 Closed connection {} after {} messages", conn_id, seq);
                            return;
                        }
                        let payload = json!({"seq": seq, "conn": conn_id}).to_string();
                        if ws.send(Message::Text(payload)).await.is_err() {
                            return;
                        }
                        seq += 1;
                        tokio::time::sleep(interval).await;
                    }
                });
            }
        });

        Ok(Self {
            addr,
            connections,
            handle,
        })
    }

    /// Base URL to configure as a stream endpoint
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for LocalStreamServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
