// src/websocket/mod.rs

pub mod manager; // Stream subscriptions with reconnect

pub use manager::{
    ConnectionStatus, StreamCallback, SubscriptionInfo, WebSocketConfig, WebSocketManager,
};
