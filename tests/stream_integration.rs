use exchange_gateway::api::ApiManager;
use exchange_gateway::config::GatewayConfig;
use exchange_gateway::error::GatewayError;
use exchange_gateway::testing::{LocalStreamServer, MockExchange};
use exchange_gateway::websocket::{ConnectionStatus, StreamCallback};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn manager_for(server: &LocalStreamServer) -> ApiManager {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = GatewayConfig::default();
    config.endpoints.rest_endpoints = vec!["https://primary.test".into()];
    config.pool.min_connections = 1;
    config.websocket.endpoints = vec![server.url()];
    config.websocket.connect_timeout_ms = 2_000;
    config.websocket.initial_reconnect_delay_ms = 50;
    config.websocket.max_reconnect_delay_ms = 200;
    ApiManager::builder(config)
        .connector(Arc::new(MockExchange::new()))
        .build()
        .unwrap()
}

fn collecting_callback() -> (StreamCallback, Arc<Mutex<Vec<Value>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let callback: StreamCallback = Arc::new(move |msg: Value| {
        sink.lock().unwrap().push(msg);
        Ok(())
    });
    (callback, received)
}

async fn wait_for<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn forcibly_closed_stream_reconnects_and_keeps_delivering() {
    let server = LocalStreamServer::start(Duration::from_millis(20), Some(3))
        .await
        .unwrap();
    let manager = manager_for(&server);
    let (callback, received) = collecting_callback();

    let id = manager
        .subscribe_stream("btcusdt@aggTrade", callback, true)
        .await
        .unwrap();

    let second_connection_seen = wait_for(
        || {
            received
                .lock()
                .unwrap()
                .iter()
                .any(|msg| msg["conn"].as_u64() == Some(1))
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(second_connection_seen, "callback stopped after the forced close");
    assert!(server.connections() >= 2);

    let streams = manager.get_metrics().await.streams;
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].id, id);
    assert!(streams[0].reconnects >= 1);
    assert!(streams[0].messages_received >= 4);

    manager.unsubscribe_stream(&id).await.unwrap();
    assert!(manager.get_metrics().await.streams.is_empty());
}

#[tokio::test]
async fn callback_errors_do_not_end_the_subscription() {
    let server = LocalStreamServer::start(Duration::from_millis(10), None)
        .await
        .unwrap();
    let manager = manager_for(&server);

    let seen = Arc::new(Mutex::new(0u32));
    let counter = seen.clone();
    let callback: StreamCallback = Arc::new(move |_msg: Value| {
        *counter.lock().unwrap() += 1;
        anyhow::bail!("subscriber rejected message")
    });

    let id = manager
        .subscribe_stream("ethusdt@trade", callback, false)
        .await
        .unwrap();
    assert!(wait_for(|| *seen.lock().unwrap() >= 5, Duration::from_secs(5)).await);

    let streams = manager.get_metrics().await.streams;
    assert_eq!(streams[0].status, ConnectionStatus::Connected);
    assert_eq!(streams[0].reconnects, 0);

    manager.unsubscribe_stream(&id).await.unwrap();
}

#[tokio::test]
async fn unsubscribe_unknown_id_is_an_error() {
    let server = LocalStreamServer::start(Duration::from_millis(50), None)
        .await
        .unwrap();
    let manager = manager_for(&server);

    let err = manager.unsubscribe_stream("missing").await.unwrap_err();
    assert!(matches!(err, GatewayError::SubscriptionNotFound(_)));
}

#[tokio::test]
async fn stop_closes_every_stream() {
    let server = LocalStreamServer::start(Duration::from_millis(20), None)
        .await
        .unwrap();
    let manager = manager_for(&server);
    manager.start(1).await.unwrap();

    for stream in ["a@trade", "b@trade"] {
        let (callback, _) = collecting_callback();
        manager.subscribe_stream(stream, callback, true).await.unwrap();
    }
    assert_eq!(manager.get_metrics().await.streams.len(), 2);

    manager.stop().await;
    assert!(manager.get_metrics().await.streams.is_empty());
}

#[tokio::test]
async fn permanently_failed_stream_is_removed() {
    let server = LocalStreamServer::start(Duration::from_millis(10), Some(2))
        .await
        .unwrap();
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = GatewayConfig::default();
    config.endpoints.rest_endpoints = vec!["https://primary.test".into()];
    config.websocket.endpoints = vec![server.url()];
    config.websocket.initial_reconnect_delay_ms = 20;
    config.websocket.max_reconnection_attempts = 1;
    let manager = ApiManager::builder(config)
        .connector(Arc::new(MockExchange::new()))
        .build()
        .unwrap();

    let (callback, _) = collecting_callback();
    let id = manager
        .subscribe_stream("btcusdt@aggTrade", callback, true)
        .await
        .unwrap();
    drop(server);

    let removed = wait_for_streams(&manager, 0, Duration::from_secs(3)).await;
    assert!(removed, "failed subscription still listed");
    assert!(matches!(
        manager.unsubscribe_stream(&id).await,
        Err(GatewayError::SubscriptionNotFound(_))
    ));
}

async fn wait_for_streams(manager: &ApiManager, count: usize, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if manager.get_metrics().await.streams.len() == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
