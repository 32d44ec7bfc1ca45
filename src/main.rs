// src/main.rs
use anyhow::Context;
use clap::Parser;
use exchange_gateway::api::ApiManager;
use exchange_gateway::config::load_config;
use exchange_gateway::utils::setup_logging;
use exchange_gateway::websocket::StreamCallback;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Poll ticker prices through the gateway and print its metrics
#[derive(Debug, Parser)]
#[command(name = "exchange-gateway", version)]
struct Args {
    /// Worker count, overrides GATEWAY_WORKERS
    #[arg(short, long)]
    workers: Option<usize>,

    /// Symbols to poll, comma separated
    #[arg(short, long, value_delimiter = ',', default_value = "BTCUSDT")]
    symbols: Vec<String>,

    /// Stream to subscribe to, e.g. btcusdt@aggTrade
    #[arg(long)]
    stream: Option<String>,

    /// How long to run before shutting down
    #[arg(short, long, default_value_t = 30)]
    duration_secs: u64,

    #[arg(long, default_value_t = 5)]
    poll_interval_secs: u64,

    /// Log level, overrides GATEWAY_LOG_LEVEL
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    dotenv::dotenv().ok();

    let level = args
        .log_level
        .clone()
        .or_else(|| std::env::var("GATEWAY_LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    setup_logging(&level).context("failed to initialize logging")?;
    info!("🚀 Exchange gateway starting...");

    let config = load_config().context("invalid gateway configuration")?;
    let workers = args.workers.unwrap_or(config.dispatcher.num_workers);

    let manager = Arc::new(ApiManager::new((*config).clone())?);
    manager.start(workers).await?;

    if let Some(stream) = &args.stream {
        let callback: StreamCallback = Arc::new(|msg: serde_json::Value| {
            info!("📡 {}", msg);
            Ok(())
        });
        match manager.subscribe_stream(stream, callback, true).await {
            Ok(id) => info!("📡 Subscribed to {} ({})", stream, id),
            Err(e) => warn!("⚠️ Could not subscribe to {}: {}", stream, e),
        }
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.duration_secs);
    let mut ticker = tokio::time::interval(Duration::from_secs(args.poll_interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Interrupted");
                break;
            }
        }

        let polls = args.symbols.iter().map(|symbol| {
            let manager = manager.clone();
            async move { (symbol, manager.get_ticker_price(Some(symbol.as_str())).await) }
        });
        for (symbol, result) in futures::future::join_all(polls).await {
            match result {
                Ok(response) => info!(
                    "💹 {} = {} via {} in {}ms",
                    symbol,
                    response.data["price"],
                    response.endpoint,
                    response.latency_ms
                ),
                Err(e) => error!("❌ {} price failed: {}", symbol, e),
            }
        }
    }

    println!("{}", manager.get_metrics().await);
    manager.stop().await;
    info!("✅ Exchange gateway stopped");
    Ok(())
}
