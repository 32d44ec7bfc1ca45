pub mod api;
pub mod config;
pub mod error;
pub mod monitoring; // Request counters and latency
pub mod testing; // Mock exchange and local stream server
pub mod utils;
pub mod websocket;

// Re-export the main entry points for easy access
pub use api::{ApiManager, ApiRequest, ApiResponse, GatewayMetrics, RequestPriority};
pub use config::{load_config, GatewayConfig};
pub use error::{GatewayError, Result};
