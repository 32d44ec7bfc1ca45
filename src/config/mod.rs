pub mod settings;

// Re-export the primary config struct and its parts
pub use settings::{ApiCredentials, EndpointConfig, GatewayConfig};

use crate::error::Result;
use std::sync::Arc;

/// Loads, validates and logs the gateway configuration.
/// `.env` is read first if present; unset variables keep their defaults.
pub fn load_config() -> Result<Arc<GatewayConfig>> {
    dotenv::dotenv().ok(); // Load .env file if present, ignore errors

    let config = GatewayConfig::from_env();
    config.validate()?;
    config.log_settings();

    Ok(Arc::new(config))
}
