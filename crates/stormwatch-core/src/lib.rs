pub mod config;
pub mod error;

pub use config::{
    CacheBackend, CacheConfig, Config, LocationConfig, ValidationResult, WeatherConfig,
    MAX_FORECAST_DAYS,
};
pub use error::{NetworkError, ReqwestErrorExt, RusqliteErrorExt, StorageError};

use anyhow::Result;

/// Initialize logging for the process
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;

    tracing::debug!("Stormwatch core initialized");
    Ok(())
}
