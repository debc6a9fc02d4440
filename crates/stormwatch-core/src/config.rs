use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

/// Number of daily entries the forecast list can hold.
pub const MAX_FORECAST_DAYS: u32 = 9;

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add an error
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a user-friendly message summarizing all errors
    pub fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            return String::new();
        }
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application configuration directory
    pub config_dir: PathBuf,

    /// Forecast point
    #[serde(default)]
    pub location: LocationConfig,

    /// Upstream forecast provider settings
    #[serde(default)]
    pub weather: WeatherConfig,

    /// Persisted cache settings
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Coordinates of the forecast point, kept as the decimal strings the
/// cache compares against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    pub latitude: String,
    pub longitude: String,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            latitude: "52.52".to_string(),
            longitude: "13.41".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    /// Base URL of the Open-Meteo compatible forecast API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Days requested from the provider
    #[serde(default = "default_forecast_days")]
    pub forecast_days: u32,

    /// Optional HTTP timeout. Unset means a hung request stays loading.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,

    /// How often the hourly refresh task checks the wall clock
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_base_url() -> String {
    "https://api.open-meteo.com".to_string()
}

fn default_forecast_days() -> u32 {
    MAX_FORECAST_DAYS
}

fn default_poll_interval() -> u64 {
    60
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            forecast_days: default_forecast_days(),
            request_timeout_secs: None,
            poll_interval_secs: default_poll_interval(),
        }
    }
}

/// Storage backend for the forecast cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Sqlite,
    File,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,

    /// Override for the cache file location
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl CacheConfig {
    /// Resolve the on-disk location for the configured backend.
    /// Returns `None` for the in-memory backend.
    pub fn resolved_path(&self, config_dir: &Path) -> Option<PathBuf> {
        let default_name = match self.backend {
            CacheBackend::Sqlite => "weather_cache.db",
            CacheBackend::File => "weather_cache.json",
            CacheBackend::Memory => return None,
        };
        Some(
            self.path
                .clone()
                .unwrap_or_else(|| config_dir.join(default_name)),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            location: LocationConfig::default(),
            weather: WeatherConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stormwatch")
}

impl Config {
    /// Load configuration from the default file, creating it if it doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from an explicit path, creating it if it doesn't exist
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents =
            std::fs::read_to_string(config_path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration and validate it
    ///
    /// Returns the config along with any validation warnings.
    /// Returns an error if validation fails with critical errors.
    pub fn load_validated(path: Option<&Path>) -> Result<(Self, ValidationResult)> {
        let config = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::load()?,
        };
        let validation = config.validate();

        if !validation.is_valid() {
            anyhow::bail!(
                "Configuration validation failed: {}",
                validation.error_summary()
            );
        }

        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        Ok((config, validation))
    }

    /// Validate the configuration
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        self.validate_url(&self.weather.base_url, "weather.base_url", &mut result);

        validate_coordinate(
            &self.location.latitude,
            "location.latitude",
            90.0,
            &mut result,
        );
        validate_coordinate(
            &self.location.longitude,
            "location.longitude",
            180.0,
            &mut result,
        );

        match self.weather.forecast_days {
            0 => result.add_error("weather.forecast_days", "Must request at least one day"),
            d if d > 16 => result.add_error(
                "weather.forecast_days",
                "Provider serves at most 16 forecast days",
            ),
            d if d > MAX_FORECAST_DAYS => result.add_warning(
                "weather.forecast_days",
                format!("Only the first {} days are kept", MAX_FORECAST_DAYS),
            ),
            _ => {}
        }

        if self.weather.poll_interval_secs == 0 {
            result.add_error(
                "weather.poll_interval_secs",
                "Poll interval must be greater than 0",
            );
        } else if self.weather.poll_interval_secs > 3600 {
            result.add_warning(
                "weather.poll_interval_secs",
                "Poll interval over an hour will skip hourly refreshes",
            );
        }

        match self.weather.request_timeout_secs {
            Some(0) => result.add_error(
                "weather.request_timeout_secs",
                "Timeout must be greater than 0 when set",
            ),
            Some(_) => result.add_warning(
                "weather.request_timeout_secs",
                "A timeout makes slow responses fail instead of waiting for them",
            ),
            None => {}
        }

        result
    }

    /// Validate a URL field
    fn validate_url(&self, url_str: &str, field_name: &str, result: &mut ValidationResult) {
        match Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    result.add_error(
                        field_name,
                        format!("URL must use http or https scheme, got: {}", url.scheme()),
                    );
                }

                if url.host().is_none() {
                    result.add_error(field_name, "URL must have a host");
                }
            }
            Err(e) => {
                result.add_error(field_name, format!("Invalid URL: {}", e));
            }
        }
    }

    /// Save configuration to an explicit path
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get the path to the configuration file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("stormwatch");

        Ok(config_dir.join("config.toml"))
    }
}

fn validate_coordinate(value: &str, field: &str, limit: f64, result: &mut ValidationResult) {
    match value.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && (-limit..=limit).contains(&v) => {}
        Ok(_) => result.add_error(field, format!("Must be within [-{limit}, {limit}]")),
        Err(_) => result.add_error(field, format!("Not a decimal number: {:?}", value)),
    }
}
