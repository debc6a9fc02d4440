//! Open-Meteo forecast client.
//!
//! One idempotent GET per fetch, no retry. The response is validated before
//! anything downstream sees it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use stormwatch_core::{NetworkError, ReqwestErrorExt, WeatherConfig, MAX_FORECAST_DAYS};
use url::Url;

use crate::error::{FetchError, SchemaError};
use crate::types::{validate_forecast, ForecastPoint, HourlySeries, MAX_FORECAST_POINTS};

const DEFAULT_BASE_URL: &str = "https://api.open-meteo.com";
const FORECAST_PATH: &str = "v1/forecast";
const DAILY_FIELDS: &str = "weathercode,temperature_2m_max,temperature_2m_min,uv_index_max,windspeed_10m_max,precipitation_probability_max";
const HOURLY_FIELDS: &str = "precipitation,uv_index,windspeed_10m,windgusts_10m,visibility";

/// Anything that can produce a forecast for a coordinate pair.
///
/// The pipeline is generic over this so tests can substitute a scripted
/// source for the HTTP client.
pub trait ForecastSource: Send + Sync + 'static {
    fn fetch(
        &self,
        lat: &str,
        lon: &str,
    ) -> impl Future<Output = Result<ForecastResponse, FetchError>> + Send;
}

/// Open-Meteo compatible HTTP client
#[derive(Debug, Clone)]
pub struct OpenMeteoClient {
    base_url: Url,
    client: Arc<Client>,
    forecast_days: u32,
}

impl OpenMeteoClient {
    /// Client for the public Open-Meteo API without a request timeout.
    pub fn new() -> Result<Self, FetchError> {
        Self::with_base_url(DEFAULT_BASE_URL, None)
    }

    /// Client for an arbitrary Open-Meteo compatible host.
    pub fn with_base_url(base_url: &str, timeout: Option<Duration>) -> Result<Self, FetchError> {
        let base_url = Url::parse(base_url).map_err(|e| {
            FetchError::Network(NetworkError::ConnectionFailed(format!(
                "invalid base URL {base_url}: {e}"
            )))
        })?;

        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::Network(e.into_network_error()))?;

        Ok(Self {
            base_url,
            client: Arc::new(client),
            forecast_days: MAX_FORECAST_DAYS,
        })
    }

    pub fn from_config(config: &WeatherConfig) -> Result<Self, FetchError> {
        let timeout = config.request_timeout_secs.map(Duration::from_secs);
        let mut client = Self::with_base_url(&config.base_url, timeout)?;
        client.forecast_days = config.forecast_days.clamp(1, MAX_FORECAST_DAYS);
        Ok(client)
    }

    fn forecast_url(&self, lat: &str, lon: &str) -> Result<Url, FetchError> {
        let mut url = self.base_url.join(FORECAST_PATH).map_err(|e| {
            FetchError::Network(NetworkError::ConnectionFailed(e.to_string()))
        })?;
        url.query_pairs_mut()
            .append_pair("latitude", lat)
            .append_pair("longitude", lon)
            .append_pair("daily", DAILY_FIELDS)
            .append_pair("hourly", HOURLY_FIELDS)
            .append_pair("timeformat", "unixtime")
            .append_pair("timezone", "auto")
            .append_pair("forecast_days", &self.forecast_days.to_string());
        Ok(url)
    }

    async fn get_forecast(&self, lat: &str, lon: &str) -> Result<ForecastResponse, FetchError> {
        let url = self.forecast_url(lat, lon)?;
        tracing::debug!("Fetching forecast for {}, {}", lat, lon);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(ReqwestErrorExt::into_network_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(NetworkError::ServerError {
                status: status.as_u16(),
                message,
            }
            .into());
        }

        let body = response
            .text()
            .await
            .map_err(ReqwestErrorExt::into_network_error)?;
        let forecast = ForecastResponse::from_json(&body)?;

        tracing::info!(
            "Fetched {} forecast days and {} hourly values",
            forecast.daily.time.len(),
            forecast.hourly.precipitation.len()
        );
        Ok(forecast)
    }
}

impl ForecastSource for OpenMeteoClient {
    fn fetch(
        &self,
        lat: &str,
        lon: &str,
    ) -> impl Future<Output = Result<ForecastResponse, FetchError>> + Send {
        self.get_forecast(lat, lon)
    }
}

/// Validated forecast body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ForecastResponse {
    #[serde(default)]
    pub utc_offset_seconds: i32,
    pub daily: DailyBlock,
    pub hourly: HourlyBlock,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DailyBlock {
    pub time: Vec<i64>,
    #[serde(alias = "weather_code")]
    pub weathercode: Vec<i32>,
    pub temperature_2m_max: Vec<f64>,
    pub temperature_2m_min: Vec<f64>,
    pub uv_index_max: Vec<f64>,
    #[serde(alias = "wind_speed_10m_max")]
    pub windspeed_10m_max: Vec<f64>,
    pub precipitation_probability_max: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HourlyBlock {
    #[serde(default)]
    pub time: Option<Vec<i64>>,
    pub precipitation: Vec<f64>,
    pub uv_index: Vec<f64>,
    #[serde(alias = "wind_speed_10m")]
    pub windspeed_10m: Vec<f64>,
    #[serde(alias = "wind_gusts_10m")]
    pub windgusts_10m: Vec<f64>,
    pub visibility: Vec<f64>,
}

impl ForecastResponse {
    /// Parse and validate a response body.
    pub fn from_json(body: &str) -> Result<Self, SchemaError> {
        let response: Self = serde_json::from_str(body)?;
        response.validate()?;
        Ok(response)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        let daily = &self.daily;
        let days = daily.time.len();
        if days == 0 {
            return Err(SchemaError::invalid("daily.time", "empty"));
        }
        check_len("daily.weathercode", daily.weathercode.len(), days)?;
        check_len("daily.temperature_2m_max", daily.temperature_2m_max.len(), days)?;
        check_len("daily.temperature_2m_min", daily.temperature_2m_min.len(), days)?;
        check_len("daily.uv_index_max", daily.uv_index_max.len(), days)?;
        check_len("daily.windspeed_10m_max", daily.windspeed_10m_max.len(), days)?;
        check_len(
            "daily.precipitation_probability_max",
            daily.precipitation_probability_max.len(),
            days,
        )?;

        let hourly = &self.hourly;
        let hours = hourly.precipitation.len();
        if hours == 0 {
            return Err(SchemaError::invalid("hourly.precipitation", "empty"));
        }
        if let Some(time) = &hourly.time {
            check_len("hourly.time", time.len(), hours)?;
        }
        check_len("hourly.uv_index", hourly.uv_index.len(), hours)?;
        check_len("hourly.windspeed_10m", hourly.windspeed_10m.len(), hours)?;
        check_len("hourly.windgusts_10m", hourly.windgusts_10m.len(), hours)?;
        check_len("hourly.visibility", hourly.visibility.len(), hours)?;

        validate_forecast(&self.forecast_list())
    }

    /// Daily forecast, at most nine days.
    pub fn forecast_list(&self) -> Vec<ForecastPoint> {
        let d = &self.daily;
        (0..d.time.len().min(MAX_FORECAST_POINTS))
            .map(|i| ForecastPoint {
                time: d.time[i],
                temperature_max: d.temperature_2m_max[i],
                temperature_min: d.temperature_2m_min[i],
                weather_code: d.weathercode[i],
                uv_index_max: d.uv_index_max[i],
                wind_speed_max: d.windspeed_10m_max[i],
                precipitation_probability: d.precipitation_probability_max[i],
            })
            .collect()
    }

    /// Hourly series starting at the hour that contains `now`.
    ///
    /// With hourly timestamps the start is the last hour not after `now`.
    /// Without them the series is assumed to begin at local midnight and the
    /// start is the local hour of day. The start never runs past the last
    /// hour, so the result is never empty.
    pub fn hourly_from(&self, now: DateTime<Utc>) -> HourlySeries {
        let h = &self.hourly;
        let len = h.precipitation.len();
        let start = match &h.time {
            Some(times) => times
                .iter()
                .rposition(|&t| t <= now.timestamp())
                .unwrap_or(0),
            None => {
                let local = now.timestamp() + i64::from(self.utc_offset_seconds);
                usize::try_from(local.rem_euclid(86_400) / 3_600).unwrap_or(0)
            }
        }
        .min(len.saturating_sub(1));

        HourlySeries {
            precipitation: h.precipitation[start..].to_vec(),
            uv_index: h.uv_index[start..].to_vec(),
            wind_speed: h.windspeed_10m[start..].to_vec(),
            wind_gusts: h.windgusts_10m[start..].to_vec(),
            visibility: h.visibility[start..].to_vec(),
        }
    }
}

fn check_len(field: &'static str, actual: usize, expected: usize) -> Result<(), SchemaError> {
    if actual != expected {
        return Err(SchemaError::invalid(
            field,
            format!("length {actual}, expected {expected}"),
        ));
    }
    Ok(())
}
