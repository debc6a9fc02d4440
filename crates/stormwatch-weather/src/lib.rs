//! Forecast ingestion and hazard signals for Stormwatch
//!
//! Fetches Open-Meteo forecasts for a fixed point, keeps the last good
//! result in a persisted cache for up to an hour, and derives per-hour
//! hazard flags from the hourly series.

pub mod cache;
pub mod error;
pub mod freshness;
pub mod pipeline;
pub mod provider;
pub mod signals;
pub mod storage;
pub mod types;

pub use cache::{format_timestamp, CacheStore};
pub use error::{FetchError, SchemaError};
pub use freshness::{check_freshness, CacheDecision, HourlyAligner, MissReason};
pub use pipeline::{
    Clock, ForecastPipeline, ManualClock, Phase, PipelineSnapshot, RefreshHandle, SystemClock,
};
pub use provider::{ForecastResponse, ForecastSource, OpenMeteoClient};
pub use signals::{derive_hazard_signals, Comparator, ThresholdCondition};
pub use storage::{open_backend, FileBackend, KvBackend, MemoryBackend, SqliteBackend};
pub use types::*;
