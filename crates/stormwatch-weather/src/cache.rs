//! Persisted forecast cache.
//!
//! Each part of a `CacheEntry` lives in its own storage slot. Every read is
//! validated; a slot that fails validation is cleared and reported as
//! absent, and a slot stored in an outdated format is rewritten in
//! canonical form as soon as it has been read.

use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, SecondsFormat, TimeZone, Utc};
use stormwatch_core::StorageError;

use crate::error::SchemaError;
use crate::storage::{KvBackend, MemoryBackend};
use crate::types::{validate_forecast, CacheEntry, ForecastPoint, HazardSignals};

type Decode<T> = fn(&str) -> Result<T, SchemaError>;
type Encode<T> = fn(&T) -> Result<String, SchemaError>;

/// A typed storage slot: key plus schema.
pub struct Slot<T> {
    pub key: &'static str,
    decode: Decode<T>,
    encode: Encode<T>,
    /// Parser that also understands older stored formats. Used instead of
    /// `decode` when present.
    legacy: Option<Decode<T>>,
}

pub const CACHED_LAT: Slot<String> = Slot {
    key: "cachedLat",
    decode: decode_coordinate,
    encode: encode_string,
    legacy: None,
};

pub const CACHED_LON: Slot<String> = Slot {
    key: "cachedLon",
    decode: decode_coordinate,
    encode: encode_string,
    legacy: None,
};

pub const LAST_UPDATED: Slot<DateTime<Utc>> = Slot {
    key: "lastUpdated",
    decode: decode_timestamp,
    encode: encode_timestamp,
    legacy: Some(decode_timestamp_or_legacy),
};

pub const FORECAST: Slot<Vec<ForecastPoint>> = Slot {
    key: "data",
    decode: decode_forecast,
    encode: encode_json,
    legacy: None,
};

pub const SIGNALS: Slot<HazardSignals> = Slot {
    key: "alerts",
    decode: decode_signals,
    encode: encode_json,
    legacy: None,
};

/// Forecast cache over any key/value backend.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn KvBackend>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// Cache with no persistence across runs.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Read and validate one slot. Never fails: storage errors and invalid
    /// contents both read as `None`.
    pub fn read<T>(&self, slot: &Slot<T>) -> Option<T> {
        let raw = match self.backend.get(slot.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Cache read of {} failed: {}", slot.key, e);
                return None;
            }
        };

        let parse = slot.legacy.unwrap_or(slot.decode);
        let value = match parse(&raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Discarding invalid cache slot {}: {}", slot.key, e);
                self.clear(slot.key);
                return None;
            }
        };

        match (slot.encode)(&value) {
            Ok(canonical) if canonical != raw => {
                tracing::debug!("Rewriting cache slot {} in canonical form", slot.key);
                if let Err(e) = self.backend.set(slot.key, &canonical) {
                    tracing::warn!("Cache rewrite of {} failed: {}", slot.key, e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Cannot re-encode cache slot {}: {}", slot.key, e),
        }

        Some(value)
    }

    pub fn write<T>(&self, slot: &Slot<T>, value: &T) -> Result<(), StorageError> {
        let encoded = (slot.encode)(value)
            .map_err(|e| StorageError::QueryFailed(format!("{}: {}", slot.key, e)))?;
        self.backend.set(slot.key, &encoded)
    }

    /// Read all five slots. The entry exists only if every slot validates;
    /// all slots are read either way so every invalid one gets cleared.
    pub fn read_entry(&self) -> Option<CacheEntry> {
        let lat = self.read(&CACHED_LAT);
        let lon = self.read(&CACHED_LON);
        let last_updated = self.read(&LAST_UPDATED);
        let forecast = self.read(&FORECAST);
        let signals = self.read(&SIGNALS);

        Some(CacheEntry {
            lat: lat?,
            lon: lon?,
            last_updated: last_updated?,
            forecast: forecast?,
            signals: signals?,
        })
    }

    /// Write-through of a complete entry. The timestamp is dropped first and
    /// written last, so an interrupted write reads back as a miss.
    pub fn write_entry(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        self.backend.remove(LAST_UPDATED.key)?;
        self.write(&FORECAST, &entry.forecast)?;
        self.write(&SIGNALS, &entry.signals)?;
        self.write(&CACHED_LAT, &entry.lat)?;
        self.write(&CACHED_LON, &entry.lon)?;
        self.write(&LAST_UPDATED, &entry.last_updated)
    }

    fn clear(&self, key: &str) {
        if let Err(e) = self.backend.remove(key) {
            tracing::warn!("Failed to clear cache slot {}: {}", key, e);
        }
    }
}

/// Canonical timestamp form: RFC 3339, UTC, millisecond precision.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Coordinates are compared verbatim against the request, so a valid slot
/// is returned exactly as stored.
fn decode_coordinate(raw: &str) -> Result<String, SchemaError> {
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(raw.to_string()),
        _ => Err(SchemaError::invalid("coordinate", format!("{raw:?}"))),
    }
}

fn encode_string(value: &String) -> Result<String, SchemaError> {
    Ok(value.clone())
}

fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>, SchemaError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SchemaError::invalid("lastUpdated", e.to_string()))
}

/// Accepts the canonical form and the old `YYYY-M-D-H` form, which was
/// written in the host's local time with hour granularity.
fn decode_timestamp_or_legacy(raw: &str) -> Result<DateTime<Utc>, SchemaError> {
    decode_timestamp(raw).or_else(|_| parse_legacy_timestamp(raw))
}

fn parse_legacy_timestamp(raw: &str) -> Result<DateTime<Utc>, SchemaError> {
    let invalid = || SchemaError::invalid("lastUpdated", format!("unrecognised {raw:?}"));

    let parts: Vec<u32> = raw
        .trim()
        .split('-')
        .map(|p| p.parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|_| invalid())?;
    let &[year, month, day, hour] = parts.as_slice() else {
        return Err(invalid());
    };

    let year = i32::try_from(year).map_err(|_| invalid())?;
    let naive = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, 0, 0))
        .ok_or_else(invalid)?;

    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.with_timezone(&Utc))
        .ok_or_else(invalid)
}

fn encode_timestamp(value: &DateTime<Utc>) -> Result<String, SchemaError> {
    Ok(format_timestamp(value))
}

fn decode_forecast(raw: &str) -> Result<Vec<ForecastPoint>, SchemaError> {
    let points: Vec<ForecastPoint> = serde_json::from_str(raw)?;
    validate_forecast(&points)?;
    Ok(points)
}

fn decode_signals(raw: &str) -> Result<HazardSignals, SchemaError> {
    let signals: HazardSignals = serde_json::from_str(raw)?;
    signals.validate()?;
    Ok(signals)
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, SchemaError> {
    Ok(serde_json::to_string(value)?)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use crate::types::PrecipitationSignal;

    fn sample_entry() -> CacheEntry {
        CacheEntry {
            lat: "52.52".to_string(),
            lon: "13.41".to_string(),
            last_updated: Utc.with_ymd_and_hms(2026, 10, 16, 9, 30, 0).unwrap(),
            forecast: vec![ForecastPoint {
                time: 1_791_151_200,
                temperature_max: 14.2,
                temperature_min: 6.1,
                weather_code: 3,
                uv_index_max: 2.5,
                wind_speed_max: 18.0,
                precipitation_probability: 10.0,
            }],
            signals: HazardSignals {
                extreme_uv: vec![false; 13],
                strong_wind: vec![false; 25],
                strong_wind_gusts: vec![false; 25],
                low_visibility: vec![true; 25],
                precipitation: PrecipitationSignal {
                    total_mm: 1.5,
                    is_underestimate: true,
                    duration_mask: vec![true; 25],
                },
            },
        }
    }

    /// Memory backend whose writes to one key fail.
    struct FailingSet {
        inner: MemoryBackend,
        key: &'static str,
    }

    impl KvBackend for FailingSet {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            if key == self.key {
                return Err(StorageError::QueryFailed("disk full".into()));
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key)
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn store_with_backend() -> (CacheStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        (CacheStore::new(backend.clone()), backend)
    }

    #[test]
    fn test_entry_round_trip() {
        let store = CacheStore::in_memory();
        let entry = sample_entry();

        store.write_entry(&entry).unwrap();
        assert_eq!(store.read_entry(), Some(entry));
    }

    #[test]
    fn test_interrupted_write_reads_as_miss() {
        let backend = Arc::new(FailingSet {
            inner: MemoryBackend::new(),
            key: "alerts",
        });
        let old = sample_entry();
        for slot in ["data", "alerts", "cachedLat", "cachedLon", "lastUpdated"] {
            let encoded = match slot {
                "data" => serde_json::to_string(&old.forecast).unwrap(),
                "alerts" => serde_json::to_string(&old.signals).unwrap(),
                "cachedLat" => old.lat.clone(),
                "cachedLon" => old.lon.clone(),
                _ => format_timestamp(&old.last_updated),
            };
            backend.inner.set(slot, &encoded).unwrap();
        }
        let store = CacheStore::new(backend.clone());
        assert_eq!(store.read_entry(), Some(old.clone()));

        let mut newer = old;
        newer.forecast[0].temperature_max = 30.0;
        newer.last_updated += chrono::Duration::hours(2);
        assert!(store.write_entry(&newer).is_err());

        assert!(store.read_entry().is_none());
        assert!(backend.get("lastUpdated").unwrap().is_none());
    }

    #[test]
    fn test_empty_store_reads_none() {
        let store = CacheStore::in_memory();
        assert!(store.read_entry().is_none());
        assert!(store.read(&LAST_UPDATED).is_none());
    }

    #[test]
    fn test_timestamp_stored_in_canonical_form() {
        let (store, backend) = store_with_backend();
        store.write_entry(&sample_entry()).unwrap();

        assert_eq!(
            backend.get("lastUpdated").unwrap().as_deref(),
            Some("2026-10-16T09:30:00.000Z")
        );
    }

    #[test]
    fn test_sub_millisecond_precision_is_normalized() {
        let store = CacheStore::in_memory();
        let mut entry = sample_entry();
        entry.last_updated = Utc.timestamp_opt(1_791_151_200, 123_456_789).unwrap();

        store.write_entry(&entry).unwrap();
        let read = store.read_entry().unwrap();
        assert_eq!(
            read.last_updated,
            Utc.timestamp_opt(1_791_151_200, 123_000_000).unwrap()
        );
        assert_eq!(read.forecast, entry.forecast);
        assert_eq!(read.signals, entry.signals);
    }

    #[test]
    fn test_legacy_timestamp_is_migrated() {
        let (store, backend) = store_with_backend();
        backend.set("lastUpdated", "2026-10-16-9").unwrap();

        let expected = Local
            .with_ymd_and_hms(2026, 10, 16, 9, 0, 0)
            .earliest()
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(store.read(&LAST_UPDATED), Some(expected));
        assert_eq!(
            backend.get("lastUpdated").unwrap(),
            Some(format_timestamp(&expected))
        );
    }

    #[test]
    fn test_offset_timestamp_is_rewritten_as_utc() {
        let (store, backend) = store_with_backend();
        backend
            .set("lastUpdated", "2026-10-16T11:30:00+02:00")
            .unwrap();

        let read = store.read(&LAST_UPDATED).unwrap();
        assert_eq!(read, Utc.with_ymd_and_hms(2026, 10, 16, 9, 30, 0).unwrap());
        assert_eq!(
            backend.get("lastUpdated").unwrap().as_deref(),
            Some("2026-10-16T09:30:00.000Z")
        );
    }

    #[test]
    fn test_unparseable_timestamp_clears_slot() {
        let (store, backend) = store_with_backend();
        for raw in ["yesterday", "2026-13-01-9", "2026-10-16", "2026-10-16-25"] {
            backend.set("lastUpdated", raw).unwrap();
            assert!(store.read(&LAST_UPDATED).is_none(), "{raw} should be rejected");
            assert!(backend.get("lastUpdated").unwrap().is_none());
        }
    }

    #[test]
    fn test_corrupted_slot_is_full_miss() {
        let (store, backend) = store_with_backend();
        store.write_entry(&sample_entry()).unwrap();
        backend.set("data", "{not json").unwrap();

        assert!(store.read_entry().is_none());
        // Only the bad slot is cleared
        assert!(backend.get("data").unwrap().is_none());
        assert!(backend.get("alerts").unwrap().is_some());
        assert!(backend.get("cachedLat").unwrap().is_some());
    }

    #[test]
    fn test_every_invalid_slot_is_cleared() {
        let (store, backend) = store_with_backend();
        store.write_entry(&sample_entry()).unwrap();
        backend.set("cachedLat", "north").unwrap();
        backend.set("alerts", r#"{"extremeUv":[]}"#).unwrap();

        assert!(store.read_entry().is_none());
        assert!(backend.get("cachedLat").unwrap().is_none());
        assert!(backend.get("alerts").unwrap().is_none());
        assert!(backend.get("cachedLon").unwrap().is_some());
    }

    #[test]
    fn test_schema_violations_are_rejected() {
        let (store, backend) = store_with_backend();

        backend.set("data", "[]").unwrap();
        assert!(store.read(&FORECAST).is_none());

        let mut signals = sample_entry().signals;
        signals.extreme_uv = vec![true; 30];
        backend
            .set("alerts", &serde_json::to_string(&signals).unwrap())
            .unwrap();
        assert!(store.read(&SIGNALS).is_none());
    }

    #[test]
    fn test_coordinate_is_kept_verbatim() {
        let (store, backend) = store_with_backend();
        backend.set("cachedLat", " 52.52 ").unwrap();

        assert_eq!(store.read(&CACHED_LAT).as_deref(), Some(" 52.52 "));
        assert_eq!(backend.get("cachedLat").unwrap().as_deref(), Some(" 52.52 "));
    }
}
