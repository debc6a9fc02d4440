//! Cache-or-fetch decision.
//!
//! # Clock injection
//! Every function takes `now` rather than reading the clock, so freshness
//! is deterministic in tests.

use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, Timelike, Utc};

use crate::cache::CacheStore;
use crate::types::{CacheEntry, LocationRequest};

/// Maximum age of a cached forecast that may still be shown.
pub const FRESHNESS_WINDOW_SECS: i64 = 60 * 60;

/// Why the cache could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// Caller asked for a refetch because the location moved.
    LocationChanged,
    /// At least one slot was missing or failed validation.
    Empty,
    /// Cached coordinates belong to another point.
    CoordinatesMismatch,
    /// Older than the freshness window.
    Expired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheDecision {
    Hit(CacheEntry),
    Miss(MissReason),
}

impl CacheDecision {
    pub fn use_cache(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn into_entry(self) -> Option<CacheEntry> {
        match self {
            Self::Hit(entry) => Some(entry),
            Self::Miss(_) => None,
        }
    }
}

/// Decide whether the cached entry can be shown for `request` at `now`.
///
/// Staleness is strictly greater than the window: an entry exactly one hour
/// old is still fresh.
pub fn check_freshness(
    store: &CacheStore,
    request: &LocationRequest,
    now: DateTime<Utc>,
) -> CacheDecision {
    if request.location_changed {
        return CacheDecision::Miss(MissReason::LocationChanged);
    }

    let Some(entry) = store.read_entry() else {
        return CacheDecision::Miss(MissReason::Empty);
    };

    if entry.lat != request.lat || entry.lon != request.lon {
        return CacheDecision::Miss(MissReason::CoordinatesMismatch);
    }

    if now - entry.last_updated > Duration::seconds(FRESHNESS_WINDOW_SECS) {
        return CacheDecision::Miss(MissReason::Expired);
    }

    CacheDecision::Hit(entry)
}

/// Fires once per wall-clock hour, one minute after the hour turns, so
/// refreshes line up with the top of the hour instead of drifting with the
/// time of the last fetch.
#[derive(Debug, Clone)]
pub struct HourlyAligner {
    last_hour: NaiveDateTime,
}

impl HourlyAligner {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            last_hour: start_of_hour(now),
        }
    }

    /// Feed the current local time; returns `true` when a refresh is due.
    pub fn poll(&mut self, now: NaiveDateTime) -> bool {
        let hour = start_of_hour(now);
        if hour > self.last_hour && now.minute() >= 1 {
            self.last_hour = hour;
            return true;
        }
        false
    }
}

fn start_of_hour(ts: NaiveDateTime) -> NaiveDateTime {
    ts.date()
        .and_time(NaiveTime::from_hms_opt(ts.hour(), 0, 0).unwrap_or_default())
}
