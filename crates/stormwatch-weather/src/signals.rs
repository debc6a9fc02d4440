//! Hazard signal derivation.
//!
//! Pure functions turning hourly numeric series into per-hour booleans and a
//! precipitation aggregate. Inputs are expected to start at the current hour.

use serde::{Deserialize, Serialize};

use crate::types::{
    HazardSignals, HourlySeries, PrecipitationSignal, HAZARD_WINDOW_HOURS, UV_WINDOW_HOURS,
};

/// Dry hours tolerated inside one precipitation event.
const DRY_HOURS_IN_EVENT: u32 = 3;

/// How a series value is compared against a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    Gte,
    Lte,
    Eq,
    /// Any comparator name we do not know. Never matches.
    #[serde(other)]
    Unknown,
}

impl Comparator {
    fn matches(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gte => value >= threshold,
            Self::Lte => value <= threshold,
            Self::Eq => value == threshold,
            Self::Unknown => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdCondition {
    pub threshold: f64,
    pub comparator: Comparator,
    pub window_hours: usize,
}

/// UV index of 11 or more within the next 13 hours.
pub const EXTREME_UV: ThresholdCondition = ThresholdCondition {
    threshold: 11.0,
    comparator: Comparator::Gte,
    window_hours: UV_WINDOW_HOURS,
};

/// Sustained wind of 60 km/h or more.
pub const STRONG_WIND: ThresholdCondition = ThresholdCondition {
    threshold: 60.0,
    comparator: Comparator::Gte,
    window_hours: HAZARD_WINDOW_HOURS,
};

/// Gusts of 80 km/h or more.
pub const STRONG_GUSTS: ThresholdCondition = ThresholdCondition {
    threshold: 80.0,
    comparator: Comparator::Gte,
    window_hours: HAZARD_WINDOW_HOURS,
};

/// Visibility at or below 200 m.
pub const LOW_VISIBILITY: ThresholdCondition = ThresholdCondition {
    threshold: 200.0,
    comparator: Comparator::Lte,
    window_hours: HAZARD_WINDOW_HOURS,
};

/// Compare the first `window_hours` values of `series` against the
/// condition. A shorter series yields a shorter result; it is never padded.
pub fn derive_threshold_signal(series: &[f64], condition: &ThresholdCondition) -> Vec<bool> {
    series
        .iter()
        .take(condition.window_hours)
        .map(|&value| condition.comparator.matches(value, condition.threshold))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecipitationAggregate {
    pub total_mm: f64,
    pub is_underestimate: bool,
}

/// Running precipitation total over the first 25 hours.
///
/// Accumulation stops at the fourth consecutive dry hour, and the result is
/// flagged as an underestimate from then on. An all-dry window therefore
/// reports `0.0` flagged as an underestimate.
pub fn derive_aggregate_precipitation(series: &[f64]) -> PrecipitationAggregate {
    let mut total_mm = 0.0;
    let mut is_underestimate = false;
    let mut zero_run = 0u32;

    for &value in series.iter().take(HAZARD_WINDOW_HOURS) {
        if is_underestimate {
            break;
        }
        if value == 0.0 {
            if zero_run == DRY_HOURS_IN_EVENT {
                is_underestimate = true;
            } else {
                zero_run += 1;
            }
        } else {
            total_mm += value;
            zero_run = 0;
        }
    }

    PrecipitationAggregate {
        total_mm,
        is_underestimate,
    }
}

/// Hours that are part of the current precipitation event.
///
/// Unlike the aggregate, the dry-hour counter never resets once it reaches
/// three: rain resuming later in the window is not part of this event.
pub fn derive_precipitation_duration_mask(series: &[f64]) -> Vec<bool> {
    let mut zero_run = 0u32;

    series
        .iter()
        .take(HAZARD_WINDOW_HOURS)
        .map(|&value| {
            let in_event = zero_run < DRY_HOURS_IN_EVENT;
            if value == 0.0 {
                zero_run = zero_run.saturating_add(1);
            } else if in_event {
                zero_run = 0;
            }
            in_event
        })
        .collect()
}

/// Derive the full signal bundle from hourly series starting at the
/// current hour.
pub fn derive_hazard_signals(hourly: &HourlySeries) -> HazardSignals {
    let aggregate = derive_aggregate_precipitation(&hourly.precipitation);

    HazardSignals {
        extreme_uv: derive_threshold_signal(&hourly.uv_index, &EXTREME_UV),
        strong_wind: derive_threshold_signal(&hourly.wind_speed, &STRONG_WIND),
        strong_wind_gusts: derive_threshold_signal(&hourly.wind_gusts, &STRONG_GUSTS),
        low_visibility: derive_threshold_signal(&hourly.visibility, &LOW_VISIBILITY),
        precipitation: PrecipitationSignal {
            total_mm: aggregate.total_mm,
            is_underestimate: aggregate.is_underestimate,
            duration_mask: derive_precipitation_duration_mask(&hourly.precipitation),
        },
    }
}
