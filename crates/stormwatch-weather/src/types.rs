use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

/// Maximum number of daily entries kept from a forecast response.
pub const MAX_FORECAST_POINTS: usize = 9;

/// Hours covered by the UV signal (current hour + next 12).
pub const UV_WINDOW_HOURS: usize = 13;

/// Hours covered by wind, gust, visibility and precipitation signals
/// (current hour + next 24).
pub const HAZARD_WINDOW_HOURS: usize = 25;

/// Coarse sky condition derived from a WMO weather code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeatherCondition {
    Clear,
    PartlyCloudy,
    Cloudy,
    Fog,
    Drizzle,
    Rain,
    HeavyRain,
    Snow,
    Sleet,
    Thunderstorm,
}

impl WeatherCondition {
    /// Codes per https://open-meteo.com/en/docs#weathervariables. Freezing
    /// drizzle and freezing rain read as sleet; unknown codes as clear.
    pub fn from_wmo_code(code: i32) -> Self {
        match code {
            1 | 2 => Self::PartlyCloudy,
            3 => Self::Cloudy,
            45 | 48 => Self::Fog,
            51 | 53 | 55 => Self::Drizzle,
            61 | 63 | 80 => Self::Rain,
            65 | 81 | 82 => Self::HeavyRain,
            56 | 57 | 66 | 67 => Self::Sleet,
            71 | 73 | 75 | 77 | 85 | 86 => Self::Snow,
            95 | 96 | 99 => Self::Thunderstorm,
            _ => Self::Clear,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Clear => "Clear",
            Self::PartlyCloudy => "Partly cloudy",
            Self::Cloudy => "Overcast",
            Self::Fog => "Fog",
            Self::Drizzle => "Drizzle",
            Self::Rain => "Rain",
            Self::HeavyRain => "Heavy rain",
            Self::Snow => "Snow",
            Self::Sleet => "Freezing rain",
            Self::Thunderstorm => "Thunderstorm",
        }
    }
}

/// One day of the forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastPoint {
    /// Unix seconds at the start of the day, local to the forecast point
    pub time: i64,
    /// °C
    pub temperature_max: f64,
    /// °C
    pub temperature_min: f64,
    /// WMO weather code
    pub weather_code: i32,
    pub uv_index_max: f64,
    /// km/h
    pub wind_speed_max: f64,
    /// Percent
    pub precipitation_probability: f64,
}

impl ForecastPoint {
    pub fn condition(&self) -> WeatherCondition {
        WeatherCondition::from_wmo_code(self.weather_code)
    }
}

/// Check that a forecast list is non-empty, holds at most nine days and is
/// ordered by ascending timestamp.
pub fn validate_forecast(points: &[ForecastPoint]) -> Result<(), SchemaError> {
    if points.is_empty() {
        return Err(SchemaError::invalid("forecast", "empty"));
    }
    if points.len() > MAX_FORECAST_POINTS {
        return Err(SchemaError::invalid(
            "forecast",
            format!("{} points, at most {}", points.len(), MAX_FORECAST_POINTS),
        ));
    }
    if points.windows(2).any(|w| w[0].time >= w[1].time) {
        return Err(SchemaError::invalid("forecast", "timestamps not ascending"));
    }
    Ok(())
}

/// Precipitation hazard over the 25-hour window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecipitationSignal {
    /// Accumulated depth in mm until a long dry spell intervened
    pub total_mm: f64,
    /// Accumulation stopped early; later precipitation was not counted
    pub is_underestimate: bool,
    /// Hours that belong to the precipitation event
    pub duration_mask: Vec<bool>,
}

/// Boolean-per-hour hazard arrays consumed by the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HazardSignals {
    pub extreme_uv: Vec<bool>,
    pub strong_wind: Vec<bool>,
    pub strong_wind_gusts: Vec<bool>,
    pub low_visibility: Vec<bool>,
    pub precipitation: PrecipitationSignal,
}

/// Named hazard, used for summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hazard {
    ExtremeUv,
    StrongWind,
    StrongWindGusts,
    LowVisibility,
}

impl Hazard {
    pub fn description(&self) -> &'static str {
        match self {
            Self::ExtremeUv => "Extreme UV",
            Self::StrongWind => "Strong wind",
            Self::StrongWindGusts => "Strong gusts",
            Self::LowVisibility => "Low visibility",
        }
    }
}

impl HazardSignals {
    /// Shape check applied whenever signals cross a trust boundary.
    pub fn validate(&self) -> Result<(), SchemaError> {
        check_window("extremeUv", &self.extreme_uv, UV_WINDOW_HOURS)?;
        check_window("strongWind", &self.strong_wind, HAZARD_WINDOW_HOURS)?;
        check_window("strongWindGusts", &self.strong_wind_gusts, HAZARD_WINDOW_HOURS)?;
        check_window("lowVisibility", &self.low_visibility, HAZARD_WINDOW_HOURS)?;
        check_window(
            "precipitation.durationMask",
            &self.precipitation.duration_mask,
            HAZARD_WINDOW_HOURS,
        )?;
        let total = self.precipitation.total_mm;
        if !total.is_finite() || total < 0.0 {
            return Err(SchemaError::invalid(
                "precipitation.totalMm",
                format!("{total} is not a depth"),
            ));
        }
        Ok(())
    }

    /// Hazards that fire in at least one hour of their window.
    pub fn active_hazards(&self) -> Vec<Hazard> {
        [
            (Hazard::ExtremeUv, &self.extreme_uv),
            (Hazard::StrongWind, &self.strong_wind),
            (Hazard::StrongWindGusts, &self.strong_wind_gusts),
            (Hazard::LowVisibility, &self.low_visibility),
        ]
        .into_iter()
        .filter(|(_, hours)| hours.iter().any(|&h| h))
        .map(|(hazard, _)| hazard)
        .collect()
    }
}

fn check_window(field: &'static str, hours: &[bool], window: usize) -> Result<(), SchemaError> {
    if hours.is_empty() || hours.len() > window {
        return Err(SchemaError::invalid(
            field,
            format!("length {}, expected 1..={}", hours.len(), window),
        ));
    }
    Ok(())
}

/// Raw hourly arrays the signals are derived from, already sliced to start
/// at the current hour.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HourlySeries {
    /// mm
    pub precipitation: Vec<f64>,
    pub uv_index: Vec<f64>,
    /// km/h
    pub wind_speed: Vec<f64>,
    /// km/h
    pub wind_gusts: Vec<f64>,
    /// m
    pub visibility: Vec<f64>,
}

/// Everything persisted for one forecast point.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub lat: String,
    pub lon: String,
    pub last_updated: DateTime<Utc>,
    pub forecast: Vec<ForecastPoint>,
    pub signals: HazardSignals,
}

/// Inbound request from the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationRequest {
    pub lat: String,
    pub lon: String,
    pub location_changed: bool,
}

impl LocationRequest {
    pub fn new(lat: impl Into<String>, lon: impl Into<String>) -> Self {
        Self {
            lat: lat.into(),
            lon: lon.into(),
            location_changed: false,
        }
    }

    pub fn with_location_changed(mut self, changed: bool) -> Self {
        self.location_changed = changed;
        self
    }

    /// Same forecast point, ignoring the change flag.
    pub fn same_point(&self, other: &LocationRequest) -> bool {
        self.lat == other.lat && self.lon == other.lon
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;

    fn point(time: i64) -> ForecastPoint {
        ForecastPoint {
            time,
            temperature_max: 20.0,
            temperature_min: 10.0,
            weather_code: 61,
            uv_index_max: 5.0,
            wind_speed_max: 12.0,
            precipitation_probability: 40.0,
        }
    }

    fn signals() -> HazardSignals {
        HazardSignals {
            extreme_uv: vec![false; UV_WINDOW_HOURS],
            strong_wind: vec![false; HAZARD_WINDOW_HOURS],
            strong_wind_gusts: vec![false; HAZARD_WINDOW_HOURS],
            low_visibility: vec![false; HAZARD_WINDOW_HOURS],
            precipitation: PrecipitationSignal {
                total_mm: 0.0,
                is_underestimate: true,
                duration_mask: vec![false; HAZARD_WINDOW_HOURS],
            },
        }
    }

    #[test]
    fn test_forecast_point_condition() {
        assert_eq!(point(0).condition(), WeatherCondition::Rain);
    }

    #[test]
    fn test_forecast_point_serializes_camel_case() {
        let json = serde_json::to_string(&point(1_700_000_000)).unwrap();
        assert!(json.contains("\"temperatureMax\":20.0"));
        assert!(json.contains("\"weatherCode\":61"));
    }

    #[test]
    fn test_validate_forecast() {
        assert!(validate_forecast(&[point(0), point(86_400)]).is_ok());
        assert!(validate_forecast(&[]).is_err());
        assert!(validate_forecast(&[point(86_400), point(0)]).is_err());

        let too_many: Vec<_> = (0..10).map(|d| point(d * 86_400)).collect();
        assert!(validate_forecast(&too_many).is_err());
    }

    #[test]
    fn test_signals_validate_shape() {
        assert!(signals().validate().is_ok());

        let mut long_uv = signals();
        long_uv.extreme_uv = vec![false; 25];
        assert!(long_uv.validate().is_err());

        let mut negative = signals();
        negative.precipitation.total_mm = -1.0;
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_signals_json_field_names() {
        let json = serde_json::to_value(signals()).unwrap();
        assert!(json.get("extremeUv").is_some());
        assert!(json.get("strongWindGusts").is_some());
        assert!(json["precipitation"].get("isUnderestimate").is_some());
        assert!(json["precipitation"].get("durationMask").is_some());
    }

    #[test]
    fn test_active_hazards() {
        let mut s = signals();
        assert!(s.active_hazards().is_empty());

        s.strong_wind[7] = true;
        s.low_visibility[0] = true;
        assert_eq!(
            s.active_hazards(),
            vec![Hazard::StrongWind, Hazard::LowVisibility]
        );
    }

    #[test]
    fn test_location_request_same_point_ignores_flag() {
        let a = LocationRequest::new("52.52", "13.41");
        let b = LocationRequest::new("52.52", "13.41").with_location_changed(true);
        assert!(a.same_point(&b));
        assert!(!a.same_point(&LocationRequest::new("52.5", "13.41")));
    }

    #[test]
    fn test_condition_from_wmo_code() {
        use WeatherCondition::*;

        let table: &[(&[i32], WeatherCondition)] = &[
            (&[0, 4, 50, 999, -1], Clear),
            (&[1, 2], PartlyCloudy),
            (&[3], Cloudy),
            (&[45, 48], Fog),
            (&[51, 53, 55], Drizzle),
            (&[61, 63, 80], Rain),
            (&[65, 81, 82], HeavyRain),
            (&[56, 57, 66, 67], Sleet),
            (&[71, 73, 75, 77, 85, 86], Snow),
            (&[95, 96, 99], Thunderstorm),
        ];

        for (codes, expected) in table {
            for &code in *codes {
                assert_eq!(WeatherCondition::from_wmo_code(code), *expected, "code {code}");
            }
        }
        assert_eq!(Sleet.description(), "Freezing rain");
    }
}
