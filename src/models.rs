use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::WeatherError;
use crate::helpers::normalize_direction;
use crate::services::members::ModelFamily;

/// Ensemble member identifier (1..=43 for NAEFS).
pub type MemberId = u8;

/// The five meteorological variables fetched per location, one source each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Variable {
    Temperature,
    RelativeHumidity,
    Precipitation,
    WindSpeed,
    WindDirection,
}

impl Variable {
    pub const ALL: [Variable; 5] = [
        Variable::Temperature,
        Variable::RelativeHumidity,
        Variable::Precipitation,
        Variable::WindSpeed,
        Variable::WindDirection,
    ];

    /// Datamart element code used in document paths.
    pub fn code(self) -> &'static str {
        match self {
            Variable::Temperature => "TMP-SFC",
            Variable::RelativeHumidity => "RELH-SFC",
            Variable::Precipitation => "APCP-SFC",
            Variable::WindSpeed => "WIND-SFC",
            Variable::WindDirection => "WDIR-SFC",
        }
    }

    /// Adverse-risk variables draw from the (100 - p)th position, so a higher
    /// percentile leans toward drier, less rainy outcomes.
    pub fn inverts_percentile(self) -> bool {
        matches!(self, Variable::RelativeHumidity | Variable::Precipitation)
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One forecast hour of one variable, as reported by a forecast source.
///
/// Only members that reported are present in `values`.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastSnapshot {
    pub forecast_hour: u32,
    /// Zulu valid time, `YYYYMMDDHH`.
    pub valid_time: String,
    values: BTreeMap<MemberId, f64>,
}

impl ForecastSnapshot {
    pub fn new(forecast_hour: u32, valid_time: impl Into<String>) -> Self {
        Self {
            forecast_hour,
            valid_time: valid_time.into(),
            values: BTreeMap::new(),
        }
    }

    /// Builder-style insert, used by parsers and fixtures.
    pub fn with_value(mut self, member: MemberId, value: f64) -> Self {
        self.values.insert(member, value);
        self
    }

    pub fn insert(&mut self, member: MemberId, value: f64) {
        self.values.insert(member, value);
    }

    pub fn get(&self, member: MemberId) -> Option<f64> {
        self.values.get(&member).copied()
    }

    pub fn reported(&self, member: MemberId) -> bool {
        self.values.contains_key(&member)
    }

    /// Values for the given members, in member order, skipping absent ones.
    pub fn values_for(&self, members: &[MemberId]) -> Vec<f64> {
        members.iter().filter_map(|m| self.get(*m)).collect()
    }

    pub fn member_count(&self) -> usize {
        self.values.len()
    }

    /// Split the valid time into its calendar date and zulu hour.
    pub fn valid_date_hour(&self) -> Result<(NaiveDate, u32), WeatherError> {
        let vt = self.valid_time.trim();
        if vt.len() != 10 || !vt.is_ascii() {
            return Err(WeatherError::MalformedDocument(format!(
                "valid time '{}' is not YYYYMMDDHH",
                self.valid_time
            )));
        }
        let date = NaiveDate::parse_from_str(&vt[..8], "%Y%m%d").map_err(|e| {
            WeatherError::MalformedDocument(format!("valid time '{}': {}", self.valid_time, e))
        })?;
        let hour: u32 = vt[8..].parse().map_err(|_| {
            WeatherError::MalformedDocument(format!(
                "valid time '{}' has a non-numeric hour",
                self.valid_time
            ))
        })?;
        if hour > 23 {
            return Err(WeatherError::MalformedDocument(format!(
                "valid time '{}' has hour {} out of range",
                self.valid_time, hour
            )));
        }
        Ok((date, hour))
    }
}

/// Fixed local offset from UTC, split into standard and daylight parts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LocalOffset {
    pub utc_offset_hours: i32,
    pub dst_hours: i32,
}

impl LocalOffset {
    pub fn new(utc_offset_hours: i32, dst_hours: i32) -> Self {
        Self {
            utc_offset_hours,
            dst_hours,
        }
    }

    pub fn total_hours(&self) -> i64 {
        i64::from(self.utc_offset_hours) + i64::from(self.dst_hours)
    }

    /// Convert a zulu date + hour into local time, rolling the calendar day
    /// when the local hour leaves [0, 23].
    pub fn to_local(&self, date: NaiveDate, zulu_hour: u32) -> Result<NaiveDateTime, WeatherError> {
        let zulu = date.and_hms_opt(zulu_hour, 0, 0).ok_or_else(|| {
            WeatherError::MalformedDocument(format!("invalid zulu hour {}", zulu_hour))
        })?;
        Ok(zulu + Duration::hours(self.total_hours()))
    }
}

/// One of the two daily model runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ForecastCycle {
    #[default]
    Midnight,
    Noon,
}

impl ForecastCycle {
    pub fn as_str(self) -> &'static str {
        match self {
            ForecastCycle::Midnight => "00",
            ForecastCycle::Noon => "12",
        }
    }
}

impl fmt::Display for ForecastCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForecastCycle {
    type Err = WeatherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_end_matches(['Z', 'z']) {
            "00" | "0" => Ok(ForecastCycle::Midnight),
            "12" => Ok(ForecastCycle::Noon),
            other => Err(WeatherError::InvalidRequest(format!(
                "unknown forecast cycle '{}'",
                other
            ))),
        }
    }
}

/// Identifies the model run whose documents are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForecastRun {
    pub date: NaiveDate,
    pub cycle: ForecastCycle,
}

impl ForecastRun {
    /// `YYYYMMDD` as used in datamart paths.
    pub fn date_stamp(&self) -> String {
        self.date.format("%Y%m%d").to_string()
    }
}

/// One hour of consensus or single-member weather, in local time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hour {
    pub time: NaiveDateTime,
    pub temperature: f64,
    pub relative_humidity: f64,
    pub precipitation: f64,
    pub wind_speed: f64,
    /// Compass degrees in [0, 360).
    pub wind_direction: f64,
    pub interpolated: bool,
    pub error: bool,
}

impl Hour {
    pub fn new(
        time: NaiveDateTime,
        temperature: f64,
        relative_humidity: f64,
        precipitation: f64,
        wind_speed: f64,
        wind_direction: f64,
    ) -> Self {
        Self {
            time,
            temperature,
            relative_humidity,
            precipitation,
            wind_speed,
            wind_direction: normalize_direction(wind_direction),
            interpolated: false,
            error: false,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.time.date()
    }

    pub fn hour(&self) -> u32 {
        self.time.hour()
    }

    /// Copy of this hour moved to `time`, marked interpolated, with no precipitation.
    pub(crate) fn synthesized_at(&self, time: NaiveDateTime) -> Self {
        Self {
            time,
            precipitation: 0.0,
            interpolated: true,
            error: false,
            ..self.clone()
        }
    }
}

/// One calendar day rolled up from a completed hour sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Day {
    pub date: NaiveDate,
    pub min_temperature: f64,
    pub max_temperature: f64,
    /// Only the daily minimum is tracked.
    pub min_relative_humidity: f64,
    pub precipitation: f64,
    pub min_wind_speed: f64,
    pub max_wind_speed: f64,
    /// Predominant (sector-weighted) direction, compass degrees.
    pub wind_direction: f64,
}

/// Hours and days for one subject: the consensus or a single member.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocationTrack {
    pub hours: Vec<Hour>,
    pub days: Vec<Day>,
}

impl LocationTrack {
    pub fn is_empty(&self) -> bool {
        self.hours.is_empty()
    }
}

/// One batch calculation over a set of locations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalculationRequest {
    /// Datamart location names, e.g. "CALGARY AB CA".
    pub locations: Vec<String>,
    pub model: ModelFamily,
    /// 0..=100
    pub percentile: u8,
    /// Only used with `ModelFamily::Custom`.
    pub custom_members: Vec<MemberId>,
    pub date: NaiveDate,
    pub cycle: ForecastCycle,
    pub offset: LocalOffset,
    pub include_members: bool,
    pub ignore_precipitation: bool,
}

impl CalculationRequest {
    /// Median consensus of every member for the midnight run.
    pub fn new(locations: Vec<String>, date: NaiveDate) -> Self {
        Self {
            locations,
            model: ModelFamily::default(),
            percentile: 50,
            custom_members: Vec::new(),
            date,
            cycle: ForecastCycle::default(),
            offset: LocalOffset::default(),
            include_members: false,
            ignore_precipitation: false,
        }
    }

    pub fn run(&self) -> ForecastRun {
        ForecastRun {
            date: self.date,
            cycle: self.cycle,
        }
    }

    pub fn validate(&self) -> Result<(), WeatherError> {
        if self.percentile > 100 {
            return Err(WeatherError::InvalidRequest(format!(
                "percentile {} is above 100",
                self.percentile
            )));
        }
        if self.locations.iter().all(|l| l.trim().is_empty()) {
            return Err(WeatherError::InvalidRequest(
                "no locations requested".to_string(),
            ));
        }
        Ok(())
    }
}
