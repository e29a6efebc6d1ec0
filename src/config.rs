use chrono::{NaiveDate, Utc};
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::WeatherError;
use crate::models::{CalculationRequest, ForecastCycle, LocalOffset, MemberId};
use crate::services::locations::NAEFS_LOCATIONS_URL;
use crate::services::members::ModelFamily;
use crate::services::naefs::NAEFS_BASE_URL;

const DEFAULT_USER_AGENT: &str = "ensemble-consensus/0.1";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
const UTC_OFFSET_HOURS: RangeInclusive<i32> = -12..=14;
const DST_HOURS: RangeInclusive<i32> = 0..=2;

/// Application configuration, parsed from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub naefs_base_url: String,
    pub locations_url: String,
    pub user_agent: String,
    pub http_timeout: Duration,
    pub locations: Vec<String>,
    /// Adds every directory location in this province, e.g. "AB".
    pub province: Option<String>,
    pub model: ModelFamily,
    pub custom_members: Vec<MemberId>,
    pub percentile: u8,
    /// `None` means today (UTC).
    pub date: Option<NaiveDate>,
    pub cycle: ForecastCycle,
    pub utc_offset_hours: i32,
    pub dst_hours: i32,
    pub include_members: bool,
    pub ignore_precipitation: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, WeatherError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset and blank values take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WeatherError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Ok(Self {
            naefs_base_url: get("NAEFS_BASE_URL").unwrap_or_else(|| NAEFS_BASE_URL.to_string()),
            locations_url: get("NAEFS_LOCATIONS_URL")
                .unwrap_or_else(|| NAEFS_LOCATIONS_URL.to_string()),
            user_agent: get("HTTP_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout: Duration::from_secs(parse_or(
                get("HTTP_TIMEOUT_SECS"),
                "HTTP_TIMEOUT_SECS",
                DEFAULT_HTTP_TIMEOUT_SECS,
            )?),
            locations: get("CALC_LOCATIONS")
                .map(|v| split_list(&v).map(str::to_string).collect())
                .unwrap_or_default(),
            province: get("CALC_PROVINCE"),
            model: parse_or(get("CALC_MODEL"), "CALC_MODEL", ModelFamily::default())?,
            custom_members: get("CALC_MEMBERS")
                .map(|v| {
                    split_list(&v)
                        .map(|id| parse_value::<MemberId>(id, "CALC_MEMBERS"))
                        .collect::<Result<Vec<_>, _>>()
                })
                .transpose()?
                .unwrap_or_default(),
            percentile: parse_or(get("CALC_PERCENTILE"), "CALC_PERCENTILE", 50)?,
            date: get("CALC_DATE")
                .map(|v| {
                    NaiveDate::parse_from_str(&v, "%Y%m%d").map_err(|e| {
                        WeatherError::Config(format!("CALC_DATE '{}' is not YYYYMMDD: {}", v, e))
                    })
                })
                .transpose()?,
            cycle: parse_or(get("CALC_CYCLE"), "CALC_CYCLE", ForecastCycle::default())?,
            utc_offset_hours: parse_within(
                get("CALC_UTC_OFFSET"),
                "CALC_UTC_OFFSET",
                0,
                UTC_OFFSET_HOURS,
            )?,
            dst_hours: parse_within(get("CALC_DST"), "CALC_DST", 0, DST_HOURS)?,
            include_members: parse_flag(get("CALC_INCLUDE_MEMBERS"), "CALC_INCLUDE_MEMBERS")?,
            ignore_precipitation: parse_flag(
                get("CALC_IGNORE_PRECIPITATION"),
                "CALC_IGNORE_PRECIPITATION",
            )?,
        })
    }

    pub fn to_request(&self) -> CalculationRequest {
        let date = self.date.unwrap_or_else(|| Utc::now().date_naive());
        let mut request = CalculationRequest::new(self.locations.clone(), date);
        request.model = self.model;
        request.percentile = self.percentile;
        request.custom_members = self.custom_members.clone();
        request.cycle = self.cycle;
        request.offset = LocalOffset::new(self.utc_offset_hours, self.dst_hours);
        request.include_members = self.include_members;
        request.ignore_precipitation = self.ignore_precipitation;
        request
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_value<T>(value: &str, key: &str) -> Result<T, WeatherError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| WeatherError::Config(format!("{} '{}' is invalid: {}", key, value, e)))
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T, WeatherError>
where
    T: FromStr,
    T::Err: Display,
{
    value.map_or(Ok(default), |v| parse_value(&v, key))
}

fn parse_within(
    value: Option<String>,
    key: &str,
    default: i32,
    range: RangeInclusive<i32>,
) -> Result<i32, WeatherError> {
    let parsed = parse_or(value, key, default)?;
    if !range.contains(&parsed) {
        return Err(WeatherError::Config(format!(
            "{} {} is outside {}..={}",
            key,
            parsed,
            range.start(),
            range.end()
        )));
    }
    Ok(parsed)
}

fn parse_flag(value: Option<String>, key: &str) -> Result<bool, WeatherError> {
    match value.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("0" | "false" | "no" | "off") => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some(other) => Err(WeatherError::Config(format!(
            "{} '{}' is not a boolean",
            key, other
        ))),
    }
}
