//! Percentile consensus across ensemble members.
//!
//! For each forecast hour the selected members' values are sorted and the
//! consensus is read at a fractional rank, linearly interpolating between the
//! neighbouring positions. Temperature and wind speed use rank
//! `(N-1) * p/100`; relative humidity and precipitation use the inverted rank
//! `(N-1) * (100-p)/100`. Wind direction uses the sector reduction in
//! `predominant_direction` instead.
//!
//! Precipitation arrives cumulative; each hour keeps only the non-negative
//! increment over the previous consensus total.

use std::collections::BTreeMap;

use crate::errors::{OutOfRangeReading, WeatherError};
use crate::helpers::{finite_value, normalize_direction};
use crate::models::{ForecastSnapshot, Hour, LocalOffset, MemberId, Variable};
use crate::services::aggregation::DirectionSamples;
use crate::services::members::MemberSelection;

/// Physical bounds used for validation and for clamping interpolated values.
pub const MIN_RELATIVE_HUMIDITY: f64 = 0.0;
pub const MAX_RELATIVE_HUMIDITY: f64 = 100.0;
pub const MIN_TEMPERATURE: f64 = -50.0;
pub const MAX_TEMPERATURE: f64 = 60.0;
pub const MIN_WIND_SPEED: f64 = 0.0;

/// Centres of the eight compass sectors, in enumeration (tie-break) order.
const SECTOR_CENTRES: [f64; 8] = [0.0, 45.0, 90.0, 135.0, 180.0, 225.0, 270.0, 315.0];
const SECTOR_HALF_WIDTH: f64 = 22.5;

/// Value at `percentile` (0..=100) of an ascending slice.
///
/// Returns `None` for an empty slice. The result always lies between the two
/// neighbouring sorted values; `0` and `100` return the extremes exactly.
pub fn percentile_value(sorted: &[f64], percentile: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = (last as f64 * percentile / 100.0).clamp(0.0, last as f64);
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    let value = (1.0 - frac) * sorted[lo] + frac * sorted[hi];
    // keep rounding from stepping outside the bracketing pair
    Some(value.max(sorted[lo]).min(sorted[hi]))
}

/// Consensus for one scalar variable from unsorted member values.
///
/// Inverted variables are read at `100 - percentile`.
pub fn consensus_value(variable: Variable, mut values: Vec<f64>, percentile: f64) -> Option<f64> {
    values.sort_by(f64::total_cmp);
    let effective = if variable.inverts_percentile() {
        100.0 - percentile
    } else {
        percentile
    };
    percentile_value(&values, effective)
}

/// Sector index and the (possibly negative) value stored in that sector.
///
/// Directions past 337.5 fall into the north sector as negative offsets,
/// e.g. 350 is kept as -10.
fn sector_of(direction: f64) -> (usize, f64) {
    let dir = normalize_direction(direction);
    SECTOR_CENTRES
        .iter()
        .position(|centre| dir <= centre + SECTOR_HALF_WIDTH)
        .map(|idx| (idx, dir))
        .unwrap_or((0, dir - 360.0))
}

/// Mode-weighted predominant wind direction.
///
/// Buckets every sample into one of eight 45° sectors, picks the most
/// populated (first in N, NE, E, ... order on ties) and averages that
/// sector's raw values. Result is in [0, 360); `None` when there are no samples.
pub fn predominant_direction(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }

    let mut sectors: [Vec<f64>; 8] = Default::default();
    for &dir in samples {
        let (idx, value) = sector_of(dir);
        sectors[idx].push(value);
    }

    let mut best = &sectors[0];
    for sector in &sectors[1..] {
        if sector.len() > best.len() {
            best = sector;
        }
    }

    let avg = best.iter().sum::<f64>() / best.len() as f64;
    Some(normalize_direction(avg))
}

/// Knobs for one reduction pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsensusSettings {
    pub percentile: f64,
    pub offset: LocalOffset,
    pub ignore_precipitation: bool,
    /// Also build one hour sequence per selected member.
    pub include_members: bool,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self {
            percentile: 50.0,
            offset: LocalOffset::default(),
            ignore_precipitation: false,
            include_members: false,
        }
    }
}

/// The five fetched series for one location, aligned by index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForecastSet {
    temperature: Vec<ForecastSnapshot>,
    relative_humidity: Vec<ForecastSnapshot>,
    precipitation: Vec<ForecastSnapshot>,
    wind_speed: Vec<ForecastSnapshot>,
    wind_direction: Vec<ForecastSnapshot>,
}

impl ForecastSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(mut self, variable: Variable, snapshots: Vec<ForecastSnapshot>) -> Self {
        self.set(variable, snapshots);
        self
    }

    pub fn set(&mut self, variable: Variable, snapshots: Vec<ForecastSnapshot>) {
        *self.series_mut(variable) = snapshots;
    }

    pub fn series(&self, variable: Variable) -> &[ForecastSnapshot] {
        match variable {
            Variable::Temperature => &self.temperature,
            Variable::RelativeHumidity => &self.relative_humidity,
            Variable::Precipitation => &self.precipitation,
            Variable::WindSpeed => &self.wind_speed,
            Variable::WindDirection => &self.wind_direction,
        }
    }

    fn series_mut(&mut self, variable: Variable) -> &mut Vec<ForecastSnapshot> {
        match variable {
            Variable::Temperature => &mut self.temperature,
            Variable::RelativeHumidity => &mut self.relative_humidity,
            Variable::Precipitation => &mut self.precipitation,
            Variable::WindSpeed => &mut self.wind_speed,
            Variable::WindDirection => &mut self.wind_direction,
        }
    }

    /// Forecast hours available in every series.
    pub fn hour_count(&self) -> usize {
        Variable::ALL
            .iter()
            .map(|v| self.series(*v).len())
            .min()
            .unwrap_or(0)
    }

    /// Whether any selected member reported `variable` for the first forecast hour.
    pub fn first_hour_reported(&self, variable: Variable, members: &MemberSelection) -> bool {
        self.series(variable)
            .first()
            .map(|snap| members.ids().iter().any(|m| snap.reported(*m)))
            .unwrap_or(false)
    }
}

/// Output of one reduction pass at native (6-hour) cadence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reduction {
    pub hours: Vec<Hour>,
    /// Every selected member's wind direction, grouped by local date.
    pub direction_samples: DirectionSamples,
    /// Native-cadence hours per member, populated when requested.
    pub member_hours: BTreeMap<MemberId, Vec<Hour>>,
    pub out_of_range: Vec<OutOfRangeReading>,
}

impl Reduction {
    pub fn had_data_errors(&self) -> bool {
        self.hours.iter().any(|h| h.error)
    }
}

/// Flag `hour` if any value breaches physical bounds, returning the breaches.
pub fn validate_hour(hour: &mut Hour) -> Vec<OutOfRangeReading> {
    let mut readings = Vec::new();
    if !(MIN_RELATIVE_HUMIDITY..=MAX_RELATIVE_HUMIDITY).contains(&hour.relative_humidity) {
        readings.push(("relative_humidity", hour.relative_humidity));
    }
    if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&hour.temperature) {
        readings.push(("temperature", hour.temperature));
    }
    if hour.wind_speed < MIN_WIND_SPEED {
        readings.push(("wind_speed", hour.wind_speed));
    }

    if !readings.is_empty() {
        hour.error = true;
    }
    readings
        .into_iter()
        .map(|(field, value)| OutOfRangeReading {
            time: hour.time,
            field,
            value,
        })
        .collect()
}

/// Finite values reported by the selected members.
fn member_values(snapshot: &ForecastSnapshot, members: &MemberSelection) -> Vec<f64> {
    snapshot
        .values_for(members.ids())
        .into_iter()
        .filter_map(|v| finite_value(v, snapshot.valid_time.as_str()))
        .collect()
}

/// Running state carried between forecast hours.
#[derive(Default)]
struct RunningTotals {
    consensus_precipitation: f64,
    member_precipitation: BTreeMap<MemberId, f64>,
    previous: Option<Hour>,
}

/// Reduce every forecast hour of `set` into consensus hours.
///
/// Series are paired by position: the i-th snapshot of every variable is
/// reduced with the i-th temperature snapshot, and a differing `forecast_hour`
/// is only logged. Time comes from the temperature snapshot.
///
/// Stops at the first hour where no selected member reported temperature;
/// if that is the very first hour the location cannot be calculated.
pub fn reduce(
    location: &str,
    set: &ForecastSet,
    members: &MemberSelection,
    settings: &ConsensusSettings,
) -> Result<Reduction, WeatherError> {
    let mut reduction = Reduction::default();
    let mut totals = RunningTotals::default();

    for i in 0..set.hour_count() {
        let temp_snap = &set.series(Variable::Temperature)[i];
        let temps = member_values(temp_snap, members);
        if temps.is_empty() {
            if i == 0 {
                return Err(WeatherError::NoMemberData(location.to_string()));
            }
            tracing::debug!(
                "{}: no selected member reported forecast hour {}, stopping",
                location,
                temp_snap.forecast_hour
            );
            break;
        }

        for variable in &Variable::ALL[1..] {
            let other = &set.series(*variable)[i];
            if other.forecast_hour != temp_snap.forecast_hour {
                tracing::warn!(
                    "{}: {} forecast hour {} does not line up with temperature hour {}",
                    location,
                    variable,
                    other.forecast_hour,
                    temp_snap.forecast_hour
                );
            }
        }

        let (date, zulu_hour) = temp_snap.valid_date_hour()?;
        let local = settings.offset.to_local(date, zulu_hour)?;

        let hour = reduce_hour(location, set, i, members, settings, local, &mut totals, &mut reduction);
        totals.previous = Some(hour.clone());
        reduction.hours.push(hour);

        if settings.include_members {
            reduce_members(set, i, members, settings, local, &mut totals, &mut reduction);
        }
    }

    Ok(reduction)
}

#[allow(clippy::too_many_arguments)]
fn reduce_hour(
    location: &str,
    set: &ForecastSet,
    i: usize,
    members: &MemberSelection,
    settings: &ConsensusSettings,
    local: chrono::NaiveDateTime,
    totals: &mut RunningTotals,
    reduction: &mut Reduction,
) -> Hour {
    let p = settings.percentile;
    let values = |v: Variable| member_values(&set.series(v)[i], members);

    let temperature = consensus_value(Variable::Temperature, values(Variable::Temperature), p);
    let humidity = consensus_value(Variable::RelativeHumidity, values(Variable::RelativeHumidity), p);
    let cumulative = consensus_value(Variable::Precipitation, values(Variable::Precipitation), p);
    let wind_speed = consensus_value(Variable::WindSpeed, values(Variable::WindSpeed), p);
    let directions = values(Variable::WindDirection);
    let wind_direction = predominant_direction(&directions);

    let mut missing = Vec::new();
    let previous = totals.previous.as_ref();
    let mut pick = |value: Option<f64>, name: &'static str, fallback: Option<f64>| {
        value.unwrap_or_else(|| {
            missing.push(name);
            fallback.unwrap_or(0.0)
        })
    };
    let temperature = pick(temperature, "temperature", previous.map(|h| h.temperature));
    let humidity = pick(humidity, "relative_humidity", previous.map(|h| h.relative_humidity));
    let wind_speed = pick(wind_speed, "wind_speed", previous.map(|h| h.wind_speed));
    let wind_direction = pick(wind_direction, "wind_direction", previous.map(|h| h.wind_direction));

    let increment = match cumulative {
        Some(total) => {
            let increment = (total - totals.consensus_precipitation).max(0.0);
            totals.consensus_precipitation = total;
            increment
        }
        None => {
            missing.push("precipitation");
            0.0
        }
    };
    let precipitation = if settings.ignore_precipitation {
        0.0
    } else {
        increment
    };

    let mut hour = Hour::new(local, temperature, humidity, precipitation, wind_speed, wind_direction);

    if !missing.is_empty() {
        tracing::warn!(
            "{}: no selected member reported {:?} at {}, carrying previous values",
            location,
            missing,
            local
        );
        hour.error = true;
    }

    for reading in validate_hour(&mut hour) {
        tracing::warn!(
            "{}: {} out of range at {}: {}",
            location,
            reading.field,
            reading.time,
            reading.value
        );
        reduction.out_of_range.push(reading);
    }

    reduction
        .direction_samples
        .entry(local.date())
        .or_default()
        .extend(directions);

    hour
}

/// Build native-cadence hours for each selected member that reported all five variables.
fn reduce_members(
    set: &ForecastSet,
    i: usize,
    members: &MemberSelection,
    settings: &ConsensusSettings,
    local: chrono::NaiveDateTime,
    totals: &mut RunningTotals,
    reduction: &mut Reduction,
) {
    for &member in members.ids() {
        let reading = |v: Variable| {
            set.series(v)[i]
                .get(member)
                .filter(|value| value.is_finite())
        };
        let (Some(t), Some(rh), Some(apcp), Some(ws), Some(wd)) = (
            reading(Variable::Temperature),
            reading(Variable::RelativeHumidity),
            reading(Variable::Precipitation),
            reading(Variable::WindSpeed),
            reading(Variable::WindDirection),
        ) else {
            continue;
        };

        let previous_total = totals.member_precipitation.entry(member).or_insert(0.0);
        let increment = (apcp - *previous_total).max(0.0);
        *previous_total = apcp;
        let precipitation = if settings.ignore_precipitation {
            0.0
        } else {
            increment
        };

        let mut hour = Hour::new(local, t, rh, precipitation, ws, wd);
        validate_hour(&mut hour);
        reduction.member_hours.entry(member).or_default().push(hour);
    }
}
