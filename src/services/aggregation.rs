//! Daily rollups of a completed hourly sequence.
//!
//! A day is every consecutive hour sharing one local calendar date. Only the
//! daily minimum relative humidity is tracked.

use chrono::NaiveDate;
use std::collections::BTreeMap;

use crate::models::{Day, Hour};
use crate::services::consensus::predominant_direction;

/// Member-level wind direction samples observed on each local date.
pub type DirectionSamples = BTreeMap<NaiveDate, Vec<f64>>;

/// Running extrema for one day-group.
struct DayAccumulator {
    date: NaiveDate,
    min_temperature: f64,
    max_temperature: f64,
    min_relative_humidity: f64,
    precipitation: f64,
    min_wind_speed: f64,
    max_wind_speed: f64,
    native_directions: Vec<f64>,
    all_directions: Vec<f64>,
}

impl DayAccumulator {
    fn start(hour: &Hour) -> Self {
        let mut acc = Self {
            date: hour.date(),
            min_temperature: hour.temperature,
            max_temperature: hour.temperature,
            min_relative_humidity: hour.relative_humidity,
            precipitation: 0.0,
            min_wind_speed: hour.wind_speed,
            max_wind_speed: hour.wind_speed,
            native_directions: Vec::new(),
            all_directions: Vec::new(),
        };
        acc.add(hour);
        acc
    }

    fn add(&mut self, hour: &Hour) {
        self.min_temperature = self.min_temperature.min(hour.temperature);
        self.max_temperature = self.max_temperature.max(hour.temperature);
        self.min_relative_humidity = self.min_relative_humidity.min(hour.relative_humidity);
        self.precipitation += hour.precipitation;
        self.min_wind_speed = self.min_wind_speed.min(hour.wind_speed);
        self.max_wind_speed = self.max_wind_speed.max(hour.wind_speed);
        if !hour.interpolated {
            self.native_directions.push(hour.wind_direction);
        }
        self.all_directions.push(hour.wind_direction);
    }

    /// Close the day. Direction comes from the day's member samples when
    /// there are any, otherwise from the hours themselves.
    fn finish(self, samples: &DirectionSamples) -> Day {
        let own = if self.native_directions.is_empty() {
            &self.all_directions
        } else {
            &self.native_directions
        };
        let wind_direction = samples
            .get(&self.date)
            .and_then(|s| predominant_direction(s))
            .or_else(|| predominant_direction(own))
            .unwrap_or(0.0);

        Day {
            date: self.date,
            min_temperature: self.min_temperature,
            max_temperature: self.max_temperature,
            min_relative_humidity: self.min_relative_humidity,
            precipitation: self.precipitation,
            min_wind_speed: self.min_wind_speed,
            max_wind_speed: self.max_wind_speed,
            wind_direction,
        }
    }
}

/// Roll hours up into days, in order. A trailing partial day is still emitted.
pub fn aggregate_days(hours: &[Hour], samples: &DirectionSamples) -> Vec<Day> {
    let mut days = Vec::new();
    let mut current: Option<DayAccumulator> = None;

    for hour in hours {
        if let Some(acc) = current.as_mut() {
            if acc.date == hour.date() {
                acc.add(hour);
                continue;
            }
        }
        if let Some(done) = current.replace(DayAccumulator::start(hour)) {
            days.push(done.finish(samples));
        }
    }
    if let Some(done) = current {
        days.push(done.finish(samples));
    }
    days
}
