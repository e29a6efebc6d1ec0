//! Gap filling from 6-hour to hourly cadence.
//!
//! Temperature, relative humidity and wind speed follow one natural cubic
//! spline each. Wind direction is copied from the preceding real sample and
//! synthesized hours carry no precipitation, so daily totals only ever count
//! what the reduction produced.

use chrono::{Duration, NaiveDateTime};

use crate::helpers::constrain;
use crate::models::Hour;
use crate::services::consensus::{
    MAX_RELATIVE_HUMIDITY, MAX_TEMPERATURE, MIN_RELATIVE_HUMIDITY, MIN_TEMPERATURE, MIN_WIND_SPEED,
};

/// Local hour before which a late-starting sequence is back-filled rather
/// than having its first partial day dropped.
const BACKFILL_BEFORE_HOUR: u32 = 12;
const LAST_HOUR_OF_DAY: u32 = 23;

/// Natural cubic spline (zero second derivative at both ends).
#[derive(Debug, Clone, PartialEq)]
pub struct NaturalSpline {
    xs: Vec<f64>,
    ys: Vec<f64>,
    second: Vec<f64>,
}

impl NaturalSpline {
    /// Fit through `(xs[i], ys[i])`.
    ///
    /// Returns `None` for empty input, mismatched lengths, or `xs` that are
    /// not strictly increasing.
    pub fn fit(xs: &[f64], ys: &[f64]) -> Option<Self> {
        let n = xs.len();
        if n == 0 || n != ys.len() || xs.windows(2).any(|w| w[1] <= w[0]) {
            return None;
        }

        // tridiagonal solve, forward sweep then back substitution
        let mut second = vec![0.0; n];
        let mut u = vec![0.0; n];
        for i in 1..n.saturating_sub(1) {
            let sig = (xs[i] - xs[i - 1]) / (xs[i + 1] - xs[i - 1]);
            let p = sig * second[i - 1] + 2.0;
            second[i] = (sig - 1.0) / p;
            let slope_diff =
                (ys[i + 1] - ys[i]) / (xs[i + 1] - xs[i]) - (ys[i] - ys[i - 1]) / (xs[i] - xs[i - 1]);
            u[i] = (6.0 * slope_diff / (xs[i + 1] - xs[i - 1]) - sig * u[i - 1]) / p;
        }
        for k in (0..n.saturating_sub(1)).rev() {
            second[k] = second[k] * second[k + 1] + u[k];
        }

        Some(Self {
            xs: xs.to_vec(),
            ys: ys.to_vec(),
            second,
        })
    }

    /// Evaluate at `x`, clamped to the fitted range.
    pub fn value(&self, x: f64) -> f64 {
        let n = self.xs.len();
        if n == 1 {
            return self.ys[0];
        }
        let x = constrain(x, self.xs[0], self.xs[n - 1]);
        let hi = self.xs.partition_point(|&xi| xi < x).clamp(1, n - 1);
        let lo = hi - 1;

        let h = self.xs[hi] - self.xs[lo];
        let a = (self.xs[hi] - x) / h;
        let b = (x - self.xs[lo]) / h;
        a * self.ys[lo]
            + b * self.ys[hi]
            + ((a * a * a - a) * self.second[lo] + (b * b * b - b) * self.second[hi]) * h * h / 6.0
    }
}

/// Insert one synthesized hour for every whole hour between adjacent samples.
///
/// Real samples are kept untouched. Input must be ordered by time; sequences
/// with fewer than two samples, or with repeated times, come back unchanged.
pub fn fill_gaps(samples: &[Hour]) -> Vec<Hour> {
    let Some(first) = samples.first() else {
        return Vec::new();
    };
    if samples.len() < 2 {
        return samples.to_vec();
    }

    let xs: Vec<f64> = samples
        .iter()
        .map(|h| (h.time - first.time).num_hours() as f64)
        .collect();
    let fit = |field: fn(&Hour) -> f64| {
        let ys: Vec<f64> = samples.iter().map(field).collect();
        NaturalSpline::fit(&xs, &ys)
    };
    let (Some(temperature), Some(humidity), Some(wind_speed)) = (
        fit(|h| h.temperature),
        fit(|h| h.relative_humidity),
        fit(|h| h.wind_speed),
    ) else {
        tracing::warn!(
            "Hour sequence starting {} is not strictly increasing, leaving it unfilled",
            first.time
        );
        return samples.to_vec();
    };

    let mut filled = Vec::with_capacity(samples.len() * 6);
    for (pair, x0) in samples.windows(2).zip(&xs) {
        let (from, to) = (&pair[0], &pair[1]);
        filled.push(from.clone());

        let gap = (to.time - from.time).num_hours();
        for step in 1..gap {
            let x = x0 + step as f64;
            let mut hour = from.synthesized_at(from.time + Duration::hours(step));
            hour.temperature = constrain(temperature.value(x), MIN_TEMPERATURE, MAX_TEMPERATURE);
            hour.relative_humidity =
                constrain(humidity.value(x), MIN_RELATIVE_HUMIDITY, MAX_RELATIVE_HUMIDITY);
            hour.wind_speed = constrain(wind_speed.value(x), MIN_WIND_SPEED, f64::MAX);
            filled.push(hour);
        }
    }
    if let Some(last) = samples.last() {
        filled.push(last.clone());
    }
    filled
}

fn at_hour(template: &Hour, hour: u32) -> Option<NaiveDateTime> {
    template.date().and_hms_opt(hour, 0, 0)
}

/// Make the hourly sequence start and end on whole local days.
///
/// A first hour before noon is back-filled to 00:00 from the first sample;
/// a first hour at or after noon drops that partial day instead. The last day
/// is forward-filled to 23:00 from the last sample. Padded hours carry no
/// precipitation.
pub fn pad_day_edges(hours: Vec<Hour>) -> Vec<Hour> {
    let Some(first) = hours.first().cloned() else {
        return hours;
    };

    let mut padded: Vec<Hour> = Vec::with_capacity(hours.len() + 2 * LAST_HOUR_OF_DAY as usize);
    let first_hour = first.hour();
    if first_hour >= BACKFILL_BEFORE_HOUR {
        let trimmed: Vec<Hour> = hours
            .iter()
            .filter(|h| h.date() != first.date())
            .cloned()
            .collect();
        if trimmed.is_empty() {
            tracing::debug!(
                "Only a partial day starting {} is available, keeping it",
                first.time
            );
            padded = hours;
        } else {
            padded = trimmed;
        }
    } else {
        padded.extend((0..first_hour).filter_map(|h| at_hour(&first, h).map(|t| first.synthesized_at(t))));
        padded.extend(hours);
    }

    if let Some(last) = padded.last().cloned() {
        padded.extend(
            (last.hour() + 1..=LAST_HOUR_OF_DAY)
                .filter_map(|h| at_hour(&last, h).map(|t| last.synthesized_at(t))),
        );
    }
    padded
}
