//! Forecast source abstraction.
//!
//! A source turns (location, variable, run) into an ordered sequence of
//! per-forecast-hour snapshots. Location Weather fetches all five variables
//! concurrently through one shared source.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::errors::WeatherError;
use crate::models::{ForecastRun, ForecastSnapshot, Variable};

#[async_trait]
pub trait ForecastSource: Send + Sync {
    /// Snapshots ordered by increasing forecast hour.
    async fn fetch(
        &self,
        location: &str,
        variable: Variable,
        run: &ForecastRun,
    ) -> Result<Vec<ForecastSnapshot>, WeatherError>;
}

/// In-memory source, keyed by location and variable.
///
/// Serves replays of previously parsed documents and test fixtures. The run
/// is ignored; whatever was loaded is returned.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    series: HashMap<(String, Variable), Vec<ForecastSnapshot>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(
        mut self,
        location: &str,
        variable: Variable,
        snapshots: Vec<ForecastSnapshot>,
    ) -> Self {
        self.insert(location, variable, snapshots);
        self
    }

    pub fn insert(&mut self, location: &str, variable: Variable, mut snapshots: Vec<ForecastSnapshot>) {
        snapshots.sort_by_key(|s| s.forecast_hour);
        self.series.insert((location.to_string(), variable), snapshots);
    }
}

#[async_trait]
impl ForecastSource for StaticSource {
    async fn fetch(
        &self,
        location: &str,
        variable: Variable,
        _run: &ForecastRun,
    ) -> Result<Vec<ForecastSnapshot>, WeatherError> {
        self.series
            .get(&(location.to_string(), variable))
            .cloned()
            .ok_or_else(|| {
                WeatherError::source_unavailable(variable, format!("no series loaded for {}", location))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ForecastCycle;
    use chrono::NaiveDate;

    fn run() -> ForecastRun {
        ForecastRun {
            date: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            cycle: ForecastCycle::Midnight,
        }
    }

    #[tokio::test]
    async fn test_static_source_orders_snapshots() {
        let source = StaticSource::new().with_series(
            "KELOWNA BC CA",
            Variable::Temperature,
            vec![
                ForecastSnapshot::new(6, "2024070106").with_value(1, 11.0),
                ForecastSnapshot::new(0, "2024070100").with_value(1, 10.0),
            ],
        );
        let snaps = source
            .fetch("KELOWNA BC CA", Variable::Temperature, &run())
            .await
            .unwrap();
        assert_eq!(snaps[0].forecast_hour, 0);
        assert_eq!(snaps[1].forecast_hour, 6);
    }

    #[tokio::test]
    async fn test_static_source_missing_series() {
        let source = StaticSource::new();
        let err = source
            .fetch("NOWHERE", Variable::WindSpeed, &run())
            .await
            .unwrap_err();
        assert!(matches!(err, WeatherError::SourceUnavailable { ref variable, .. } if variable == "WIND-SFC"));
    }
}
