//! Per-location pipeline: fetch, reduce, gap-fill, aggregate.
//!
//! Each `calculate()` is one full pass. A failure at any stage leaves the
//! instance in `Stage::Failed` with the error stored; nothing is resumable.

use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::errors::{OutOfRangeReading, WeatherError};
use crate::models::{Day, ForecastRun, Hour, LocationTrack, MemberId, Variable};
use crate::services::aggregation::{aggregate_days, DirectionSamples};
use crate::services::consensus::{reduce, ConsensusSettings, ForecastSet, Reduction};
use crate::services::interpolation::{fill_gaps, pad_day_edges};
use crate::services::members::MemberSelection;
use crate::services::source::ForecastSource;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Idle,
    Fetching,
    Reducing,
    Interpolating,
    Aggregating,
    Done,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct LocationWeather {
    location: String,
    stage: Stage,
    consensus: LocationTrack,
    members: BTreeMap<MemberId, LocationTrack>,
    out_of_range: Vec<OutOfRangeReading>,
    had_data_errors: bool,
    failure: Option<WeatherError>,
}

impl LocationWeather {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ..Self::default()
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn succeeded(&self) -> bool {
        self.stage == Stage::Done
    }

    pub fn hours(&self) -> &[Hour] {
        &self.consensus.hours
    }

    pub fn days(&self) -> &[Day] {
        &self.consensus.days
    }

    pub fn consensus(&self) -> &LocationTrack {
        &self.consensus
    }

    /// Per-member tracks; empty unless member detail was requested.
    pub fn member_tracks(&self) -> &BTreeMap<MemberId, LocationTrack> {
        &self.members
    }

    pub fn out_of_range(&self) -> &[OutOfRangeReading] {
        &self.out_of_range
    }

    pub fn had_data_errors(&self) -> bool {
        self.had_data_errors
    }

    pub fn failure(&self) -> Option<&WeatherError> {
        self.failure.as_ref()
    }

    /// Run the whole pipeline for one forecast run.
    pub async fn calculate(
        &mut self,
        source: &dyn ForecastSource,
        run: &ForecastRun,
        members: &MemberSelection,
        settings: &ConsensusSettings,
    ) -> Result<(), WeatherError> {
        self.reset();
        tracing::info!(
            "Calculating {} for {} {}Z with {} members",
            self.location,
            run.date_stamp(),
            run.cycle,
            members.len()
        );

        match self.run_pipeline(source, run, members, settings).await {
            Ok(()) => {
                self.stage = Stage::Done;
                tracing::info!(
                    "Finished {}: {} hours, {} days, {} out-of-range readings",
                    self.location,
                    self.consensus.hours.len(),
                    self.consensus.days.len(),
                    self.out_of_range.len()
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!("Calculation for {} failed: {}", self.location, e);
                self.stage = Stage::Failed;
                self.failure = Some(e.clone());
                Err(e)
            }
        }
    }

    fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.location));
    }

    async fn run_pipeline(
        &mut self,
        source: &dyn ForecastSource,
        run: &ForecastRun,
        members: &MemberSelection,
        settings: &ConsensusSettings,
    ) -> Result<(), WeatherError> {
        self.stage = Stage::Fetching;
        let set = self.fetch(source, run, members).await?;

        self.stage = Stage::Reducing;
        let reduction = reduce(&self.location, &set, members, settings)?;
        self.had_data_errors = reduction.had_data_errors();

        self.stage = Stage::Interpolating;
        let Reduction {
            hours,
            direction_samples,
            member_hours,
            out_of_range,
        } = reduction;
        self.out_of_range = out_of_range;
        let hourly = pad_day_edges(fill_gaps(&hours));
        let member_hourly: BTreeMap<MemberId, Vec<Hour>> = member_hours
            .into_iter()
            .map(|(member, hours)| (member, pad_day_edges(fill_gaps(&hours))))
            .collect();

        self.stage = Stage::Aggregating;
        self.consensus = LocationTrack {
            days: aggregate_days(&hourly, &direction_samples),
            hours: hourly,
        };
        // members have no sample pool of their own; days use their native hours
        let no_samples = DirectionSamples::new();
        self.members = member_hourly
            .into_iter()
            .map(|(member, hours)| {
                let days = aggregate_days(&hours, &no_samples);
                (member, LocationTrack { hours, days })
            })
            .collect();

        Ok(())
    }

    /// Fetch all five variables concurrently and wait for every one.
    async fn fetch(
        &self,
        source: &dyn ForecastSource,
        run: &ForecastRun,
        members: &MemberSelection,
    ) -> Result<ForecastSet, WeatherError> {
        let fetches = Variable::ALL
            .iter()
            .map(|variable| source.fetch(&self.location, *variable, run));
        let results = join_all(fetches).await;

        let mut set = ForecastSet::new();
        let mut first_error = None;
        for (variable, result) in Variable::ALL.iter().zip(results) {
            match result {
                Ok(snapshots) => set.set(*variable, snapshots),
                Err(e) => {
                    tracing::warn!("Fetching {} for {} failed: {}", variable, self.location, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        if let Some(variable) = Variable::ALL
            .iter()
            .find(|v| !set.first_hour_reported(**v, members))
        {
            tracing::warn!(
                "No selected member reported {} for the first forecast hour at {}",
                variable,
                self.location
            );
            return Err(WeatherError::NoMemberData(self.location.clone()));
        }

        Ok(set)
    }

    /// Borrowed, serializable view of this location's outcome.
    pub fn report(&self) -> LocationReport<'_> {
        LocationReport {
            location: &self.location,
            stage: self.stage,
            error: self.failure.as_ref().map(|e| e.to_string()),
            had_data_errors: self.had_data_errors,
            out_of_range: &self.out_of_range,
            hours: &self.consensus.hours,
            days: &self.consensus.days,
            members: &self.members,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LocationReport<'a> {
    pub location: &'a str,
    pub stage: Stage,
    pub error: Option<String>,
    pub had_data_errors: bool,
    pub out_of_range: &'a [OutOfRangeReading],
    pub hours: &'a [Hour],
    pub days: &'a [Day],
    #[serde(skip_serializing_if = "no_member_tracks")]
    pub members: &'a BTreeMap<MemberId, LocationTrack>,
}

fn no_member_tracks(tracks: &&BTreeMap<MemberId, LocationTrack>) -> bool {
    tracks.is_empty()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{ForecastCycle, ForecastSnapshot};
    use crate::services::members::{select_members, ModelFamily};
    use crate::services::source::StaticSource;
    use chrono::NaiveDate;

    pub(crate) fn run() -> ForecastRun {
        ForecastRun {
            date: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            cycle: ForecastCycle::Midnight,
        }
    }

    /// Two days of 6-hourly data for members 1..=3 at one location.
    pub(crate) fn load_location(source: StaticSource, location: &str) -> StaticSource {
        let times = [
            (0, "2024070100"),
            (6, "2024070106"),
            (12, "2024070112"),
            (18, "2024070118"),
            (24, "2024070200"),
            (30, "2024070206"),
            (36, "2024070212"),
            (42, "2024070218"),
        ];
        let series = |value: &dyn Fn(usize, MemberId) -> f64| -> Vec<ForecastSnapshot> {
            times
                .iter()
                .enumerate()
                .map(|(i, (fh, vt))| {
                    (1..=3).fold(ForecastSnapshot::new(*fh, *vt), |s, m| {
                        s.with_value(m, value(i, m))
                    })
                })
                .collect()
        };
        source
            .with_series(
                location,
                Variable::Temperature,
                series(&|i, m| 10.0 + 5.0 * m as f64 + (i % 4) as f64),
            )
            .with_series(
                location,
                Variable::RelativeHumidity,
                series(&|i, m| 30.0 + 10.0 * m as f64 + i as f64),
            )
            .with_series(
                location,
                Variable::Precipitation,
                series(&|i, m| (i as f64) * 0.5 * m as f64),
            )
            .with_series(location, Variable::WindSpeed, series(&|_, m| 4.0 + m as f64))
            .with_series(
                location,
                Variable::WindDirection,
                series(&|_, m| [0.0, 10.0, 355.0][m as usize - 1]),
            )
    }

    fn members() -> MemberSelection {
        select_members(ModelFamily::Custom, &[1, 2, 3])
    }

    #[tokio::test]
    async fn test_calculate_runs_to_done() {
        let source = load_location(StaticSource::new(), "CALGARY AB CA");
        let mut loc = LocationWeather::new("CALGARY AB CA");
        assert_eq!(loc.stage(), Stage::Idle);

        loc.calculate(&source, &run(), &members(), &ConsensusSettings::default())
            .await
            .unwrap();

        assert_eq!(loc.stage(), Stage::Done);
        assert!(loc.succeeded());
        assert!(!loc.had_data_errors());
        // 2024-07-01 00:00 through 2024-07-02 23:00
        assert_eq!(loc.hours().len(), 48);
        assert_eq!(loc.days().len(), 2);
        assert_eq!(loc.hours()[0].temperature, 20.0);
        assert!((loc.days()[0].wind_direction - 5.0 / 3.0).abs() < 1e-9);
        assert!(loc.member_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_calculate_precipitation_matches_consensus_total() {
        let source = load_location(StaticSource::new(), "CALGARY AB CA");
        let mut loc = LocationWeather::new("CALGARY AB CA");
        loc.calculate(&source, &run(), &members(), &ConsensusSettings::default())
            .await
            .unwrap();

        // median-inverted precipitation is member 2's cumulative: 7 * 0.5 * 2
        let total: f64 = loc.days().iter().map(|d| d.precipitation).sum();
        assert!((total - 7.0).abs() < 1e-9);
        for day in loc.days() {
            let hourly: f64 = loc
                .hours()
                .iter()
                .filter(|h| h.date() == day.date)
                .map(|h| h.precipitation)
                .sum();
            assert!((hourly - day.precipitation).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_calculate_with_member_tracks() {
        let source = load_location(StaticSource::new(), "CALGARY AB CA");
        let mut loc = LocationWeather::new("CALGARY AB CA");
        let settings = ConsensusSettings {
            include_members: true,
            ..ConsensusSettings::default()
        };
        loc.calculate(&source, &run(), &members(), &settings)
            .await
            .unwrap();

        let tracks = loc.member_tracks();
        assert_eq!(tracks.len(), 3);
        let member3 = &tracks[&3];
        assert_eq!(member3.hours.len(), 48);
        assert_eq!(member3.days.len(), 2);
        assert!((member3.days[0].wind_direction - 355.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_calculate_fails_when_a_source_is_missing() {
        let mut source = load_location(StaticSource::new(), "CALGARY AB CA");
        source.insert("ELSEWHERE", Variable::Temperature, Vec::new());
        let mut loc = LocationWeather::new("ELSEWHERE");
        let err = loc
            .calculate(&source, &run(), &members(), &ConsensusSettings::default())
            .await
            .unwrap_err();

        assert!(matches!(err, WeatherError::SourceUnavailable { .. }));
        assert_eq!(loc.stage(), Stage::Failed);
        assert_eq!(loc.failure(), Some(&err));
        assert!(loc.hours().is_empty());
    }

    #[tokio::test]
    async fn test_calculate_fails_without_first_hour_members() {
        let source = load_location(StaticSource::new(), "CALGARY AB CA");
        let mut loc = LocationWeather::new("CALGARY AB CA");
        let others = select_members(ModelFamily::GlobalEnsemble, &[]);
        let err = loc
            .calculate(&source, &run(), &others, &ConsensusSettings::default())
            .await
            .unwrap_err();
        assert_eq!(err, WeatherError::NoMemberData("CALGARY AB CA".to_string()));
        assert_eq!(loc.stage(), Stage::Failed);
    }

    #[tokio::test]
    async fn test_recalculate_clears_previous_failure() {
        let source = load_location(StaticSource::new(), "CALGARY AB CA");
        let mut loc = LocationWeather::new("CALGARY AB CA");
        let others = select_members(ModelFamily::GlobalEnsemble, &[]);
        let _ = loc
            .calculate(&source, &run(), &others, &ConsensusSettings::default())
            .await;
        assert!(loc.failure().is_some());

        loc.calculate(&source, &run(), &members(), &ConsensusSettings::default())
            .await
            .unwrap();
        assert!(loc.failure().is_none());
        assert_eq!(loc.stage(), Stage::Done);
    }

    #[tokio::test]
    async fn test_out_of_range_hours_still_complete() {
        let mut source = load_location(StaticSource::new(), "CALGARY AB CA");
        let hot: Vec<ForecastSnapshot> = (0..4)
            .map(|i| {
                let vt = format!("20240701{:02}", i * 6);
                (1..=3).fold(ForecastSnapshot::new(i * 6, vt), |s, m| s.with_value(m, 75.0))
            })
            .collect();
        source.insert("CALGARY AB CA", Variable::Temperature, hot);

        let mut loc = LocationWeather::new("CALGARY AB CA");
        loc.calculate(&source, &run(), &members(), &ConsensusSettings::default())
            .await
            .unwrap();
        assert_eq!(loc.stage(), Stage::Done);
        assert!(loc.had_data_errors());
        assert_eq!(loc.out_of_range().len(), 4);
        assert!(loc.hours().iter().filter(|h| !h.interpolated).all(|h| h.error));
    }

    #[test]
    fn test_report_serializes() {
        let loc = LocationWeather::new("CALGARY AB CA");
        let json = serde_json::to_value(loc.report()).unwrap();
        assert_eq!(json["location"], "CALGARY AB CA");
        assert_eq!(json["stage"], "idle");
        assert!(json.get("members").is_none());
    }
}
