//! Batch calculation over several locations.
//!
//! Locations share nothing but the read-only forecast source, so they run
//! concurrently. One location failing never affects the others.

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;

use crate::errors::WeatherError;
use crate::models::{CalculationRequest, ForecastRun, MemberId};
use crate::services::consensus::ConsensusSettings;
use crate::services::location::{LocationReport, LocationWeather};
use crate::services::members::{require_members, MemberSelection, ModelFamily};
use crate::services::source::ForecastSource;

/// Counts for one finished batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalculationSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub had_data_errors: bool,
}

impl CalculationSummary {
    pub fn all_failed(&self) -> bool {
        self.succeeded == 0 && self.failed > 0
    }
}

pub struct Calculator {
    source: Arc<dyn ForecastSource>,
    locations: Vec<LocationWeather>,
    members: MemberSelection,
    run: Option<ForecastRun>,
}

impl Calculator {
    pub fn new(source: Arc<dyn ForecastSource>) -> Self {
        Self {
            source,
            locations: Vec::new(),
            members: MemberSelection::default(),
            run: None,
        }
    }

    /// Run every requested location, replacing any previous results.
    ///
    /// Fails before fetching if the request is invalid or selects no members;
    /// per-location failures are recorded on the location instead.
    pub async fn calculate(
        &mut self,
        request: &CalculationRequest,
    ) -> Result<CalculationSummary, WeatherError> {
        request.validate()?;
        let members = require_members(request.model, &request.custom_members)?;
        let run = request.run();
        let settings = ConsensusSettings {
            percentile: f64::from(request.percentile),
            offset: request.offset,
            ignore_precipitation: request.ignore_precipitation,
            include_members: request.include_members,
        };

        tracing::info!(
            "Starting {} model ({} members, p{}) for {} locations",
            request.model,
            members.len(),
            request.percentile,
            request.locations.len()
        );

        self.locations = request
            .locations
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .map(LocationWeather::new)
            .collect();

        let source = Arc::clone(&self.source);
        join_all(
            self.locations
                .iter_mut()
                .map(|loc| loc.calculate(source.as_ref(), &run, &members, &settings)),
        )
        .await;

        self.members = members;
        self.run = Some(run);

        let summary = self.summary();
        tracing::info!(
            "Batch finished: {} succeeded, {} failed, data errors: {}",
            summary.succeeded,
            summary.failed,
            summary.had_data_errors
        );
        Ok(summary)
    }

    fn summary(&self) -> CalculationSummary {
        let succeeded = self.locations.iter().filter(|l| l.succeeded()).count();
        CalculationSummary {
            succeeded,
            failed: self.locations.len() - succeeded,
            had_data_errors: self.had_data_errors(),
        }
    }

    pub fn locations(&self) -> &[LocationWeather] {
        &self.locations
    }

    pub fn location(&self, name: &str) -> Option<&LocationWeather> {
        self.locations
            .iter()
            .find(|l| l.location().eq_ignore_ascii_case(name.trim()))
    }

    /// Members used by the last batch.
    pub fn members(&self) -> &MemberSelection {
        &self.members
    }

    /// True when any location in the last batch flagged an hour.
    pub fn had_data_errors(&self) -> bool {
        self.locations.iter().any(|l| l.had_data_errors())
    }

    pub fn report(&self) -> CalculationReport<'_> {
        CalculationReport {
            run: self.run,
            members: self.members.ids(),
            had_data_errors: self.had_data_errors(),
            locations: self.locations.iter().map(|l| l.report()).collect(),
        }
    }
}

/// Serializable view of the last batch.
#[derive(Debug, Serialize)]
pub struct CalculationReport<'a> {
    pub run: Option<ForecastRun>,
    pub members: &'a [MemberId],
    pub had_data_errors: bool,
    pub locations: Vec<LocationReport<'a>>,
}

/// Convenience for a single-location calculation with one model family.
pub async fn calculate_location(
    source: Arc<dyn ForecastSource>,
    location: &str,
    model: ModelFamily,
    request: &CalculationRequest,
) -> Result<LocationWeather, WeatherError> {
    let mut single = request.clone();
    single.locations = vec![location.to_string()];
    single.model = model;

    let mut calculator = Calculator::new(source);
    calculator.calculate(&single).await?;
    let mut locations = std::mem::take(&mut calculator.locations);
    match locations.pop() {
        Some(loc) => match loc.failure() {
            Some(e) => Err(e.clone()),
            None => Ok(loc),
        },
        None => Err(WeatherError::InvalidRequest("no locations requested".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Variable;
    use crate::services::location::tests::{load_location, run};
    use crate::services::location::Stage;
    use crate::services::source::StaticSource;

    fn request(locations: &[&str]) -> CalculationRequest {
        let mut request = CalculationRequest::new(
            locations.iter().map(|l| l.to_string()).collect(),
            run().date,
        );
        request.model = ModelFamily::Custom;
        request.custom_members = vec![1, 2, 3];
        request
    }

    fn two_location_source() -> Arc<dyn ForecastSource> {
        let source = load_location(StaticSource::new(), "CALGARY AB CA");
        Arc::new(load_location(source, "KELOWNA BC CA"))
    }

    #[tokio::test]
    async fn test_batch_runs_every_location() {
        let mut calc = Calculator::new(two_location_source());
        let summary = calc
            .calculate(&request(&["CALGARY AB CA", "KELOWNA BC CA"]))
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 0);
        assert!(!summary.had_data_errors);
        assert_eq!(calc.locations().len(), 2);
        assert!(calc.locations().iter().all(|l| l.stage() == Stage::Done));
        assert_eq!(calc.members().ids(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failed_location_does_not_affect_others() {
        let mut calc = Calculator::new(two_location_source());
        let summary = calc
            .calculate(&request(&["CALGARY AB CA", "NOWHERE"]))
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert!(!summary.all_failed());
        assert_eq!(calc.location("calgary ab ca").unwrap().stage(), Stage::Done);
        let failed = calc.location("NOWHERE").unwrap();
        assert_eq!(failed.stage(), Stage::Failed);
        assert!(matches!(
            failed.failure(),
            Some(WeatherError::SourceUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_custom_selection_fails_before_fetch() {
        let mut calc = Calculator::new(two_location_source());
        let mut req = request(&["CALGARY AB CA"]);
        req.custom_members.clear();
        let err = calc.calculate(&req).await.unwrap_err();
        assert_eq!(err, WeatherError::EmptyMemberSelection("custom".to_string()));
        assert!(calc.locations().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_custom_members_count_once() {
        let mut calc = Calculator::new(two_location_source());
        let mut req = request(&["CALGARY AB CA"]);
        req.custom_members = vec![1, 1, 1, 3];
        req.include_members = true;
        calc.calculate(&req).await.unwrap();

        assert_eq!(calc.members().ids(), &[1, 3]);
        let loc = calc.location("CALGARY AB CA").unwrap();
        // p50 of members 1 (15.0) and 3 (25.0)
        assert_eq!(loc.hours()[0].temperature, 20.0);

        let track = &loc.member_tracks()[&1];
        assert_eq!(track.hours.len(), 48);
        assert!(track.hours.windows(2).all(|w| w[0].time < w[1].time));
    }

    #[tokio::test]
    async fn test_out_of_range_custom_member_rejected() {
        let mut calc = Calculator::new(two_location_source());
        let mut req = request(&["CALGARY AB CA"]);
        req.custom_members = vec![1, 44];
        assert!(matches!(
            calc.calculate(&req).await,
            Err(WeatherError::InvalidRequest(_))
        ));
        assert!(calc.locations().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_percentile_rejected() {
        let mut calc = Calculator::new(two_location_source());
        let mut req = request(&["CALGARY AB CA"]);
        req.percentile = 150;
        assert!(matches!(
            calc.calculate(&req).await,
            Err(WeatherError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_recalculate_replaces_previous_results() {
        let mut calc = Calculator::new(two_location_source());
        calc.calculate(&request(&["CALGARY AB CA", "KELOWNA BC CA"]))
            .await
            .unwrap();
        calc.calculate(&request(&["KELOWNA BC CA"])).await.unwrap();
        assert_eq!(calc.locations().len(), 1);
        assert!(calc.location("CALGARY AB CA").is_none());
    }

    #[tokio::test]
    async fn test_batch_data_error_flag() {
        let mut source = load_location(StaticSource::new(), "CALGARY AB CA");
        source = load_location(source, "KELOWNA BC CA");
        let soaked: Vec<_> = source_series_with(120.0);
        source.insert("KELOWNA BC CA", Variable::RelativeHumidity, soaked);

        let mut calc = Calculator::new(Arc::new(source));
        let summary = calc
            .calculate(&request(&["CALGARY AB CA", "KELOWNA BC CA"]))
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 2);
        assert!(summary.had_data_errors);
        assert!(calc.had_data_errors());
        assert!(!calc.location("CALGARY AB CA").unwrap().had_data_errors());
    }

    fn source_series_with(value: f64) -> Vec<crate::models::ForecastSnapshot> {
        (0..2)
            .map(|i| {
                (1..=3).fold(
                    crate::models::ForecastSnapshot::new(i * 6, format!("20240701{:02}", i * 6)),
                    |s, m| s.with_value(m, value),
                )
            })
            .collect()
    }

    #[test]
    fn test_higher_percentile_is_warmer_and_drier() {
        let source = two_location_source();
        let median = tokio_test::block_on(calculate_location(
            Arc::clone(&source),
            "CALGARY AB CA",
            ModelFamily::Custom,
            &request(&[]),
        ))
        .unwrap();

        let mut hot_request = request(&[]);
        hot_request.percentile = 90;
        let hot = tokio_test::block_on(calculate_location(
            source,
            "CALGARY AB CA",
            ModelFamily::Custom,
            &hot_request,
        ))
        .unwrap();

        for (m, h) in median.days().iter().zip(hot.days()) {
            assert!(h.max_temperature >= m.max_temperature);
            assert!(h.min_relative_humidity <= m.min_relative_humidity);
            assert!(h.precipitation <= m.precipitation);
        }
    }

    #[test]
    fn test_report_serializes() {
        let mut calc = Calculator::new(two_location_source());
        tokio_test::block_on(calc.calculate(&request(&["CALGARY AB CA"]))).unwrap();
        let json = serde_json::to_value(calc.report()).unwrap();
        assert_eq!(json["members"], serde_json::json!([1, 2, 3]));
        assert_eq!(json["locations"][0]["stage"], "done");
        assert_eq!(json["locations"][0]["hours"].as_array().unwrap().len(), 48);
    }
}
