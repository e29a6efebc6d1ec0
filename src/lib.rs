//! Percentile consensus forecasts from NAEFS ensemble members.
//!
//! The pipeline per location: fetch the five surface variables, reduce the
//! selected members to one percentile value per forecast hour, gap-fill the
//! 6-hour series to hourly, then roll the hours up into days.

pub mod config;
pub mod errors;
mod helpers;
pub mod models;
pub mod services;

pub use errors::{OutOfRangeReading, WeatherError};
pub use models::{CalculationRequest, Day, Hour, LocationTrack};
pub use services::calculator::{CalculationSummary, Calculator};
pub use services::location::{LocationWeather, Stage};
pub use services::source::{ForecastSource, StaticSource};
