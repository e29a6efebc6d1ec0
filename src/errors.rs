use chrono::NaiveDateTime;
use serde::Serialize;

/// Fatal errors for a calculation or a single location within it.
///
/// Payloads are plain strings so a failure can be stored on the location that
/// produced it and handed back to the caller after the batch completes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WeatherError {
    #[error("Forecast source unavailable for {variable}: {message}")]
    SourceUnavailable { variable: String, message: String },

    #[error("No ensemble members resolved for model family '{0}'")]
    EmptyMemberSelection(String),

    #[error("No selected member reported data for the first forecast hour at {0}")]
    NoMemberData(String),

    #[error("Malformed forecast document: {0}")]
    MalformedDocument(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to write results: {0}")]
    Output(String),
}

impl WeatherError {
    pub(crate) fn source_unavailable(variable: impl ToString, message: impl ToString) -> Self {
        WeatherError::SourceUnavailable {
            variable: variable.to_string(),
            message: message.to_string(),
        }
    }
}

/// A reduced hour whose value breached physical bounds.
///
/// Never fatal: the hour stays in the sequence with its `error` flag set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutOfRangeReading {
    pub time: NaiveDateTime,
    pub field: &'static str,
    pub value: f64,
}
