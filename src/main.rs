// Ensemble consensus runner v0.1
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ensemble_consensus::config::AppConfig;
use ensemble_consensus::services::calculator::Calculator;
use ensemble_consensus::services::locations::LocationDirectory;
use ensemble_consensus::services::naefs::NaefsClient;
use ensemble_consensus::WeatherError;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing; stdout is reserved for the JSON results
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "ensemble_consensus=debug".into()),
    );
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    match run().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode, WeatherError> {
    let config = AppConfig::from_env()?;
    let mut request = config.to_request();

    if let Some(province) = &config.province {
        let directory =
            LocationDirectory::new(&config.locations_url, &config.user_agent, config.http_timeout)?;
        let found = directory.in_province(province).await?;
        if found.is_empty() {
            tracing::warn!("No forecast locations found in province {}", province);
        }
        request.locations.extend(
            found
                .into_iter()
                .map(|entry| entry.name)
                .filter(|name| !config.locations.contains(name)),
        );
    }

    let client = NaefsClient::new(&config.naefs_base_url, &config.user_agent, config.http_timeout)?;
    let mut calculator = Calculator::new(Arc::new(client));
    let summary = calculator.calculate(&request).await?;

    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &calculator.report())
        .map_err(|e| WeatherError::Output(e.to_string()))?;
    writeln!(stdout).map_err(|e| WeatherError::Output(e.to_string()))?;

    if summary.all_failed() {
        tracing::error!("Every location failed");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
