//! NAEFS raw ensemble XML client.
//!
//! Fetches one document per (location, variable, run) from the MSC datamart.
//! See: https://dd.weather.gc.ca/ensemble/naefs/xml/

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use std::io::Read;
use std::time::Duration;

use crate::errors::WeatherError;
use crate::helpers::finite_value;
use crate::models::{ForecastRun, ForecastSnapshot, MemberId, Variable};
use crate::services::source::ForecastSource;

pub const NAEFS_BASE_URL: &str = "https://dd.weather.gc.ca/ensemble/naefs/xml/";

/// bzip2 stream magic.
const BZIP2_MAGIC: &[u8] = b"BZh";

/// Client for the NAEFS datamart.
#[derive(Debug, Clone)]
pub struct NaefsClient {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
}

impl NaefsClient {
    pub fn new(base_url: &str, user_agent: &str, timeout: Duration) -> Result<Self, WeatherError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WeatherError::Config(format!("Failed to build HTTP client: {}", e)))?;
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self {
            client,
            base_url,
            user_agent: user_agent.to_string(),
        })
    }

    /// Full document URL for one location, variable and run.
    pub fn document_url(&self, location: &str, variable: Variable, run: &ForecastRun) -> String {
        let stamp = run.date_stamp();
        let cycle = run.cycle.as_str();
        let code = variable.code();
        format!(
            "{}{}/{}/{}/raw/{}{}_GEPS-NAEFS-RAW_{}_{}_000-384.xml.bz2",
            self.base_url,
            stamp,
            cycle,
            code,
            stamp,
            cycle,
            location.trim().replace(' ', "_"),
            code
        )
    }

    async fn fetch_body(&self, url: &str, variable: Variable) -> Result<Vec<u8>, WeatherError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent)
                .map_err(|e| WeatherError::Config(format!("Invalid User-Agent: {}", e)))?,
        );

        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| {
                WeatherError::source_unavailable(variable, format!("request failed: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(WeatherError::source_unavailable(
                variable,
                format!("datamart returned HTTP {}", response.status()),
            ));
        }

        let body = response.bytes().await.map_err(|e| {
            WeatherError::source_unavailable(variable, format!("reading body failed: {}", e))
        })?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl ForecastSource for NaefsClient {
    async fn fetch(
        &self,
        location: &str,
        variable: Variable,
        run: &ForecastRun,
    ) -> Result<Vec<ForecastSnapshot>, WeatherError> {
        let url = self.document_url(location, variable, run);
        let body = self.fetch_body(&url, variable).await?;
        let xml = decode_body(&body)
            .map_err(|e| WeatherError::source_unavailable(variable, e.to_string()))?;
        let snapshots = parse_forecast_document(&xml)
            .map_err(|e| WeatherError::source_unavailable(variable, e.to_string()))?;
        tracing::debug!("Fetched {} ({} forecast hours)", url, snapshots.len());
        Ok(snapshots)
    }
}

/// Decompress a bzip2 body, or pass plain XML through.
pub fn decode_body(body: &[u8]) -> Result<String, WeatherError> {
    if body.starts_with(BZIP2_MAGIC) {
        let mut xml = String::new();
        bzip2::read::BzDecoder::new(body)
            .read_to_string(&mut xml)
            .map_err(|e| WeatherError::MalformedDocument(format!("bzip2: {}", e)))?;
        Ok(xml)
    } else {
        String::from_utf8(body.to_vec())
            .map_err(|e| WeatherError::MalformedDocument(format!("not UTF-8: {}", e)))
    }
}

/// Parse a NAEFS forecast document into snapshots ordered by forecast hour.
///
/// Each `<forecast forecast_hour=".." valid_time="..">` becomes one snapshot;
/// each child with an `id` attribute and numeric text is a member value.
pub fn parse_forecast_document(xml: &str) -> Result<Vec<ForecastSnapshot>, WeatherError> {
    let mut reader = Reader::from_str(xml);

    let mut snapshots: Vec<ForecastSnapshot> = Vec::new();
    let mut current: Option<ForecastSnapshot> = None;
    let mut member: Option<MemberId> = None;

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                if e.name().as_ref() == b"forecast" {
                    let mut forecast_hour: Option<u32> = None;
                    let mut valid_time: Option<String> = None;
                    for attr in e.attributes().flatten() {
                        let val = std::str::from_utf8(&attr.value).unwrap_or("").trim();
                        match attr.key.as_ref() {
                            b"forecast_hour" => forecast_hour = val.parse().ok(),
                            b"valid_time" => valid_time = Some(val.to_string()),
                            _ => {}
                        }
                    }
                    let (Some(forecast_hour), Some(valid_time)) = (forecast_hour, valid_time)
                    else {
                        return Err(WeatherError::MalformedDocument(
                            "<forecast> without forecast_hour/valid_time".to_string(),
                        ));
                    };
                    current = Some(ForecastSnapshot::new(forecast_hour, valid_time));
                } else if current.is_some() {
                    member = member_id(e);
                }
            }
            Ok(Event::Text(ref e)) => {
                if let (Some(snapshot), Some(id)) = (current.as_mut(), member) {
                    let text = e.unescape().unwrap_or_default().trim().to_string();
                    match text.parse::<f64>() {
                        Ok(value) => {
                            if let Some(value) = finite_value(value, &snapshot.valid_time) {
                                snapshot.insert(id, value);
                            }
                        }
                        Err(_) if text.is_empty() => {}
                        Err(_) => tracing::warn!(
                            "Member {} at {} has non-numeric value '{}', ignoring it",
                            id,
                            snapshot.valid_time,
                            text
                        ),
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"forecast" {
                    if let Some(snapshot) = current.take() {
                        snapshots.push(snapshot);
                    }
                }
                member = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(WeatherError::MalformedDocument(format!(
                    "XML error at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    snapshots.sort_by_key(|s| s.forecast_hour);
    Ok(snapshots)
}

fn member_id(e: &quick_xml::events::BytesStart<'_>) -> Option<MemberId> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == b"id")
        .and_then(|attr| std::str::from_utf8(&attr.value).ok()?.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ForecastCycle;
    use chrono::NaiveDate;
    use std::io::Write;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DOCUMENT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<product>
  <header>
    <location description="CALGARY" pays_country="CA" province_state="AB"/>
    <forecast_element code="TMP-SFC" title_english="Temperature" unit_english="C"/>
  </header>
  <data>
    <forecast forecast_hour="6" valid_time="2024070106">
      <model id="1">12.5</model>
      <model id="2"></model>
      <model id="3">NaN</model>
      <model id="22">11.0</model>
    </forecast>
    <forecast forecast_hour="0" valid_time="2024070100">
      <model id="1">10.0</model>
      <model id="2">9.5</model>
    </forecast>
  </data>
</product>"#;

    fn run() -> ForecastRun {
        ForecastRun {
            date: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            cycle: ForecastCycle::Noon,
        }
    }

    fn client(base: &str) -> NaefsClient {
        NaefsClient::new(base, "ensemble-consensus-test", Duration::from_secs(5)).unwrap()
    }

    fn bzip(xml: &str) -> Vec<u8> {
        let mut encoder =
            bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        encoder.write_all(xml.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_document_url() {
        let c = client("https://dd.weather.gc.ca/ensemble/naefs/xml");
        assert_eq!(
            c.document_url("CALGARY AB CA", Variable::WindDirection, &run()),
            "https://dd.weather.gc.ca/ensemble/naefs/xml/20240701/12/WDIR-SFC/raw/\
             2024070112_GEPS-NAEFS-RAW_CALGARY_AB_CA_WDIR-SFC_000-384.xml.bz2"
        );
    }

    #[test]
    fn test_parse_forecast_document() {
        let snaps = parse_forecast_document(DOCUMENT).unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].forecast_hour, 0);
        assert_eq!(snaps[0].valid_time, "2024070100");
        assert_eq!(snaps[0].get(2), Some(9.5));

        let later = &snaps[1];
        assert_eq!(later.get(1), Some(12.5));
        assert_eq!(later.get(22), Some(11.0));
        // empty and NaN values mean the member did not report
        assert!(!later.reported(2));
        assert!(!later.reported(3));
    }

    #[test]
    fn test_parse_forecast_document_missing_attributes() {
        let err = parse_forecast_document("<data><forecast><model id=\"1\">1</model></forecast></data>")
            .unwrap_err();
        assert!(matches!(err, WeatherError::MalformedDocument(_)));
    }

    #[test]
    fn test_parse_forecast_document_broken_xml() {
        assert!(parse_forecast_document("<data><forecast forecast_hour=\"0\" valid_time=\"2024070100\"></data>").is_err());
    }

    #[test]
    fn test_decode_body_plain_and_bzip2() {
        assert_eq!(decode_body(b"<a/>").unwrap(), "<a/>");
        assert_eq!(decode_body(&bzip(DOCUMENT)).unwrap(), DOCUMENT);
    }

    #[tokio::test]
    async fn test_fetch_decompresses_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/20240701/12/TMP-SFC/raw/2024070112_GEPS-NAEFS-RAW_CALGARY_AB_CA_TMP-SFC_000-384.xml.bz2",
            ))
            .and(header("user-agent", "ensemble-consensus-test"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(bzip(DOCUMENT)))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server.uri());
        let snaps = c
            .fetch("CALGARY AB CA", Variable::Temperature, &run())
            .await
            .unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[1].get(1), Some(12.5));
    }

    #[tokio::test]
    async fn test_fetch_http_error_is_source_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .fetch("NOWHERE", Variable::Precipitation, &run())
            .await
            .unwrap_err();
        match err {
            WeatherError::SourceUnavailable { variable, message } => {
                assert_eq!(variable, "APCP-SFC");
                assert!(message.contains("404"), "message: {}", message);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_garbage_body_is_source_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<forecast forecast_hour=\"x\">"))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .fetch("CALGARY AB CA", Variable::WindSpeed, &run())
            .await
            .unwrap_err();
        assert!(matches!(err, WeatherError::SourceUnavailable { .. }));
    }
}
