//! Directory of NAEFS forecast locations.
//!
//! The directory is owned by whoever constructs it. The list is loaded on
//! first lookup and kept until `invalidate()` is called.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::header::USER_AGENT;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::errors::WeatherError;
use crate::services::naefs::decode_body;

pub const NAEFS_LOCATIONS_URL: &str =
    "https://dd.weather.gc.ca/ensemble/doc/naefs/xml/locations.xml";

/// One published forecast location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationEntry {
    /// Upper-case `NAME PV CC` form, as used in document paths (with spaces).
    pub name: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Metres; NaN when the directory omits it.
    pub elevation: f64,
}

impl LocationEntry {
    /// Whether this is a Canadian location in the given province or territory.
    pub fn in_province(&self, abbrev: &str) -> bool {
        let mut parts = self.name.split_whitespace().rev();
        match (parts.next(), parts.next()) {
            (Some(country), Some(province)) => {
                country.eq_ignore_ascii_case("CA") && province.eq_ignore_ascii_case(abbrev.trim())
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
enum Feed {
    Remote {
        client: reqwest::Client,
        url: String,
        user_agent: String,
    },
    Inline(String),
}

#[derive(Debug)]
pub struct LocationDirectory {
    feed: Feed,
    cache: RwLock<Option<Arc<Vec<LocationEntry>>>>,
}

impl LocationDirectory {
    /// Directory backed by the datamart's `locations.xml`.
    pub fn new(url: &str, user_agent: &str, timeout: Duration) -> Result<Self, WeatherError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WeatherError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            feed: Feed::Remote {
                client,
                url: url.to_string(),
                user_agent: user_agent.to_string(),
            },
            cache: RwLock::new(None),
        })
    }

    /// Directory backed by an already downloaded document.
    pub fn from_xml(xml: impl Into<String>) -> Self {
        Self {
            feed: Feed::Inline(xml.into()),
            cache: RwLock::new(None),
        }
    }

    /// All entries, loading them on first use.
    pub async fn entries(&self) -> Result<Arc<Vec<LocationEntry>>, WeatherError> {
        if let Some(entries) = self.cache.read().await.as_ref() {
            return Ok(Arc::clone(entries));
        }

        let mut cache = self.cache.write().await;
        // another task may have loaded while we waited for the lock
        if let Some(entries) = cache.as_ref() {
            return Ok(Arc::clone(entries));
        }
        let entries = Arc::new(self.load().await?);
        tracing::info!("Loaded {} forecast locations", entries.len());
        *cache = Some(Arc::clone(&entries));
        Ok(entries)
    }

    /// Drop the cached list; the next lookup reloads it.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    pub async fn is_loaded(&self) -> bool {
        self.cache.read().await.is_some()
    }

    /// Case-insensitive lookup by name.
    pub async fn find(&self, name: &str) -> Result<Option<LocationEntry>, WeatherError> {
        let wanted = name.trim().replace('_', " ");
        Ok(self
            .entries()
            .await?
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(&wanted))
            .cloned())
    }

    /// Canadian locations in one province or territory, e.g. "AB".
    pub async fn in_province(&self, abbrev: &str) -> Result<Vec<LocationEntry>, WeatherError> {
        Ok(self
            .entries()
            .await?
            .iter()
            .filter(|e| e.in_province(abbrev))
            .cloned()
            .collect())
    }

    async fn load(&self) -> Result<Vec<LocationEntry>, WeatherError> {
        match &self.feed {
            Feed::Inline(xml) => parse_locations(xml),
            Feed::Remote {
                client,
                url,
                user_agent,
            } => {
                let unavailable = |message: String| WeatherError::SourceUnavailable {
                    variable: "locations".to_string(),
                    message,
                };
                let response = client
                    .get(url)
                    .header(USER_AGENT, user_agent.as_str())
                    .send()
                    .await
                    .map_err(|e| unavailable(format!("request failed: {}", e)))?;
                if !response.status().is_success() {
                    return Err(unavailable(format!(
                        "datamart returned HTTP {}",
                        response.status()
                    )));
                }
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| unavailable(format!("reading body failed: {}", e)))?;
                parse_locations(&decode_body(&body)?)
            }
        }
    }
}

/// Parse the datamart `locations.xml`.
pub fn parse_locations(xml: &str) -> Result<Vec<LocationEntry>, WeatherError> {
    let mut reader = Reader::from_str(xml);

    let mut entries = Vec::new();
    let mut current: Option<LocationEntry> = None;
    let mut field: Option<&'static str> = None;

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"location" => current = Some(entry_from_attributes(e)),
                b"latitude" => field = Some("latitude"),
                b"longitude" => field = Some("longitude"),
                b"altitude" => field = Some("altitude"),
                _ => field = None,
            },
            Ok(Event::Empty(ref e)) => {
                if e.name().as_ref() == b"location" {
                    entries.push(entry_from_attributes(e));
                }
            }
            Ok(Event::Text(ref e)) => {
                if let (Some(entry), Some(name)) = (current.as_mut(), field) {
                    let text = e.unescape().unwrap_or_default().trim().to_string();
                    let value = text.parse::<f64>().unwrap_or_else(|_| {
                        tracing::warn!(
                            "Malformed {} '{}' for {}, leaving it unset",
                            name,
                            text,
                            entry.name
                        );
                        f64::NAN
                    });
                    match name {
                        "latitude" => entry.latitude = value,
                        "longitude" => entry.longitude = value,
                        _ => entry.elevation = value,
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"location" {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                }
                field = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(WeatherError::MalformedDocument(format!(
                    "locations.xml at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(entries)
}

fn entry_from_attributes(e: &BytesStart<'_>) -> LocationEntry {
    let mut entry = LocationEntry {
        name: String::new(),
        country: String::new(),
        latitude: f64::NAN,
        longitude: f64::NAN,
        elevation: f64::NAN,
    };
    for attr in e.attributes().flatten() {
        let val = std::str::from_utf8(&attr.value).unwrap_or("").trim();
        match attr.key.as_ref() {
            b"file_desc" => entry.name = val.replace('_', " "),
            b"pays_country" => entry.country = val.to_string(),
            _ => {}
        }
    }
    entry
}
