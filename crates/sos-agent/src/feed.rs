//! Remote telemetry channel: record model, trigger decoding, and the HTTP
//! feed client.
//!
//! The channel exposes the device's latest snapshot as a field-keyed JSON
//! document:
//!
//! ```text
//! GET {base}/channels/{id}/feeds.json?api_key={key}&results=1
//! { "channel": { .. }, "feeds": [ { "created_at": "..", "entry_id": 7,
//!                                   "field1": "1", "field2": "17.38", .. } ] }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::TelemetryConfig;
use crate::errors::{ConfigError, FetchError};
use crate::location::{self, Location, LocationFields};

/// One immutable snapshot of the channel's fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<u64>,
    /// Non-null field values, numbers rendered as strings.
    pub fields: BTreeMap<String, String>,
}

impl TelemetryRecord {
    pub fn from_fields(fields: BTreeMap<String, String>) -> Self {
        Self {
            created_at: None,
            entry_id: None,
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Build a record from one raw feed entry. Nulls are dropped.
    fn from_entry(entry: serde_json::Map<String, Value>) -> Self {
        let mut record = Self::default();
        for (key, value) in entry {
            match value {
                Value::String(s) if key == "created_at" => record.created_at = Some(s),
                Value::Number(n) if key == "entry_id" => record.entry_id = n.as_u64(),
                Value::String(s) => {
                    record.fields.insert(key, s);
                }
                Value::Number(n) => {
                    record.fields.insert(key, n.to_string());
                }
                _ => {}
            }
        }
        record
    }
}

/// The two values of the SOS trigger field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerValue {
    Cleared,
    Active,
}

impl TriggerValue {
    /// Decode a raw field value. Accepts `"1"`/`"0"` and their numeric
    /// spellings (`"1.0"`), surrounding whitespace ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "1" => Some(Self::Active),
            "0" => Some(Self::Cleared),
            other => match other.parse::<f64>() {
                Ok(v) if v == 1.0 => Some(Self::Active),
                Ok(v) if v == 0.0 => Some(Self::Cleared),
                _ => None,
            },
        }
    }

    pub fn is_active(self) -> bool {
        self == Self::Active
    }
}

impl fmt::Display for TriggerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cleared => write!(f, "cleared"),
            Self::Active => write!(f, "active"),
        }
    }
}

/// Which record fields carry the trigger and coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedFields {
    pub trigger: String,
    pub location: LocationFields,
}

impl Default for FeedFields {
    fn default() -> Self {
        Self {
            trigger: "field1".to_string(),
            location: LocationFields::default(),
        }
    }
}

/// What the state machine consumes from one record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub trigger: TriggerValue,
    pub location: Option<Location>,
}

impl Observation {
    pub fn new(trigger: TriggerValue, location: Option<Location>) -> Self {
        Self { trigger, location }
    }

    /// Extract trigger and location. A missing or unrecognized trigger is a
    /// `FetchError`: the cycle must be skipped rather than guessed.
    pub fn from_record(record: &TelemetryRecord, fields: &FeedFields) -> Result<Self, FetchError> {
        let raw = record
            .field(&fields.trigger)
            .ok_or_else(|| FetchError::MissingTrigger {
                field: fields.trigger.clone(),
            })?;
        let trigger = TriggerValue::parse(raw).ok_or_else(|| FetchError::InvalidTrigger {
            field: fields.trigger.clone(),
            value: raw.to_string(),
        })?;
        Ok(Self {
            trigger,
            location: location::resolve(record, &fields.location),
        })
    }
}

/// Source of the latest telemetry record.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Fetch the single most recent record.
    async fn fetch_latest(&self) -> Result<TelemetryRecord, FetchError>;
}

#[derive(Debug, Deserialize)]
struct FeedDocument {
    #[serde(default)]
    feeds: Vec<serde_json::Map<String, Value>>,
}

/// Parse a feed document body and return its most recent entry.
pub fn parse_feed(body: &str) -> Result<TelemetryRecord, FetchError> {
    let doc: FeedDocument =
        serde_json::from_str(body).map_err(|e| FetchError::Decode(e.to_string()))?;
    doc.feeds
        .into_iter()
        .last()
        .map(TelemetryRecord::from_entry)
        .ok_or(FetchError::EmptyFeed)
}

/// HTTP client for a ThingSpeak-style channel feed.
pub struct ChannelFeed {
    client: reqwest::Client,
    url: String,
    read_api_key: String,
}

impl ChannelFeed {
    pub fn new(config: &TelemetryConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self {
            client,
            url: feed_url(&config.base_url, &config.channel_id),
            read_api_key: config.read_api_key.clone(),
        })
    }
}

fn feed_url(base_url: &str, channel_id: &str) -> String {
    format!(
        "{}/channels/{}/feeds.json",
        base_url.trim_end_matches('/'),
        channel_id
    )
}

#[async_trait]
impl TelemetrySource for ChannelFeed {
    async fn fetch_latest(&self) -> Result<TelemetryRecord, FetchError> {
        let resp = self
            .client
            .get(&self.url)
            .query(&[("api_key", self.read_api_key.as_str()), ("results", "1")])
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let record = parse_feed(&body)?;
        debug!(entry_id = ?record.entry_id, created_at = ?record.created_at, "Fetched telemetry record");
        Ok(record)
    }
}
