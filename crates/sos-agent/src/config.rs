//! Agent configuration: TOML file, then environment overrides, then
//! validation.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variables (`TWILIO_AUTH_TOKEN`, `SOS_EMERGENCY_CONTACTS`, ...)
//! 2. Values in the TOML file
//! 3. Built-in defaults
//!
//! Any [`ConfigError`] is fatal: the engine must not start half-configured.
//!
//! ```toml
//! [telemetry]
//! channel_id = "2931414"
//! read_api_key = "..."
//!
//! [provider]
//! account_sid = "AC..."
//! auth_token = "..."
//! from_number = "+15673471858"
//!
//! [alerts]
//! contacts = ["+919391502293"]
//! fallback_location = { latitude = 17.385, longitude = 78.4867 }
//! ```

use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::contacts::{Contact, ContactList};
use crate::dispatcher::DispatchSettings;
use crate::engine::EngineOptions;
use crate::errors::ConfigError;
use crate::feed::FeedFields;
use crate::location::{Location, LocationFields};

const DEFAULT_FEED_BASE_URL: &str = "https://api.thingspeak.com";
const DEFAULT_PROVIDER_BASE_URL: &str = "https://api.twilio.com";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CALL_DELAY_SECS: u64 = 3;

const ENV_ACCOUNT_SID: &str = "TWILIO_ACCOUNT_SID";
const ENV_AUTH_TOKEN: &str = "TWILIO_AUTH_TOKEN";
const ENV_FROM_NUMBER: &str = "TWILIO_FROM_NUMBER";
const ENV_CHANNEL_ID: &str = "THINGSPEAK_CHANNEL_ID";
const ENV_READ_API_KEY: &str = "THINGSPEAK_READ_API_KEY";
const ENV_CONTACTS: &str = "SOS_EMERGENCY_CONTACTS";

/// Remote telemetry channel.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub base_url: String,
    pub channel_id: String,
    /// Empty for public channels.
    pub read_api_key: String,
    pub trigger_field: String,
    pub latitude_field: String,
    pub longitude_field: String,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_FEED_BASE_URL.to_string(),
            channel_id: String::new(),
            read_api_key: String::new(),
            trigger_field: "field1".to_string(),
            latitude_field: "field2".to_string(),
            longitude_field: "field3".to_string(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl TelemetryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn feed_fields(&self) -> FeedFields {
        FeedFields {
            trigger: self.trigger_field.clone(),
            location: LocationFields {
                latitude: self.latitude_field.clone(),
                longitude: self.longitude_field.clone(),
            },
        }
    }
}

impl fmt::Debug for TelemetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryConfig")
            .field("base_url", &self.base_url)
            .field("channel_id", &self.channel_id)
            .field("read_api_key", &redact(&self.read_api_key))
            .field("trigger_field", &self.trigger_field)
            .field("latitude_field", &self.latitude_field)
            .field("longitude_field", &self.longitude_field)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

/// Messaging provider account.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    /// Voice used for spoken scripts.
    pub voice: String,
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_PROVIDER_BASE_URL.to_string(),
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            voice: "alice".to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl ProviderConfig {
    pub fn sender(&self) -> Result<Contact, ConfigError> {
        Contact::parse(&self.from_number).map_err(|_| {
            ConfigError::invalid(
                "provider.from_number",
                format!("{:?} is not an E.164 phone number", self.from_number),
            )
        })
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .field("account_sid", &self.account_sid)
            .field("auth_token", &redact(&self.auth_token))
            .field("from_number", &self.from_number)
            .field("voice", &self.voice)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

/// Who gets alerted, and how.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Notification order.
    pub contacts: Vec<String>,
    pub call_delay_secs: u64,
    pub fallback_location: Option<Location>,
    pub cancel_pending_call_on_reset: bool,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            contacts: Vec::new(),
            call_delay_secs: DEFAULT_CALL_DELAY_SECS,
            fallback_location: None,
            cancel_pending_call_on_reset: false,
        }
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub telemetry: TelemetryConfig,
    pub provider: ProviderConfig,
    pub alerts: AlertsConfig,
}

impl AgentConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from `path` (or defaults when `None`), apply environment
    /// overrides, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from `lookup` (normally the process environment).
    /// Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_ACCOUNT_SID) {
            self.provider.account_sid = v;
        }
        if let Some(v) = get(ENV_AUTH_TOKEN) {
            self.provider.auth_token = v;
        }
        if let Some(v) = get(ENV_FROM_NUMBER) {
            self.provider.from_number = v;
        }
        if let Some(v) = get(ENV_CHANNEL_ID) {
            self.telemetry.channel_id = v;
        }
        if let Some(v) = get(ENV_READ_API_KEY) {
            self.telemetry.read_api_key = v;
        }
        if let Some(v) = get(ENV_CONTACTS) {
            self.alerts.contacts = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.telemetry;
        require_url("telemetry.base_url", &t.base_url)?;
        require_non_empty("telemetry.channel_id", &t.channel_id)?;
        require_non_empty("telemetry.trigger_field", &t.trigger_field)?;
        require_non_empty("telemetry.latitude_field", &t.latitude_field)?;
        require_non_empty("telemetry.longitude_field", &t.longitude_field)?;
        if t.poll_interval_secs == 0 {
            return Err(ConfigError::invalid("telemetry.poll_interval_secs", "must be > 0"));
        }
        if t.request_timeout_secs == 0 || t.request_timeout_secs >= t.poll_interval_secs {
            return Err(ConfigError::invalid(
                "telemetry.request_timeout_secs",
                format!("must be in 1..{}", t.poll_interval_secs),
            ));
        }

        let p = &self.provider;
        require_url("provider.base_url", &p.base_url)?;
        require_non_empty("provider.account_sid", &p.account_sid)?;
        require_non_empty("provider.auth_token", &p.auth_token)?;
        require_non_empty("provider.voice", &p.voice)?;
        p.sender()?;
        if p.request_timeout_secs == 0 {
            return Err(ConfigError::invalid("provider.request_timeout_secs", "must be > 0"));
        }

        let contacts = self.contact_list()?;
        if contacts.is_empty() {
            return Err(ConfigError::invalid("alerts.contacts", "must not be empty"));
        }
        if let Some(loc) = self.alerts.fallback_location {
            if !loc.is_valid() {
                return Err(ConfigError::invalid(
                    "alerts.fallback_location",
                    format!("{loc} is outside valid coordinate ranges"),
                ));
            }
        }
        Ok(())
    }

    pub fn contact_list(&self) -> Result<ContactList, ConfigError> {
        ContactList::parse(&self.alerts.contacts).map_err(|e| match e {
            ConfigError::Invalid { reason, .. } => ConfigError::invalid("alerts.contacts", reason),
            other => other,
        })
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            call_delay: Duration::from_secs(self.alerts.call_delay_secs),
            voice: self.provider.voice.clone(),
            fallback_location: self.alerts.fallback_location,
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            cancel_pending_call_on_reset: self.alerts.cancel_pending_call_on_reset,
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty"));
    }
    Ok(())
}

fn require_url(field: &str, value: &str) -> Result<(), ConfigError> {
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        return Err(ConfigError::invalid(field, format!("{value:?} is not an http(s) URL")));
    }
    Ok(())
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}
