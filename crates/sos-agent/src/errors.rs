//! Error taxonomy for the alert engine.
//!
//! | Error          | Raised by                 | Effect                                   |
//! |----------------|---------------------------|------------------------------------------|
//! | `FetchError`   | telemetry source          | poll cycle skipped, episode untouched    |
//! | `ChannelError` | text / voice channel      | attempt recorded as failed, budget spent |
//! | `ConfigError`  | config load / validation  | fatal at startup, engine never starts    |
//!
//! None of these are retried. A channel failure for one contact never aborts
//! the remaining contacts of the same dispatch cycle.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to obtain a usable telemetry record for one poll cycle.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection refused, DNS failure, timeout.
    #[error("Telemetry transport failure: {0}")]
    Transport(String),

    /// The feed endpoint answered with a non-success status.
    #[error("Telemetry source returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The body was not a feed document.
    #[error("Telemetry decode failure: {0}")]
    Decode(String),

    /// The feed parsed but carried no entries.
    #[error("Telemetry feed has no entries")]
    EmptyFeed,

    /// The latest entry has no value for the trigger field.
    #[error("Trigger field `{field}` missing from latest entry")]
    MissingTrigger { field: String },

    /// The trigger field holds something other than the two known values.
    #[error("Trigger field `{field}` has unrecognized value {value:?}")]
    InvalidTrigger { field: String, value: String },
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Coarse classification of a channel failure, used for log fields only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelFailureKind {
    Authentication,
    InvalidDestination,
    Transport,
    Provider,
}

impl fmt::Display for ChannelFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::InvalidDestination => write!(f, "invalid_destination"),
            Self::Transport => write!(f, "transport"),
            Self::Provider => write!(f, "provider"),
        }
    }
}

/// A single text or voice send that the provider did not accept.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// Credentials rejected by the provider.
    #[error("Provider rejected credentials: {0}")]
    Authentication(String),

    /// The contact address is not deliverable.
    #[error("Invalid destination {contact}: {message}")]
    InvalidDestination { contact: String, message: String },

    /// The request never got a provider answer (connect, timeout).
    #[error("Provider transport failure: {0}")]
    Transport(String),

    /// Any other provider-reported failure.
    #[error("Provider error (status {status}, code {code:?}): {message}")]
    Provider {
        status: u16,
        code: Option<i64>,
        message: String,
    },
}

impl ChannelError {
    pub fn kind(&self) -> ChannelFailureKind {
        match self {
            Self::Authentication(_) => ChannelFailureKind::Authentication,
            Self::InvalidDestination { .. } => ChannelFailureKind::InvalidDestination,
            Self::Transport(_) => ChannelFailureKind::Transport,
            Self::Provider { .. } => ChannelFailureKind::Provider,
        }
    }

    /// Whether the failure could plausibly clear on its own.
    ///
    /// Informational: the dispatcher never retries, whatever this says.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Provider { status, .. } => *status == 429 || *status >= 500,
            Self::Authentication(_) | Self::InvalidDestination { .. } => false,
        }
    }
}

impl From<reqwest::Error> for ChannelError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Missing or invalid configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value `{field}`: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failure_is_transient() {
        let err = ChannelError::Transport("connection reset".into());
        assert!(err.is_transient());
        assert_eq!(err.kind(), ChannelFailureKind::Transport);
    }

    #[test]
    fn auth_failure_is_not_transient() {
        let err = ChannelError::Authentication("bad token".into());
        assert!(!err.is_transient());
        assert_eq!(err.kind().to_string(), "authentication");
    }

    #[test]
    fn provider_5xx_and_429_are_transient() {
        let server = ChannelError::Provider {
            status: 503,
            code: None,
            message: "unavailable".into(),
        };
        let throttled = ChannelError::Provider {
            status: 429,
            code: Some(20429),
            message: "too many requests".into(),
        };
        let rejected = ChannelError::Provider {
            status: 400,
            code: Some(21606),
            message: "from number not capable".into(),
        };
        assert!(server.is_transient());
        assert!(throttled.is_transient());
        assert!(!rejected.is_transient());
    }

    #[test]
    fn config_invalid_message_names_field() {
        let err = ConfigError::invalid("alerts.contacts", "must not be empty");
        assert_eq!(
            err.to_string(),
            "Invalid config value `alerts.contacts`: must not be empty"
        );
    }

    #[test]
    fn fetch_error_display() {
        let err = FetchError::InvalidTrigger {
            field: "field1".into(),
            value: "maybe".into(),
        };
        assert!(err.to_string().contains("field1"));
        assert!(err.to_string().contains("\"maybe\""));
    }
}
