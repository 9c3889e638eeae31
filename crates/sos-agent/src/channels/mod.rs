//! Notification channels: one send operation per delivery mechanism.
//!
//! Both operations are side-effecting and NOT idempotent. Re-sending after
//! an ambiguous failure can page a contact twice, so nothing in this crate
//! retries them.

pub mod twilio;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::contacts::Contact;
use crate::errors::ChannelError;
use crate::messages::VoiceScript;

pub use twilio::TwilioClient;

/// Identifier the provider assigns to an accepted message or call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(pub String);

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which channel an attempt went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    Voice,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Voice => write!(f, "voice"),
        }
    }
}

/// Sends a text message.
#[async_trait]
pub trait TextChannel: Send + Sync {
    async fn send_text(&self, contact: &Contact, body: &str) -> Result<ProviderId, ChannelError>;
}

/// Places a voice call that speaks a script.
#[async_trait]
pub trait VoiceChannel: Send + Sync {
    async fn place_voice_call(
        &self,
        contact: &Contact,
        script: &VoiceScript,
    ) -> Result<ProviderId, ChannelError>;
}
