//! Alert content: the text body and the spoken voice script.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::location::Location;

/// Phrase used in place of coordinates when no location is known.
pub const UNKNOWN_LOCATION: &str = "unknown location";

const DEFAULT_VOICE: &str = "alice";

/// Render the SOS text message body.
pub fn render_text(location: Option<&Location>, at: DateTime<Utc>) -> String {
    let where_line = match location {
        Some(loc) => format!("https://maps.google.com/maps?q={}", loc.query_pair()),
        None => UNKNOWN_LOCATION.to_string(),
    };
    format!(
        "SMARTBAND+ SOS ALERT!\n\
         Emergency signal triggered!\n\
         Location: {where_line}\n\
         Time: {}\n\
         Please respond immediately!",
        at.format("%Y-%m-%d %H:%M:%S UTC")
    )
}

/// One element of a spoken script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptPart {
    Say(String),
    /// Silence, in whole seconds.
    Pause(u32),
}

/// A voice-call script, rendered to provider markup on send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceScript {
    pub voice: String,
    pub parts: Vec<ScriptPart>,
}

impl VoiceScript {
    pub fn new(voice: impl Into<String>) -> Self {
        Self {
            voice: voice.into(),
            parts: Vec::new(),
        }
    }

    pub fn say(mut self, line: impl Into<String>) -> Self {
        self.parts.push(ScriptPart::Say(line.into()));
        self
    }

    pub fn pause(mut self, seconds: u32) -> Self {
        self.parts.push(ScriptPart::Pause(seconds));
        self
    }

    /// The standard SOS call: announcement, coordinates, closing request.
    pub fn for_alert(location: Option<&Location>, voice: &str) -> Self {
        let voice = if voice.trim().is_empty() {
            DEFAULT_VOICE
        } else {
            voice
        };
        let coordinates = match location {
            Some(loc) => format!(
                "Location coordinates: Latitude {}, Longitude {}.",
                loc.latitude, loc.longitude
            ),
            None => "The location is currently unknown.".to_string(),
        };
        Self::new(voice)
            .say(
                "Emergency Alert from Smartband Plus. An S.O.S signal has been triggered. \
                 The user needs immediate assistance.",
            )
            .pause(1)
            .say(coordinates)
            .pause(1)
            .say("Please respond to this emergency immediately. Thank you.")
    }

    /// Render as TwiML.
    pub fn to_twiml(&self) -> String {
        let mut out = String::from("<Response>");
        for part in &self.parts {
            match part {
                ScriptPart::Say(line) => {
                    out.push_str(&format!(
                        "<Say voice=\"{}\">{}</Say>",
                        escape_xml(&self.voice),
                        escape_xml(line)
                    ));
                }
                ScriptPart::Pause(secs) => {
                    out.push_str(&format!("<Pause length=\"{secs}\"/>"));
                }
            }
        }
        out.push_str("</Response>");
        out
    }

    /// Spoken lines joined, for logs.
    pub fn spoken_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ScriptPart::Say(line) => Some(line.as_str()),
                ScriptPart::Pause(_) => None,
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
