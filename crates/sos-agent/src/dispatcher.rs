//! Alert dispatcher: the ordered, capped fan-out for one dispatch cycle.
//!
//! ```text
//! for contact in contacts (in order):
//!   texts_sent < MAX_TEXTS        → send text, count it (even on failure)
//!   first text of the episode     → reserve call budget, spawn delayed call
//! both caps reached               → close sending until the next reset
//! ```
//!
//! The voice call is a separate task: it sleeps for the configured delay
//! and then dials. It owns copies of its contact, script and episode id and
//! never touches `EpisodeState`, so it needs no lock. It can be cancelled
//! through the episode's token; whether a reset cancels it is the engine's
//! decision.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channels::{ChannelKind, ProviderId, TextChannel, VoiceChannel};
use crate::contacts::Contact;
use crate::errors::{ChannelError, ChannelFailureKind};
use crate::location::Location;
use crate::messages::{render_text, VoiceScript};
use crate::state_machine::{EpisodeState, MAX_CALLS, MAX_TEXTS};

/// Default gap between the first text and the voice call.
pub const DEFAULT_CALL_DELAY: Duration = Duration::from_secs(3);

/// Outcome of one notification send. Logged, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertAttempt {
    pub kind: ChannelKind,
    pub contact: Contact,
    pub episode: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<ProviderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ChannelFailureKind>,
    /// Whether the failure looked transient. Informational; never retried.
    #[serde(default)]
    pub transient: bool,
    pub at: DateTime<Utc>,
}

impl AlertAttempt {
    pub fn new(
        kind: ChannelKind,
        contact: Contact,
        episode: u64,
        result: Result<ProviderId, ChannelError>,
    ) -> Self {
        let (provider_id, error) = match result {
            Ok(id) => (Some(id), None),
            Err(e) => (None, Some(e)),
        };
        Self {
            kind,
            contact,
            episode,
            success: error.is_none(),
            provider_id,
            failure: error.as_ref().map(ChannelError::kind),
            transient: error.as_ref().is_some_and(ChannelError::is_transient),
            error: error.map(|e| e.to_string()),
            at: Utc::now(),
        }
    }

    fn log(&self, ordinal: u32, cap: u32) {
        if self.success {
            info!(
                channel = %self.kind,
                contact = %self.contact,
                episode = self.episode,
                provider_id = ?self.provider_id,
                "Alert {ordinal}/{cap} delivered to provider"
            );
        } else {
            warn!(
                channel = %self.kind,
                contact = %self.contact,
                episode = self.episode,
                failure = ?self.failure,
                transient = self.transient,
                error = ?self.error,
                "Alert {ordinal}/{cap} failed; budget consumed, not retried"
            );
        }
    }
}

/// A voice call waiting on its delay.
#[derive(Debug)]
pub struct ScheduledCall {
    pub episode: u64,
    pub contact: Contact,
    /// Resolves to `None` if the call was cancelled before dialing.
    pub handle: JoinHandle<Option<AlertAttempt>>,
}

/// Everything one dispatch cycle did.
#[derive(Debug)]
pub struct DispatchReport {
    pub episode: u64,
    /// The location the alerts carried, after fallback.
    pub location: Option<Location>,
    pub texts: Vec<AlertAttempt>,
    pub scheduled_call: Option<ScheduledCall>,
    /// This cycle reached both caps and closed sending.
    pub exhausted: bool,
}

/// Knobs for message content and timing.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub call_delay: Duration,
    pub voice: String,
    /// Used when the record carried no resolvable location.
    pub fallback_location: Option<Location>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            call_delay: DEFAULT_CALL_DELAY,
            voice: "alice".to_string(),
            fallback_location: None,
        }
    }
}

pub struct AlertDispatcher {
    text: Arc<dyn TextChannel>,
    voice: Arc<dyn VoiceChannel>,
    settings: DispatchSettings,
}

impl AlertDispatcher {
    pub fn new(
        text: Arc<dyn TextChannel>,
        voice: Arc<dyn VoiceChannel>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            text,
            voice,
            settings,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Run one dispatch cycle against `state`.
    ///
    /// Channel failures are recorded and the loop moves on to the next
    /// contact. Scheduled calls observe `cancel`.
    pub async fn dispatch_episode(
        &self,
        state: &mut EpisodeState,
        contacts: &[Contact],
        location: Option<Location>,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        let location = location.or(self.settings.fallback_location);
        let episode = state.episode();
        let mut texts = Vec::new();
        let mut scheduled_call = None;

        for contact in contacts {
            if !state.can_send_text() {
                break;
            }

            let body = render_text(location.as_ref(), Utc::now());
            let result = self.text.send_text(contact, &body).await;
            let Some(ordinal) = state.record_text() else {
                break;
            };
            let attempt = AlertAttempt::new(ChannelKind::Text, contact.clone(), episode, result);
            attempt.log(ordinal, MAX_TEXTS);
            texts.push(attempt);

            if scheduled_call.is_none() && state.reserve_call() {
                info!(
                    contact = %contact,
                    episode,
                    delay_ms = self.settings.call_delay.as_millis() as u64,
                    "Voice call {}/{MAX_CALLS} scheduled",
                    state.calls_made()
                );
                scheduled_call = Some(self.schedule_call(contact, location, episode, cancel));
            }
        }

        let exhausted = state.settle();
        if exhausted {
            info!(
                episode,
                texts = state.texts_sent(),
                calls = state.calls_made(),
                "Maximum alerts sent; waiting for the trigger to clear"
            );
        }

        DispatchReport {
            episode,
            location,
            texts,
            scheduled_call,
            exhausted,
        }
    }

    fn schedule_call(
        &self,
        contact: &Contact,
        location: Option<Location>,
        episode: u64,
        cancel: &CancellationToken,
    ) -> ScheduledCall {
        let voice = Arc::clone(&self.voice);
        let script = VoiceScript::for_alert(location.as_ref(), &self.settings.voice);
        let delay = self.settings.call_delay;
        let cancel = cancel.clone();
        let target = contact.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(contact = %target, episode, "Scheduled voice call cancelled before dialing");
                    None
                }
                _ = tokio::time::sleep(delay) => {
                    let result = voice.place_voice_call(&target, &script).await;
                    let attempt = AlertAttempt::new(ChannelKind::Voice, target, episode, result);
                    attempt.log(1, MAX_CALLS);
                    Some(attempt)
                }
            }
        });

        ScheduledCall {
            episode,
            contact: contact.clone(),
            handle,
        }
    }
}
