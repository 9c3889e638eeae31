//! The SOS engine: sole owner of the episode state.
//!
//! Every observation, whether it comes from the poller or a manual check,
//! enters through [`SosEngine::observe`], which holds the state lock for the
//! whole cycle (reset, dispatch, bookkeeping). Two cycles can therefore never
//! interleave their mutations.
//!
//! Scheduled voice calls are tracked here so a shutdown or a one-shot check
//! can wait for them to finish.

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::contacts::ContactList;
use crate::dispatcher::{AlertAttempt, AlertDispatcher, ScheduledCall};
use crate::feed::Observation;
use crate::state_machine::{Decision, EpisodeState};

/// Engine behavior switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    /// Cancel a not-yet-dialed call when its episode is reset. Off by
    /// default: a scheduled call normally runs to completion.
    pub cancel_pending_call_on_reset: bool,
}

/// What one observation did.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub decision: Decision,
    pub texts: Vec<AlertAttempt>,
    pub call_scheduled: bool,
    /// This cycle closed sending for the episode.
    pub exhausted: bool,
    /// State after the cycle.
    pub state: EpisodeState,
}

struct EpisodeCell {
    state: EpisodeState,
    /// Cancels calls scheduled during the current episode.
    token: CancellationToken,
}

pub struct SosEngine {
    cell: Mutex<EpisodeCell>,
    dispatcher: AlertDispatcher,
    contacts: ContactList,
    options: EngineOptions,
    pending: Mutex<Vec<ScheduledCall>>,
}

impl SosEngine {
    pub fn new(dispatcher: AlertDispatcher, contacts: ContactList, options: EngineOptions) -> Self {
        Self {
            cell: Mutex::new(EpisodeCell {
                state: EpisodeState::new(),
                token: CancellationToken::new(),
            }),
            dispatcher,
            contacts,
            options,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn contacts(&self) -> &ContactList {
        &self.contacts
    }

    /// Copy of the current episode state.
    pub async fn snapshot(&self) -> EpisodeState {
        self.cell.lock().await.state.clone()
    }

    /// Feed one observation through the state machine.
    pub async fn observe(&self, observation: Observation) -> CycleOutcome {
        let mut cell = self.cell.lock().await;
        let decision = cell.state.begin_cycle(observation.trigger);

        if decision.reset {
            let stale = std::mem::replace(&mut cell.token, CancellationToken::new());
            if self.options.cancel_pending_call_on_reset {
                stale.cancel();
            }
            info!(
                episode = cell.state.episode(),
                "Trigger cleared; alert counters reset"
            );
        }

        let mut outcome = CycleOutcome {
            decision,
            texts: Vec::new(),
            call_scheduled: false,
            exhausted: false,
            state: cell.state.clone(),
        };

        if decision.dispatch {
            info!(
                edge = %decision.edge,
                episode = cell.state.episode(),
                location = ?observation.location,
                "SOS trigger active; dispatching alerts"
            );
            let token = cell.token.clone();
            let report = self
                .dispatcher
                .dispatch_episode(
                    &mut cell.state,
                    self.contacts.as_slice(),
                    observation.location,
                    &token,
                )
                .await;
            outcome.texts = report.texts;
            outcome.exhausted = report.exhausted;
            if let Some(call) = report.scheduled_call {
                outcome.call_scheduled = true;
                let mut pending = self.pending.lock().await;
                pending.retain(|c| !c.handle.is_finished());
                pending.push(call);
            }
        }

        cell.state.end_cycle(observation.trigger);
        outcome.state = cell.state.clone();
        outcome
    }

    /// Number of scheduled calls that have not finished yet.
    pub async fn pending_calls(&self) -> usize {
        self.pending
            .lock()
            .await
            .iter()
            .filter(|c| !c.handle.is_finished())
            .count()
    }

    /// Wait for every scheduled call and return the attempts that dialed.
    pub async fn drain_pending_calls(&self) -> Vec<AlertAttempt> {
        let calls = std::mem::take(&mut *self.pending.lock().await);
        let mut attempts = Vec::with_capacity(calls.len());
        for call in calls {
            match call.handle.await {
                Ok(Some(attempt)) => attempts.push(attempt),
                Ok(None) => {}
                Err(e) => warn!(
                    contact = %call.contact,
                    episode = call.episode,
                    error = %e,
                    "Scheduled voice call task failed"
                ),
            }
        }
        attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ProviderId, TextChannel, VoiceChannel};
    use crate::contacts::Contact;
    use crate::dispatcher::DispatchSettings;
    use crate::errors::ChannelError;
    use crate::feed::TriggerValue;
    use crate::messages::VoiceScript;
    use crate::state_machine::{MAX_CALLS, MAX_TEXTS};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingChannel {
        texts: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TextChannel for CountingChannel {
        async fn send_text(&self, _: &Contact, _: &str) -> Result<ProviderId, ChannelError> {
            self.texts.fetch_add(1, Ordering::SeqCst);
            Ok(ProviderId("SM".into()))
        }
    }

    #[async_trait]
    impl VoiceChannel for CountingChannel {
        async fn place_voice_call(&self, _: &Contact, _: &VoiceScript) -> Result<ProviderId, ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProviderId("CA".into()))
        }
    }

    fn engine(channel: Arc<CountingChannel>, options: EngineOptions) -> SosEngine {
        let dispatcher = AlertDispatcher::new(channel.clone(), channel, DispatchSettings::default());
        SosEngine::new(
            dispatcher,
            ContactList::parse(&["+15550000001"]).unwrap(),
            options,
        )
    }

    fn active() -> Observation {
        Observation::new(TriggerValue::Active, None)
    }

    fn cleared() -> Observation {
        Observation::new(TriggerValue::Cleared, None)
    }

    #[tokio::test(start_paused = true)]
    async fn observe_updates_last_trigger_every_cycle() {
        let channel = Arc::new(CountingChannel::default());
        let engine = engine(channel, EngineOptions::default());

        let out = engine.observe(cleared()).await;
        assert!(!out.decision.dispatch);
        assert_eq!(out.state.last_trigger(), TriggerValue::Cleared);

        let out = engine.observe(active()).await;
        assert!(out.decision.dispatch);
        assert!(out.call_scheduled);
        assert_eq!(out.state.last_trigger(), TriggerValue::Active);
        assert_eq!(engine.snapshot().await.texts_sent(), 1);
        engine.drain_pending_calls().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reset_does_not_cancel_call_by_default() {
        let channel = Arc::new(CountingChannel::default());
        let engine = engine(channel.clone(), EngineOptions::default());

        engine.observe(active()).await;
        let out = engine.observe(cleared()).await;
        assert!(out.decision.reset);
        assert_eq!(engine.pending_calls().await, 1);

        let attempts = engine.drain_pending_calls().await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].episode, 0);
        assert_eq!(channel.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_call_when_configured() {
        let channel = Arc::new(CountingChannel::default());
        let engine = engine(
            channel.clone(),
            EngineOptions {
                cancel_pending_call_on_reset: true,
            },
        );

        engine.observe(active()).await;
        engine.observe(cleared()).await;

        let attempts = engine.drain_pending_calls().await;
        assert!(attempts.is_empty());
        assert_eq!(channel.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn caps_hold_for_every_trigger_sequence() {
        // Exhaustive over all trigger sequences up to length 8, through the
        // real dispatch path.
        for len in 1..=8u32 {
            for bits in 0..(1u32 << len) {
                let channel = Arc::new(CountingChannel::default());
                let engine = engine(channel.clone(), EngineOptions::default());
                let (mut episode_texts, mut episode_calls) = (0usize, 0usize);
                let (mut total_texts, mut total_calls) = (0usize, 0usize);

                for i in 0..len {
                    let observation = if bits & (1 << i) != 0 { active() } else { cleared() };
                    let out = engine.observe(observation).await;
                    if out.decision.reset {
                        episode_texts = 0;
                        episode_calls = 0;
                    }
                    episode_texts += out.texts.len();
                    episode_calls += usize::from(out.call_scheduled);
                    total_texts += out.texts.len();
                    total_calls += usize::from(out.call_scheduled);

                    let ctx = format!("bits={bits:b} len={len} step={i}");
                    assert!(episode_texts <= MAX_TEXTS as usize, "{ctx}");
                    assert!(episode_calls <= MAX_CALLS as usize, "{ctx}");
                    if episode_calls > 0 {
                        assert!(episode_texts > 0, "call before text: {ctx}");
                    }
                    let state = &out.state;
                    assert_eq!(state.texts_sent() as usize, episode_texts, "{ctx}");
                    assert_eq!(state.calls_made() as usize, episode_calls, "{ctx}");
                    assert_eq!(
                        !state.sending_permitted(),
                        state.texts_sent() == MAX_TEXTS && state.calls_made() == MAX_CALLS,
                        "{ctx}"
                    );
                }

                engine.drain_pending_calls().await;
                assert_eq!(channel.texts.load(Ordering::SeqCst), total_texts);
                assert_eq!(channel.calls.load(Ordering::SeqCst), total_calls);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_observations_never_exceed_caps() {
        let channel = Arc::new(CountingChannel::default());
        let engine = Arc::new(engine(channel.clone(), EngineOptions::default()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.observe(active()).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        engine.drain_pending_calls().await;

        assert_eq!(channel.texts.load(Ordering::SeqCst), 2);
        assert_eq!(channel.calls.load(Ordering::SeqCst), 1);
        assert!(!engine.snapshot().await.sending_permitted());
    }
}
