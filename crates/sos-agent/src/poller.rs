//! Periodic poller: fetch the latest record, hand it to the engine.
//!
//! Cycles never overlap. The run loop awaits each cycle before taking the
//! next tick, late ticks are skipped rather than bursted, and
//! [`Poller::poll_once`] refuses to start while another cycle (e.g. a manual
//! check) is in flight.
//!
//! A failed fetch skips the cycle without touching the episode.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{CycleOutcome, SosEngine};
use crate::errors::FetchError;
use crate::feed::{FeedFields, Observation, TelemetrySource};

/// Default polling period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Result of one poll attempt.
#[derive(Debug)]
pub enum PollOutcome {
    /// The record was observed by the engine.
    Observed(CycleOutcome),
    /// Fetch or decode failed; episode untouched.
    FetchFailed(FetchError),
    /// Another cycle was still running.
    Busy,
}

pub struct Poller {
    source: Arc<dyn TelemetrySource>,
    engine: Arc<SosEngine>,
    fields: FeedFields,
    period: Duration,
    gate: Mutex<()>,
}

impl Poller {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        engine: Arc<SosEngine>,
        fields: FeedFields,
        period: Duration,
    ) -> Self {
        Self {
            source,
            engine,
            fields,
            period,
            gate: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &Arc<SosEngine> {
        &self.engine
    }

    /// Run a single cycle unless one is already running.
    pub async fn poll_once(&self) -> PollOutcome {
        let Ok(_guard) = self.gate.try_lock() else {
            debug!("Previous poll cycle still running; skipping");
            return PollOutcome::Busy;
        };

        let observation = match self.fetch_observation().await {
            Ok(obs) => obs,
            Err(e) => {
                warn!(error = %e, "Telemetry fetch failed; cycle skipped, episode unchanged");
                return PollOutcome::FetchFailed(e);
            }
        };
        debug!(trigger = %observation.trigger, location = ?observation.location, "Telemetry observed");

        PollOutcome::Observed(self.engine.observe(observation).await)
    }

    async fn fetch_observation(&self) -> Result<Observation, FetchError> {
        let record = self.source.fetch_latest().await?;
        Observation::from_record(&record, &self.fields)
    }

    /// Poll every period until `shutdown` fires. The first cycle runs
    /// immediately. An in-flight cycle is allowed to finish.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_secs = self.period.as_secs(), "SOS poller started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }

        info!("SOS poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ProviderId, TextChannel, VoiceChannel};
    use crate::contacts::{Contact, ContactList};
    use crate::dispatcher::{AlertDispatcher, DispatchSettings};
    use crate::engine::EngineOptions;
    use crate::errors::ChannelError;
    use crate::feed::{parse_feed, MockTelemetrySource, TriggerValue};
    use crate::messages::VoiceScript;
    use async_trait::async_trait;
    use mockall::Sequence;

    struct NullChannel;

    #[async_trait]
    impl TextChannel for NullChannel {
        async fn send_text(&self, _: &Contact, _: &str) -> Result<ProviderId, ChannelError> {
            Ok(ProviderId("SM".into()))
        }
    }

    #[async_trait]
    impl VoiceChannel for NullChannel {
        async fn place_voice_call(&self, _: &Contact, _: &VoiceScript) -> Result<ProviderId, ChannelError> {
            Ok(ProviderId("CA".into()))
        }
    }

    fn engine() -> Arc<SosEngine> {
        let channel = Arc::new(NullChannel);
        Arc::new(SosEngine::new(
            AlertDispatcher::new(channel.clone(), channel, DispatchSettings::default()),
            ContactList::parse(&["+15550000001"]).unwrap(),
            EngineOptions::default(),
        ))
    }

    fn record(trigger: &str) -> crate::feed::TelemetryRecord {
        parse_feed(&format!(
            r#"{{"feeds":[{{"field1":"{trigger}","field2":"17.385","field3":"78.4867"}}]}}"#
        ))
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failure_leaves_episode_untouched() {
        let mut source = MockTelemetrySource::new();
        let mut seq = Sequence::new();
        source
            .expect_fetch_latest()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(record("1")));
        source
            .expect_fetch_latest()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(FetchError::Transport("timed out".into())));

        let poller = Poller::new(Arc::new(source), engine(), FeedFields::default(), DEFAULT_POLL_INTERVAL);

        assert!(matches!(poller.poll_once().await, PollOutcome::Observed(_)));
        let before = poller.engine().snapshot().await;

        assert!(matches!(poller.poll_once().await, PollOutcome::FetchFailed(_)));
        let after = poller.engine().snapshot().await;
        assert_eq!(before, after);
        assert_eq!(after.last_trigger(), TriggerValue::Active);
        poller.engine().drain_pending_calls().await;
    }

    #[tokio::test]
    async fn malformed_trigger_skips_cycle() {
        let mut source = MockTelemetrySource::new();
        source
            .expect_fetch_latest()
            .returning(|| Ok(parse_feed(r#"{"feeds":[{"field1":null}]}"#).unwrap()));

        let poller = Poller::new(Arc::new(source), engine(), FeedFields::default(), DEFAULT_POLL_INTERVAL);
        let outcome = poller.poll_once().await;
        assert!(matches!(
            outcome,
            PollOutcome::FetchFailed(FetchError::MissingTrigger { .. })
        ));
        assert_eq!(poller.engine().snapshot().await, crate::state_machine::EpisodeState::new());
    }

    #[tokio::test]
    async fn busy_gate_skips_cycle() {
        let mut source = MockTelemetrySource::new();
        source.expect_fetch_latest().never();

        let poller = Poller::new(Arc::new(source), engine(), FeedFields::default(), DEFAULT_POLL_INTERVAL);
        let _held = poller.gate.lock().await;
        assert!(matches!(poller.poll_once().await, PollOutcome::Busy));
    }

    #[tokio::test(start_paused = true)]
    async fn run_polls_each_period_until_shutdown() {
        let mut source = MockTelemetrySource::new();
        source.expect_fetch_latest().times(3).returning(|| Ok(record("0")));

        let poller = Arc::new(Poller::new(
            Arc::new(source),
            engine(),
            FeedFields::default(),
            Duration::from_secs(30),
        ));
        let shutdown = CancellationToken::new();
        let task = {
            let poller = Arc::clone(&poller);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { poller.run(shutdown).await })
        };

        // Ticks at t=0, 30, 60.
        tokio::time::sleep(Duration::from_secs(61)).await;
        shutdown.cancel();
        task.await.unwrap();
    }
}
