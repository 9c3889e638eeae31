//! SOS episode state and the per-observation transition decision.
//!
//! Two phases, driven by each observed trigger value:
//!
//! ```text
//! Cleared --active-->  Active    dispatch if sending permitted
//! Active  --active-->  Active    dispatch again while caps allow
//! Active  --cleared--> Cleared   reset counters, no notification
//! Cleared --cleared--> Cleared   no-op
//! ```
//!
//! Dispatch is level-triggered (every "active" observation may send) but
//! bounded: at most [`MAX_TEXTS`] texts and [`MAX_CALLS`] calls per episode.
//! Counters reset only on a falling edge.
//!
//! Only the engine mutates [`EpisodeState`]; the mutators are crate-private
//! so no caller can bypass the caps.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::feed::TriggerValue;

/// Texts allowed per episode.
pub const MAX_TEXTS: u32 = 2;
/// Voice calls allowed per episode.
pub const MAX_CALLS: u32 = 1;

/// Phase of the trigger as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SosPhase {
    Cleared,
    Active,
}

impl From<TriggerValue> for SosPhase {
    fn from(value: TriggerValue) -> Self {
        match value {
            TriggerValue::Cleared => Self::Cleared,
            TriggerValue::Active => Self::Active,
        }
    }
}

impl fmt::Display for SosPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cleared => write!(f, "cleared"),
            Self::Active => write!(f, "active"),
        }
    }
}

/// Edge between two consecutive observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    /// Cleared → Active.
    Rising,
    /// Active → Active.
    Held,
    /// Active → Cleared.
    Falling,
    /// Cleared → Cleared.
    Idle,
}

impl Edge {
    pub fn between(from: SosPhase, to: SosPhase) -> Self {
        match (from, to) {
            (SosPhase::Cleared, SosPhase::Active) => Self::Rising,
            (SosPhase::Active, SosPhase::Active) => Self::Held,
            (SosPhase::Active, SosPhase::Cleared) => Self::Falling,
            (SosPhase::Cleared, SosPhase::Cleared) => Self::Idle,
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rising => write!(f, "rising"),
            Self::Held => write!(f, "held"),
            Self::Falling => write!(f, "falling"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

/// What one observation should cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub edge: Edge,
    /// Reset counters before anything else this cycle.
    pub reset: bool,
    /// Run a dispatch cycle.
    pub dispatch: bool,
}

/// The process-wide episode record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeState {
    last_trigger: TriggerValue,
    texts_sent: u32,
    calls_made: u32,
    sending_permitted: bool,
    /// Bumped on every reset; identifies the episode a scheduled call
    /// belongs to.
    episode: u64,
}

impl EpisodeState {
    pub fn new() -> Self {
        Self {
            last_trigger: TriggerValue::Cleared,
            texts_sent: 0,
            calls_made: 0,
            sending_permitted: true,
            episode: 0,
        }
    }

    pub fn last_trigger(&self) -> TriggerValue {
        self.last_trigger
    }

    pub fn phase(&self) -> SosPhase {
        self.last_trigger.into()
    }

    pub fn texts_sent(&self) -> u32 {
        self.texts_sent
    }

    pub fn calls_made(&self) -> u32 {
        self.calls_made
    }

    pub fn sending_permitted(&self) -> bool {
        self.sending_permitted
    }

    pub fn episode(&self) -> u64 {
        self.episode
    }

    pub fn can_send_text(&self) -> bool {
        self.sending_permitted && self.texts_sent < MAX_TEXTS
    }

    /// A call may only follow at least one text of the same episode.
    pub fn can_schedule_call(&self) -> bool {
        self.sending_permitted && self.texts_sent >= 1 && self.calls_made < MAX_CALLS
    }

    /// Decide without mutating.
    pub fn decide(&self, observed: TriggerValue) -> Decision {
        let edge = Edge::between(self.phase(), observed.into());
        let reset = edge == Edge::Falling;
        // After a reset sending is permitted again, but a falling edge
        // observes "cleared" so it never dispatches.
        let dispatch = observed.is_active() && self.sending_permitted;
        Decision {
            edge,
            reset,
            dispatch,
        }
    }

    /// First half of a cycle: decide and apply the reset, if any.
    pub(crate) fn begin_cycle(&mut self, observed: TriggerValue) -> Decision {
        let decision = self.decide(observed);
        tracing::debug!(
            from = %self.phase(),
            to = %SosPhase::from(observed),
            edge = %decision.edge,
            episode = self.episode,
            "Trigger observed"
        );
        if decision.reset {
            self.reset();
        }
        decision
    }

    /// Second half of a cycle: record the observed value unconditionally.
    pub(crate) fn end_cycle(&mut self, observed: TriggerValue) {
        self.last_trigger = observed;
    }

    /// Count one text attempt. Returns its 1-based ordinal in the episode,
    /// or `None` if the cap was already reached.
    pub(crate) fn record_text(&mut self) -> Option<u32> {
        if !self.can_send_text() {
            return None;
        }
        self.texts_sent += 1;
        Some(self.texts_sent)
    }

    /// Reserve the episode's call budget. Returns `false` if not allowed.
    pub(crate) fn reserve_call(&mut self) -> bool {
        if !self.can_schedule_call() {
            return false;
        }
        self.calls_made += 1;
        true
    }

    /// Close sending once both caps are reached. Returns `true` if this
    /// call is what closed it.
    pub(crate) fn settle(&mut self) -> bool {
        let exhausted = self.texts_sent >= MAX_TEXTS && self.calls_made >= MAX_CALLS;
        let newly = exhausted && self.sending_permitted;
        self.sending_permitted = !exhausted;
        newly
    }

    fn reset(&mut self) {
        self.texts_sent = 0;
        self.calls_made = 0;
        self.sending_permitted = true;
        self.episode += 1;
    }
}

impl Default for EpisodeState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TriggerValue::{Active, Cleared};

    /// One dispatch cycle for a single contact, mirroring the dispatcher's
    /// bookkeeping without any I/O.
    fn step(state: &mut EpisodeState, observed: TriggerValue) -> (u32, u32) {
        let decision = state.begin_cycle(observed);
        let (mut texts, mut calls) = (0, 0);
        if decision.dispatch {
            if state.record_text().is_some() {
                texts += 1;
            }
            if state.reserve_call() {
                calls += 1;
            }
            state.settle();
        }
        state.end_cycle(observed);
        (texts, calls)
    }

    fn assert_invariants(state: &EpisodeState) {
        assert!(state.texts_sent() <= MAX_TEXTS);
        assert!(state.calls_made() <= MAX_CALLS);
        assert_eq!(
            !state.sending_permitted(),
            state.texts_sent() == MAX_TEXTS && state.calls_made() == MAX_CALLS
        );
        if state.calls_made() > 0 {
            assert!(state.texts_sent() > 0);
        }
    }

    #[test]
    fn test_initial_state() {
        let state = EpisodeState::new();
        assert_eq!(state.last_trigger(), Cleared);
        assert_eq!(state.phase(), SosPhase::Cleared);
        assert_eq!(state.texts_sent(), 0);
        assert_eq!(state.calls_made(), 0);
        assert!(state.sending_permitted());
        assert!(state.can_send_text());
        assert!(!state.can_schedule_call());
    }

    #[test]
    fn test_edges() {
        assert_eq!(Edge::between(SosPhase::Cleared, SosPhase::Active), Edge::Rising);
        assert_eq!(Edge::between(SosPhase::Active, SosPhase::Active), Edge::Held);
        assert_eq!(Edge::between(SosPhase::Active, SosPhase::Cleared), Edge::Falling);
        assert_eq!(Edge::between(SosPhase::Cleared, SosPhase::Cleared), Edge::Idle);
    }

    #[test]
    fn test_rising_edge_dispatches_without_reset() {
        let state = EpisodeState::new();
        let d = state.decide(Active);
        assert_eq!(d.edge, Edge::Rising);
        assert!(d.dispatch);
        assert!(!d.reset);
    }

    #[test]
    fn test_cleared_observations_never_dispatch() {
        let mut state = EpisodeState::new();
        let d = state.decide(Cleared);
        assert_eq!(d.edge, Edge::Idle);
        assert!(!d.dispatch && !d.reset);

        step(&mut state, Active);
        let d = state.decide(Cleared);
        assert_eq!(d.edge, Edge::Falling);
        assert!(d.reset);
        assert!(!d.dispatch);
    }

    #[test]
    fn test_call_requires_prior_text() {
        let mut state = EpisodeState::new();
        assert!(!state.reserve_call());
        assert_eq!(state.record_text(), Some(1));
        assert!(state.reserve_call());
        assert!(!state.reserve_call());
    }

    #[test]
    fn test_reference_sequence() {
        let mut state = EpisodeState::new();
        let seq = [Cleared, Active, Active, Active, Active, Cleared, Active];
        let sent: Vec<(u32, u32)> = seq
            .iter()
            .map(|&t| {
                let s = step(&mut state, t);
                assert_invariants(&state);
                s
            })
            .collect();

        // First active run: 2 texts, 1 call, then silence.
        let first_run: (u32, u32) = sent[1..5]
            .iter()
            .fold((0, 0), |acc, s| (acc.0 + s.0, acc.1 + s.1));
        assert_eq!(first_run, (2, 1));
        assert_eq!(sent[1], (1, 1));
        assert_eq!(sent[2], (1, 0));
        assert_eq!(sent[3], (0, 0));
        assert_eq!(sent[4], (0, 0));

        // Reset is silent; the fresh episode starts sending again.
        assert_eq!(sent[5], (0, 0));
        assert_eq!(sent[6], (1, 1));
        assert_eq!(state.texts_sent(), 1);
        assert_eq!(state.calls_made(), 1);
        assert!(state.sending_permitted());
        assert_eq!(state.episode(), 1);
    }

    #[test]
    fn test_caps_close_sending() {
        let mut state = EpisodeState::new();
        step(&mut state, Active);
        assert!(state.sending_permitted());
        step(&mut state, Active);
        assert!(!state.sending_permitted());
        assert!(!state.decide(Active).dispatch);
    }

    #[test]
    fn test_falling_edge_always_resets() {
        let mut state = EpisodeState::new();
        step(&mut state, Active);
        step(&mut state, Active);
        step(&mut state, Active);
        assert!(!state.sending_permitted());

        step(&mut state, Cleared);
        assert_invariants(&state);
        assert_eq!(state.texts_sent(), 0);
        assert_eq!(state.calls_made(), 0);
        assert!(state.sending_permitted());
        assert_eq!(state.last_trigger(), Cleared);
    }

    #[test]
    fn test_idle_cleared_does_not_bump_episode() {
        let mut state = EpisodeState::new();
        step(&mut state, Cleared);
        step(&mut state, Cleared);
        assert_eq!(state.episode(), 0);
    }

    #[test]
    fn test_state_display_and_serde() {
        assert_eq!(SosPhase::Active.to_string(), "active");
        assert_eq!(SosPhase::Cleared.to_string(), TriggerValue::Cleared.to_string());
        assert_eq!(Edge::Falling.to_string(), "falling");

        let mut state = EpisodeState::new();
        step(&mut state, Active);
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"last_trigger\":\"active\""));
        assert!(json.contains("\"texts_sent\":1"));
    }
}
