//! Connection retry engine
//!
//! A pure state machine over injected time. The session feeds it connection
//! outcomes and platform signals; it answers with what to do next. Nothing
//! in here sleeps or spawns.

use std::time::{Duration, Instant};

use marionette_core::{ObservabilityContext, RetryState, TelemetryEvent};
use marionette_time::Deadline;
use serde::{Deserialize, Serialize};

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_rounds: u32,
    pub max_attempts_per_round: u32,
    /// Backoff ceiling
    pub max_backoff_ms: u64,
    /// Window in which reconnect signals are coalesced
    pub debounce_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_rounds: 3,
            max_attempts_per_round: 5,
            max_backoff_ms: 16_000,
            debounce_ms: 500,
        }
    }
}

impl RetryConfig {
    /// Delay before `attempt`: `min(2^attempt s, max_backoff)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(Duration::from_millis(self.max_backoff_ms))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Total connect attempts before giving up
    pub fn budget(&self) -> u32 {
        self.max_rounds.max(1) * self.max_attempts_per_round.max(1)
    }
}

/// Platform hints that the network may be usable again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectSignal {
    NetworkOnline,
    SocketReopened,
}

/// Where the connection is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    /// Before the first connection
    Idle,
    Connected,
    /// Lost, waiting for the next attempt
    Disconnected,
    /// A connect attempt is in flight
    Reconnecting,
    /// Budget spent
    Exhausted,
    /// Deliberately closed
    Closed,
}

/// What the session should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCommand {
    /// Open a connection now
    Connect { round: u32, attempt: u32 },
    /// Present the offline state
    EnterOffline,
    /// Reconnected: send resume information
    Resume,
    /// Stop trying and tear the session down
    GiveUp,
}

/// Reconnect scheduler
#[derive(Debug)]
pub struct ConnectionRetryEngine {
    config: RetryConfig,
    phase: RetryPhase,
    retry: RetryState,
    next_attempt: Deadline,
    signal_window: Deadline,
    attempts_made: u32,
    obs: ObservabilityContext,
}

impl ConnectionRetryEngine {
    pub fn new() -> Self {
        Self::with_config(RetryConfig::default(), ObservabilityContext::default())
    }

    pub fn with_config(config: RetryConfig, obs: ObservabilityContext) -> Self {
        let retry = RetryState::new(config.max_rounds, config.max_attempts_per_round);
        ConnectionRetryEngine {
            config,
            phase: RetryPhase::Idle,
            retry,
            next_attempt: Deadline::disarmed(),
            signal_window: Deadline::disarmed(),
            attempts_made: 0,
            obs,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn phase(&self) -> RetryPhase {
        self.phase
    }

    pub fn retry_state(&self) -> RetryState {
        self.retry
    }

    /// Connect attempts issued since the last successful connection
    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn in_flight(&self) -> bool {
        self.phase == RetryPhase::Reconnecting
    }

    /// When `poll` next has something to do
    pub fn next_wakeup(&self) -> Option<Instant> {
        match (self.next_attempt.expires_at(), self.signal_window.expires_at()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire due timers
    pub fn poll(&mut self, now: Instant) -> Option<RetryCommand> {
        if self.phase != RetryPhase::Disconnected {
            return None;
        }
        let signalled = self.signal_window.fire(now);
        if signalled || self.next_attempt.fire(now) {
            if signalled {
                tracing::debug!("reconnect signal window elapsed");
            }
            return Some(self.issue_connect());
        }
        None
    }

    fn issue_connect(&mut self) -> RetryCommand {
        self.next_attempt.disarm();
        self.signal_window.disarm();
        self.phase = RetryPhase::Reconnecting;
        self.attempts_made += 1;

        let (round, attempt) = (self.retry.round, self.retry.attempt);
        tracing::info!(round, attempt, "reconnecting");
        self.obs
            .record(TelemetryEvent::ReconnectAttempt { round, attempt });
        RetryCommand::Connect { round, attempt }
    }

    /// The live connection dropped
    pub fn on_disconnect(&mut self, now: Instant) -> Option<RetryCommand> {
        match self.phase {
            RetryPhase::Connected | RetryPhase::Idle => {
                self.phase = RetryPhase::Disconnected;
                self.schedule(now);
                tracing::warn!(retry_in = ?self.next_attempt.remaining(now), "connection lost");
                Some(RetryCommand::EnterOffline)
            }
            RetryPhase::Reconnecting => self.on_connect_failed(now),
            RetryPhase::Disconnected | RetryPhase::Exhausted | RetryPhase::Closed => None,
        }
    }

    /// A connect attempt failed
    pub fn on_connect_failed(&mut self, now: Instant) -> Option<RetryCommand> {
        match self.phase {
            RetryPhase::Reconnecting => {
                if !self.retry.advance() {
                    self.phase = RetryPhase::Exhausted;
                    self.next_attempt.disarm();
                    self.signal_window.disarm();
                    tracing::warn!(attempts = self.attempts_made, "reconnect budget exhausted");
                    return Some(RetryCommand::GiveUp);
                }
                self.phase = RetryPhase::Disconnected;
                self.schedule(now);
                None
            }
            // Initial connect failed: same as losing the connection
            RetryPhase::Idle => self.on_disconnect(now),
            _ => None,
        }
    }

    /// A connection opened
    pub fn on_connected(&mut self, _now: Instant) -> Option<RetryCommand> {
        let previous = self.phase;
        match previous {
            RetryPhase::Exhausted | RetryPhase::Closed | RetryPhase::Connected => return None,
            _ => {}
        }
        self.phase = RetryPhase::Connected;
        self.retry.reset();
        self.attempts_made = 0;
        self.next_attempt.disarm();
        self.signal_window.disarm();

        match previous {
            RetryPhase::Idle => {
                tracing::info!("connected");
                None
            }
            _ => {
                tracing::info!("reconnected");
                Some(RetryCommand::Resume)
            }
        }
    }

    /// A platform hint; bursts within the debounce window coalesce into one
    /// early attempt
    pub fn signal(&mut self, signal: ReconnectSignal, now: Instant) -> Option<RetryCommand> {
        match self.phase {
            RetryPhase::Disconnected => {
                if !self.signal_window.is_armed() {
                    self.signal_window.arm(now, self.config.debounce());
                    tracing::debug!(?signal, "reconnect signal");
                }
            }
            RetryPhase::Reconnecting => {
                tracing::debug!(?signal, "connect already in flight");
            }
            _ => {}
        }
        None
    }

    /// Deliberate close: stop all retrying
    pub fn close(&mut self) {
        self.phase = RetryPhase::Closed;
        self.next_attempt.disarm();
        self.signal_window.disarm();
    }

    fn schedule(&mut self, now: Instant) {
        self.next_attempt
            .arm(now, self.config.backoff(self.retry.attempt));
    }
}

impl Default for ConnectionRetryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marionette_core::RecordingTelemetry;
    use std::sync::Arc;

    fn connected(now: Instant) -> ConnectionRetryEngine {
        let mut engine = ConnectionRetryEngine::new();
        assert_eq!(engine.on_connected(now), None);
        engine
    }

    #[test]
    fn test_backoff_sequence() {
        let config = RetryConfig::default();
        let secs: Vec<u64> = (1..=6).map(|a| config.backoff(a).as_secs()).collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 16, 16]);
        assert_eq!(config.backoff(200), Duration::from_secs(16));
    }

    #[test]
    fn test_disconnect_enters_offline_then_waits() {
        let t0 = Instant::now();
        let mut engine = connected(t0);
        assert_eq!(engine.on_disconnect(t0), Some(RetryCommand::EnterOffline));
        assert_eq!(engine.phase(), RetryPhase::Disconnected);

        assert_eq!(engine.poll(t0 + Duration::from_millis(1999)), None);
        assert_eq!(
            engine.poll(t0 + Duration::from_secs(2)),
            Some(RetryCommand::Connect { round: 1, attempt: 1 })
        );
        assert!(engine.in_flight());
    }

    #[test]
    fn test_gives_up_after_budget() {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let mut engine = ConnectionRetryEngine::with_config(
            RetryConfig::default(),
            ObservabilityContext::new(telemetry.clone(), "t"),
        );
        let mut now = Instant::now();
        engine.on_connected(now);
        engine.on_disconnect(now);

        let mut connects = Vec::new();
        let mut gave_up = false;
        for _ in 0..100 {
            now += Duration::from_secs(20);
            if let Some(RetryCommand::Connect { round, attempt }) = engine.poll(now) {
                connects.push((round, attempt));
                if engine.on_connect_failed(now) == Some(RetryCommand::GiveUp) {
                    gave_up = true;
                    break;
                }
            }
        }

        assert!(gave_up);
        assert_eq!(connects.len(), 15);
        assert_eq!(connects.first(), Some(&(1, 1)));
        assert_eq!(connects[5], (2, 1));
        assert_eq!(connects.last(), Some(&(3, 5)));
        assert_eq!(engine.phase(), RetryPhase::Exhausted);
        assert_eq!(engine.poll(now + Duration::from_secs(60)), None);
        assert_eq!(
            telemetry.count(|e| matches!(e, TelemetryEvent::ReconnectAttempt { .. })),
            15
        );
    }

    #[test]
    fn test_success_resets_counters() {
        let mut now = Instant::now();
        let mut engine = connected(now);
        engine.on_disconnect(now);
        for _ in 0..3 {
            now += Duration::from_secs(20);
            assert!(engine.poll(now).is_some());
            engine.on_connect_failed(now);
        }
        assert_eq!(engine.retry_state().attempt, 4);

        now += Duration::from_secs(20);
        engine.poll(now);
        assert_eq!(engine.on_connected(now), Some(RetryCommand::Resume));
        assert!(engine.retry_state().is_reset());
        assert_eq!(engine.attempts_made(), 0);
    }

    #[test]
    fn test_signals_debounced_into_one_attempt() {
        let t0 = Instant::now();
        let mut engine = connected(t0);
        engine.on_disconnect(t0);

        engine.signal(ReconnectSignal::NetworkOnline, t0 + Duration::from_millis(100));
        engine.signal(ReconnectSignal::SocketReopened, t0 + Duration::from_millis(300));
        engine.signal(ReconnectSignal::NetworkOnline, t0 + Duration::from_millis(550));

        assert_eq!(engine.poll(t0 + Duration::from_millis(599)), None);
        assert_eq!(
            engine.poll(t0 + Duration::from_millis(600)),
            Some(RetryCommand::Connect { round: 1, attempt: 1 })
        );
        // The backoff timer was cancelled by the early attempt
        assert_eq!(engine.poll(t0 + Duration::from_secs(3)), None);
        assert_eq!(engine.attempts_made(), 1);
    }

    #[test]
    fn test_signal_while_in_flight_is_noop() {
        let t0 = Instant::now();
        let mut engine = connected(t0);
        engine.on_disconnect(t0);
        engine.poll(t0 + Duration::from_secs(2));
        assert!(engine.in_flight());

        assert_eq!(engine.signal(ReconnectSignal::NetworkOnline, t0 + Duration::from_secs(2)), None);
        assert_eq!(engine.next_wakeup(), None);
    }

    #[test]
    fn test_close_stops_everything() {
        let t0 = Instant::now();
        let mut engine = connected(t0);
        engine.close();
        assert_eq!(engine.on_disconnect(t0), None);
        assert_eq!(engine.poll(t0 + Duration::from_secs(60)), None);
        assert_eq!(engine.phase(), RetryPhase::Closed);
    }

    #[test]
    fn test_initial_connect_failure_starts_retry() {
        let t0 = Instant::now();
        let mut engine = ConnectionRetryEngine::new();
        assert_eq!(engine.on_connect_failed(t0), Some(RetryCommand::EnterOffline));
        assert_eq!(engine.phase(), RetryPhase::Disconnected);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Input {
            Advance(u64),
            Fail,
            Succeed,
            Drop,
            Signal,
        }

        fn input() -> impl Strategy<Value = Input> {
            prop_oneof![
                (0u64..20_000).prop_map(Input::Advance),
                Just(Input::Fail),
                Just(Input::Succeed),
                Just(Input::Drop),
                Just(Input::Signal),
            ]
        }

        proptest! {
            #[test]
            fn prop_attempts_bounded_and_reset(inputs in proptest::collection::vec(input(), 1..200)) {
                let mut now = Instant::now();
                let mut engine = ConnectionRetryEngine::new();
                engine.on_connected(now);
                let budget = engine.config().budget();

                for step in inputs {
                    match step {
                        Input::Advance(ms) => {
                            now += Duration::from_millis(ms);
                            engine.poll(now);
                        }
                        Input::Fail => { engine.on_connect_failed(now); }
                        Input::Succeed => {
                            if engine.in_flight() {
                                engine.on_connected(now);
                                prop_assert!(engine.retry_state().is_reset());
                            }
                        }
                        Input::Drop => { engine.on_disconnect(now); }
                        Input::Signal => { engine.signal(ReconnectSignal::NetworkOnline, now); }
                    }
                    prop_assert!(engine.attempts_made() <= budget);
                    let state = engine.retry_state();
                    prop_assert!(state.round >= 1 && state.round <= 3);
                    prop_assert!(state.attempt >= 1 && state.attempt <= 5);
                }
            }
        }
    }
}
