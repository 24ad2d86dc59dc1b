//! Lifecycle states
//!
//! Render and connection lifecycles are reported to the embedding
//! application; retry counters travel with the connection state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of the render loop
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RenderState {
    /// Created, waiting for resources and the first frames
    Init,
    /// Ticking normally
    Rendering,
    /// Clock frozen; receive path still buffering
    Paused,
    /// First tick after a pause; GPU state rebuilt, decoder resynced
    Resumed,
    /// Terminal
    Stopped,
}

impl RenderState {
    /// Whether ticks in this state render frames
    pub fn is_active(self) -> bool {
        matches!(self, RenderState::Rendering | RenderState::Resumed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RenderState::Stopped)
    }
}

impl fmt::Display for RenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RenderState::Init => "init",
            RenderState::Rendering => "rendering",
            RenderState::Paused => "paused",
            RenderState::Resumed => "resumed",
            RenderState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Session-level connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Connected and streaming
    Online,
    /// Connection lost; offline animation is shown while retrying
    Offline,
    /// Connected but not presenting video
    Invisible,
    /// Session closed, either deliberately or after exhausting retries
    Closed,
}

/// Retry counters for reconnection
///
/// Counters are 1-based. `(round, attempt)` only moves forward until a
/// successful reconnect resets it to `(1, 1)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub round: u32,
    pub attempt: u32,
    pub max_rounds: u32,
    pub max_attempts_per_round: u32,
}

impl RetryState {
    pub fn new(max_rounds: u32, max_attempts_per_round: u32) -> Self {
        RetryState {
            round: 1,
            attempt: 1,
            max_rounds: max_rounds.max(1),
            max_attempts_per_round: max_attempts_per_round.max(1),
        }
    }

    /// Total attempt budget
    pub fn budget(&self) -> u32 {
        self.max_rounds.saturating_mul(self.max_attempts_per_round)
    }

    /// 1-based ordinal of the current attempt across all rounds
    pub fn ordinal(&self) -> u32 {
        (self.round - 1) * self.max_attempts_per_round + self.attempt
    }

    /// Move to the next attempt, rolling into the next round when the
    /// current one is used up. Returns false once the budget is spent; the
    /// counters are left untouched in that case.
    pub fn advance(&mut self) -> bool {
        if self.attempt < self.max_attempts_per_round {
            self.attempt += 1;
            true
        } else if self.round < self.max_rounds {
            self.round += 1;
            self.attempt = 1;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.round = 1;
        self.attempt = 1;
    }

    pub fn is_reset(&self) -> bool {
        self.round == 1 && self.attempt == 1
    }
}

/// Speaking state reported to the application
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoiceState {
    Start,
    End,
}
