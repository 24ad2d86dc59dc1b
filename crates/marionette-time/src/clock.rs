//! Animation clock
//!
//! The clock derives the current frame from elapsed wall-clock time, never
//! from counting callbacks. A stalled tick loop therefore catches up on the
//! next tick instead of drifting behind.

use std::sync::Arc;
use std::time::{Duration, Instant};

use marionette_core::{FrameIndex, FrameRate, FRAMES_PER_SECOND};
use serde::{Deserialize, Serialize};

use crate::TimeSource;

/// Clock configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Frames per second of the shared timeline
    pub fps: u32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        ClockConfig {
            fps: FRAMES_PER_SECOND,
        }
    }
}

/// Result of one clock tick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockTick {
    /// Current frame
    pub frame: FrameIndex,
    /// Frame reported by the previous tick, if any
    pub previous: Option<FrameIndex>,
    /// Frames passed over without a tick since the previous one
    pub skipped: u64,
}

impl ClockTick {
    /// Whether the frame moved since the previous tick
    pub fn advanced(&self) -> bool {
        match self.previous {
            Some(prev) => self.frame > prev,
            None => true,
        }
    }

    /// First frame not yet reported before this tick
    pub fn first_unreported(&self) -> FrameIndex {
        match self.previous {
            Some(prev) if self.frame > prev => prev.next(),
            _ => self.frame,
        }
    }
}

/// Monotonic frame counter at a fixed rate
///
/// INVARIANT: `pause()` freezes `current_frame()`; the next `play()`
/// continues from exactly that frame.
pub struct AnimationClock {
    source: Arc<dyn TimeSource>,
    rate: FrameRate,
    /// Frame at the last play/seek
    base: FrameIndex,
    /// Set while playing
    started_at: Option<Instant>,
    /// Last frame handed out by `tick`
    last_reported: Option<FrameIndex>,
}

impl AnimationClock {
    /// Create a paused clock at frame zero
    pub fn new(source: Arc<dyn TimeSource>) -> Self {
        Self::with_config(source, &ClockConfig::default())
    }

    pub fn with_config(source: Arc<dyn TimeSource>, config: &ClockConfig) -> Self {
        AnimationClock {
            source,
            rate: FrameRate::new(config.fps),
            base: FrameIndex::ZERO,
            started_at: None,
            last_reported: None,
        }
    }

    /// Start or continue counting from the frozen frame
    pub fn play(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(self.source.now());
            tracing::debug!(frame = %self.base, "clock play");
        }
    }

    /// Freeze at the current frame
    pub fn pause(&mut self) {
        if self.started_at.is_some() {
            self.base = self.current_frame();
            self.started_at = None;
            tracing::debug!(frame = %self.base, "clock pause");
        }
    }

    pub fn is_playing(&self) -> bool {
        self.started_at.is_some()
    }

    /// Current frame derived from elapsed time
    pub fn current_frame(&self) -> FrameIndex {
        match self.started_at {
            Some(started) => {
                let elapsed = self.source.now().saturating_duration_since(started);
                self.base.saturating_add(self.rate.frames_in(elapsed))
            }
            None => self.base,
        }
    }

    /// Jump to a frame, keeping the play/pause state
    pub fn seek(&mut self, frame: FrameIndex) {
        self.base = frame;
        if self.started_at.is_some() {
            self.started_at = Some(self.source.now());
        }
        self.last_reported = None;
    }

    /// Sample the clock for a render tick
    pub fn tick(&mut self) -> ClockTick {
        let frame = self.current_frame();
        let previous = self.last_reported;
        let skipped = match previous {
            Some(prev) if frame.0 > prev.0 + 1 => frame.0 - prev.0 - 1,
            _ => 0,
        };
        if previous.map_or(true, |prev| frame > prev) {
            self.last_reported = Some(frame);
        }
        ClockTick {
            frame,
            previous,
            skipped,
        }
    }

    /// Last frame handed out by `tick`
    pub fn last_reported(&self) -> Option<FrameIndex> {
        self.last_reported
    }

    /// Nominal interval between ticks
    pub fn frame_interval(&self) -> Duration {
        self.rate.frame_duration()
    }

    pub fn rate(&self) -> FrameRate {
        self.rate
    }

    /// Time until the next frame boundary, for timer-driven hosts
    pub fn until_next_frame(&self) -> Duration {
        match self.started_at {
            Some(started) => {
                let elapsed = self.source.now().saturating_duration_since(started);
                let done = self.rate.frames_in(elapsed);
                let next = self.rate.duration_of(done + 1);
                next.saturating_sub(elapsed)
            }
            None => self.frame_interval(),
        }
    }
}

impl std::fmt::Debug for AnimationClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnimationClock")
            .field("rate", &self.rate)
            .field("base", &self.base)
            .field("playing", &self.is_playing())
            .field("last_reported", &self.last_reported)
            .finish()
    }
}
