//! Frame timeline primitives
//!
//! The avatar timeline is a fixed-rate frame counter (24fps by default).
//! Wall-clock durations convert to frame indices here and nowhere else, so
//! every component agrees on which frame "now" is.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::FrameIndex;

/// Nominal frame rate of the shared clock
pub const FRAMES_PER_SECOND: u32 = 24;

/// Fixed frame rate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate(u32);

impl FrameRate {
    /// Create a frame rate; zero is coerced to one frame per second
    pub fn new(fps: u32) -> Self {
        FrameRate(fps.max(1))
    }

    #[inline]
    pub fn fps(self) -> u32 {
        self.0
    }

    /// Duration of a single frame
    pub fn frame_duration(self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.0 as u64)
    }

    /// Number of whole frames elapsed in `elapsed`
    #[inline]
    pub fn frames_in(self, elapsed: Duration) -> u64 {
        // Integer math on nanoseconds avoids float drift over long sessions
        (elapsed.as_nanos() * self.0 as u128 / 1_000_000_000) as u64
    }

    /// Wall-clock offset at which `frame` begins: the earliest offset for
    /// which `frames_in` reaches it
    pub fn start_of(self, frame: FrameIndex) -> Duration {
        let fps = self.0 as u128;
        let nanos = (frame.0 as u128 * 1_000_000_000).div_ceil(fps);
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    /// Wall-clock length of `frames` frames
    pub fn duration_of(self, frames: u64) -> Duration {
        self.start_of(FrameIndex(frames))
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        FrameRate(FRAMES_PER_SECOND)
    }
}

impl FrameIndex {
    /// Frame reached after `elapsed` time at `rate`
    pub fn from_elapsed(elapsed: Duration, rate: FrameRate) -> Self {
        FrameIndex(rate.frames_in(elapsed))
    }

    /// Offset from session start at which this frame begins
    pub fn start_time(self, rate: FrameRate) -> Duration {
        rate.start_of(self)
    }
}

/// Inclusive range of frames `[start, end]`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRange {
    pub start: FrameIndex,
    pub end: FrameIndex,
}

impl FrameRange {
    /// Build a range; a reversed pair is normalised
    pub fn new(start: FrameIndex, end: FrameIndex) -> Self {
        if end < start {
            FrameRange { start: end, end: start }
        } else {
            FrameRange { start, end }
        }
    }

    /// Single-frame range
    pub fn single(frame: FrameIndex) -> Self {
        FrameRange {
            start: frame,
            end: frame,
        }
    }

    #[inline]
    pub fn contains(&self, frame: FrameIndex) -> bool {
        frame >= self.start && frame <= self.end
    }

    #[inline]
    pub fn intersects(&self, other: &FrameRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Number of frames in the range
    #[inline]
    pub fn len(&self) -> u64 {
        self.end.0 - self.start.0 + 1
    }

    /// A range always holds at least one frame
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Classify a frame relative to this range
    pub fn classify(&self, frame: FrameIndex) -> FramePosition {
        if frame < self.start {
            FramePosition::Ahead
        } else if frame > self.end {
            FramePosition::Passed
        } else {
            FramePosition::Within
        }
    }
}

/// Where a range sits relative to the playhead
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramePosition {
    /// Playhead has not reached the range yet
    Ahead,
    /// Playhead is inside the range
    Within,
    /// Playhead is past the range - data is expired
    Passed,
}
