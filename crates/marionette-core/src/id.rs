//! Identity types for the avatar timeline
//!
//! Every stream is joined on `FrameIndex`; speech, body and clip identifiers
//! group data that belongs together on that timeline.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position on the shared frame clock, counted from session start
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct FrameIndex(pub u64);

impl FrameIndex {
    pub const ZERO: FrameIndex = FrameIndex(0);
    pub const MAX: FrameIndex = FrameIndex(u64::MAX);

    #[inline]
    pub fn new(index: u64) -> Self {
        FrameIndex(index)
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn next(self) -> Self {
        FrameIndex(self.0.saturating_add(1))
    }

    #[inline]
    pub fn saturating_add(self, frames: u64) -> Self {
        FrameIndex(self.0.saturating_add(frames))
    }

    #[inline]
    pub fn saturating_sub(self, frames: u64) -> Self {
        FrameIndex(self.0.saturating_sub(frames))
    }

    /// Number of frames from `earlier` to `self` (zero if `earlier` is ahead)
    #[inline]
    pub fn frames_since(self, earlier: FrameIndex) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Debug for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for FrameIndex {
    fn from(value: u64) -> Self {
        FrameIndex(value)
    }
}

/// Utterance identity - monotonically increasing per session
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SpeechId(pub u64);

impl SpeechId {
    #[inline]
    pub fn new(id: u64) -> Self {
        SpeechId(id)
    }
}

impl fmt::Debug for SpeechId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Speech({})", self.0)
    }
}

impl fmt::Display for SpeechId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the avatar body (rig) a frame or face sample belongs to
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BodyId(pub u32);

impl BodyId {
    #[inline]
    pub fn new(id: u32) -> Self {
        BodyId(id)
    }
}

impl fmt::Debug for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Body({})", self.0)
    }
}

/// Identity of one decodable body clip; doubles as its decode task key
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct DescriptorId(pub u64);

impl DescriptorId {
    #[inline]
    pub fn new(id: u64) -> Self {
        DescriptorId(id)
    }
}

impl fmt::Debug for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Clip({})", self.0)
    }
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
