//! Stream kinds and speech grouping
//!
//! The server delivers five independently paced, independently lossy
//! streams. They share nothing but the frame timeline and, for speech
//! related data, the speech id.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{FrameIndex, FrameRange, SpeechId};

/// Kind of a frame-indexed stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// Decoded body video
    Body,
    /// Sparse, real-time driven facial samples
    FaceAuthoritative,
    /// Dense idle/fallback facial track
    FaceRealtime,
    /// Speech audio
    Audio,
    /// UI events (subtitles, widgets)
    Event,
}

impl StreamKind {
    pub const ALL: [StreamKind; 5] = [
        StreamKind::Body,
        StreamKind::FaceAuthoritative,
        StreamKind::FaceRealtime,
        StreamKind::Audio,
        StreamKind::Event,
    ];

    /// Streams whose entries are grouped by speech id
    pub fn is_speech_scoped(self) -> bool {
        matches!(
            self,
            StreamKind::FaceAuthoritative | StreamKind::Audio | StreamKind::Event
        )
    }

    /// Streams fed straight from the transport (as opposed to the decoder)
    pub fn is_transport_fed(self) -> bool {
        !matches!(self, StreamKind::Body)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Body => "body",
            StreamKind::FaceAuthoritative => "face-authoritative",
            StreamKind::FaceRealtime => "face-realtime",
            StreamKind::Audio => "audio",
            StreamKind::Event => "event",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One utterance: the unit of interruption and cancellation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechSegment {
    pub speech_id: SpeechId,
    pub start_frame: FrameIndex,
    pub end_frame: FrameIndex,
}

impl SpeechSegment {
    pub fn new(speech_id: SpeechId, start_frame: FrameIndex, end_frame: FrameIndex) -> Self {
        let range = FrameRange::new(start_frame, end_frame);
        SpeechSegment {
            speech_id,
            start_frame: range.start,
            end_frame: range.end,
        }
    }

    pub fn range(&self) -> FrameRange {
        FrameRange::new(self.start_frame, self.end_frame)
    }

    /// Widen the segment to also cover `range`
    pub fn extend(&mut self, range: FrameRange) {
        self.start_frame = self.start_frame.min(range.start);
        self.end_frame = self.end_frame.max(range.end);
    }
}

/// A single UI event (subtitle line, widget command)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UiEvent {
    /// Frame at which the event fires
    pub frame: FrameIndex,
    /// Event name, e.g. "subtitle" or "widget"
    pub kind: String,
    /// Opaque payload for the overlay layer
    pub payload: String,
}

/// Frame-ordered batch of UI events
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UiEventBatch {
    pub start_frame: FrameIndex,
    pub end_frame: FrameIndex,
    pub speech_id: Option<SpeechId>,
    pub events: Vec<UiEvent>,
}

impl UiEventBatch {
    /// Build a batch; events are sorted by frame so delivery order matches
    /// timeline order regardless of how the server listed them
    pub fn new(
        start_frame: FrameIndex,
        end_frame: FrameIndex,
        speech_id: Option<SpeechId>,
        mut events: Vec<UiEvent>,
    ) -> Self {
        events.sort_by_key(|e| e.frame);
        let range = FrameRange::new(start_frame, end_frame);
        UiEventBatch {
            start_frame: range.start,
            end_frame: range.end,
            speech_id,
            events,
        }
    }

    pub fn range(&self) -> FrameRange {
        FrameRange::new(self.start_frame, self.end_frame)
    }
}
