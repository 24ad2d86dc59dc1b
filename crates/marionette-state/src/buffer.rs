//! Per-stream frame buffer
//!
//! Entries are keyed by their start frame and match any frame inside their
//! range. Consumption only moves forward: a take at frame `i` evicts every
//! entry that ended before `i` and raises the watermark to `i`, after which
//! data ending below the watermark is refused.

use std::collections::BTreeMap;

use marionette_core::{FrameIndex, FrameRange, SpeechId, StreamKind, UiEventBatch};
use marionette_visual::{BodyFrame, FaceSample};
use marionette_voice::AudioChunk;

/// Anything stored on the frame timeline
pub trait Framed {
    fn range(&self) -> FrameRange;

    /// Speech the entry belongs to, for speech-scoped streams
    fn speech_id(&self) -> Option<SpeechId> {
        None
    }
}

impl Framed for BodyFrame {
    fn range(&self) -> FrameRange {
        FrameRange::single(self.frame_index)
    }
}

impl Framed for FaceSample {
    fn range(&self) -> FrameRange {
        FrameRange::single(self.frame_index)
    }

    fn speech_id(&self) -> Option<SpeechId> {
        self.speech_id
    }
}

impl Framed for AudioChunk {
    fn range(&self) -> FrameRange {
        AudioChunk::range(self)
    }

    fn speech_id(&self) -> Option<SpeechId> {
        Some(self.speech_id)
    }
}

impl Framed for UiEventBatch {
    fn range(&self) -> FrameRange {
        UiEventBatch::range(self)
    }

    fn speech_id(&self) -> Option<SpeechId> {
        self.speech_id
    }
}

/// Outcome of a single insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Stored,
    /// An entry with the same start frame was dropped
    Replaced,
    /// Entry ends below the watermark; carries its end frame
    Expired(FrameIndex),
}

/// Ordered, bounded buffer for one stream
#[derive(Debug)]
pub struct StreamBuffer<T> {
    kind: StreamKind,
    entries: BTreeMap<FrameIndex, T>,
    watermark: Option<FrameIndex>,
    capacity: usize,
}

impl<T: Framed> StreamBuffer<T> {
    pub fn new(kind: StreamKind, capacity: usize) -> Self {
        StreamBuffer {
            kind,
            entries: BTreeMap::new(),
            watermark: None,
            capacity: capacity.max(1),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Highest frame consumed so far
    pub fn watermark(&self) -> Option<FrameIndex> {
        self.watermark
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// End frame of the entry with the latest start
    pub fn tail_end(&self) -> Option<FrameIndex> {
        self.entries.last_key_value().map(|(_, e)| e.range().end)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    pub fn insert(&mut self, item: T) -> Insert {
        let range = item.range();
        if self.watermark.is_some_and(|w| range.end < w) {
            return Insert::Expired(range.end);
        }
        match self.entries.insert(range.start, item) {
            Some(_) => Insert::Replaced,
            None => Insert::Stored,
        }
    }

    /// Drop the oldest entries beyond capacity. Returns how many went.
    pub fn enforce_capacity(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            self.entries.pop_first();
            evicted += 1;
        }
        evicted
    }

    /// Remove and return the entry covering `frame`
    pub fn take(&mut self, frame: FrameIndex) -> Option<T> {
        self.take_range(frame, frame)
    }

    /// Remove and return the latest entry intersecting `[lo, hi]`,
    /// consuming through `hi`
    pub fn take_range(&mut self, lo: FrameIndex, hi: FrameIndex) -> Option<T> {
        if self.watermark.is_some_and(|w| hi < w) {
            return None;
        }
        let key = self
            .entries
            .range(..=hi)
            .rev()
            .find(|(_, e)| e.range().end >= lo)
            .map(|(k, _)| *k);
        let taken = key.and_then(|k| self.entries.remove(&k));
        self.advance_to(hi);
        taken
    }

    /// Remove every entry intersecting `[lo, hi]` in frame order,
    /// consuming through `hi`
    pub fn take_all_range(&mut self, lo: FrameIndex, hi: FrameIndex) -> Vec<T> {
        if self.watermark.is_some_and(|w| hi < w) {
            return Vec::new();
        }
        let keys: Vec<FrameIndex> = self
            .entries
            .range(..=hi)
            .filter(|(_, e)| e.range().end >= lo)
            .map(|(k, _)| *k)
            .collect();
        let taken = keys
            .into_iter()
            .filter_map(|k| self.entries.remove(&k))
            .collect();
        self.advance_to(hi);
        taken
    }

    /// Remove every entry starting at or before `hi`, in frame order,
    /// without consuming
    pub fn drain_until(&mut self, hi: FrameIndex) -> Vec<T> {
        let rest = match hi.0.checked_add(1) {
            Some(next) => self.entries.split_off(&FrameIndex(next)),
            None => BTreeMap::new(),
        };
        let drained = std::mem::replace(&mut self.entries, rest);
        drained.into_values().collect()
    }

    /// Raise the watermark to `frame` and evict everything ending before it
    ///
    /// Returns how many entries were evicted.
    pub fn advance_to(&mut self, frame: FrameIndex) -> usize {
        if self.watermark.is_some_and(|w| frame <= w) {
            return 0;
        }
        self.watermark = Some(frame);
        let before = self.entries.len();
        self.entries.retain(|_, e| e.range().end >= frame);
        before - self.entries.len()
    }

    /// Drop all entries, keeping the watermark
    pub fn flush(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    /// Drop entries of one speech, or everything when `speech` is `None`
    pub fn clear(&mut self, speech: Option<SpeechId>) -> usize {
        match speech {
            None => self.flush(),
            Some(id) => {
                let before = self.entries.len();
                self.entries.retain(|_, e| e.speech_id() != Some(id));
                before - self.entries.len()
            }
        }
    }

    /// Forget consumption history as well as entries
    pub fn reset(&mut self) {
        self.entries.clear();
        self.watermark = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Span(u64, u64, Option<u64>);

    impl Framed for Span {
        fn range(&self) -> FrameRange {
            FrameRange::new(FrameIndex(self.0), FrameIndex(self.1))
        }
        fn speech_id(&self) -> Option<SpeechId> {
            self.2.map(SpeechId)
        }
    }

    fn buffer() -> StreamBuffer<Span> {
        StreamBuffer::new(StreamKind::Event, 100)
    }

    #[test]
    fn test_take_matches_inside_range_and_evicts_older() {
        let mut buf = buffer();
        buf.insert(Span(0, 9, None));
        buf.insert(Span(10, 19, None));
        buf.insert(Span(20, 29, None));

        assert_eq!(buf.take(FrameIndex(15)), Some(Span(10, 19, None)));
        // 0..9 ended before 15
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.watermark(), Some(FrameIndex(15)));
    }

    #[test]
    fn test_insert_below_watermark_expired() {
        let mut buf = buffer();
        buf.advance_to(FrameIndex(50));
        assert_eq!(buf.insert(Span(40, 49, None)), Insert::Expired(FrameIndex(49)));
        assert_eq!(buf.insert(Span(40, 50, None)), Insert::Stored);
        assert_eq!(buf.insert(Span(40, 60, None)), Insert::Replaced);
    }

    #[test]
    fn test_take_range_returns_latest() {
        let mut buf = buffer();
        for f in 0..10 {
            buf.insert(Span(f, f, None));
        }
        assert_eq!(buf.take_range(FrameIndex(3), FrameIndex(7)), Some(Span(7, 7, None)));
        assert_eq!(buf.iter().map(|s| s.0).collect::<Vec<_>>(), vec![8, 9]);
        // Going back is refused
        assert_eq!(buf.take(FrameIndex(6)), None);
    }

    #[test]
    fn test_take_all_range_in_order() {
        let mut buf = buffer();
        buf.insert(Span(12, 14, None));
        buf.insert(Span(5, 20, None));
        buf.insert(Span(30, 31, None));
        let taken = buf.take_all_range(FrameIndex(10), FrameIndex(15));
        assert_eq!(taken, vec![Span(5, 20, None), Span(12, 14, None)]);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_drain_until_keeps_later() {
        let mut buf = buffer();
        buf.insert(Span(0, 11, Some(1)));
        buf.insert(Span(12, 23, Some(1)));
        buf.insert(Span(24, 35, Some(1)));
        let drained = buf.drain_until(FrameIndex(12));
        assert_eq!(drained.len(), 2);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.watermark(), None);
    }

    #[test]
    fn test_clear_by_speech() {
        let mut buf = buffer();
        buf.insert(Span(0, 5, Some(1)));
        buf.insert(Span(6, 9, Some(2)));
        buf.insert(Span(10, 12, None));
        assert_eq!(buf.clear(Some(SpeechId(1))), 1);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.clear(None), 2);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut buf = StreamBuffer::new(StreamKind::Body, 3);
        for f in 0..5 {
            buf.insert(Span(f, f, None));
        }
        assert_eq!(buf.enforce_capacity(), 2);
        assert_eq!(buf.iter().map(|s| s.0).collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_consumption_is_monotonic(
                spans in proptest::collection::vec((0u64..200, 0u64..5), 1..60),
                takes in proptest::collection::vec(0u64..220, 1..40),
            ) {
                let mut buf = StreamBuffer::new(StreamKind::Body, 1000);
                for (start, len) in spans {
                    buf.insert(Span(start, start + len, None));
                }
                let mut high = 0u64;
                for t in takes {
                    let taken = buf.take(FrameIndex(t));
                    if t < high {
                        prop_assert!(taken.is_none());
                    } else {
                        high = t;
                        if let Some(span) = taken {
                            prop_assert!(span.0 <= t && span.1 >= t);
                        }
                    }
                    // Nothing ending below the watermark survives
                    prop_assert!(buf.iter().all(|s| s.1 >= high));
                }
            }
        }
    }
}
