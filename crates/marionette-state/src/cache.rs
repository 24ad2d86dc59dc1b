//! Frame cache
//!
//! One buffer per stream kind, owned by the render scheduler. The transport
//! and the decoder write into it, the tick loop reads from it; both happen
//! on the scheduler's thread so no locking is involved.

use marionette_core::{
    AvatarError, FrameIndex, ObservabilityContext, SpeechId, StreamKind, TelemetryEvent,
    UiEventBatch,
};
use marionette_visual::{BodyFrame, FaceSample, FaceSource};
use marionette_voice::AudioChunk;
use serde::{Deserialize, Serialize};

use crate::buffer::{Framed, Insert, StreamBuffer};

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry bound per stream; the oldest entries go first
    pub max_frames_per_stream: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            // One minute of body video at 24fps
            max_frames_per_stream: 1440,
        }
    }
}

impl CacheConfig {
    /// Twenty seconds per stream
    pub fn constrained() -> Self {
        CacheConfig {
            max_frames_per_stream: 480,
        }
    }
}

/// A batch of entries for one stream
#[derive(Debug)]
pub enum StreamBatch {
    Body(Vec<BodyFrame>),
    FaceAuthoritative(Vec<FaceSample>),
    FaceRealtime(Vec<FaceSample>),
    Audio(Vec<AudioChunk>),
    Event(Vec<UiEventBatch>),
}

impl StreamBatch {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamBatch::Body(_) => StreamKind::Body,
            StreamBatch::FaceAuthoritative(_) => StreamKind::FaceAuthoritative,
            StreamBatch::FaceRealtime(_) => StreamKind::FaceRealtime,
            StreamBatch::Audio(_) => StreamKind::Audio,
            StreamBatch::Event(_) => StreamKind::Event,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            StreamBatch::Body(v) => v.len(),
            StreamBatch::FaceAuthoritative(v) | StreamBatch::FaceRealtime(v) => v.len(),
            StreamBatch::Audio(v) => v.len(),
            StreamBatch::Event(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An entry taken out of the cache
#[derive(Debug)]
pub enum CachedFrame {
    Body(BodyFrame),
    Face(FaceSample),
    Audio(AudioChunk),
    Event(UiEventBatch),
}

impl CachedFrame {
    pub fn into_body(self) -> Option<BodyFrame> {
        match self {
            CachedFrame::Body(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn into_face(self) -> Option<FaceSample> {
        match self {
            CachedFrame::Face(sample) => Some(sample),
            _ => None,
        }
    }

    pub fn into_audio(self) -> Option<AudioChunk> {
        match self {
            CachedFrame::Audio(chunk) => Some(chunk),
            _ => None,
        }
    }

    pub fn into_events(self) -> Option<UiEventBatch> {
        match self {
            CachedFrame::Event(batch) => Some(batch),
            _ => None,
        }
    }
}

/// Result of a `put`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutReport {
    pub stored: usize,
    pub replaced: usize,
    /// Entries dropped by a staleness flush before insertion
    pub flushed: usize,
    /// Entries dropped to honour the capacity bound
    pub evicted: usize,
    /// Rejected entries (expired or malformed)
    pub errors: Vec<AvatarError>,
}

impl PutReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Frame-indexed storage for every stream
#[derive(Debug)]
pub struct FrameCache {
    body: StreamBuffer<BodyFrame>,
    face_live: StreamBuffer<FaceSample>,
    face_idle: StreamBuffer<FaceSample>,
    audio: StreamBuffer<AudioChunk>,
    events: StreamBuffer<UiEventBatch>,
    config: CacheConfig,
    obs: ObservabilityContext,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default(), ObservabilityContext::default())
    }

    pub fn with_config(config: CacheConfig, obs: ObservabilityContext) -> Self {
        let cap = config.max_frames_per_stream;
        FrameCache {
            body: StreamBuffer::new(StreamKind::Body, cap),
            face_live: StreamBuffer::new(StreamKind::FaceAuthoritative, cap),
            face_idle: StreamBuffer::new(StreamKind::FaceRealtime, cap),
            audio: StreamBuffer::new(StreamKind::Audio, cap),
            events: StreamBuffer::new(StreamKind::Event, cap),
            config,
            obs,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Store a batch
    pub fn put(&mut self, batch: StreamBatch) -> PutReport {
        let mut report = PutReport::default();
        match batch {
            StreamBatch::Body(frames) => {
                store(&mut self.body, frames, &self.obs, &mut report);
            }
            StreamBatch::FaceAuthoritative(samples) => {
                let samples = self.check_face_flags(samples, true, &mut report);
                store(&mut self.face_live, samples, &self.obs, &mut report);
            }
            StreamBatch::FaceRealtime(samples) => {
                let samples = self.check_face_flags(samples, false, &mut report);
                store(&mut self.face_idle, samples, &self.obs, &mut report);
            }
            StreamBatch::Audio(chunks) => {
                store(&mut self.audio, chunks, &self.obs, &mut report);
            }
            StreamBatch::Event(batches) => {
                store(&mut self.events, batches, &self.obs, &mut report);
            }
        }
        report
    }

    fn check_face_flags(
        &self,
        samples: Vec<FaceSample>,
        authoritative: bool,
        report: &mut PutReport,
    ) -> Vec<FaceSample> {
        let stream = if authoritative {
            StreamKind::FaceAuthoritative
        } else {
            StreamKind::FaceRealtime
        };
        let (good, bad): (Vec<_>, Vec<_>) = samples
            .into_iter()
            .partition(|s| s.is_authoritative == authoritative);
        for sample in bad {
            let reason = format!(
                "sample at frame {} has is_authoritative={}",
                sample.frame_index, sample.is_authoritative
            );
            tracing::warn!(%stream, %reason, "malformed face sample");
            self.obs.record(TelemetryEvent::DataMalformed {
                stream,
                reason: reason.clone(),
            });
            report.errors.push(AvatarError::DataMalformed { stream, reason });
        }
        good
    }

    /// Remove and return the entry covering `frame`
    pub fn take(&mut self, kind: StreamKind, frame: FrameIndex) -> Option<CachedFrame> {
        self.take_range(kind, frame, frame)
    }

    /// Remove and return the latest entry intersecting `[lo, hi]`
    pub fn take_range(
        &mut self,
        kind: StreamKind,
        lo: FrameIndex,
        hi: FrameIndex,
    ) -> Option<CachedFrame> {
        match kind {
            StreamKind::Body => self.body.take_range(lo, hi).map(CachedFrame::Body),
            StreamKind::FaceAuthoritative => {
                self.face_live.take_range(lo, hi).map(CachedFrame::Face)
            }
            StreamKind::FaceRealtime => self.face_idle.take_range(lo, hi).map(CachedFrame::Face),
            StreamKind::Audio => self.audio.take_range(lo, hi).map(CachedFrame::Audio),
            StreamKind::Event => self.events.take_range(lo, hi).map(CachedFrame::Event),
        }
    }

    /// Body frame to present for a tick that covered `[lo, hi]`
    pub fn take_body(&mut self, lo: FrameIndex, hi: FrameIndex) -> Option<BodyFrame> {
        self.body.take_range(lo, hi)
    }

    /// Face sample of one track at `frame`
    pub fn take_face(&mut self, kind: StreamKind, frame: FrameIndex) -> Option<FaceSample> {
        match kind {
            StreamKind::FaceAuthoritative => self.face_live.take(frame),
            StreamKind::FaceRealtime => self.face_idle.take(frame),
            _ => None,
        }
    }

    /// Every UI event batch reached during `[lo, hi]`, in frame order
    pub fn take_events(&mut self, lo: FrameIndex, hi: FrameIndex) -> Vec<UiEventBatch> {
        self.events.take_all_range(lo, hi)
    }

    /// Hand out every entry starting at or before `hi`
    pub fn drain_until(&mut self, kind: StreamKind, hi: FrameIndex) -> Vec<CachedFrame> {
        match kind {
            StreamKind::Body => wrap(self.body.drain_until(hi), CachedFrame::Body),
            StreamKind::FaceAuthoritative => wrap(self.face_live.drain_until(hi), CachedFrame::Face),
            StreamKind::FaceRealtime => wrap(self.face_idle.drain_until(hi), CachedFrame::Face),
            StreamKind::Audio => wrap(self.audio.drain_until(hi), CachedFrame::Audio),
            StreamKind::Event => wrap(self.events.drain_until(hi), CachedFrame::Event),
        }
    }

    /// Audio chunks due by `hi`, for the compositor lead-in
    pub fn drain_audio(&mut self, hi: FrameIndex) -> Vec<AudioChunk> {
        self.audio.drain_until(hi)
    }

    /// Consume every stream through `frame`
    pub fn advance(&mut self, frame: FrameIndex) -> usize {
        self.body.advance_to(frame)
            + self.face_live.advance_to(frame)
            + self.face_idle.advance_to(frame)
            + self.audio.advance_to(frame)
            + self.events.advance_to(frame)
    }

    /// Drop entries of one stream, optionally only those of one speech
    pub fn clear(&mut self, kind: StreamKind, speech: Option<SpeechId>) -> usize {
        let dropped = match kind {
            StreamKind::Body => self.body.clear(speech),
            StreamKind::FaceAuthoritative => self.face_live.clear(speech),
            StreamKind::FaceRealtime => self.face_idle.clear(speech),
            StreamKind::Audio => self.audio.clear(speech),
            StreamKind::Event => self.events.clear(speech),
        };
        if dropped > 0 {
            tracing::debug!(%kind, ?speech, dropped, "stream cleared");
        }
        dropped
    }

    /// Drop everything and forget consumption history
    pub fn clear_all(&mut self) {
        self.body.reset();
        self.face_live.reset();
        self.face_idle.reset();
        self.audio.reset();
        self.events.reset();
        tracing::debug!("frame cache cleared");
    }

    pub fn len(&self, kind: StreamKind) -> usize {
        match kind {
            StreamKind::Body => self.body.len(),
            StreamKind::FaceAuthoritative => self.face_live.len(),
            StreamKind::FaceRealtime => self.face_idle.len(),
            StreamKind::Audio => self.audio.len(),
            StreamKind::Event => self.events.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        StreamKind::ALL.iter().all(|k| self.len(*k) == 0)
    }

    pub fn watermark(&self, kind: StreamKind) -> Option<FrameIndex> {
        match kind {
            StreamKind::Body => self.body.watermark(),
            StreamKind::FaceAuthoritative => self.face_live.watermark(),
            StreamKind::FaceRealtime => self.face_idle.watermark(),
            StreamKind::Audio => self.audio.watermark(),
            StreamKind::Event => self.events.watermark(),
        }
    }

    /// Buffered body frames at or after `frame`
    pub fn body_frames_from(&self, frame: FrameIndex) -> usize {
        self.body.iter().filter(|f| f.frame_index >= frame).count()
    }

    /// Contiguous body frames buffered from `frame` onwards
    pub fn contiguous_body_from(&self, frame: FrameIndex) -> u64 {
        let mut expected = frame;
        let mut run = 0;
        for f in self.body.iter().filter(|f| f.frame_index >= frame) {
            if f.frame_index != expected {
                break;
            }
            run += 1;
            expected = expected.next();
        }
        run
    }
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FaceSource for FrameCache {
    fn authoritative_face(&mut self, frame: FrameIndex) -> Option<FaceSample> {
        self.face_live.take(frame)
    }

    fn idle_face(&mut self, frame: FrameIndex) -> Option<FaceSample> {
        self.face_idle.take(frame)
    }
}

fn wrap<T>(items: Vec<T>, f: fn(T) -> CachedFrame) -> Vec<CachedFrame> {
    items.into_iter().map(f).collect()
}

fn store<T: Framed>(
    buffer: &mut StreamBuffer<T>,
    items: Vec<T>,
    obs: &ObservabilityContext,
    report: &mut PutReport,
) {
    let kind = buffer.kind();
    if items.is_empty() {
        return;
    }

    // A transport stream that restarts at or before what it already sent
    // has been rewound by the server
    if kind.is_transport_fed() {
        let first = items.iter().map(|i| i.range().start).min();
        if let (Some(first), Some(tail)) = (first, buffer.tail_end()) {
            if first <= tail {
                let dropped = buffer.flush();
                report.flushed += dropped;
                tracing::debug!(%kind, ?first, ?tail, dropped, "stale stream flushed");
                obs.record(TelemetryEvent::StreamFlushed {
                    stream: kind,
                    dropped,
                });
            }
        }
    }

    for item in items {
        match buffer.insert(item) {
            Insert::Stored => report.stored += 1,
            Insert::Replaced => {
                report.stored += 1;
                report.replaced += 1;
            }
            Insert::Expired(frame) => {
                obs.record(TelemetryEvent::DataExpired { stream: kind, frame });
                report.errors.push(AvatarError::DataExpired { stream: kind, frame });
            }
        }
    }

    let evicted = buffer.enforce_capacity();
    if evicted > 0 {
        report.evicted += evicted;
        tracing::warn!(%kind, evicted, "stream over capacity");
        obs.record(TelemetryEvent::CapacityEvicted {
            stream: kind,
            evicted,
        });
    }
}
