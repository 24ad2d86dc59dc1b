//! Audio compositor
//!
//! Audio chunks are buffered per speech segment and handed to the host sink
//! only once the animation clock reaches the segment's first frame. Exactly
//! one segment plays at a time; a newer speech id preempts anything older.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use marionette_core::{
    AvatarError, AvatarResult, FrameIndex, FrameRange, FrameRate, ObservabilityContext, SpeechId,
    StreamKind, TelemetryEvent,
};
use serde::{Deserialize, Serialize};

use crate::chunk::{AudioCapabilities, AudioChunk, AudioFormat};

/// Host audio output
pub trait AudioSink: Send {
    /// Begin playback of a segment
    fn start(&mut self, speech_id: SpeechId, format: &AudioFormat);
    /// Append audio to the playing segment
    fn write(&mut self, speech_id: SpeechId, payload: &Bytes);
    /// Stop immediately and drop anything queued
    fn stop(&mut self, speech_id: SpeechId);
    fn set_volume(&mut self, volume: f32);
}

/// Compositor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Initial output volume in [0, 1]
    pub volume: f32,
    /// Frames ahead of the playhead that chunks are pulled from the cache
    pub lead_frames: u64,
    /// Host decodes container formats (mp3/aac/opus) natively
    pub container_supported: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            volume: 1.0,
            lead_frames: 12,
            container_supported: true,
        }
    }
}

impl AudioConfig {
    pub fn capabilities(&self) -> AudioCapabilities {
        AudioCapabilities {
            container_supported: self.container_supported,
        }
    }
}

/// Which speech to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTarget {
    All,
    Speech(SpeechId),
}

/// A speech segment start or end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechReport {
    pub speech_id: SpeechId,
    /// Buffered length at start, played length at end
    pub duration: Duration,
}

/// What changed during one `tick_start`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioTick {
    pub started: Option<SpeechReport>,
    pub ended: Vec<SpeechReport>,
}

impl AudioTick {
    pub fn is_empty(&self) -> bool {
        self.started.is_none() && self.ended.is_empty()
    }
}

#[derive(Debug)]
struct Segment {
    format: AudioFormat,
    range: FrameRange,
    /// Sorted by start frame
    chunks: Vec<AudioChunk>,
    /// Chunks already written to the sink
    written: usize,
    complete: bool,
}

impl Segment {
    fn new(chunk: &AudioChunk) -> Self {
        Segment {
            format: chunk.format,
            range: chunk.range(),
            chunks: Vec::new(),
            written: 0,
            complete: false,
        }
    }

    /// Insert in frame order. Returns false for a chunk that would land
    /// before audio already written.
    fn push(&mut self, chunk: AudioChunk) -> bool {
        let pos = self
            .chunks
            .partition_point(|c| c.start_frame <= chunk.start_frame);
        if pos < self.written {
            return false;
        }
        self.range = FrameRange::new(
            self.range.start.min(chunk.start_frame),
            self.range.end.max(chunk.end_frame),
        );
        self.complete |= chunk.is_last;
        self.chunks.insert(pos, chunk);
        true
    }

    fn buffered_frames(&self) -> u64 {
        self.chunks.iter().map(|c| c.range().len()).sum()
    }

    /// Past its last frame with nothing more to come
    fn finished_at(&self, frame: FrameIndex) -> bool {
        self.complete && frame > self.range.end
    }
}

#[derive(Debug, Clone, Copy)]
struct Playing {
    speech_id: SpeechId,
    started_at: FrameIndex,
}

/// Frame-gated speech audio player
pub struct AudioCompositor {
    config: AudioConfig,
    caps: AudioCapabilities,
    rate: FrameRate,
    sink: Box<dyn AudioSink>,
    segments: BTreeMap<SpeechId, Segment>,
    playing: Option<Playing>,
    /// Highest speech id ever started
    last_started: Option<SpeechId>,
    /// Speech ids at or below this were interrupted
    interrupted_through: Option<SpeechId>,
    /// Speech cut by a hard stop; its replayed audio may start again
    restartable: Option<SpeechId>,
    volume: f32,
    obs: ObservabilityContext,
}

impl AudioCompositor {
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        Self::with_config(
            AudioConfig::default(),
            FrameRate::default(),
            sink,
            ObservabilityContext::default(),
        )
    }

    pub fn with_config(
        config: AudioConfig,
        rate: FrameRate,
        mut sink: Box<dyn AudioSink>,
        obs: ObservabilityContext,
    ) -> Self {
        let volume = config.volume.clamp(0.0, 1.0);
        sink.set_volume(volume);
        AudioCompositor {
            caps: config.capabilities(),
            config,
            rate,
            sink,
            segments: BTreeMap::new(),
            playing: None,
            last_started: None,
            interrupted_through: None,
            restartable: None,
            volume,
            obs,
        }
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn capabilities(&self) -> AudioCapabilities {
        self.caps
    }

    /// Buffer a chunk for its speech segment
    pub fn feed(&mut self, chunk: AudioChunk) -> AvatarResult<()> {
        if let Err(e) = chunk.validate(&self.caps) {
            if let AvatarError::DataMalformed { reason, .. } = &e {
                self.obs.record(TelemetryEvent::DataMalformed {
                    stream: StreamKind::Audio,
                    reason: reason.clone(),
                });
            }
            return Err(e);
        }

        let id = chunk.speech_id;
        let stale = self.interrupted_through.is_some_and(|w| id <= w)
            || (self.restartable != Some(id)
                && (self.last_started.is_some_and(|s| id < s)
                    || (self.last_started == Some(id)
                        && self.playing.map(|p| p.speech_id) != Some(id))));
        if stale {
            return Err(self.expired(chunk.start_frame));
        }

        let segment = self
            .segments
            .entry(id)
            .or_insert_with(|| Segment::new(&chunk));
        let start = chunk.start_frame;
        if !segment.push(chunk) {
            return Err(self.expired(start));
        }

        if self.playing.is_some_and(|p| p.speech_id == id) {
            self.flush(id);
        }
        Ok(())
    }

    fn expired(&self, frame: FrameIndex) -> AvatarError {
        self.obs.record(TelemetryEvent::DataExpired {
            stream: StreamKind::Audio,
            frame,
        });
        AvatarError::DataExpired {
            stream: StreamKind::Audio,
            frame,
        }
    }

    /// Write every not yet written chunk of the playing segment
    fn flush(&mut self, id: SpeechId) {
        if let Some(segment) = self.segments.get_mut(&id) {
            for chunk in &segment.chunks[segment.written..] {
                self.sink.write(id, &chunk.payload);
            }
            segment.written = segment.chunks.len();
        }
    }

    /// Drive segment ends and the frame-gated start for `frame`
    pub fn tick_start(&mut self, frame: FrameIndex) -> AudioTick {
        let mut tick = AudioTick::default();

        if let Some(playing) = self.playing {
            let done = self
                .segments
                .get(&playing.speech_id)
                .map_or(true, |s| s.finished_at(frame));
            if done {
                let played = self
                    .segments
                    .remove(&playing.speech_id)
                    .map_or(0, |s| s.range.len());
                self.sink.stop(playing.speech_id);
                self.playing = None;
                tracing::debug!(speech = ?playing.speech_id, ?frame, "speech ended");
                tick.ended.push(SpeechReport {
                    speech_id: playing.speech_id,
                    duration: self.rate.duration_of(played),
                });
            }
        }

        let candidate = self
            .segments
            .iter()
            .rev()
            .find(|(id, seg)| {
                (Some(**id) > self.last_started || Some(**id) == self.restartable)
                    && seg.range.start <= frame
                    && !seg.finished_at(frame)
            })
            .map(|(id, _)| *id);

        if let Some(id) = candidate {
            if let Some(old) = self.playing.take() {
                self.sink.stop(old.speech_id);
                self.obs.record(TelemetryEvent::SpeechInterrupted {
                    speech_id: old.speech_id,
                });
                tracing::debug!(old = ?old.speech_id, new = ?id, "speech preempted");
                tick.ended.push(SpeechReport {
                    speech_id: old.speech_id,
                    duration: self.rate.duration_of(frame.frames_since(old.started_at)),
                });
            }
            // Older segments can never play now
            self.segments.retain(|k, _| *k >= id);

            let (format, buffered) = match self.segments.get(&id) {
                Some(seg) => (seg.format, seg.buffered_frames()),
                None => return tick,
            };
            self.sink.start(id, &format);
            self.playing = Some(Playing {
                speech_id: id,
                started_at: frame,
            });
            self.last_started = self.last_started.max(Some(id));
            self.restartable = None;
            self.flush(id);

            tracing::debug!(speech = ?id, ?frame, "speech started");
            tick.started = Some(SpeechReport {
                speech_id: id,
                duration: self.rate.duration_of(buffered),
            });
        }

        tick
    }

    /// Hard-stop playback
    ///
    /// `All` is a reset: buffered audio is discarded but later chunks are
    /// still accepted, and a replay of the cut speech gate-starts again.
    /// `Speech(id)` is an interruption: chunks for `id` and older speech are
    /// rejected from now on.
    pub fn stop(&mut self, target: StopTarget, frame: FrameIndex) -> Vec<SpeechReport> {
        let mut ended = Vec::new();

        match target {
            StopTarget::All => self.segments.clear(),
            StopTarget::Speech(id) => {
                self.segments.remove(&id);
            }
        }

        if let Some(playing) = self.playing {
            let hit = match target {
                StopTarget::All => true,
                StopTarget::Speech(id) => playing.speech_id == id,
            };
            if hit {
                self.sink.stop(playing.speech_id);
                self.playing = None;
                self.obs.record(TelemetryEvent::SpeechInterrupted {
                    speech_id: playing.speech_id,
                });
                ended.push(SpeechReport {
                    speech_id: playing.speech_id,
                    duration: self.rate.duration_of(frame.frames_since(playing.started_at)),
                });
                if target == StopTarget::All {
                    self.restartable = Some(playing.speech_id);
                }
            }
        }

        if let StopTarget::Speech(id) = target {
            self.interrupted_through = self.interrupted_through.max(Some(id));
            if self.restartable.is_some_and(|r| r <= id) {
                self.restartable = None;
            }
        }
        tracing::debug!(?target, interrupted_through = ?self.interrupted_through, "audio stopped");
        ended
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        self.sink.set_volume(self.volume);
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Speech currently handed to the sink
    pub fn playing(&self) -> Option<SpeechId> {
        self.playing.map(|p| p.speech_id)
    }

    pub fn last_started(&self) -> Option<SpeechId> {
        self.last_started
    }

    pub fn interrupted_through(&self) -> Option<SpeechId> {
        self.interrupted_through
    }

    /// Speech ids with buffered audio
    pub fn buffered(&self) -> Vec<SpeechId> {
        self.segments.keys().copied().collect()
    }
}

impl std::fmt::Debug for AudioCompositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCompositor")
            .field("playing", &self.playing())
            .field("segments", &self.segments.len())
            .field("last_started", &self.last_started)
            .field("interrupted_through", &self.interrupted_through)
            .field("restartable", &self.restartable)
            .field("volume", &self.volume)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ContainerKind;
    use marionette_core::RecordingTelemetry;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    enum SinkCall {
        Start(SpeechId),
        Write(SpeechId, usize),
        Stop(SpeechId),
        Volume(f32),
    }

    #[derive(Clone, Default)]
    struct LogSink(Arc<Mutex<Vec<SinkCall>>>);

    impl LogSink {
        fn calls(&self) -> Vec<SinkCall> {
            self.0.lock().clone()
        }

        fn starts(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, SinkCall::Start(_)))
                .count()
        }
    }

    impl AudioSink for LogSink {
        fn start(&mut self, speech_id: SpeechId, _format: &AudioFormat) {
            self.0.lock().push(SinkCall::Start(speech_id));
        }
        fn write(&mut self, speech_id: SpeechId, payload: &Bytes) {
            self.0.lock().push(SinkCall::Write(speech_id, payload.len()));
        }
        fn stop(&mut self, speech_id: SpeechId) {
            self.0.lock().push(SinkCall::Stop(speech_id));
        }
        fn set_volume(&mut self, volume: f32) {
            self.0.lock().push(SinkCall::Volume(volume));
        }
    }

    fn chunk(id: u64, start: u64, end: u64, last: bool) -> AudioChunk {
        AudioChunk {
            speech_id: SpeechId(id),
            start_frame: FrameIndex(start),
            end_frame: FrameIndex(end),
            payload: Bytes::from(vec![0u8; 64]),
            format: AudioFormat::Pcm16 {
                sample_rate: 16_000,
                channels: 1,
            },
            is_last: last,
        }
    }

    fn compositor() -> (LogSink, AudioCompositor) {
        let sink = LogSink::default();
        let comp = AudioCompositor::new(Box::new(sink.clone()));
        (sink, comp)
    }

    #[test]
    fn test_gate_start_exactly_once() {
        let (sink, mut comp) = compositor();
        comp.feed(chunk(1, 100, 123, false)).unwrap();

        for f in 80..100 {
            assert!(comp.tick_start(FrameIndex(f)).started.is_none());
        }
        let tick = comp.tick_start(FrameIndex(100));
        assert_eq!(tick.started.map(|s| s.speech_id), Some(SpeechId(1)));
        for f in 101..120 {
            assert!(comp.tick_start(FrameIndex(f)).started.is_none());
        }
        assert_eq!(sink.starts(), 1);
    }

    #[test]
    fn test_late_chunks_written_while_playing() {
        let (sink, mut comp) = compositor();
        comp.feed(chunk(1, 0, 11, false)).unwrap();
        comp.tick_start(FrameIndex(0));
        comp.feed(chunk(1, 12, 23, true)).unwrap();

        let writes = sink
            .calls()
            .iter()
            .filter(|c| matches!(c, SinkCall::Write(SpeechId(1), _)))
            .count();
        assert_eq!(writes, 2);
    }

    #[test]
    fn test_segment_ends_after_last_chunk_and_end_frame() {
        let (sink, mut comp) = compositor();
        comp.feed(chunk(1, 0, 23, false)).unwrap();
        comp.tick_start(FrameIndex(0));

        // No last chunk yet: keeps playing past the end frame
        assert!(comp.tick_start(FrameIndex(30)).ended.is_empty());

        comp.feed(chunk(1, 24, 47, true)).unwrap();
        assert!(comp.tick_start(FrameIndex(47)).ended.is_empty());
        let tick = comp.tick_start(FrameIndex(48));
        assert_eq!(
            tick.ended,
            vec![SpeechReport {
                speech_id: SpeechId(1),
                duration: Duration::from_secs(2),
            }]
        );
        assert_eq!(comp.playing(), None);
        assert_eq!(sink.calls().last(), Some(&SinkCall::Stop(SpeechId(1))));
    }

    #[test]
    fn test_newer_speech_preempts_older() {
        let (sink, mut comp) = compositor();
        comp.feed(chunk(1, 0, 100, true)).unwrap();
        comp.feed(chunk(2, 40, 80, true)).unwrap();
        comp.feed(chunk(3, 60, 90, true)).unwrap();

        comp.tick_start(FrameIndex(0));
        assert_eq!(comp.playing(), Some(SpeechId(1)));

        // 2 and 3 are both due; the newest wins and 2 is discarded
        let tick = comp.tick_start(FrameIndex(60));
        assert_eq!(tick.started.map(|s| s.speech_id), Some(SpeechId(3)));
        assert_eq!(tick.ended[0].speech_id, SpeechId(1));
        assert_eq!(comp.buffered(), vec![SpeechId(3)]);
        assert!(sink.calls().contains(&SinkCall::Stop(SpeechId(1))));

        // Stale chunks for older speech are rejected
        assert!(matches!(
            comp.feed(chunk(2, 81, 90, true)),
            Err(AvatarError::DataExpired { .. })
        ));
    }

    #[test]
    fn test_interrupt_watermark_rejects_stale_chunks() {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let sink = LogSink::default();
        let mut comp = AudioCompositor::with_config(
            AudioConfig::default(),
            FrameRate::default(),
            Box::new(sink.clone()),
            ObservabilityContext::new(telemetry.clone(), "test"),
        );
        comp.feed(chunk(4, 0, 23, false)).unwrap();
        comp.tick_start(FrameIndex(0));

        let ended = comp.stop(StopTarget::Speech(SpeechId(4)), FrameIndex(12));
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].duration, Duration::from_millis(500));
        assert_eq!(comp.interrupted_through(), Some(SpeechId(4)));

        assert!(comp.feed(chunk(4, 24, 47, true)).is_err());
        assert!(comp.feed(chunk(5, 50, 60, true)).is_ok());
        assert_eq!(
            telemetry.count(|e| matches!(e, TelemetryEvent::SpeechInterrupted { .. })),
            1
        );
    }

    #[test]
    fn test_reset_lets_replayed_speech_start_again() {
        let (sink, mut comp) = compositor();
        comp.feed(chunk(5, 0, 23, false)).unwrap();
        comp.tick_start(FrameIndex(0));

        let ended = comp.stop(StopTarget::All, FrameIndex(20));
        assert_eq!(ended[0].speech_id, SpeechId(5));
        assert_eq!(comp.playing(), None);
        assert_eq!(comp.interrupted_through(), None);
        assert!(comp.buffered().is_empty());

        // The server replays the speech from the resume frame
        comp.feed(chunk(5, 24, 200, true)).unwrap();
        assert!(comp.tick_start(FrameIndex(23)).started.is_none());
        let tick = comp.tick_start(FrameIndex(24));
        assert_eq!(tick.started.map(|s| s.speech_id), Some(SpeechId(5)));
        assert_eq!(comp.playing(), Some(SpeechId(5)));
        assert_eq!(sink.starts(), 2);

        // Older speech stays stale after the reset
        assert!(comp.feed(chunk(4, 30, 40, true)).is_err());
    }

    #[test]
    fn test_interrupt_after_reset_rejects_replay() {
        let (_sink, mut comp) = compositor();
        comp.feed(chunk(5, 0, 23, false)).unwrap();
        comp.tick_start(FrameIndex(0));
        comp.stop(StopTarget::All, FrameIndex(10));
        comp.stop(StopTarget::Speech(SpeechId(5)), FrameIndex(10));
        assert!(comp.feed(chunk(5, 24, 47, true)).is_err());
    }

    #[test]
    fn test_stop_single_speech_keeps_others() {
        let (_sink, mut comp) = compositor();
        comp.feed(chunk(1, 0, 10, true)).unwrap();
        comp.feed(chunk(2, 20, 30, true)).unwrap();
        comp.stop(StopTarget::Speech(SpeechId(1)), FrameIndex(0));
        assert_eq!(comp.buffered(), vec![SpeechId(2)]);
    }

    #[test]
    fn test_container_rejected_when_unsupported() {
        let sink = LogSink::default();
        let config = AudioConfig {
            container_supported: false,
            ..AudioConfig::default()
        };
        let mut comp = AudioCompositor::with_config(
            config,
            FrameRate::default(),
            Box::new(sink),
            ObservabilityContext::default(),
        );
        let mut c = chunk(1, 0, 10, true);
        c.format = AudioFormat::Container(ContainerKind::Aac);
        assert!(matches!(
            comp.feed(c),
            Err(AvatarError::DataMalformed { .. })
        ));
    }

    #[test]
    fn test_volume_clamped() {
        let (sink, mut comp) = compositor();
        comp.set_volume(3.0);
        assert_eq!(comp.volume(), 1.0);
        comp.set_volume(-1.0);
        assert_eq!(sink.calls().last(), Some(&SinkCall::Volume(0.0)));
    }
}
