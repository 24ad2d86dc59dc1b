//! Simulation harness
//!
//! Deterministic stand-ins for every host capability, and a `Harness` that
//! wires them into an `AvatarSession` over a manual clock. Tests drive time
//! frame by frame and inspect what the host would have seen.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use marionette_core::{
    AvatarError, AvatarEvent, AvatarResult, BodyId, DescriptorId, FrameIndex, RecordingTelemetry,
    SpeechId, StreamKind, UiEvent, UiEventBatch,
};
use marionette_runtime::{AvatarConfig, AvatarSession, RenderInput, Renderer, SessionParts};
use marionette_time::ManualTimeSource;
use marionette_transport::{ControlMessage, ResumeInfo, Transport, TransportEvent};
use marionette_visual::{
    BodyDecoder, BodyFrame, BodyFrameDescriptor, DecodeStream, DecodedImage, FaceSample,
    ReleaseLedger, SurfaceHandle, SurfaceId, Task, TaskSpawner,
};
use marionette_voice::{AudioChunk, AudioFormat, AudioSink};
use parking_lot::Mutex;

// ============================================================================
// TRANSPORT
// ============================================================================

/// What the engine asked of the network
#[derive(Debug, Default)]
pub struct TransportScript {
    pub connects: Vec<Option<ResumeInfo>>,
    pub sent: Vec<ControlMessage>,
    pub closed: bool,
    /// Fail every `connect` call synchronously
    pub refuse_connects: bool,
}

/// Transport that records calls and fails on demand
#[derive(Clone, Default)]
pub struct ScriptedTransport(pub Arc<Mutex<TransportScript>>);

impl ScriptedTransport {
    pub fn connect_count(&self) -> usize {
        self.0.lock().connects.len()
    }

    pub fn last_resume(&self) -> Option<ResumeInfo> {
        self.0.lock().connects.last().cloned().flatten()
    }

    pub fn refuse(&self, refuse: bool) {
        self.0.lock().refuse_connects = refuse;
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self, resume: Option<ResumeInfo>) -> AvatarResult<()> {
        let mut script = self.0.lock();
        script.connects.push(resume);
        if script.refuse_connects {
            return Err(AvatarError::TransportError("connection refused".into()));
        }
        Ok(())
    }

    fn send(&mut self, message: ControlMessage) -> AvatarResult<()> {
        self.0.lock().sent.push(message);
        Ok(())
    }

    fn close(&mut self) {
        self.0.lock().closed = true;
    }
}

// ============================================================================
// RENDERER
// ============================================================================

/// One presented frame
#[derive(Debug, Clone, PartialEq)]
pub struct Presented {
    pub frame: FrameIndex,
    pub body_frame: Option<FrameIndex>,
    pub surface: Option<SurfaceId>,
    pub fresh: bool,
    pub face: Option<FaceSample>,
}

#[derive(Debug, Default)]
pub struct RenderRecord {
    pub presented: Vec<Presented>,
    pub offline_ticks: Vec<u64>,
    pub ensured: u32,
    pub released: u32,
    pub fail_ensure: bool,
}

impl RenderRecord {
    pub fn frames(&self) -> Vec<FrameIndex> {
        self.presented.iter().map(|p| p.frame).collect()
    }

    pub fn resources_live(&self) -> bool {
        self.ensured > self.released
    }
}

#[derive(Clone, Default)]
pub struct RecordingRenderer(pub Arc<Mutex<RenderRecord>>);

impl Renderer for RecordingRenderer {
    fn ensure_resources(&mut self) -> AvatarResult<()> {
        let mut record = self.0.lock();
        if record.fail_ensure {
            return Err(AvatarError::ResourceInitFailure("gpu context lost".into()));
        }
        record.ensured += 1;
        Ok(())
    }

    fn release_resources(&mut self) {
        self.0.lock().released += 1;
    }

    fn present(&mut self, input: RenderInput<'_>) {
        self.0.lock().presented.push(Presented {
            frame: input.frame,
            body_frame: input.body.map(|b| b.frame_index),
            surface: input.body.map(|b| b.surface.id()),
            fresh: input.body_fresh,
            face: input.face.cloned(),
        });
    }

    fn present_offline(&mut self, _animation: &str, tick: u64) {
        self.0.lock().offline_ticks.push(tick);
    }
}

// ============================================================================
// AUDIO
// ============================================================================

#[derive(Debug, Default)]
pub struct AudioRecord {
    pub started: Vec<SpeechId>,
    pub stopped: Vec<SpeechId>,
    pub bytes_written: usize,
    pub volume: f32,
}

#[derive(Clone, Default)]
pub struct RecordingAudioSink(pub Arc<Mutex<AudioRecord>>);

impl AudioSink for RecordingAudioSink {
    fn start(&mut self, speech_id: SpeechId, _format: &AudioFormat) {
        self.0.lock().started.push(speech_id);
    }

    fn write(&mut self, _speech_id: SpeechId, payload: &Bytes) {
        self.0.lock().bytes_written += payload.len();
    }

    fn stop(&mut self, speech_id: SpeechId) {
        self.0.lock().stopped.push(speech_id);
    }

    fn set_volume(&mut self, volume: f32) {
        self.0.lock().volume = volume;
    }
}

// ============================================================================
// DECODING
// ============================================================================

/// Spawner that queues tasks until the test runs them
#[derive(Clone, Default)]
pub struct ManualSpawner(Arc<Mutex<Vec<Task>>>);

impl ManualSpawner {
    pub fn pending(&self) -> usize {
        self.0.lock().len()
    }

    /// Run every queued task to completion
    pub fn run_all(&self) -> usize {
        let tasks: Vec<Task> = std::mem::take(&mut *self.0.lock());
        let n = tasks.len();
        for task in tasks {
            task();
        }
        n
    }

    /// Drop queued tasks without running them
    pub fn discard(&self) -> usize {
        let tasks: Vec<Task> = std::mem::take(&mut *self.0.lock());
        tasks.len()
    }
}

impl TaskSpawner for ManualSpawner {
    fn spawn(&self, task: Task) {
        self.0.lock().push(task);
    }
}

/// Decoder producing one numbered surface per frame
///
/// Every surface gets a fresh id so the ledger can tell a double release
/// from two decodes of the same frame.
#[derive(Debug, Default)]
pub struct SyntheticDecoder {
    pub ledger: Arc<ReleaseLedger>,
    next_surface: Arc<AtomicU64>,
    opened: Mutex<Vec<(DescriptorId, FrameIndex)>>,
    failing: Mutex<HashSet<DescriptorId>>,
}

impl SyntheticDecoder {
    pub fn new() -> Self {
        SyntheticDecoder::default()
    }

    /// Surfaces created so far
    pub fn created(&self) -> u64 {
        self.next_surface.load(Ordering::SeqCst)
    }

    /// Every surface created has been released exactly once
    pub fn all_released(&self) -> bool {
        self.ledger.total() == self.created() && !self.ledger.any_double_release()
    }

    pub fn opened(&self) -> Vec<(DescriptorId, FrameIndex)> {
        self.opened.lock().clone()
    }

    /// Make every open of `clip` fail mid-stream
    pub fn fail_clip(&self, clip: DescriptorId) {
        self.failing.lock().insert(clip);
    }
}

struct SyntheticStream {
    next: FrameIndex,
    end: FrameIndex,
    fail_after: Option<u64>,
    produced: u64,
    ledger: Arc<ReleaseLedger>,
    next_surface: Arc<AtomicU64>,
}

impl DecodeStream for SyntheticStream {
    fn next_image(&mut self) -> AvatarResult<Option<DecodedImage>> {
        if self.fail_after.is_some_and(|n| self.produced >= n) {
            return Err(AvatarError::DecodeFailure {
                stream: StreamKind::Body,
            });
        }
        if self.next > self.end {
            return Ok(None);
        }
        let frame = self.next;
        self.next = frame.next();
        self.produced += 1;
        let id = self.next_surface.fetch_add(1, Ordering::SeqCst);
        Ok(Some(DecodedImage {
            frame_index: frame,
            surface: SurfaceHandle::new(SurfaceId(id), self.ledger.clone()),
        }))
    }

    fn cancel(&mut self) {
        self.next = self.end.next();
    }
}

impl BodyDecoder for SyntheticDecoder {
    fn open(
        &self,
        descriptor: &BodyFrameDescriptor,
        from: FrameIndex,
    ) -> AvatarResult<Box<dyn DecodeStream>> {
        self.opened.lock().push((descriptor.id, from));
        let fail_after = self.failing.lock().contains(&descriptor.id).then_some(2);
        Ok(Box::new(SyntheticStream {
            next: from,
            end: descriptor.end_frame,
            fail_after,
            produced: 0,
            ledger: self.ledger.clone(),
            next_surface: self.next_surface.clone(),
        }))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub fn clip(id: u64, start: u64, end: u64) -> BodyFrameDescriptor {
    BodyFrameDescriptor {
        id: DescriptorId(id),
        body_id: BodyId(1),
        name: format!("clip_{id}"),
        start_frame: FrameIndex(start),
        end_frame: FrameIndex(end),
        has_facial_data: false,
        state: "speaking".into(),
    }
}

pub fn pcm_chunk(speech: u64, start: u64, end: u64, last: bool) -> AudioChunk {
    AudioChunk {
        speech_id: SpeechId(speech),
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

pub fn subtitle(frame: u64, speech: Option<u64>, text: &str) -> UiEventBatch {
    UiEventBatch::new(
        FrameIndex(frame),
        FrameIndex(frame),
        speech.map(SpeechId),
        vec![UiEvent {
            frame: FrameIndex(frame),
            kind: "subtitle".into(),
            payload: text.into(),
        }],
    )
}

/// Body frames as they would arrive pre-decoded from the server
pub fn body_frames(
    ledger: &Arc<ReleaseLedger>,
    clip: DescriptorId,
    frames: std::ops::RangeInclusive<u64>,
    surface_base: u64,
) -> Vec<BodyFrame> {
    frames
        .map(|f| BodyFrame {
            frame_index: FrameIndex(f),
            descriptor: clip,
            body_id: BodyId(1),
            has_facial_data: false,
            surface: SurfaceHandle::new(SurfaceId(surface_base + f), ledger.clone()),
        })
        .collect()
}

// ============================================================================
// HARNESS
// ============================================================================

/// A session with recording doubles on a manual clock
pub struct Harness {
    pub time: ManualTimeSource,
    pub transport: ScriptedTransport,
    pub renderer: RecordingRenderer,
    pub sink: RecordingAudioSink,
    pub spawner: ManualSpawner,
    pub decoder: Arc<SyntheticDecoder>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub session: AvatarSession,
    events: Arc<Mutex<Vec<AvatarEvent>>>,
    step: Duration,
}

impl Harness {
    pub fn new(config: AvatarConfig) -> Self {
        let time = ManualTimeSource::new();
        let transport = ScriptedTransport::default();
        let renderer = RecordingRenderer::default();
        let sink = RecordingAudioSink::default();
        let spawner = ManualSpawner::default();
        let decoder = Arc::new(SyntheticDecoder::new());
        let telemetry = Arc::new(RecordingTelemetry::new());

        let mut session = AvatarSession::new(
            &config,
            SessionParts {
                time: Arc::new(time.clone()),
                transport: Box::new(transport.clone()),
                renderer: Box::new(renderer.clone()),
                decoder: decoder.clone(),
                spawner: Arc::new(spawner.clone()),
                audio_sink: Box::new(sink.clone()),
                telemetry: telemetry.clone(),
            },
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = events.clone();
        session.subscribe_all(move |e| log.lock().push(e.clone()));

        // Rounded up so every step lands inside exactly the next frame
        let fps = u64::from(config.clock.fps.max(1));
        let step = Duration::from_nanos(1_000_000_000u64.div_ceil(fps));

        Harness {
            time,
            transport,
            renderer,
            sink,
            spawner,
            decoder,
            telemetry,
            session,
            events,
            step,
        }
    }

    /// Harness with warm-up disabled
    pub fn instant() -> Self {
        let mut config = AvatarConfig::default();
        config.scheduler.warmup_frames = 0;
        Harness::new(config)
    }

    /// Connected and rendering from frame 0
    pub fn online(config: AvatarConfig) -> Self {
        let mut harness = Harness::new(config);
        harness.connect();
        harness
    }

    pub fn connect(&mut self) {
        if let Err(e) = self.session.connect() {
            tracing::debug!(error = %e, "harness connect refused");
            return;
        }
        self.session.on_transport_event(TransportEvent::Opened);
    }

    pub fn deliver(&mut self, event: TransportEvent) {
        self.session.on_transport_event(event);
    }

    /// Tick once at the current time, then let decode tasks run
    pub fn tick(&mut self) -> Option<FrameIndex> {
        let out = self.session.tick();
        self.spawner.run_all();
        out
    }

    /// Advance one frame period and tick
    pub fn step(&mut self) -> Option<FrameIndex> {
        self.time.advance(self.step);
        self.tick()
    }

    /// Advance wall time without ticking the session
    pub fn elapse(&self, by: Duration) {
        self.time.advance(by);
    }

    /// Tick until the clock reaches `frame`
    ///
    /// Stops early if the clock is frozen.
    pub fn run_to(&mut self, frame: u64) {
        self.tick();
        let mut budget = frame.saturating_sub(self.current_frame().0) + 2;
        while self.current_frame().0 < frame && budget > 0 {
            self.step();
            budget -= 1;
        }
    }

    /// Tick `n` frame periods
    pub fn run_frames(&mut self, n: u64) {
        for _ in 0..n {
            self.step();
        }
    }

    pub fn current_frame(&self) -> FrameIndex {
        self.session.scheduler().current_frame()
    }

    /// Every event published so far
    pub fn events(&self) -> Vec<AvatarEvent> {
        self.events.lock().clone()
    }

    /// Events published since the last call
    pub fn take_events(&self) -> Vec<AvatarEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}
