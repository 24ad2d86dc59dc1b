//! Render scheduler
//!
//! The scheduler owns every per-frame component and drives them from one
//! cooperative tick. Each tick while rendering:
//!
//! 1. Release GPU resources if a teardown was deferred to this tick
//! 2. Merge decoded body frames into the cache
//! 3. Sample the animation clock
//! 4. Take the body frame (the latest one when ticks were skipped)
//! 5. Resolve the face and present both
//! 6. Feed audio lead-in and run the frame-gated start
//! 7. Emit UI events in frame order
//! 8. Consume every stream through the frame
//! 9. Let the decoder start work ahead of the playhead
//!
//! State machine: `Init -> Rendering <-> Paused -> Resumed -> Rendering`,
//! any state `-> Stopped`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use marionette_core::{
    AvatarError, AvatarEvent, AvatarResult, ConnectionState, DescriptorId, FrameIndex,
    ObservabilityContext, RenderState, SpeechId, StreamKind, TelemetryEvent, VoiceState,
};
use marionette_state::{FrameCache, PutReport, StreamBatch};
use marionette_time::{AnimationClock, TimeSource};
use marionette_visual::{BodyFrame, BodyFrameDescriptor, FaceInterpolator, ParallelDecoder};
use marionette_voice::{AudioCompositor, AudioTick, SpeechReport, StopTarget};
use serde::{Deserialize, Serialize};

use crate::render::{RenderInput, Renderer};

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Body frames buffered before the first render; 0 starts at once
    pub warmup_frames: u64,
    /// Animation shown while the connection is down
    pub offline_animation: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            warmup_frames: 6,
            offline_animation: "offline_idle".into(),
        }
    }
}

/// Presentation change that waits for the next `start` or `resume` when
/// requested while not rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Keep audio and events running, stop presenting video
    Invisible,
    Visible,
}

/// Components the scheduler drives
pub struct SchedulerParts {
    pub time: Arc<dyn TimeSource>,
    pub clock: AnimationClock,
    pub cache: FrameCache,
    pub decoder: ParallelDecoder,
    pub audio: AudioCompositor,
    pub face: FaceInterpolator,
    pub renderer: Box<dyn Renderer>,
}

#[derive(Debug, Clone)]
struct ClipLabel {
    name: String,
    state: String,
    end_frame: FrameIndex,
}

/// Orchestrates one avatar's render loop
pub struct RenderScheduler {
    config: SchedulerConfig,
    state: RenderState,
    time: Arc<dyn TimeSource>,
    clock: AnimationClock,
    cache: FrameCache,
    decoder: ParallelDecoder,
    audio: AudioCompositor,
    face: FaceInterpolator,
    renderer: Box<dyn Renderer>,
    warming: bool,
    progress: Option<u8>,
    offline: bool,
    offline_ticks: u64,
    invisible: bool,
    queued: Option<Transition>,
    resources_live: bool,
    teardown_pending: bool,
    /// Last presented body image, shown again when a frame is dropped
    held_body: Option<BodyFrame>,
    last_rendered: Option<FrameIndex>,
    clips: HashMap<DescriptorId, ClipLabel>,
    current_clip: Option<(DescriptorId, ClipLabel)>,
    events: Vec<AvatarEvent>,
    obs: ObservabilityContext,
}

impl RenderScheduler {
    pub fn new(config: SchedulerConfig, parts: SchedulerParts, obs: ObservabilityContext) -> Self {
        RenderScheduler {
            config,
            state: RenderState::Init,
            time: parts.time,
            clock: parts.clock,
            cache: parts.cache,
            decoder: parts.decoder,
            audio: parts.audio,
            face: parts.face,
            renderer: parts.renderer,
            warming: false,
            progress: None,
            offline: false,
            offline_ticks: 0,
            invisible: false,
            queued: None,
            resources_live: false,
            teardown_pending: false,
            held_body: None,
            last_rendered: None,
            clips: HashMap::new(),
            current_clip: None,
            events: Vec::new(),
            obs,
        }
    }

    pub fn state(&self) -> RenderState {
        self.state
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Events produced since the last drain, in order
    pub fn drain_events(&mut self) -> Vec<AvatarEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn current_frame(&self) -> FrameIndex {
        self.clock.current_frame()
    }

    /// Last frame fully presented
    pub fn last_rendered(&self) -> Option<FrameIndex> {
        self.last_rendered
    }

    /// Name of the clip on screen
    pub fn animation(&self) -> Option<&str> {
        self.current_clip.as_ref().map(|(_, c)| c.name.as_str())
    }

    /// State label of the clip on screen
    pub fn avatar_state(&self) -> Option<&str> {
        self.current_clip.as_ref().map(|(_, c)| c.state.as_str())
    }

    pub fn current_speech(&self) -> Option<SpeechId> {
        self.audio.playing()
    }

    pub fn is_warming(&self) -> bool {
        self.warming
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn is_invisible(&self) -> bool {
        self.invisible
    }

    pub fn queued_transition(&self) -> Option<Transition> {
        self.queued
    }

    pub fn cache(&self) -> &FrameCache {
        &self.cache
    }

    pub fn decoder(&self) -> &ParallelDecoder {
        &self.decoder
    }

    pub fn audio(&self) -> &AudioCompositor {
        &self.audio
    }

    pub fn face(&self) -> &FaceInterpolator {
        &self.face
    }

    pub fn clock(&self) -> &AnimationClock {
        &self.clock
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.audio.set_volume(volume);
    }

    fn set_state(&mut self, next: RenderState) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, "render state");
            self.state = next;
            self.events.push(AvatarEvent::StateChange(next));
        }
    }

    fn invalid(&self, action: &'static str) -> AvatarError {
        AvatarError::InvalidTransition {
            from: self.state,
            action,
        }
    }

    /// Begin the session: create GPU resources, then warm up or render
    pub fn start(&mut self) -> AvatarResult<()> {
        if self.state != RenderState::Init || self.warming {
            return Err(self.invalid("start"));
        }
        if let Err(e) = self.acquire_resources() {
            self.events.push(AvatarEvent::error(&e));
            self.set_state(RenderState::Stopped);
            return Err(e);
        }
        self.apply_queued();

        if self.config.warmup_frames == 0 {
            self.begin_rendering();
        } else {
            self.warming = true;
            self.report_progress(0);
            tracing::info!(frames = self.config.warmup_frames, "warming up");
        }
        Ok(())
    }

    fn begin_rendering(&mut self) {
        self.warming = false;
        self.apply_queued();
        if !self.offline {
            self.clock.play();
        }
        tracing::info!(frame = %self.clock.current_frame(), "rendering started");
        self.set_state(RenderState::Rendering);
    }

    fn acquire_resources(&mut self) -> AvatarResult<()> {
        self.teardown_pending = false;
        if !self.resources_live {
            self.renderer.ensure_resources()?;
            self.resources_live = true;
        }
        Ok(())
    }

    fn defer_teardown(&mut self) {
        if self.resources_live {
            self.teardown_pending = true;
        }
    }

    /// Freeze playback. Incoming data keeps being cached.
    pub fn pause(&mut self) -> AvatarResult<()> {
        match self.state {
            RenderState::Paused => return Ok(()),
            RenderState::Rendering | RenderState::Resumed => {}
            _ => return Err(self.invalid("pause")),
        }
        self.clock.pause();
        let frame = self.clock.current_frame();

        self.decoder.park();
        let ended = self.audio.stop(StopTarget::All, frame);
        self.report_ended(ended);
        self.clear_face();
        // held_body survives: the resume tick redraws the frozen frame with it
        self.defer_teardown();

        tracing::info!(%frame, "paused");
        self.set_state(RenderState::Paused);
        Ok(())
    }

    /// Continue from the exact frame playback was paused at
    pub fn resume(&mut self) -> AvatarResult<()> {
        match self.state {
            RenderState::Paused => {}
            RenderState::Rendering | RenderState::Resumed => return Ok(()),
            _ => return Err(self.invalid("resume")),
        }
        self.apply_queued();
        if !self.invisible {
            if let Err(e) = self.acquire_resources() {
                self.events.push(AvatarEvent::error(&e));
                return Err(e);
            }
        }

        let frame = self.clock.current_frame();
        self.face.reset();
        self.decoder.resync_to(frame);
        if !self.offline {
            self.clock.play();
        }

        tracing::info!(%frame, "resumed");
        self.set_state(RenderState::Resumed);
        Ok(())
    }

    /// End the session. GPU resources go on the next tick.
    pub fn stop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.clock.pause();
        let frame = self.clock.current_frame();

        self.decoder.abort_all();
        let ended = self.audio.stop(StopTarget::All, frame);
        self.report_ended(ended);
        self.held_body = None;
        self.cache.clear_all();
        self.face.reset();
        self.warming = false;
        self.queued = None;
        self.defer_teardown();

        tracing::info!(%frame, "stopped");
        self.set_state(RenderState::Stopped);
    }

    /// Cut the current speech short
    ///
    /// Returns the interrupted speech, which the caller reports upstream.
    pub fn interrupt(&mut self) -> Option<SpeechId> {
        if self.state.is_terminal() {
            return None;
        }
        self.face.prefer_live(true);

        let target = self
            .audio
            .playing()
            .or_else(|| self.audio.buffered().last().copied())?;
        let frame = self.clock.current_frame();

        let ended = self.audio.stop(StopTarget::Speech(target), frame);
        self.cache.clear(StreamKind::Audio, Some(target));
        self.cache.clear(StreamKind::Event, Some(target));
        self.cache.clear(StreamKind::FaceAuthoritative, Some(target));
        // The server may never send an end marker for a cut segment
        self.report_ended(ended);

        tracing::info!(speech = ?target, %frame, "speech interrupted");
        Some(target)
    }

    /// Request a presentation change, applied now while rendering and
    /// queued otherwise. Returns whether it was applied.
    pub fn queue_transition(&mut self, transition: Transition) -> bool {
        match self.state {
            RenderState::Rendering | RenderState::Resumed if !self.warming => {
                self.apply_transition(transition);
                true
            }
            RenderState::Init | RenderState::Paused => {
                tracing::debug!(?transition, state = %self.state, "transition queued");
                self.queued = Some(transition);
                false
            }
            _ => false,
        }
    }

    fn apply_queued(&mut self) {
        if let Some(transition) = self.queued.take() {
            self.apply_transition(transition);
        }
    }

    fn apply_transition(&mut self, transition: Transition) {
        match transition {
            Transition::Invisible => {
                if self.invisible {
                    return;
                }
                self.invisible = true;
                self.held_body = None;
                self.face.reset();
                self.defer_teardown();
                self.events
                    .push(AvatarEvent::ConnectionStateChange(ConnectionState::Invisible));
            }
            Transition::Visible => {
                if !self.invisible {
                    return;
                }
                if self.state.is_active() {
                    if let Err(e) = self.acquire_resources() {
                        tracing::warn!(error = %e, "cannot leave invisible mode");
                        self.events.push(AvatarEvent::error(&e));
                        return;
                    }
                }
                self.invisible = false;
                self.face.reset();
                if !self.offline {
                    self.events
                        .push(AvatarEvent::ConnectionStateChange(ConnectionState::Online));
                }
            }
        }
        tracing::info!(?transition, "presentation changed");
    }

    /// Connection lost: freeze the timeline and show the offline animation
    pub fn enter_offline(&mut self) {
        if self.offline || self.state.is_terminal() {
            return;
        }
        self.offline = true;
        self.offline_ticks = 0;
        self.clock.pause();
        let frame = self.clock.current_frame();

        self.decoder.abort_all();
        let ended = self.audio.stop(StopTarget::All, frame);
        self.report_ended(ended);
        self.clear_face();
        self.held_body = None;
        tracing::info!(%frame, "offline");
    }

    /// Connection back: continue from the frozen frame
    pub fn exit_offline(&mut self) {
        if !self.offline {
            return;
        }
        self.offline = false;
        let frame = self.clock.current_frame();
        self.face.reset();
        self.decoder.resync_to(frame);
        if self.state.is_active() {
            self.clock.play();
        }
        tracing::info!(%frame, "online");
    }

    /// Store stream data from the transport
    pub fn ingest(&mut self, batch: StreamBatch) -> PutReport {
        if self.state.is_terminal() {
            return PutReport::default();
        }
        let report = self.cache.put(batch);
        for e in &report.errors {
            self.report_error(e);
        }
        report
    }

    /// Schedule body clips for decoding
    pub fn enqueue(&mut self, descriptors: Vec<BodyFrameDescriptor>) -> usize {
        if self.state.is_terminal() {
            return 0;
        }
        for d in &descriptors {
            self.clips.insert(
                d.id,
                ClipLabel {
                    name: d.name.clone(),
                    state: d.state.clone(),
                    end_frame: d.end_frame,
                },
            );
        }
        self.decoder.enqueue(descriptors)
    }

    /// Drop clips the server replaced
    pub fn supersede(&mut self, clips: &[DescriptorId]) -> usize {
        clips
            .iter()
            .filter(|id| {
                self.clips.remove(*id);
                self.decoder.abort_one(**id)
            })
            .count()
    }

    /// Run one tick. Returns the frame presented, if any.
    pub fn tick(&mut self) -> Option<FrameIndex> {
        let now = self.time.now();

        if self.teardown_pending {
            self.teardown_pending = false;
            self.resources_live = false;
            self.renderer.release_resources();
            tracing::debug!("gpu resources released");
        }
        if self.state.is_terminal() {
            return None;
        }

        self.merge_decoded(now);

        if self.offline {
            if !self.invisible && self.resources_live {
                self.renderer
                    .present_offline(&self.config.offline_animation, self.offline_ticks);
            }
            self.offline_ticks += 1;
            return None;
        }

        match self.state {
            RenderState::Init if self.warming => {
                self.warm_up(now);
                None
            }
            RenderState::Rendering | RenderState::Resumed => self.render(now),
            _ => None,
        }
    }

    fn merge_decoded(&mut self, now: Instant) {
        let mut frames = Vec::new();
        let errors = self.decoder.poll_frames(now, |frame| frames.push(frame));
        if !frames.is_empty() {
            let report = self.cache.put(StreamBatch::Body(frames));
            for e in &report.errors {
                self.report_error(e);
            }
        }
        for e in &errors {
            self.report_error(e);
        }
    }

    fn warm_up(&mut self, now: Instant) {
        let frame = self.clock.current_frame();
        self.decoder.pump(now, frame);

        let target = self.config.warmup_frames;
        let ready = self.cache.contiguous_body_from(frame).min(target);
        self.report_progress((ready * 100 / target) as u8);
        if ready >= target {
            self.begin_rendering();
        }
    }

    fn report_progress(&mut self, percent: u8) {
        if self.progress != Some(percent) {
            self.progress = Some(percent);
            self.events.push(AvatarEvent::DownloadProgress(percent));
        }
    }

    fn render(&mut self, now: Instant) -> Option<FrameIndex> {
        let resumed = self.state == RenderState::Resumed;
        let tick = self.clock.tick();
        if !tick.advanced() && !resumed {
            self.decoder.pump(now, tick.frame);
            return None;
        }
        if tick.skipped > 0 {
            tracing::debug!(skipped = tick.skipped, frame = %tick.frame, "ticks skipped");
            self.obs.record(TelemetryEvent::TickLag {
                skipped: tick.skipped,
            });
        }
        let frame = tick.frame;
        let lo = tick.first_unreported();

        let fresh = match self.cache.take_body(lo, frame) {
            Some(body) => {
                self.note_clip(body.descriptor);
                self.held_body = Some(body);
                true
            }
            None => {
                self.obs.record(TelemetryEvent::FrameDropped {
                    stream: StreamKind::Body,
                    frame,
                });
                false
            }
        };

        let face = match self.held_body.as_ref().map(|b| b.body_id) {
            Some(body_id) => self.face.resolve(frame, body_id, &mut self.cache),
            None => None,
        };

        if self.invisible {
            self.held_body = None;
        } else if self.resources_live {
            self.renderer.present(RenderInput {
                frame,
                body: self.held_body.as_ref(),
                body_fresh: fresh,
                face: face.as_ref(),
            });
        }

        let lead = frame.saturating_add(self.audio.config().lead_frames);
        for chunk in self.cache.drain_audio(lead) {
            if let Err(e) = self.audio.feed(chunk) {
                self.report_error(&e);
            }
        }
        let audio = self.audio.tick_start(frame);
        self.report_audio(audio);

        for batch in self.cache.take_events(lo, frame) {
            self.events.push(AvatarEvent::UiEvents(batch));
        }

        self.cache.advance(frame);
        self.last_rendered = Some(frame);
        self.clips.retain(|_, c| c.end_frame >= frame);
        if resumed {
            self.set_state(RenderState::Rendering);
        }

        self.decoder.pump(now, frame);
        Some(frame)
    }

    fn note_clip(&mut self, clip: DescriptorId) {
        if self.current_clip.as_ref().is_some_and(|(id, _)| *id == clip) {
            return;
        }
        if let Some(label) = self.clips.get(&clip) {
            tracing::debug!(?clip, animation = %label.name, "clip on screen");
            self.current_clip = Some((clip, label.clone()));
        }
    }

    fn clear_face(&mut self) {
        self.cache.clear(StreamKind::FaceAuthoritative, None);
        self.cache.clear(StreamKind::FaceRealtime, None);
        self.face.reset();
    }

    fn report_audio(&mut self, tick: AudioTick) {
        self.report_ended(tick.ended);
        if let Some(started) = tick.started {
            self.face.prefer_live(false);
            self.events.push(AvatarEvent::VoiceStateChange {
                state: VoiceState::Start,
                speech_id: started.speech_id,
                duration: started.duration,
            });
        }
    }

    fn report_ended(&mut self, ended: Vec<SpeechReport>) {
        for report in ended {
            self.events.push(AvatarEvent::VoiceStateChange {
                state: VoiceState::End,
                speech_id: report.speech_id,
                duration: report.duration,
            });
        }
    }

    /// Data errors are recovered here; only what the application can act
    /// on becomes an event
    fn report_error(&mut self, err: &AvatarError) {
        match err {
            AvatarError::DataExpired { stream, frame } => {
                tracing::debug!(%stream, %frame, "expired data dropped");
            }
            _ => {
                tracing::warn!(error = %err, "recovered error");
                self.events.push(AvatarEvent::error(err));
            }
        }
    }
}

impl std::fmt::Debug for RenderScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderScheduler")
            .field("state", &self.state)
            .field("frame", &self.clock.current_frame())
            .field("last_rendered", &self.last_rendered)
            .field("warming", &self.warming)
            .field("offline", &self.offline)
            .field("invisible", &self.invisible)
            .field("queued", &self.queued)
            .field("decoder", &self.decoder)
            .field("audio", &self.audio)
            .finish()
    }
}
